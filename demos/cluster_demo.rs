// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::anyhow;
use cluster_dispatch::cache::MemoryCache;
use cluster_dispatch::config::ClientConfig;
use cluster_dispatch::request::{ReqType, Request};
use cluster_dispatch::response::Response;
use cluster_dispatch::transport::AsyncTransport;
use cluster_dispatch::{ClusterClient, Connection};
use env_logger::Env;
use log::{info, warn};
use serde_json::json;
use std::env::var;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"
[cluster]
name = "catalog"
nodes = ["10.0.0.1:5000", "10.0.0.2:5000", "10.0.0.3:5000"]
health_backoff = "30s"

[call]
timeout = "2s"
use_cache = true
cache_max_age = "1m"

[transport]
queue_capacity = 256
max_concurrency = 16
"#;

/// Simulated node: the second node refuses connections, the others answer
/// after a short delay.
async fn simulated_exchange(conn: Arc<dyn Connection>, request: Request) -> anyhow::Result<Response> {
    if conn.address().as_str().starts_with("10.0.0.2") {
        return Err(anyhow!("connection refused by {}", conn.address()));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let body = match &request.method {
        Some(method) => json!({"node": conn.address(), "method": method, "params": request.params}),
        None => json!({"node": conn.address(), "uri": request.uri}),
    };
    Ok(Response::ok(body.to_string()).with_header("content-type", "application/json"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let config: ClientConfig = match var("CLUSTER_CONFIG") {
        Ok(path) => ClientConfig::load(path)?,
        Err(_) => DEFAULT_CONFIG.parse()?,
    };
    info!(
        "cluster {} with {} nodes",
        config.cluster.name,
        config.cluster.nodes.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let transport = AsyncTransport::spawn_with_limits(
        runtime.handle(),
        config.transport.queue_capacity,
        config.transport.max_concurrency,
        simulated_exchange,
    );
    let pool = Arc::new(config.cluster.build_pool());
    let client = ClusterClient::new(pool.clone(), transport.clone())
        .with_cache(Arc::new(MemoryCache::new()))
        .with_options(config.call);

    let call = client.call("/inventory").mapreduce(true).dispatch()?;
    let results = call.getswait(false)?;
    for result in results.iter() {
        match result.node() {
            Some(node) => info!("{} -> {:?} {}", node, result.status(), result.response().text()),
            None => warn!("no node -> {:?}", result.status()),
        }
    }

    // Lands on the refusing node at some point and fails over.
    for i in 0..3 {
        let call = client.call(format!("/items/{i}")).dispatch()?;
        let result = call.getwait_or_throw()?;
        info!(
            "/items/{} served by {:?} after {} retries",
            i,
            result.node(),
            call.retry_count()
        );
        call.cache(Duration::from_secs(60), Some(&[200][..]))?;
    }

    let cached = client.call("/items/0").dispatch()?;
    info!(
        "/items/0 again: x-cache={:?}",
        cached.getwait(false)?.response().get_header("x-cache")
    );

    let rpc = client.rpc("/rpc2", ReqType::JsonRpc)?;
    let sum = rpc.method("calc").attr("add").call(json!([1, 2]));
    sum.set_callback(
        |outcome| info!("calc.add callback: {:?}", outcome.status_code()),
        Some("demo-1"),
    );
    sum.wait();

    info!("transport: {}", serde_json::to_string(&transport.metrics())?);
    info!("nodes: {}", serde_json::to_string(&pool.node_metrics())?);
    Ok(())
}
