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

mod common;

use anyhow::anyhow;
use cluster_dispatch::config::ClientConfig;
use cluster_dispatch::request::Request;
use cluster_dispatch::response::Response;
use cluster_dispatch::transport::AsyncTransport;
use cluster_dispatch::pool::NodePool;
use cluster_dispatch::{ClusterClient, Connection, DispatchStatus, NodeAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const CONFIG: &str = r#"
[cluster]
name = "search"
nodes = ["alpha:5000", "beta:5000", "gamma:5000"]
health_backoff = "10s"

[call]
timeout = "2s"

[transport]
queue_capacity = 16
max_concurrency = 4
"#;

async fn exchange(conn: Arc<dyn Connection>, request: Request) -> anyhow::Result<Response> {
    if conn.address().as_str().starts_with("beta") {
        return Err(anyhow!("connection refused"));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    Ok(Response::ok(format!("{} {}", conn.address(), request.uri)))
}

fn setup(rt: &Runtime) -> (ClusterClient, Arc<AsyncTransport>) {
    common::init_logging();
    let config: ClientConfig = CONFIG.parse().unwrap();
    let transport = AsyncTransport::spawn_with_limits(
        rt.handle(),
        config.transport.queue_capacity,
        config.transport.max_concurrency,
        exchange,
    );
    let client = ClusterClient::new(Arc::new(config.cluster.build_pool()), transport.clone())
        .with_options(config.call);
    (client, transport)
}

#[test]
fn mapreduce_over_tokio_transport() {
    let rt = Runtime::new().unwrap();
    let (client, transport) = setup(&rt);

    let call = client.call("/search").mapreduce(true).dispatch().unwrap();
    let results = call.getswait(false).unwrap();

    assert_eq!(
        results.statuses(),
        vec![
            DispatchStatus::Normal,
            DispatchStatus::NetErr,
            DispatchStatus::Normal
        ]
    );
    assert_eq!(results[0].response().text(), "alpha:5000 /search");
    assert_eq!(results[2].response().text(), "gamma:5000 /search");
    assert_eq!(transport.metrics().errors, 1);
    assert_eq!(transport.inflight(), 0);
}

#[test]
fn single_call_fails_over_past_refusing_node() {
    let rt = Runtime::new().unwrap();
    let (client, _transport) = setup(&rt);

    // Round-robin selection starts at alpha, so the second call lands on beta.
    let first = client.call("/a").dispatch().unwrap();
    assert!(first.getwait(true).unwrap().is_normal());

    let second = client.call("/b").dispatch().unwrap();
    let result = second.getwait(true).unwrap();
    assert!(result.is_normal());
    assert_eq!(second.retry_count(), 1);
    assert_eq!(result.node().map(|n| n.as_str()), Some("alpha:5000"));
}

#[test]
fn slow_exchange_times_out() {
    let rt = Runtime::new().unwrap();
    common::init_logging();
    let transport = AsyncTransport::spawn(rt.handle(), |_conn: Arc<dyn Connection>, _req: Request| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Response::ok("too late"))
    });
    let pool = NodePool::new(
        "slow",
        [NodeAddr::new("slow:1")],
        Duration::from_secs(1),
    );
    let client = ClusterClient::new(Arc::new(pool), transport);

    let call = client
        .call("/wait")
        .timeout(Duration::from_millis(100))
        .dispatch()
        .unwrap();
    let result = call.getwait(false).unwrap();
    assert!(matches!(
        result.status(),
        DispatchStatus::Timeout | DispatchStatus::NetErr
    ));
    assert!(result.status_code() >= 700);
}

async fn slow_path_exchange(conn: Arc<dyn Connection>, request: Request) -> anyhow::Result<Response> {
    if request.uri == "/slow" {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    Ok(Response::ok(format!("{} {}", conn.address(), request.uri)))
}

/// One node, one exchange at a time: later calls queue behind `/slow`.
fn single_lane(rt: &Runtime) -> (ClusterClient, Arc<NodePool>) {
    common::init_logging();
    let transport = AsyncTransport::spawn_with_limits(rt.handle(), 16, 1, slow_path_exchange);
    let pool = Arc::new(NodePool::new(
        "lane",
        [NodeAddr::new("only:1")],
        Duration::from_secs(30),
    ));
    (ClusterClient::new(pool.clone(), transport), pool)
}

#[test]
fn local_failure_stays_with_its_own_call() {
    let rt = Runtime::new().unwrap();
    let (client, pool) = single_lane(&rt);

    let slow = client.call("/slow").dispatch().unwrap();
    let queued = client.call("/ok").dispatch().unwrap();
    let broken = client
        .call("/ok")
        .params(serde_json::json!([1, 2]))
        .dispatch()
        .unwrap();

    assert_eq!(broken.getwait(false).unwrap().status(), DispatchStatus::ReqFail);
    let result = queued.getwait(true).unwrap();
    assert_eq!(result.status(), DispatchStatus::Normal);
    assert_eq!(result.response().text(), "only:1 /ok");
    assert!(slow.getwait(true).unwrap().is_normal());
    assert!(pool.is_healthy(&NodeAddr::new("only:1")));
}

#[test]
fn timeout_abort_stays_with_its_own_call() {
    let rt = Runtime::new().unwrap();
    let (client, pool) = single_lane(&rt);

    let slow = client.call("/slow").dispatch().unwrap();
    let impatient = client
        .call("/slow")
        .timeout(Duration::from_millis(50))
        .dispatch()
        .unwrap();
    let queued = client.call("/ok").dispatch().unwrap();

    assert_eq!(impatient.getwait(false).unwrap().status(), DispatchStatus::Timeout);
    let result = queued.getwait(true).unwrap();
    assert_eq!(result.status(), DispatchStatus::Normal);
    assert!(slow.getwait(true).unwrap().is_normal());
    assert_eq!(pool.node(&NodeAddr::new("only:1")).unwrap().aborts(), 1);
}
