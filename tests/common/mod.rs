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

#![allow(dead_code)]

use cluster_dispatch::cache::{CacheKey, CachedEntry, MemoryCache, ResponseCache};
use cluster_dispatch::pool::NodePool;
use cluster_dispatch::request::Request;
use cluster_dispatch::response::Response;
use cluster_dispatch::transport::{Completion, RequestHandler, Transport, TransportError};
use cluster_dispatch::{Cluster, ClusterClient, Connection, NodeAddr};
use cluster_dispatch::cluster::ClusterError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const CLUSTER: &str = "test-cluster";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn node(i: usize) -> NodeAddr {
    NodeAddr::new(format!("node{i}"))
}

/// Cluster that records every health report.
pub struct SpyCluster {
    pool: NodePool,
    reports: Mutex<Vec<(NodeAddr, bool)>>,
}

impl SpyCluster {
    pub fn new(nodes: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: NodePool::new(CLUSTER, (0..nodes).map(node), Duration::from_secs(60)),
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn reports(&self) -> Vec<(NodeAddr, bool)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn aborts(&self, addr: &NodeAddr) -> usize {
        self.pool.node(addr).map(|n| n.aborts()).unwrap_or(0)
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }
}

impl Cluster for SpyCluster {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn get_nodes(&self) -> Vec<NodeAddr> {
        self.pool.get_nodes()
    }

    fn get(&self, node: Option<&NodeAddr>) -> Result<Arc<dyn Connection>, ClusterError> {
        self.pool.get(node)
    }

    fn report(&self, conn: &Arc<dyn Connection>, healthy: bool) {
        self.reports
            .lock()
            .unwrap()
            .push((conn.address().clone(), healthy));
        self.pool.report(conn, healthy);
    }
}

/// What a scripted node does with a request.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answer 200 with the node address as body, synchronously.
    Echo,
    /// Answer with the given status, synchronously.
    Status(u16),
    /// Answer 200 with the node address after a delay, from another thread.
    Delay(Duration),
    /// Connection reset.
    NetErr,
    /// Never answer.
    Hang,
    /// Refuse the request before it is sent.
    RejectSend,
}

#[derive(Default)]
pub struct TransportLog {
    pub started: AtomicUsize,
    pub wakes: AtomicUsize,
    pub requests: Mutex<Vec<(NodeAddr, Request)>>,
    pub hung: Mutex<Vec<Completion>>,
}

pub struct ScriptedTransport {
    behaviors: HashMap<NodeAddr, Behavior>,
    log: Arc<TransportLog>,
}

impl ScriptedTransport {
    pub fn new(behaviors: impl IntoIterator<Item = (NodeAddr, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors.into_iter().collect(),
            log: Arc::new(TransportLog::default()),
        })
    }

    pub fn echo() -> Arc<Self> {
        Self::new([])
    }

    pub fn started(&self) -> usize {
        self.log.started.load(Ordering::SeqCst)
    }

    pub fn wakes(&self) -> usize {
        self.log.wakes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(NodeAddr, Request)> {
        self.log.requests.lock().unwrap().clone()
    }

    /// Deliver a response for the oldest hung request.
    pub fn release_hung(&self, response: Response) -> bool {
        let completion = {
            let mut hung = self.log.hung.lock().unwrap();
            if hung.is_empty() {
                return false;
            }
            hung.remove(0)
        };
        completion(response);
        true
    }
}

struct ScriptedHandler {
    behavior: Behavior,
    conn: Arc<dyn Connection>,
    request: Request,
    on_complete: Completion,
    log: Arc<TransportLog>,
}

impl RequestHandler for ScriptedHandler {
    fn handle_request(self: Box<Self>) -> Result<(), TransportError> {
        let ScriptedHandler {
            behavior,
            conn,
            request,
            on_complete,
            log,
        } = *self;
        if let Behavior::RejectSend = behavior {
            return Err(TransportError::QueueFull);
        }
        let addr = conn.address().clone();
        log.started.fetch_add(1, Ordering::SeqCst);
        log.requests.lock().unwrap().push((addr.clone(), request));
        match behavior {
            Behavior::Echo => on_complete(Response::ok(addr.to_string())),
            Behavior::Status(code) => on_complete(Response::new(code).with_content(addr.to_string())),
            Behavior::NetErr => on_complete(Response::local_error(701, "connection reset")),
            Behavior::Delay(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    on_complete(Response::ok(addr.to_string()));
                });
            }
            Behavior::Hang => log.hung.lock().unwrap().push(on_complete),
            Behavior::RejectSend => unreachable!(),
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn handler(
        &self,
        conn: Arc<dyn Connection>,
        request: Request,
        on_complete: Completion,
    ) -> Box<dyn RequestHandler> {
        let behavior = self
            .behaviors
            .get(conn.address())
            .cloned()
            .unwrap_or(Behavior::Echo);
        Box::new(ScriptedHandler {
            behavior,
            conn,
            request,
            on_complete,
            log: self.log.clone(),
        })
    }

    fn wake(&self) {
        self.log.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory cache counting saves.
#[derive(Default)]
pub struct SpyCache {
    inner: MemoryCache,
    pub saves: AtomicUsize,
}

impl SpyCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ResponseCache for SpyCache {
    fn get(&self, key: &CacheKey, max_age: Duration) -> Option<CachedEntry> {
        self.inner.get(key, max_age)
    }

    fn save(&self, key: &CacheKey, content_type: &str, content: &[u8], max_age: Duration, flags: u32) {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(key, content_type, content, max_age, flags);
    }
}

pub fn client(cluster: &Arc<SpyCluster>, transport: &Arc<ScriptedTransport>) -> ClusterClient {
    init_logging();
    ClusterClient::new(cluster.clone(), transport.clone())
}
