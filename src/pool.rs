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

use crate::cluster::{Auth, Cluster, ClusterError, Connection, NodeAddr};
use crate::constants::{DEFAULT_CALL_TIMEOUT, FAR_FUTURE};
use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Per-node state shared by every acquisition of that node.
pub struct PooledNode {
    addr: NodeAddr,
    proto: String,
    auth: Option<Auth>,
    aborts: AtomicUsize,
    inflight: AtomicUsize,
}

impl PooledNode {
    pub fn new(addr: NodeAddr, proto: impl Into<String>, auth: Option<Auth>) -> Self {
        Self {
            addr,
            proto: proto.into(),
            auth,
            aborts: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Exchanges aborted on this node, over all acquisitions.
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// One acquisition of a pooled node.
///
/// Timeout, activity and abort state belong to the exchange holding the
/// handle; other calls on the same node never observe them.
pub struct PooledConnection {
    node: Arc<PooledNode>,
    timeout_ms: AtomicU64,
    active: AtomicBool,
    aborted: AtomicBool,
}

impl PooledConnection {
    pub fn new(node: Arc<PooledNode>) -> Self {
        Self {
            node,
            timeout_ms: AtomicU64::new(duration_millis(DEFAULT_CALL_TIMEOUT)),
            active: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &Arc<PooledNode> {
        &self.node
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Connection for PooledConnection {
    fn address(&self) -> &NodeAddr {
        &self.node.addr
    }

    fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(duration_millis(timeout), Ordering::Relaxed);
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn get_auth(&self) -> Option<Auth> {
        self.node.auth.clone()
    }

    fn is_connected(&self) -> bool {
        self.is_active() && !self.is_aborted()
    }

    fn get_proto(&self) -> &str {
        &self.node.proto
    }

    fn handle_abort(&self) {
        if !self.aborted.swap(true, Ordering::Relaxed) {
            self.node.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

#[derive(Serialize)]
pub struct NodeMetrics {
    pub node: NodeAddr,
    pub inflight: usize,
    pub healthy: bool,
    pub aborts: usize,
    pub failures: usize,
}

/// In-memory cluster with least-loaded selection and health back-off.
pub struct NodePool {
    name: String,
    nodes: Vec<Arc<PooledNode>>,
    unhealthy: DashMap<NodeAddr, Instant>,
    failures: DashMap<NodeAddr, usize>,
    backoff: Duration,
    cursor: Mutex<usize>,
}

impl NodePool {
    pub fn new(
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = NodeAddr>,
        backoff: Duration,
    ) -> Self {
        Self::with_nodes(
            name,
            nodes
                .into_iter()
                .map(|addr| Arc::new(PooledNode::new(addr, "http", None))),
            backoff,
        )
    }

    pub fn with_nodes(
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = Arc<PooledNode>>,
        backoff: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: nodes.into_iter().collect(),
            unhealthy: DashMap::new(),
            failures: DashMap::new(),
            backoff,
            cursor: Mutex::new(0),
        }
    }

    pub fn node(&self, node: &NodeAddr) -> Option<&Arc<PooledNode>> {
        self.nodes.iter().find(|n| n.address() == node)
    }

    pub fn is_healthy(&self, node: &NodeAddr) -> bool {
        match self.unhealthy.get(node) {
            Some(until) => *until.value() <= Instant::now(),
            None => true,
        }
    }

    /// Least in-flight healthy node; ties are broken round-robin so an idle
    /// pool still spreads calls.
    fn choose_least_loaded_node(&self) -> Option<usize> {
        let now = Instant::now();
        self.unhealthy.retain(|_, until| *until > now);

        let n = self.nodes.len();
        if n == 0 {
            return None;
        }
        let start = {
            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            let start = *cursor % n;
            *cursor = cursor.wrapping_add(1);
            start
        };
        let order = (0..n).map(|i| (start + i) % n);

        let healthy = order
            .clone()
            .filter(|&i| !self.unhealthy.contains_key(self.nodes[i].address()))
            .min_by_key(|&i| self.nodes[i].inflight());
        healthy.or_else(|| order.min_by_key(|&i| self.nodes[i].inflight()))
    }

    pub fn node_metrics(&self) -> Vec<NodeMetrics> {
        self.nodes
            .iter()
            .map(|c| NodeMetrics {
                node: c.address().clone(),
                inflight: c.inflight(),
                healthy: self.is_healthy(c.address()),
                aborts: c.aborts(),
                failures: self.failures.get(c.address()).map(|f| *f).unwrap_or(0),
            })
            .collect()
    }
}

fn backoff_until(now: Instant, backoff: Duration) -> Instant {
    now.checked_add(backoff).unwrap_or(now + FAR_FUTURE)
}

impl Cluster for NodePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_nodes(&self) -> Vec<NodeAddr> {
        self.nodes.iter().map(|c| c.address().clone()).collect()
    }

    fn get(&self, node: Option<&NodeAddr>) -> Result<Arc<dyn Connection>, ClusterError> {
        let pooled = match node {
            Some(addr) => self
                .node(addr)
                .ok_or_else(|| ClusterError::UnknownNode(addr.clone()))?,
            None => {
                let idx = self.choose_least_loaded_node().ok_or(ClusterError::NoNodes)?;
                &self.nodes[idx]
            }
        };
        pooled.inflight.fetch_add(1, Ordering::Relaxed);
        debug!(
            "cluster {}: node {} acquired, current inflight {}",
            self.name,
            pooled.address(),
            pooled.inflight()
        );
        let conn: Arc<dyn Connection> = Arc::new(PooledConnection::new(pooled.clone()));
        Ok(conn)
    }

    fn report(&self, conn: &Arc<dyn Connection>, healthy: bool) {
        let addr = conn.address();
        if let Some(pooled) = self.node(addr) {
            pooled.release();
        }
        if healthy {
            self.unhealthy.remove(addr);
        } else {
            warn!(
                "cluster {}: node {} reported unhealthy, backing off for {:?}",
                self.name, addr, self.backoff
            );
            *self.failures.entry(addr.clone()).or_insert(0) += 1;
            self.unhealthy
                .insert(addr.clone(), backoff_until(Instant::now(), self.backoff));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> NodePool {
        NodePool::new(
            "test",
            (0..n).map(|i| NodeAddr::new(format!("10.0.0.{i}:80"))),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn enumerates_nodes_in_order() {
        let p = pool(3);
        let nodes: Vec<String> = p.get_nodes().iter().map(|n| n.to_string()).collect();
        assert_eq!(nodes, vec!["10.0.0.0:80", "10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[test]
    fn picks_least_loaded() {
        let p = pool(2);
        let first = p.get(None).unwrap();
        let second = p.get(None).unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(p.node(first.address()).unwrap().inflight(), 1);
    }

    #[test]
    fn skips_unhealthy_nodes() {
        let p = pool(2);
        let a: Arc<dyn Connection> = p.get(Some(&"10.0.0.0:80".into())).unwrap();
        p.report(&a, false);
        assert!(!p.is_healthy(a.address()));
        for _ in 0..4 {
            let c = p.get(None).unwrap();
            assert_eq!(c.address().as_str(), "10.0.0.1:80");
            p.report(&c, true);
        }
    }

    #[test]
    fn falls_back_when_all_unhealthy() {
        let p = pool(1);
        let a = p.get(None).unwrap();
        p.report(&a, false);
        assert!(p.get(None).is_ok());
    }

    #[test]
    fn report_is_idempotent_on_inflight() {
        let p = pool(1);
        let a = p.get(None).unwrap();
        p.report(&a, true);
        p.report(&a, true);
        assert_eq!(p.node(a.address()).unwrap().inflight(), 0);
    }

    #[test]
    fn unknown_and_empty() {
        let p = pool(0);
        assert_eq!(p.get(None).err(), Some(ClusterError::NoNodes));
        let missing = NodeAddr::from("nowhere");
        assert_eq!(
            p.get(Some(&missing)).err(),
            Some(ClusterError::UnknownNode(missing))
        );
    }

    #[test]
    fn acquisitions_do_not_share_exchange_state() {
        let p = pool(1);
        let a = p.get(None).unwrap();
        let b = p.get(None).unwrap();
        a.set_timeout(Duration::from_millis(5));
        a.set_active(false);
        b.handle_abort();
        b.handle_abort();

        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert_eq!(b.timeout(), DEFAULT_CALL_TIMEOUT);
        let c = p.get(None).unwrap();
        assert!(c.is_connected());
        assert_eq!(p.node(c.address()).unwrap().aborts(), 1);
        assert_eq!(p.node(c.address()).unwrap().inflight(), 3);
    }

    #[test]
    fn huge_durations_saturate() {
        let p = NodePool::new("test", [NodeAddr::from("a")], Duration::MAX);
        let a = p.get(None).unwrap();
        a.set_timeout(Duration::MAX);
        assert_eq!(a.timeout(), Duration::from_millis(u64::MAX));
        p.report(&a, false);
        assert!(!p.is_healthy(a.address()));
    }

    #[test]
    fn metrics_serialize() {
        let p = pool(1);
        let a = p.get(None).unwrap();
        p.report(&a, false);
        let json = serde_json::to_value(p.node_metrics()).unwrap();
        assert_eq!(json[0]["failures"], 1);
        assert_eq!(json[0]["healthy"], false);
    }
}
