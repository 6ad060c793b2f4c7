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

//! Boundary contracts towards the cluster layer: node addressing,
//! connection handles and health feedback.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque address of one backend node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Auth {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Auth {
    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Auth::Basic { user, password } => format!("Basic {user}:{password}"),
            Auth::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

/// A non-blocking connection to one node, supplied by the I/O layer.
pub trait Connection: Send + Sync {
    fn address(&self) -> &NodeAddr;
    fn set_timeout(&self, timeout: Duration);
    fn timeout(&self) -> Duration;
    /// Connection-level default credentials.
    fn get_auth(&self) -> Option<Auth>;
    fn is_connected(&self) -> bool;
    /// Protocol label, e.g. `"http"` or `"https"`.
    fn get_proto(&self) -> &str;
    /// Abort whatever exchange is in progress.
    fn handle_abort(&self);
    fn set_active(&self, active: bool);
}

/// Node enumeration, connection acquisition and health bookkeeping.
///
/// Implementations do their own locking; `report` must be atomic and
/// idempotent.
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;
    fn get_nodes(&self) -> Vec<NodeAddr>;
    /// Acquire a connection, to `node` if given, otherwise to a node the
    /// cluster selects. The handle belongs to one exchange: timeout, abort
    /// and activity changes on it must not reach other callers.
    fn get(&self, node: Option<&NodeAddr>) -> Result<Arc<dyn Connection>, ClusterError>;
    fn report(&self, conn: &Arc<dyn Connection>, healthy: bool);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster has no nodes")]
    NoNodes,
    #[error("unknown node {0}")]
    UnknownNode(NodeAddr),
    #[error("node {0} unavailable: {1}")]
    Unavailable(NodeAddr, String),
}
