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

use crate::cluster::NodeAddr;
use crate::constants::{
    DEFAULT_CACHE_MAX_AGE, DEFAULT_CALL_TIMEOUT, DEFAULT_HEALTH_BACKOFF,
    MAX_CONCURRENT_EXCHANGES, MAX_TRANSPORT_QUEUE_CAPACITY,
};
use crate::pool::NodePool;
use crate::request::ReqType;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Per-call defaults; every field can be overridden on a call builder.
#[derive(Debug, Clone, Deserialize)]
pub struct CallOptions {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default = "default_cache_max_age", with = "humantime_serde")]
    pub cache_max_age: Duration,
    #[serde(default)]
    pub reqtype: ReqType,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            use_cache: false,
            cache_max_age: default_cache_max_age(),
            reqtype: ReqType::default(),
        }
    }
}

fn default_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

fn default_cache_max_age() -> Duration {
    DEFAULT_CACHE_MAX_AGE
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_health_backoff", with = "humantime_serde")]
    pub health_backoff: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            nodes: Vec::new(),
            health_backoff: default_health_backoff(),
        }
    }
}

impl ClusterConfig {
    pub fn build_pool(&self) -> NodePool {
        NodePool::new(
            self.name.clone(),
            self.nodes.iter().map(|n| NodeAddr::new(n.as_str())),
            self.health_backoff,
        )
    }
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_health_backoff() -> Duration {
    DEFAULT_HEALTH_BACKOFF
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_queue_capacity() -> usize {
    MAX_TRANSPORT_QUEUE_CAPACITY
}

fn default_max_concurrency() -> usize {
    MAX_CONCURRENT_EXCHANGES
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub call: CallOptions,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        content.parse()
    }
}

impl FromStr for ClientConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}
