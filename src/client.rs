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

use crate::cache::ResponseCache;
use crate::call::CallBuilder;
use crate::cluster::Cluster;
use crate::config::CallOptions;
use crate::error::DistCallError;
use crate::proxy::Proxy;
use crate::request::{RequestCodec, ReqType, StandardCodec};
use crate::transport::Transport;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Completion signal shared by every call issued through one cluster client.
///
/// Each completion bumps the epoch and wakes all waiters; a waiter re-checks
/// its own call while holding the epoch lock, so a wake-up cannot slip in
/// between its check and its wait.
#[derive(Default)]
pub struct CallSignal {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl CallSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until `done()` holds or `deadline` passes; returns the final
    /// value of `done()`.
    pub(crate) fn wait_until(&self, deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
        let mut guard = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// Everything a call needs to reach a cluster: node source, transport,
/// request codec, optional response cache and the shared completion signal.
#[derive(Clone)]
pub struct ClusterClient {
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn RequestCodec>,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) signal: Arc<CallSignal>,
    pub(crate) defaults: CallOptions,
}

impl ClusterClient {
    pub fn new(cluster: Arc<dyn Cluster>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cluster,
            transport,
            codec: Arc::new(StandardCodec),
            cache: None,
            signal: Arc::new(CallSignal::new()),
            defaults: CallOptions::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn RequestCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share one signal between several clients of the same cluster.
    pub fn with_signal(mut self, signal: Arc<CallSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn signal(&self) -> &Arc<CallSignal> {
        &self.signal
    }

    pub fn options(&self) -> &CallOptions {
        &self.defaults
    }

    pub fn call(&self, uri: impl Into<String>) -> CallBuilder {
        CallBuilder::new(self.clone(), uri.into())
    }

    pub fn rpc(&self, uri: impl Into<String>, reqtype: ReqType) -> Result<Proxy, DistCallError> {
        self.call(uri).reqtype(reqtype).proxy()
    }
}
