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

use crate::cache::CacheKey;
use crate::cluster::NodeAddr;
use crate::constants::{STATUS_NETWORK_ERROR, STATUS_REQUEST_FAILED, STATUS_TIMEOUT};
use crate::error::RequestFailure;
use crate::response::Response;
use crate::result::CallResult;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Stable per-call key of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(pub(crate) u64);

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Unsent,
    Normal,
    Timeout,
    NetErr,
    ReqFail,
}

impl DispatchStatus {
    pub fn is_terminal(self) -> bool {
        self != DispatchStatus::Unsent
    }
}

/// Tracks one request to one node. Status only moves out of `Unsent`, once.
#[derive(Debug)]
pub struct Dispatcher {
    id: DispatchId,
    slot: usize,
    node: Option<NodeAddr>,
    ident: Option<CacheKey>,
    status: DispatchStatus,
    result: Option<CallResult>,
    created: Instant,
}

impl Dispatcher {
    pub fn new(id: DispatchId, slot: usize, node: Option<NodeAddr>, ident: Option<CacheKey>) -> Self {
        Self {
            id,
            slot,
            node,
            ident,
            status: DispatchStatus::Unsent,
            result: None,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    /// Position of the node in the original dispatch order.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn node(&self) -> Option<&NodeAddr> {
        self.node.as_ref()
    }

    pub(crate) fn set_node(&mut self, node: NodeAddr) {
        self.node = Some(node);
    }

    pub fn ident(&self) -> Option<&CacheKey> {
        self.ident.as_ref()
    }

    pub fn status(&self) -> DispatchStatus {
        self.status
    }

    pub fn creation_time(&self) -> Instant {
        self.created
    }

    fn settle(&mut self, status: DispatchStatus, response: Response) -> bool {
        if self.status.is_terminal() {
            debug!(
                "dispatch {} already {:?}, ignoring {:?}",
                self.id, self.status, status
            );
            return false;
        }
        self.status = status;
        self.result = Some(CallResult::new(
            self.node.clone(),
            status,
            response,
            self.ident.clone(),
        ));
        true
    }

    /// Record what the transport delivered; codes in the local range count
    /// as network errors.
    pub fn handle_result(&mut self, response: Response) -> DispatchStatus {
        let status = if response.is_local_error() {
            DispatchStatus::NetErr
        } else {
            DispatchStatus::Normal
        };
        self.settle(status, response);
        self.status
    }

    pub fn fail(&mut self, failure: &RequestFailure) {
        self.settle(
            DispatchStatus::ReqFail,
            Response::local_error(STATUS_REQUEST_FAILED, failure.to_string()),
        );
    }

    pub fn time_out(&mut self) {
        self.settle(
            DispatchStatus::Timeout,
            Response::local_error(STATUS_TIMEOUT, "no response before the call deadline"),
        );
    }

    pub(crate) fn hit_cache(&mut self, result: CallResult) {
        if !self.status.is_terminal() {
            self.status = DispatchStatus::Normal;
            self.result = Some(result);
        }
    }

    /// Best-effort result, synthesized when the dispatcher never completed.
    pub fn get_result(&self) -> CallResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let (status, code, detail) = match self.status {
            DispatchStatus::ReqFail => (
                DispatchStatus::ReqFail,
                STATUS_REQUEST_FAILED,
                "request failed",
            ),
            DispatchStatus::NetErr => (
                DispatchStatus::NetErr,
                STATUS_NETWORK_ERROR,
                "network error",
            ),
            _ => (
                DispatchStatus::Timeout,
                STATUS_TIMEOUT,
                "no response before the call deadline",
            ),
        };
        CallResult::new(
            self.node.clone(),
            status,
            Response::local_error(code, detail),
            self.ident.clone(),
        )
    }
}
