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

use crate::cluster::ClusterError;
use crate::request::BuildError;
use crate::transport::TransportError;
use thiserror::Error;

/// Why a request never left the process. Recorded on the dispatcher as
/// [`DispatchStatus::ReqFail`](crate::dispatcher::DispatchStatus::ReqFail);
/// not attributed to node health.
#[derive(Error, Debug, Clone)]
pub enum RequestFailure {
    #[error("connection acquisition failed: {0}")]
    Acquire(#[from] ClusterError),
    #[error("request build failed: {0}")]
    Build(#[from] BuildError),
    #[error("request send failed: {0}")]
    Send(#[from] TransportError),
}

/// Application-level error carried by a response, surfaced by
/// `raise_for_status` and by `reraise`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("response status {code} {reason}")]
pub struct ResponseError {
    pub code: u16,
    pub reason: String,
}

#[derive(Error, Debug, Clone)]
pub enum DistCallError {
    #[error("operation error: {0}")]
    Operation(String),
    #[error("no result has been retrieved yet")]
    NotReady,
    #[error(transparent)]
    Response(#[from] ResponseError),
}

/// Uniform error returned by the `*_or_throw` accessors: every failure kind is
/// folded into an HTTP-style status while keeping the original error as source.
#[derive(Error, Debug, Clone)]
#[error("{status} {reason}")]
pub struct HttpError {
    pub status: u16,
    pub reason: &'static str,
    #[source]
    pub source: DistCallError,
}

impl HttpError {
    pub fn new(status: u16, source: DistCallError) -> Self {
        Self {
            status,
            reason: reason_phrase(status),
            source,
        }
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        700 => "Request Failed",
        701 => "Network Error",
        702 => "Timeout",
        _ => "Unknown",
    }
}
