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

use std::time::Duration;

/// Bounded job queue of an [`AsyncTransport`](crate::transport::AsyncTransport).
pub const MAX_TRANSPORT_QUEUE_CAPACITY: usize = 1024;

/// Concurrent exchanges an [`AsyncTransport`](crate::transport::AsyncTransport) runs at once.
pub const MAX_CONCURRENT_EXCHANGES: usize = 64;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(300);

/// Stand-in deadline distance for durations too large to add to an `Instant`.
pub const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// How long a node reported unhealthy is skipped by [`NodePool`](crate::pool::NodePool).
pub const DEFAULT_HEALTH_BACKOFF: Duration = Duration::from_secs(30);

/// Status codes at or above this value never come from a remote node.
pub const LOCAL_STATUS_BASE: u16 = 700;
pub const STATUS_REQUEST_FAILED: u16 = 700;
pub const STATUS_NETWORK_ERROR: u16 = 701;
pub const STATUS_TIMEOUT: u16 = 702;

/// Cache entry holds the aggregated responses of a map-reduce call.
pub const CACHE_FLAG_AGGREGATE: u32 = 0x1;

/// Cache entry holds one serialized [`Response`](crate::response::Response).
pub const CACHE_FLAG_RESPONSE: u32 = 0x2;

pub const AGGREGATE_CONTENT_TYPE: &str = "application/x-dist-results+json";
