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

//! # Cluster Dispatch
//!
//! A **fan-out/fan-in call dispatcher** for clusters of backend nodes.
//!
//! One logical call becomes one request (single-node call) or one request
//! per node (map-reduce call). Every request is tracked by a
//! [`Dispatcher`](dispatcher::Dispatcher); the call collects their outcomes
//! and hands them back either to a blocked caller thread or to a callback.
//!
//! - **Node selection** through the [`Cluster`](cluster::Cluster) contract
//! - **Transparent failover** of single-node calls on network errors
//! - **Deadline-bounded waits**: pending requests are aborted at the deadline
//! - **Response caching** keyed by a structured call identity
//! - **RPC method proxies** built as explicit method-name chains
//!
//! ## Core Concepts
//!
//! - [`ClusterClient`] bundles the cluster, transport, request codec,
//!   optional cache and the completion signal shared by its calls.
//! - [`ClusterDistCall`] is one logical call, created with
//!   [`ClusterClient::call`] and a [`CallBuilder`].
//! - [`CallResult`] / [`CallResults`] carry node outcomes.
//! - [`AsyncTransport`](transport::AsyncTransport) runs exchanges on a tokio
//!   runtime; [`NodePool`](pool::NodePool) is an in-memory cluster.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cluster_dispatch::{ClusterClient, Connection, NodeAddr};
//! use cluster_dispatch::pool::NodePool;
//! use cluster_dispatch::response::Response;
//! use cluster_dispatch::transport::AsyncTransport;
//!
//! fn main() -> anyhow::Result<()> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let transport = AsyncTransport::spawn(runtime.handle(), |conn, req| async move {
//!         Ok::<_, anyhow::Error>(Response::ok(format!("{} answered {}", conn.address(), req.uri)))
//!     });
//!     let pool = NodePool::new(
//!         "search",
//!         ["10.0.0.1:5000", "10.0.0.2:5000"].map(NodeAddr::from),
//!         Duration::from_secs(30),
//!     );
//!     let client = ClusterClient::new(Arc::new(pool), transport);
//!
//!     let call = client.call("/status").mapreduce(true).dispatch()?;
//!     let results = call.getswait(false)?;
//!     println!("{:?}", results.status_code());
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Waiting blocks the calling OS thread; transports complete requests from
//! their own threads. Never call the blocking accessors from inside an async
//! task.
//!
//! ## License
//!
//! Licensed under [Apache 2.0](https://www.apache.org/licenses/LICENSE-2.0).
pub mod cache;
pub mod call;
pub mod client;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod result;
pub mod transport;

pub use call::{CallBuilder, CallOutcome, ClusterDistCall};
pub use client::{CallSignal, ClusterClient};
pub use cluster::{Auth, Cluster, Connection, NodeAddr};
pub use dispatcher::DispatchStatus;
pub use error::{DistCallError, HttpError, ResponseError};
pub use result::{CallResult, CallResults};
