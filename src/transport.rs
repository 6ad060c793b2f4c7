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

use crate::cluster::{Connection, NodeAddr};
use crate::constants::{
    MAX_CONCURRENT_EXCHANGES, MAX_TRANSPORT_QUEUE_CAPACITY, STATUS_NETWORK_ERROR, STATUS_TIMEOUT,
};
use crate::request::Request;
use crate::response::Response;
use log::{debug, error};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Invoked exactly once with the response or a local error response.
pub type Completion = Box<dyn FnOnce(Response) + Send>;

/// One prepared exchange over one connection.
pub trait RequestHandler: Send {
    /// Start the exchange without blocking. When this returns an error the
    /// completion is dropped and never invoked.
    fn handle_request(self: Box<Self>) -> Result<(), TransportError>;
}

pub trait Transport: Send + Sync {
    fn handler(
        &self,
        conn: Arc<dyn Connection>,
        request: Request,
        on_complete: Completion,
    ) -> Box<dyn RequestHandler>;

    /// Called once after a dispatch round put at least one request on the
    /// wire. Loop-driven transports override this to leave their poll wait.
    fn wake(&self) {}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport queue is full")]
    QueueFull,
    #[error("transport is closed")]
    Closed,
    #[error("connection to {0} is not usable")]
    NotConnected(NodeAddr),
}

pub struct Job {
    pub conn: Arc<dyn Connection>,
    pub request: Request,
    pub respond_to: Completion,
}

#[derive(Serialize)]
pub struct TransportMetrics {
    pub inflight: usize,
    pub queue_len: usize,
    pub capacity: usize,
    pub errors: usize,
}

/// Transport running exchanges as tokio tasks behind a bounded job queue.
pub struct AsyncTransport {
    tx: mpsc::Sender<Job>,
    inflight: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl AsyncTransport {
    pub fn spawn<F, Fut>(handle: &Handle, exchange: F) -> Arc<Self>
    where
        F: Fn(Arc<dyn Connection>, Request) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        Self::spawn_with_limits(
            handle,
            MAX_TRANSPORT_QUEUE_CAPACITY,
            MAX_CONCURRENT_EXCHANGES,
            exchange,
        )
    }

    /// Spawn the job loop on `handle`; each job runs `exchange(conn, req)`
    /// bounded by the connection timeout.
    pub fn spawn_with_limits<F, Fut>(
        handle: &Handle,
        queue_capacity: usize,
        max_concurrency: usize,
        exchange: F,
    ) -> Arc<Self>
    where
        F: Fn(Arc<dyn Connection>, Request) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let inflight = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1)));

        handle.spawn({
            let inflight = inflight.clone();
            let errors = errors.clone();
            async move {
                while let Some(Job {
                    conn,
                    request,
                    respond_to,
                }) = rx.recv().await
                {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            debug!("transport semaphore closed, failing job for {}", conn.address());
                            respond_to(Response::local_error(
                                STATUS_NETWORK_ERROR,
                                "transport shut down",
                            ));
                            continue;
                        }
                    };
                    let inflight = inflight.clone();
                    let errors = errors.clone();
                    let exchange = exchange.clone();

                    inflight.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        let resp = if !conn.is_connected() {
                            Response::local_error(STATUS_NETWORK_ERROR, "connection aborted")
                        } else {
                            let timeout = conn.timeout();
                            match tokio::time::timeout(timeout, exchange(conn.clone(), request))
                                .await
                            {
                                Ok(Ok(resp)) => resp,
                                Ok(Err(e)) => {
                                    error!("exchange with {} failed: {:?}", conn.address(), e);
                                    errors.fetch_add(1, Ordering::Relaxed);
                                    Response::local_error(STATUS_NETWORK_ERROR, e.to_string())
                                }
                                Err(_) => {
                                    errors.fetch_add(1, Ordering::Relaxed);
                                    Response::local_error(
                                        STATUS_TIMEOUT,
                                        format!("no response within {timeout:?}"),
                                    )
                                }
                            }
                        };
                        inflight.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                        respond_to(resp);
                    });
                }
            }
        });

        Arc::new(Self {
            tx,
            inflight,
            errors,
        })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            inflight: self.inflight(),
            queue_len: self.tx.max_capacity() - self.tx.capacity(),
            capacity: self.tx.max_capacity(),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct QueuedHandler {
    tx: mpsc::Sender<Job>,
    job: Job,
}

impl RequestHandler for QueuedHandler {
    fn handle_request(self: Box<Self>) -> Result<(), TransportError> {
        let addr = self.job.conn.address().clone();
        self.tx.try_send(self.job).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })?;
        debug!("request for {} queued", addr);
        Ok(())
    }
}

impl Transport for AsyncTransport {
    fn handler(
        &self,
        conn: Arc<dyn Connection>,
        request: Request,
        on_complete: Completion,
    ) -> Box<dyn RequestHandler> {
        Box::new(QueuedHandler {
            tx: self.tx.clone(),
            job: Job {
                conn,
                request,
                respond_to: on_complete,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PooledConnection, PooledNode};
    use crate::request::{CallSpec, ReqType, RequestCodec, StandardCodec};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn conn(timeout: Duration) -> Arc<dyn Connection> {
        let node = PooledNode::new("127.0.0.1:9".into(), "http", None);
        let c = PooledConnection::new(Arc::new(node));
        c.set_timeout(timeout);
        Arc::new(c)
    }

    fn request() -> Request {
        StandardCodec
            .build(&CallSpec::new("/ping", ReqType::Get), None)
            .unwrap()
    }

    async fn exchange_once(transport: &AsyncTransport, conn: Arc<dyn Connection>) -> Response {
        let (tx, rx) = oneshot::channel();
        transport
            .handler(
                conn,
                request(),
                Box::new(move |resp: Response| {
                    let _ = tx.send(resp);
                }),
            )
            .handle_request()
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_response() {
        let transport = AsyncTransport::spawn(&Handle::current(), |conn, req| async move {
            Ok(Response::ok(format!("{} {}", conn.address(), req.uri)))
        });
        let resp = exchange_once(&transport, conn(Duration::from_secs(1))).await;
        assert_eq!(resp.code, 200);
        assert_eq!(resp.text(), "127.0.0.1:9 /ping");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn maps_failures_to_local_codes() {
        let transport = AsyncTransport::spawn(&Handle::current(), |_conn, req| async move {
            if req.uri == "/ping" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err::<Response, _>(anyhow::anyhow!("connection reset"))
        });
        let resp = exchange_once(&transport, conn(Duration::from_millis(20))).await;
        assert_eq!(resp.code, STATUS_TIMEOUT);
        assert_eq!(transport.metrics().errors, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_connection_is_not_used() {
        let transport = AsyncTransport::spawn(&Handle::current(), |_conn, _req| async move {
            Ok(Response::ok("unexpected"))
        });
        let c = conn(Duration::from_secs(1));
        c.handle_abort();
        let resp = exchange_once(&transport, c).await;
        assert_eq!(resp.code, STATUS_NETWORK_ERROR);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_rejects() {
        let transport = AsyncTransport::spawn_with_limits(&Handle::current(), 1, 1, |_c, _r| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Response::ok(""))
        });
        let mut rejected = false;
        for _ in 0..8 {
            let res = transport
                .handler(conn(Duration::from_secs(10)), request(), Box::new(|_: Response| {}))
                .handle_request();
            if res == Err(TransportError::QueueFull) {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        let json = serde_json::to_value(transport.metrics()).unwrap();
        assert_eq!(json["capacity"], 1);
    }
}
