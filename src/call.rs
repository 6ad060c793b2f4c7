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

//! The distributed call: one logical request turned into one request per
//! target node, tracked to completion and folded into one outcome.

use crate::cache::{CacheKey, CachedEntry};
use crate::client::ClusterClient;
use crate::constants::FAR_FUTURE;
use crate::cluster::{Auth, Connection, NodeAddr};
use crate::dispatcher::{DispatchId, DispatchStatus, Dispatcher};
use crate::error::{DistCallError, HttpError, RequestFailure, ResponseError};
use crate::proxy::Proxy;
use crate::request::{CallSpec, ReqType, Request};
use crate::response::Response;
use crate::result::{CallResult, CallResults};
use log::{debug, trace, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Runs for every successful node result, outside any lock.
pub type Filter = Arc<dyn Fn(&CallResult) + Send + Sync>;

/// Runs once, when every dispatch of the call has finished.
pub type Callback = Box<dyn FnOnce(CallOutcome) + Send>;

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Single(Arc<CallResult>),
    Many(Arc<CallResults>),
}

impl CallOutcome {
    pub fn status_code(&self) -> Vec<u16> {
        match self {
            CallOutcome::Single(r) => vec![r.status_code()],
            CallOutcome::Many(rs) => rs.status_code(),
        }
    }

    pub fn single(&self) -> Option<&Arc<CallResult>> {
        match self {
            CallOutcome::Single(r) => Some(r),
            CallOutcome::Many(_) => None,
        }
    }

    pub fn many(&self) -> Option<&Arc<CallResults>> {
        match self {
            CallOutcome::Many(rs) => Some(rs),
            CallOutcome::Single(_) => None,
        }
    }
}

/// Reusable part of a call description; a [`Proxy`] stamps out one call per
/// invocation from it.
#[derive(Clone)]
pub(crate) struct CallTemplate {
    pub(crate) client: ClusterClient,
    pub(crate) spec: CallSpec,
    pub(crate) timeout: Duration,
    pub(crate) use_cache: bool,
    pub(crate) cache_max_age: Duration,
    pub(crate) mapreduce: bool,
    pub(crate) filter: Option<Filter>,
}

pub struct CallBuilder {
    template: CallTemplate,
    callback: Option<Callback>,
}

impl CallBuilder {
    pub(crate) fn new(client: ClusterClient, uri: String) -> Self {
        let defaults = client.defaults.clone();
        Self {
            template: CallTemplate {
                spec: CallSpec::new(uri, defaults.reqtype),
                timeout: defaults.timeout,
                use_cache: defaults.use_cache,
                cache_max_age: defaults.cache_max_age,
                mapreduce: false,
                filter: None,
                client,
            },
            callback: None,
        }
    }

    pub fn reqtype(mut self, reqtype: ReqType) -> Self {
        self.template.spec.reqtype = reqtype;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.template.spec.params = params;
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.template.spec.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.spec.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.template
            .spec
            .headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.template.spec.auth = Some(auth);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template.spec.meta.insert(key.into(), value.into());
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.template.use_cache = use_cache;
        self
    }

    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.template.cache_max_age = max_age;
        self
    }

    /// Send to every node of the cluster instead of one.
    pub fn mapreduce(mut self, mapreduce: bool) -> Self {
        self.template.mapreduce = mapreduce;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.template.timeout = timeout;
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&CallResult) + Send + Sync + 'static,
    {
        self.template.filter = Some(Arc::new(filter));
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Build and send the request(s) now.
    pub fn dispatch(self) -> Result<ClusterDistCall, DistCallError> {
        let reqtype = self.template.spec.reqtype;
        if reqtype.is_rpc() {
            return Err(DistCallError::Operation(format!(
                "{reqtype} calls are issued through a method proxy"
            )));
        }
        Ok(ClusterDistCall::start(self.template, self.callback))
    }

    /// Defer request building until a remote method is invoked.
    pub fn proxy(self) -> Result<Proxy, DistCallError> {
        let reqtype = self.template.spec.reqtype;
        if !reqtype.is_rpc() {
            return Err(DistCallError::Operation(format!(
                "{reqtype} is not an rpc request type"
            )));
        }
        if self.callback.is_some() {
            return Err(DistCallError::Operation(
                "rpc callbacks are registered per call with set_callback".into(),
            ));
        }
        Ok(Proxy::new(self.template))
    }
}

struct Inflight {
    dispatcher: Dispatcher,
    conn: Arc<dyn Connection>,
}

#[derive(Default)]
struct CallState {
    next_id: u64,
    inflight: HashMap<DispatchId, Inflight>,
    completed: Vec<Dispatcher>,
    tried: Vec<NodeAddr>,
    retry_count: usize,
    dispatching: bool,
    finished: bool,
    callback: Option<Callback>,
    meta: crate::request::Meta,
}

impl CallState {
    fn next_id(&mut self) -> DispatchId {
        let id = DispatchId(self.next_id);
        self.next_id += 1;
        id
    }
}

struct CallInner {
    client: ClusterClient,
    spec: CallSpec,
    key: CacheKey,
    mapreduce: bool,
    use_cache: bool,
    cache_max_age: Duration,
    timeout: Duration,
    deadline: Instant,
    numnodes: usize,
    filter: Option<Filter>,
    state: Mutex<CallState>,
    single: OnceLock<Arc<CallResult>>,
    many: OnceLock<Arc<CallResults>>,
}

enum Sent {
    Wire,
    Cached,
    Failed,
}

enum Settled {
    Retry { conn: Arc<dyn Connection>, slot: usize, next: NodeAddr },
    Done { conn: Arc<dyn Connection>, healthy: bool, result: Option<CallResult> },
}

impl CallInner {
    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self, target: Option<&NodeAddr>) -> Result<Arc<dyn Connection>, RequestFailure> {
        Ok(self.client.cluster.get(target)?)
    }

    fn build_request(&self, auth: Option<Auth>) -> Result<Request, RequestFailure> {
        Ok(self.client.codec.build(&self.spec, auth)?)
    }

    fn cache_lookup(&self, request: &Request) -> Option<CachedEntry> {
        if !self.use_cache {
            return None;
        }
        let cache = self.client.cache.as_ref()?;
        if !cache.is_cachable(
            request.cache_control(),
            request.has_cookie(),
            request.has_auth(),
            request.pragma(),
        ) {
            trace!("request for {} is not cachable", self.spec.uri);
            return None;
        }
        cache.get(&self.key, self.cache_max_age)
    }

    /// Settle a whole map-reduce call from one aggregate cache entry.
    fn settle_from_aggregate(&self) -> bool {
        if !self.use_cache || self.client.cache.is_none() {
            return false;
        }
        let Ok(request) = self.build_request(self.spec.auth.clone()) else {
            return false;
        };
        let Some(entry) = self.cache_lookup(&request) else {
            return false;
        };
        let Some(results) = CallResults::from_cache(&self.key, &entry) else {
            return false;
        };
        if results.len() != self.numnodes {
            debug!(
                "cached results for {} cover {} nodes, cluster has {}",
                self.spec.uri,
                results.len(),
                self.numnodes
            );
            return false;
        }
        let mut st = self.lock();
        for (slot, result) in results.into_iter().enumerate() {
            let id = st.next_id();
            let mut dispatcher = Dispatcher::new(id, slot, result.node().cloned(), None);
            dispatcher.hit_cache(result);
            st.completed.push(dispatcher);
        }
        debug!("map-reduce call {} served from cache", self.spec.uri);
        true
    }

    fn dispatch_round(self: &Arc<Self>, targets: Vec<(usize, Option<NodeAddr>)>) {
        let mut on_wire = 0;
        for (slot, target) in targets {
            if let Sent::Wire = self.dispatch_one(slot, target.as_ref()) {
                on_wire += 1;
            }
        }
        if on_wire > 0 {
            self.client.transport.wake();
        }
    }

    fn dispatch_one(self: &Arc<Self>, slot: usize, target: Option<&NodeAddr>) -> Sent {
        let id = self.lock().next_id();
        let ident = (!self.mapreduce).then(|| self.key.clone());
        let mut dispatcher = Dispatcher::new(id, slot, target.cloned(), ident);

        let conn = match self.acquire(target) {
            Ok(conn) => conn,
            Err(failure) => {
                warn!("dispatch {} for {} failed: {}", id, self.spec.uri, failure);
                dispatcher.fail(&failure);
                self.finalize_failed(dispatcher, None);
                return Sent::Failed;
            }
        };
        dispatcher.set_node(conn.address().clone());
        self.lock().tried.push(conn.address().clone());
        conn.set_timeout(self.timeout);

        let auth = self.spec.auth.clone().or_else(|| conn.get_auth());
        let request = match self.build_request(auth) {
            Ok(request) => request,
            Err(failure) => {
                warn!("dispatch {} to {} failed: {}", id, conn.address(), failure);
                dispatcher.fail(&failure);
                self.finalize_failed(dispatcher, Some(conn));
                return Sent::Failed;
            }
        };

        if !self.mapreduce {
            let cached = self.cache_lookup(&request).and_then(|entry| {
                CallResult::from_cache(Some(conn.address().clone()), self.key.clone(), entry)
            });
            if let Some(result) = cached {
                debug!("dispatch {} for {} served from cache", id, self.spec.uri);
                dispatcher.hit_cache(result);
                self.client.cluster.report(&conn, true);
                self.lock().completed.push(dispatcher);
                return Sent::Cached;
            }
        }

        let on_complete = {
            let inner = Arc::clone(self);
            Box::new(move |response: Response| inner.handle_result(id, response))
        };
        let handler = self
            .client
            .transport
            .handler(conn.clone(), request, on_complete);
        debug!("dispatch {} to {} for {}", id, conn.address(), self.spec.uri);
        self.lock().inflight.insert(id, Inflight { dispatcher, conn });

        match handler.handle_request() {
            Ok(()) => Sent::Wire,
            Err(e) => {
                let entry = self.lock().inflight.remove(&id);
                if let Some(Inflight {
                    mut dispatcher,
                    conn,
                }) = entry
                {
                    let failure = RequestFailure::Send(e);
                    warn!("dispatch {} to {} failed: {}", id, conn.address(), failure);
                    dispatcher.fail(&failure);
                    self.finalize_failed(dispatcher, Some(conn));
                }
                Sent::Failed
            }
        }
    }

    /// Local failure: the node is not blamed.
    fn finalize_failed(&self, dispatcher: Dispatcher, conn: Option<Arc<dyn Connection>>) {
        if let Some(conn) = conn {
            conn.set_active(false);
            self.client.cluster.report(&conn, true);
        }
        self.lock().completed.push(dispatcher);
        self.progress();
    }

    fn handle_result(self: &Arc<Self>, id: DispatchId, response: Response) {
        let nodes = if self.mapreduce {
            Vec::new()
        } else {
            self.client.cluster.get_nodes()
        };

        let settled = {
            let mut st = self.lock();
            let Some(Inflight {
                mut dispatcher,
                conn,
            }) = st.inflight.remove(&id)
            else {
                debug!("dispatch {} already finalized, dropping late response", id);
                return;
            };
            let status = dispatcher.handle_result(response);
            let next = nodes.into_iter().find(|n| !st.tried.contains(n));
            match (status, next) {
                (DispatchStatus::NetErr, Some(next))
                    if !self.mapreduce && st.retry_count + 1 < self.numnodes =>
                {
                    st.retry_count += 1;
                    st.dispatching = true;
                    Settled::Retry {
                        conn,
                        slot: dispatcher.slot(),
                        next,
                    }
                }
                _ => {
                    let result = (status == DispatchStatus::Normal).then(|| dispatcher.get_result());
                    st.completed.push(dispatcher);
                    Settled::Done {
                        conn,
                        healthy: status == DispatchStatus::Normal,
                        result,
                    }
                }
            }
        };

        match settled {
            Settled::Retry { conn, slot, next } => {
                self.client.cluster.report(&conn, false);
                warn!(
                    "network error on {} for {}, retrying on {}",
                    conn.address(),
                    self.spec.uri,
                    next
                );
                self.dispatch_round(vec![(slot, Some(next))]);
                self.finish_round();
            }
            Settled::Done {
                conn,
                healthy,
                result,
            } => {
                self.client.cluster.report(&conn, healthy);
                if let (Some(filter), Some(result)) = (&self.filter, &result) {
                    filter(result);
                }
                self.progress();
            }
        }
    }

    fn finish_round(&self) {
        self.lock().dispatching = false;
        self.progress();
    }

    /// Fire the callback once the last dispatch is done, then wake waiters.
    fn progress(&self) {
        let callback = {
            let mut st = self.lock();
            if !st.finished && !st.dispatching && st.inflight.is_empty() {
                st.finished = true;
                trace!("call {} finished", self.spec.uri);
                st.callback.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(self.outcome());
        }
        self.client.signal.notify();
    }

    fn is_done(&self) -> bool {
        self.lock().finished
    }

    /// Abort whatever is still in flight after the deadline.
    fn expire(&self) {
        let expired: Vec<Inflight> = {
            let mut st = self.lock();
            st.inflight.drain().map(|(_, entry)| entry).collect()
        };
        let mut timed_out = Vec::with_capacity(expired.len());
        for Inflight {
            mut dispatcher,
            conn,
        } in expired
        {
            warn!(
                "dispatch {} to {} timed out after {:?}",
                dispatcher.id(),
                conn.address(),
                self.timeout
            );
            conn.handle_abort();
            dispatcher.time_out();
            self.client.cluster.report(&conn, false);
            timed_out.push(dispatcher);
        }
        self.lock().completed.extend(timed_out);
        self.progress();
    }

    /// Results in dispatch order, with the call's meta attached.
    fn collect_results(&self) -> Vec<CallResult> {
        let st = self.lock();
        let mut results: Vec<(usize, CallResult)> = st
            .completed
            .iter()
            .chain(st.inflight.values().map(|e| &e.dispatcher))
            .map(|d| (d.slot(), d.get_result().with_meta(st.meta.clone())))
            .collect();
        results.sort_by_key(|(slot, _)| *slot);
        if results.is_empty() && !self.mapreduce {
            // A retry was still being dispatched when the deadline hit.
            let orphan = Dispatcher::new(DispatchId(u64::MAX), 0, None, Some(self.key.clone()));
            results.push((0, orphan.get_result().with_meta(st.meta.clone())));
        }
        results.into_iter().map(|(_, r)| r).collect()
    }

    fn single(&self) -> Result<Arc<CallResult>, DistCallError> {
        if let Some(result) = self.single.get() {
            return Ok(result.clone());
        }
        let mut results = self.collect_results();
        if results.len() != 1 {
            return Err(DistCallError::Operation(format!(
                "expected exactly one result, call produced {}; use getswait",
                results.len()
            )));
        }
        let result = Arc::new(results.remove(0));
        Ok(self.single.get_or_init(|| result).clone())
    }

    fn many(&self) -> Arc<CallResults> {
        self.many
            .get_or_init(|| {
                let ident = self.mapreduce.then(|| self.key.clone());
                let meta = self.lock().meta.clone();
                Arc::new(CallResults::new(self.collect_results(), ident).with_meta(meta))
            })
            .clone()
    }

    fn outcome(&self) -> CallOutcome {
        if !self.mapreduce {
            if let Ok(result) = self.single() {
                return CallOutcome::Single(result);
            }
        }
        CallOutcome::Many(self.many())
    }
}

/// One logical call against a cluster.
///
/// Requests go out when the call is created. Results are retrieved with
/// [`getwait`](Self::getwait) / [`getswait`](Self::getswait), which block up to
/// the call timeout, or delivered to a callback.
pub struct ClusterDistCall {
    inner: Arc<CallInner>,
}

impl ClusterDistCall {
    pub(crate) fn start(template: CallTemplate, callback: Option<Callback>) -> Self {
        let CallTemplate {
            client,
            spec,
            timeout,
            use_cache,
            cache_max_age,
            mapreduce,
            filter,
        } = template;

        let nodes = client.cluster.get_nodes();
        let key = CacheKey::for_call(client.cluster.name(), &spec, mapreduce);
        let state = CallState {
            dispatching: true,
            callback,
            meta: spec.meta.clone(),
            ..CallState::default()
        };
        let inner = Arc::new(CallInner {
            key,
            mapreduce,
            use_cache,
            cache_max_age,
            timeout,
            deadline: deadline_after(timeout),
            numnodes: nodes.len(),
            filter,
            state: Mutex::new(state),
            single: OnceLock::new(),
            many: OnceLock::new(),
            spec,
            client,
        });

        let targets: Vec<(usize, Option<NodeAddr>)> = if mapreduce {
            nodes.into_iter().map(Some).enumerate().collect()
        } else {
            vec![(0, None)]
        };
        debug!(
            "calling {} {} on {} node(s) of cluster {}",
            inner.spec.reqtype,
            inner.spec.uri,
            targets.len(),
            inner.client.cluster.name()
        );
        if !(mapreduce && inner.settle_from_aggregate()) {
            inner.dispatch_round(targets);
        }
        inner.finish_round();

        Self { inner }
    }

    pub fn spec(&self) -> &CallSpec {
        &self.inner.spec
    }

    /// Identity used for response caching.
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn is_mapreduce(&self) -> bool {
        self.inner.mapreduce
    }

    pub fn numnodes(&self) -> usize {
        self.inner.numnodes
    }

    pub fn retry_count(&self) -> usize {
        self.inner.lock().retry_count
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Block until every dispatch finished or the call deadline passed.
    /// Dispatches still in flight at the deadline end up `Timeout`.
    pub fn wait(&self) {
        let inner = &self.inner;
        let done = inner
            .client
            .signal
            .wait_until(inner.deadline, || inner.is_done());
        if !done {
            inner.expire();
        }
    }

    /// The single result of a one-node call. Repeated calls return the same
    /// `Arc` without waiting again.
    pub fn getwait(&self, reraise: bool) -> Result<Arc<CallResult>, DistCallError> {
        let result = match self.inner.single.get() {
            Some(result) => result.clone(),
            None => {
                self.wait();
                self.inner.single()?
            }
        };
        if reraise {
            result.reraise()?;
        }
        Ok(result)
    }

    /// Every node's result, in dispatch order.
    pub fn getswait(&self, reraise: bool) -> Result<Arc<CallResults>, DistCallError> {
        let results = match self.inner.many.get() {
            Some(results) => results.clone(),
            None => {
                self.wait();
                self.inner.many()
            }
        };
        if reraise {
            results.reraise()?;
        }
        Ok(results)
    }

    pub fn getwait_or_throw(&self) -> Result<Arc<CallResult>, HttpError> {
        let result = self
            .getwait(false)
            .map_err(|e| HttpError::new(500, e))?;
        throw_for(&result)?;
        Ok(result)
    }

    pub fn getswait_or_throw(&self) -> Result<Arc<CallResults>, HttpError> {
        let results = self
            .getswait(false)
            .map_err(|e| HttpError::new(500, e))?;
        results.iter().try_for_each(throw_for)?;
        Ok(results)
    }

    /// Cache the retrieved result(s). With `validation`, only when every
    /// status code is listed. Returns whether anything was stored.
    pub fn cache(&self, max_age: Duration, validation: Option<&[u16]>) -> Result<bool, DistCallError> {
        let Some(cache) = self.inner.client.cache.as_deref() else {
            return Ok(false);
        };
        let accepted = |codes: &[u16]| validation.is_none_or(|v| codes.iter().all(|c| v.contains(c)));
        if let Some(result) = self.inner.single.get() {
            if !accepted(&[result.status_code()]) {
                return Ok(false);
            }
            return Ok(result.cache(cache, max_age));
        }
        if let Some(results) = self.inner.many.get() {
            if !accepted(&results.status_code()) {
                return Ok(false);
            }
            return Ok(results.cache(cache, max_age));
        }
        Err(DistCallError::NotReady)
    }

    /// Deliver the outcome to `callback` exactly once: now, if every dispatch
    /// already finished, otherwise from the completion path.
    pub fn set_callback<F>(&self, callback: F, reqid: Option<&str>)
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let mut st = self.inner.lock();
        if let Some(reqid) = reqid {
            st.meta.insert("reqid".to_string(), reqid.to_string());
        }
        if !st.finished {
            st.callback = Some(Box::new(callback));
            return;
        }
        drop(st);
        callback(self.inner.outcome());
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

fn throw_for(result: &CallResult) -> Result<(), HttpError> {
    let status = match result.status() {
        DispatchStatus::Normal => match result.reraise() {
            Ok(()) => return Ok(()),
            Err(e) if e.code < 600 => e.code,
            Err(_) => 502,
        },
        DispatchStatus::Timeout | DispatchStatus::Unsent => 504,
        DispatchStatus::NetErr => 502,
        DispatchStatus::ReqFail => 500,
    };
    let source = result.reraise().err().unwrap_or_else(|| ResponseError {
        code: result.status_code(),
        reason: result.response().reason.clone(),
    });
    Err(HttpError::new(status, DistCallError::Response(source)))
}
