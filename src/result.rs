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

use crate::cache::{CacheKey, CachedEntry, ResponseCache};
use crate::cluster::NodeAddr;
use crate::constants::{AGGREGATE_CONTENT_TYPE, CACHE_FLAG_AGGREGATE, CACHE_FLAG_RESPONSE};
use crate::dispatcher::DispatchStatus;
use crate::error::ResponseError;
use crate::request::Meta;
use crate::response::Response;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::Index;
use std::time::Duration;

/// Outcome of one node.
#[derive(Debug, Clone)]
pub struct CallResult {
    node: Option<NodeAddr>,
    status: DispatchStatus,
    response: Response,
    ident: Option<CacheKey>,
    meta: Meta,
}

impl CallResult {
    pub fn new(
        node: Option<NodeAddr>,
        status: DispatchStatus,
        response: Response,
        ident: Option<CacheKey>,
    ) -> Self {
        Self {
            node,
            status,
            response,
            ident,
            meta: Meta::new(),
        }
    }

    /// Rebuild a result from a cache entry. Entries stored by
    /// [`cache`](Self::cache) replay the full response; plain entries are
    /// served as a 200 with the stored body.
    pub(crate) fn from_cache(
        node: Option<NodeAddr>,
        ident: CacheKey,
        entry: CachedEntry,
    ) -> Option<Self> {
        let response = if entry.flags & CACHE_FLAG_RESPONSE != 0 {
            match serde_json::from_slice::<Response>(&entry.content) {
                Ok(response) => response,
                Err(e) => {
                    warn!("corrupt cache entry {}: {}", ident, e);
                    return None;
                }
            }
        } else {
            Response::ok(entry.content).with_header("content-type", entry.content_type)
        };
        Some(Self::new(
            node,
            DispatchStatus::Normal,
            response.with_header("x-cache", "hit"),
            Some(ident),
        ))
    }

    pub(crate) fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn node(&self) -> Option<&NodeAddr> {
        self.node.as_ref()
    }

    pub fn status(&self) -> DispatchStatus {
        self.status
    }

    pub fn is_normal(&self) -> bool {
        self.status == DispatchStatus::Normal
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn status_code(&self) -> u16 {
        self.response.code
    }

    pub fn ident(&self) -> Option<&CacheKey> {
        self.ident.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        self.response.json()
    }

    pub fn reraise(&self) -> Result<(), ResponseError> {
        self.response.raise_for_status()
    }

    /// Store the response under this result's identity. Only successful
    /// single-node results are cached; returns whether anything was saved.
    /// A freshness limit set by the response caps `max_age`.
    pub fn cache(&self, cache: &dyn ResponseCache, max_age: Duration) -> bool {
        if !self.is_normal() {
            return false;
        }
        let Some(ident) = &self.ident else {
            return false;
        };
        match serde_json::to_vec(&self.response) {
            Ok(content) => {
                cache.save(
                    ident,
                    self.response.content_type(),
                    &content,
                    capped_max_age(&self.response, max_age),
                    CACHE_FLAG_RESPONSE,
                );
                true
            }
            Err(e) => {
                warn!("failed to encode response for {}: {}", ident, e);
                false
            }
        }
    }
}

fn capped_max_age(response: &Response, max_age: Duration) -> Duration {
    response.max_age.map_or(max_age, |own| own.min(max_age))
}

#[derive(Serialize, Deserialize)]
struct CachedMember {
    node: Option<NodeAddr>,
    response: Response,
}

/// Outcomes of a map-reduce call, in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct CallResults {
    results: Vec<CallResult>,
    ident: Option<CacheKey>,
    meta: Meta,
}

impl CallResults {
    pub fn new(results: Vec<CallResult>, ident: Option<CacheKey>) -> Self {
        Self {
            results,
            ident,
            meta: Meta::new(),
        }
    }

    pub(crate) fn with_meta(mut self, meta: Meta) -> Self {
        for r in &mut self.results {
            r.meta = meta.clone();
        }
        self.meta = meta;
        self
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CallResult> {
        self.results.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&CallResult> {
        self.results.get(idx)
    }

    pub fn status_code(&self) -> Vec<u16> {
        self.results.iter().map(CallResult::status_code).collect()
    }

    pub fn statuses(&self) -> Vec<DispatchStatus> {
        self.results.iter().map(CallResult::status).collect()
    }

    pub fn all_normal(&self) -> bool {
        self.results.iter().all(CallResult::is_normal)
    }

    pub fn ident(&self) -> Option<&CacheKey> {
        self.ident.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// First application error among the members.
    pub fn reraise(&self) -> Result<(), ResponseError> {
        self.results.iter().try_for_each(CallResult::reraise)
    }

    /// Cache the whole set as one entry, only when every member succeeded.
    pub fn cache(&self, cache: &dyn ResponseCache, max_age: Duration) -> bool {
        if self.results.is_empty() || !self.all_normal() {
            debug!("not caching partial map-reduce results");
            return false;
        }
        let Some(ident) = &self.ident else {
            return false;
        };
        let max_age = self
            .results
            .iter()
            .fold(max_age, |age, r| capped_max_age(&r.response, age));
        let members: Vec<CachedMember> = self
            .results
            .iter()
            .map(|r| CachedMember {
                node: r.node.clone(),
                response: r.response.clone(),
            })
            .collect();
        match serde_json::to_vec(&members) {
            Ok(content) => {
                cache.save(
                    ident,
                    AGGREGATE_CONTENT_TYPE,
                    &content,
                    max_age,
                    CACHE_FLAG_AGGREGATE,
                );
                true
            }
            Err(e) => {
                warn!("failed to encode map-reduce results for {}: {}", ident, e);
                false
            }
        }
    }

    /// Rebuild member results from an aggregate cache entry.
    pub(crate) fn from_cache(ident: &CacheKey, entry: &CachedEntry) -> Option<Vec<CallResult>> {
        if entry.flags & CACHE_FLAG_AGGREGATE == 0 {
            return None;
        }
        let members: Vec<CachedMember> = match serde_json::from_slice(&entry.content) {
            Ok(members) => members,
            Err(e) => {
                warn!("corrupt aggregate cache entry {}: {}", ident, e);
                return None;
            }
        };
        Some(
            members
                .into_iter()
                .map(|m| {
                    CallResult::new(
                        m.node,
                        DispatchStatus::Normal,
                        m.response.with_header("x-cache", "hit"),
                        None,
                    )
                })
                .collect(),
        )
    }
}

impl Index<usize> for CallResults {
    type Output = CallResult;

    fn index(&self, idx: usize) -> &CallResult {
        &self.results[idx]
    }
}

impl<'a> IntoIterator for &'a CallResults {
    type Item = &'a CallResult;
    type IntoIter = std::slice::Iter<'a, CallResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
