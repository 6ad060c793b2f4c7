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

use crate::constants::FAR_FUTURE;
use crate::request::{CallSpec, ReqType};
use dashmap::DashMap;
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

/// Deterministic identity of a call.
///
/// The components are encoded as a JSON object, so a delimiter inside the uri
/// or params can never make two different calls collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyParts<'a> {
    cluster: &'a str,
    uri: &'a str,
    reqtype: ReqType,
    method: Option<&'a str>,
    params: &'a Value,
    mapreduce: bool,
}

impl CacheKey {
    pub fn for_call(cluster: &str, spec: &CallSpec, mapreduce: bool) -> Self {
        let parts = KeyParts {
            cluster,
            uri: &spec.uri,
            reqtype: spec.reqtype,
            method: spec.method.as_deref(),
            params: &spec.params,
            mapreduce,
        };
        // Serializing strings and a `Value` cannot fail.
        CacheKey(serde_json::to_string(&parts).unwrap_or_default())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub content_type: String,
    pub content: Vec<u8>,
    pub flags: u32,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

/// Response cache used for call results.
pub trait ResponseCache: Send + Sync {
    /// Entry for `key` no older than `max_age`.
    fn get(&self, key: &CacheKey, max_age: Duration) -> Option<CachedEntry>;

    fn save(&self, key: &CacheKey, content_type: &str, content: &[u8], max_age: Duration, flags: u32);

    fn is_cachable(
        &self,
        cache_control: Option<&str>,
        has_cookie: bool,
        has_auth: bool,
        pragma: Option<&str>,
    ) -> bool {
        if has_cookie || has_auth {
            return false;
        }
        if pragma.is_some_and(|p| p.to_ascii_lowercase().contains("no-cache")) {
            return false;
        }
        match cache_control {
            Some(cc) => {
                let cc = cc.to_ascii_lowercase();
                !["no-cache", "no-store", "private", "max-age=0"]
                    .iter()
                    .any(|d| cc.contains(d))
            }
            None => true,
        }
    }
}

/// In-process cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<CacheKey, CachedEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &CacheKey, max_age: Duration) -> Option<CachedEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.expires_at <= now || now.duration_since(entry.stored_at) > max_age {
            trace!("cache entry {} is stale", key);
            return None;
        }
        debug!("cache hit {}", key);
        Some(entry.value().clone())
    }

    fn save(&self, key: &CacheKey, content_type: &str, content: &[u8], max_age: Duration, flags: u32) {
        self.purge_expired();
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CachedEntry {
                content_type: content_type.to_string(),
                content: content.to_vec(),
                flags,
                stored_at: now,
                expires_at: now.checked_add(max_age).unwrap_or(now + FAR_FUTURE),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_deterministic_and_unambiguous() {
        let mut a = CallSpec::new("/a,b", ReqType::Get);
        a.params = json!({"x": 1, "y": [1, 2]});
        let mut b = CallSpec::new("/a", ReqType::Get);
        b.params = json!({"x": 1, "y": [1, 2]});
        assert_eq!(
            CacheKey::for_call("c", &a, false),
            CacheKey::for_call("c", &a.clone(), false)
        );
        assert_ne!(CacheKey::for_call("c", &a, false), CacheKey::for_call("c", &b, false));
        assert_ne!(CacheKey::for_call("c", &a, false), CacheKey::for_call("c", &a, true));
        assert_ne!(CacheKey::for_call("c", &a, false), CacheKey::for_call("d", &a, false));
    }

    #[test]
    fn memory_cache_honours_max_age() {
        let cache = MemoryCache::new();
        let key = CacheKey::for_call("c", &CallSpec::new("/k", ReqType::Get), false);
        cache.save(&key, "text/plain", b"hello", Duration::from_secs(60), 0);
        let hit = cache.get(&key, Duration::from_secs(60)).unwrap();
        assert_eq!(hit.content, b"hello");
        assert_eq!(hit.content_type, "text/plain");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key, Duration::from_millis(1)).is_none());
    }

    #[test]
    fn expired_entries_vanish() {
        let cache = MemoryCache::new();
        let key = CacheKey::for_call("c", &CallSpec::new("/k", ReqType::Get), false);
        cache.save(&key, "text/plain", b"x", Duration::ZERO, 0);
        assert!(cache.get(&key, Duration::from_secs(60)).is_none());
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn cachability_rules() {
        let cache = MemoryCache::new();
        assert!(cache.is_cachable(None, false, false, None));
        assert!(!cache.is_cachable(None, true, false, None));
        assert!(!cache.is_cachable(None, false, true, None));
        assert!(!cache.is_cachable(Some("No-Store"), false, false, None));
        assert!(!cache.is_cachable(None, false, false, Some("no-cache")));
        assert!(cache.is_cachable(Some("max-age=60"), false, false, None));
    }
}
