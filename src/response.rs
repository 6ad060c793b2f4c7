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

use crate::constants::LOCAL_STATUS_BASE;
use crate::error::{ResponseError, reason_phrase};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Response of one node, or a locally synthesized one for failures
/// (codes from [`LOCAL_STATUS_BASE`] up).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub content: Vec<u8>,
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: reason_phrase(code).to_string(),
            headers: Vec::new(),
            content: Vec::new(),
            max_age: None,
        }
    }

    pub fn ok(content: impl Into<Vec<u8>>) -> Self {
        Self::new(200).with_content(content)
    }

    /// Failure that never reached (or never came back from) a node.
    pub fn local_error(code: u16, detail: impl Into<String>) -> Self {
        let mut resp = Self::new(code);
        resp.content = detail.into().into_bytes();
        resp
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.code
    }

    pub fn is_local_error(&self) -> bool {
        self.code >= LOCAL_STATUS_BASE
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.get_header("content-type")
            .unwrap_or("application/octet-stream")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.content)
    }

    pub fn raise_for_status(&self) -> Result<(), ResponseError> {
        if self.code >= 400 {
            return Err(ResponseError {
                code: self.code,
                reason: self.reason.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_for_status() {
        assert!(Response::ok("x").raise_for_status().is_ok());
        assert!(Response::new(304).raise_for_status().is_ok());
        let err = Response::new(503).raise_for_status().unwrap_err();
        assert_eq!(err.code, 503);
        assert_eq!(err.reason, "Service Unavailable");
        assert!(Response::local_error(701, "reset").raise_for_status().is_err());
    }

    #[test]
    fn local_errors() {
        assert!(Response::local_error(702, "deadline").is_local_error());
        assert!(!Response::new(599).is_local_error());
    }

    #[test]
    fn headers_and_json() {
        let resp = Response::ok(r#"{"n":3}"#).with_header("Content-Type", "application/json");
        assert_eq!(resp.content_type(), "application/json");
        let v: serde_json::Value = resp.json().unwrap();
        assert_eq!(v["n"], 3);
    }
}
