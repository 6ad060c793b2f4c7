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

use crate::cluster::Auth;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Caller-supplied metadata propagated to every result of a call.
pub type Meta = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReqType {
    #[default]
    Get,
    Post,
    Ws,
    Wss,
    Rpc,
    XmlRpc,
    JsonRpc,
    Grpc,
    Upload,
}

impl ReqType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReqType::Get => "get",
            ReqType::Post => "post",
            ReqType::Ws => "ws",
            ReqType::Wss => "wss",
            ReqType::Rpc => "rpc",
            ReqType::XmlRpc => "xmlrpc",
            ReqType::JsonRpc => "jsonrpc",
            ReqType::Grpc => "grpc",
            ReqType::Upload => "upload",
        }
    }

    /// RPC-style types are invoked through a method proxy.
    pub fn is_rpc(self) -> bool {
        self.as_str().ends_with("rpc")
    }

    pub fn http_method(self) -> &'static str {
        match self {
            ReqType::Get | ReqType::Ws | ReqType::Wss => "GET",
            _ => "POST",
        }
    }

    fn default_content_type(self) -> Option<&'static str> {
        match self {
            ReqType::Get | ReqType::Ws | ReqType::Wss => None,
            ReqType::Post | ReqType::JsonRpc => Some("application/json"),
            ReqType::Rpc | ReqType::XmlRpc => Some("text/xml"),
            ReqType::Grpc => Some("application/grpc"),
            ReqType::Upload => Some("multipart/form-data"),
        }
    }
}

impl fmt::Display for ReqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReqType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "get" => ReqType::Get,
            "post" => ReqType::Post,
            "ws" => ReqType::Ws,
            "wss" => ReqType::Wss,
            "rpc" => ReqType::Rpc,
            "xmlrpc" => ReqType::XmlRpc,
            "jsonrpc" => ReqType::JsonRpc,
            "grpc" => ReqType::Grpc,
            "upload" => ReqType::Upload,
            other => return Err(BuildError::UnknownReqType(other.to_string())),
        })
    }
}

/// Complete, immutable description of one logical call. Retries rebuild
/// their request from this snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    pub uri: String,
    pub reqtype: ReqType,
    pub method: Option<String>,
    pub params: Value,
    pub headers: Vec<(String, String)>,
    pub auth: Option<Auth>,
    pub meta: Meta,
}

impl CallSpec {
    pub fn new(uri: impl Into<String>, reqtype: ReqType) -> Self {
        Self {
            uri: uri.into(),
            reqtype,
            method: None,
            params: Value::Null,
            headers: Vec::new(),
            auth: None,
            meta: Meta::new(),
        }
    }
}

/// Wire-ready request handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub reqtype: ReqType,
    pub uri: String,
    pub method: Option<String>,
    pub params: Value,
    pub headers: Vec<(String, String)>,
    pub auth: Option<Auth>,
}

impl Request {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_cookie(&self) -> bool {
        self.get_header("cookie").is_some()
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some() || self.get_header("authorization").is_some()
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.get_header("cache-control")
    }

    pub fn pragma(&self) -> Option<&str> {
        self.get_header("pragma")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("empty uri")]
    EmptyUri,
    #[error("{0} request requires a method name")]
    MissingMethod(ReqType),
    #[error("invalid params for {0} request: {1}")]
    InvalidParams(ReqType, &'static str),
    #[error("unknown request type {0:?}")]
    UnknownReqType(String),
}

/// Turns a call description into a wire request for one connection.
pub trait RequestCodec: Send + Sync {
    fn build(&self, spec: &CallSpec, auth: Option<Auth>) -> Result<Request, BuildError>;
}

/// Codec covering every [`ReqType`] with structural validation and default
/// content types.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodec;

impl RequestCodec for StandardCodec {
    fn build(&self, spec: &CallSpec, auth: Option<Auth>) -> Result<Request, BuildError> {
        let reqtype = spec.reqtype;
        if spec.uri.trim().is_empty() {
            return Err(BuildError::EmptyUri);
        }
        let method = spec.method.clone().filter(|m| !m.is_empty());
        if reqtype.is_rpc() && method.is_none() {
            return Err(BuildError::MissingMethod(reqtype));
        }
        match (reqtype, &spec.params) {
            (ReqType::Get, Value::Null | Value::Object(_)) => {}
            (ReqType::Get, _) => {
                return Err(BuildError::InvalidParams(reqtype, "query must be an object"));
            }
            (ReqType::Upload, Value::Object(_)) => {}
            (ReqType::Upload, _) => {
                return Err(BuildError::InvalidParams(reqtype, "form must be an object"));
            }
            _ => {}
        }

        let mut headers = spec.headers.clone();
        let has = |headers: &[(String, String)], name: &str| {
            headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
        };
        if let Some(ct) = reqtype.default_content_type() {
            if !has(&headers, "content-type") {
                headers.push(("content-type".into(), ct.into()));
            }
        }
        if matches!(reqtype, ReqType::Ws | ReqType::Wss) && !has(&headers, "upgrade") {
            headers.push(("upgrade".into(), "websocket".into()));
        }

        Ok(Request {
            reqtype,
            uri: spec.uri.clone(),
            method,
            params: spec.params.clone(),
            headers,
            auth,
        })
    }
}
