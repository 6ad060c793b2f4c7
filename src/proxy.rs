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

use crate::call::{CallTemplate, ClusterDistCall};
use serde_json::Value;

/// Entry point for RPC-style calls: `proxy.method("ns").attr("add").call(params)`.
///
/// Holds no per-call state; every [`Method::call`] issues a fresh
/// [`ClusterDistCall`].
#[derive(Clone)]
pub struct Proxy {
    template: CallTemplate,
}

impl Proxy {
    pub(crate) fn new(template: CallTemplate) -> Self {
        Self { template }
    }

    pub fn method(&self, name: impl Into<String>) -> Method {
        Method {
            template: self.template.clone(),
            path: vec![name.into()],
        }
    }
}

/// Dotted remote method name under construction.
#[derive(Clone)]
pub struct Method {
    template: CallTemplate,
    path: Vec<String>,
}

impl Method {
    pub fn attr(mut self, name: impl Into<String>) -> Self {
        self.path.push(name.into());
        self
    }

    pub fn name(&self) -> String {
        self.path.join(".")
    }

    pub fn call(&self, params: Value) -> ClusterDistCall {
        let mut template = self.template.clone();
        template.spec.method = Some(self.name());
        template.spec.params = params;
        ClusterDistCall::start(template, None)
    }
}
