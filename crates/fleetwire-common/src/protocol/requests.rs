// Copyright 2025 Fleetwire Authors
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

//! Logical request description handed to the transport.

use hyper::body::Bytes;
use hyper::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identifies one logical call in executor traffic (the HTTP executor sends
/// it as `X-Opaque-Id`). Every attempt of the call carries the same id.
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A role a cluster node may advertise.
///
/// Requests that must land on a particular kind of node (bulk indexing on an
/// ingest node, for instance) carry one of these as `required_role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Data,
    Ingest,
    Master,
}

/// One logical call against the cluster.
///
/// The transport treats the body as opaque bytes; building and parsing
/// endpoint payloads is the job of the layers above.
///
/// # Example
///
/// ```
/// use fleetwire_common::protocol::Request;
/// use hyper::Method;
///
/// let request = Request::new(Method::POST, "/logs/_search")
///     .with_json_body(br#"{"query":{"match_all":{}}}"#.to_vec())
///     .allow_status(404);
/// assert_eq!(request.path, "/logs/_search");
/// assert!(request.is_allowed_status(404));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    /// Path and query, starting with `/`
    pub path: String,
    pub body: Option<Bytes>,
    /// Non-2xx statuses the caller treats as a successful answer
    pub allowed_status_codes: Vec<u16>,
    pub required_role: Option<NodeRole>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        Request {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method,
            path,
            body: None,
            allowed_status_codes: Vec::new(),
            required_role: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn with_json_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn allow_status(mut self, status: u16) -> Self {
        if !self.allowed_status_codes.contains(&status) {
            self.allowed_status_codes.push(status);
        }
        self
    }

    pub fn with_required_role(mut self, role: NodeRole) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether `status` counts as a successful answer for this request.
    pub fn is_allowed_status(&self, status: u16) -> bool {
        (200..300).contains(&status) || self.allowed_status_codes.contains(&status)
    }

    /// Size of the request body in bytes.
    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}
