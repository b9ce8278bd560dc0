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

//! Response types.

use hyper::body::Bytes;
use serde::de::DeserializeOwned;

use super::error::Result;

/// Status and body as returned by a raw request executor, before the
/// pipeline has classified it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    /// Body as lossy UTF-8, truncated for use in error messages.
    pub fn body_snippet(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.body);
        if text.len() <= max {
            return text.into_owned();
        }
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Successful answer to a logical call.
///
/// `node` is the node that produced the answer, so callers can correlate it
/// with the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
    pub node: String,
}

impl Response {
    pub fn from_raw(raw: RawResponse, node: impl Into<String>) -> Self {
        Self {
            status: raw.status,
            body: raw.body,
            node: node.into(),
        }
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_response_json() {
        let raw = RawResponse::ok(br#"{"cluster_name":"logs"}"#.to_vec());
        let response = Response::from_raw(raw, "http://a:9200");
        let value: Value = response.json().unwrap();
        assert_eq!(value, json!({"cluster_name": "logs"}));
        assert_eq!(response.node, "http://a:9200");
    }

    #[test]
    fn test_response_json_invalid() {
        let response = Response::from_raw(RawResponse::ok("not json"), "http://a:9200");
        assert!(response.json::<Value>().is_err());
    }

    #[test]
    fn test_body_snippet_truncates_on_char_boundary() {
        let raw = RawResponse::new(400, "héllo wörld");
        assert_eq!(raw.body_snippet(100), "héllo wörld");
        assert_eq!(raw.body_snippet(2), "h...");
    }
}
