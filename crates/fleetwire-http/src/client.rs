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

use async_trait::async_trait;
use fleetwire_common::protocol::error::{Result, TransportError};
use fleetwire_common::{RawResponse, Request};
use fleetwire_transport::{ExecuteError, Node, NodeAddress, RequestExecutor};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::error::Error as StdError;
use std::time::Duration;
use tracing::trace;

use crate::config::HttpExecutorConfig;

/// Carries the request id unless the configuration sets its own.
const OPAQUE_ID: &str = "x-opaque-id";

/// Keep-alive channel to one node.
///
/// Wraps a hyper client whose connection pool only ever holds connections to
/// this node, so retiring the channel drops exactly that node's sockets.
pub struct NodeChannel {
    client: Client<HttpConnector, Full<Bytes>>,
    address: NodeAddress,
}

impl NodeChannel {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }
}

/// [`RequestExecutor`] speaking HTTP/1.1 through hyper.
///
/// Plain `http` only; TLS is left to executors that bring their own
/// connector.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    config: HttpExecutorConfig,
}

impl HttpExecutor {
    pub fn new(config: HttpExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HttpExecutorConfig {
        &self.config
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    type Handle = NodeChannel;

    fn open_handle(&self, address: &NodeAddress) -> Result<NodeChannel> {
        if address.scheme != "http" {
            return Err(TransportError::InvalidNodeAddress(format!(
                "{}: scheme '{}' is not supported by the HTTP executor",
                address, address.scheme
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(self.config.connect_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.config.pool_idle_timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Ok(NodeChannel {
            client,
            address: address.clone(),
        })
    }

    async fn execute(
        &self,
        handle: &NodeChannel,
        node: &Node,
        request: &Request,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, ExecuteError> {
        let uri = handle.address.url(&request.path);
        trace!(request_id = request.id, node = %node.id(), method = %request.method, %uri, "Sending request");

        let mut builder = hyper::Request::builder()
            .method(request.method.clone())
            .uri(&uri);
        for (name, value) in &self.config.default_headers {
            builder = builder.header(name, value);
        }
        if !self.config.default_headers.contains_key(OPAQUE_ID) {
            builder = builder.header(OPAQUE_ID, request.id.to_string());
        }
        if request.body.is_some() {
            builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        let http_request = builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| ExecuteError::InvalidRequest(format!("{}: {}", uri, e)))?;

        let response = tokio::time::timeout(timeout, handle.client.request(http_request))
            .await
            .map_err(|_| ExecuteError::Timeout)?
            .map_err(|e| ExecuteError::Connection(describe(&e)))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ExecuteError::Io(describe(&e)))?
            .to_bytes();

        trace!(request_id = request.id, node = %node.id(), status, bytes = body.len(), "Received response");
        Ok(RawResponse::new(status, body))
    }
}

/// Flattens an error and its sources into one line. hyper's top-level
/// messages ("client error (Connect)") hide the useful part.
fn describe(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
