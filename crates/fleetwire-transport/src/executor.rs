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

//! Raw request executor port.
//!
//! The pipeline never touches sockets. It hands a node, a request and a
//! timeout to a [`RequestExecutor`] and gets back a status and body, or a
//! transport-level failure. `fleetwire-http` provides the HTTP implementation;
//! tests provide scripted ones.

use async_trait::async_trait;
use fleetwire_common::protocol::error::Result;
use fleetwire_common::{RawResponse, Request};
use std::time::Duration;
use thiserror::Error;

use crate::node::{Node, NodeAddress};

/// Transport-level failure of one raw exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    /// Refused, reset, DNS failure, or any failure before a response arrived
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out")]
    Timeout,

    /// The response started but could not be read completely
    #[error("I/O error: {0}")]
    Io(String),

    /// The request could not be built; no node was contacted
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Sends one request to one node.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    /// Reusable channel to a node, cached by the transport for
    /// `handler_lifetime`.
    type Handle: Send + Sync + 'static;

    /// Creates a handle for `address`. Must not perform network I/O.
    fn open_handle(&self, address: &NodeAddress) -> Result<Self::Handle>;

    /// Executes `request` against `node` through `handle`.
    ///
    /// `timeout` is advisory; the pipeline enforces it independently.
    async fn execute(
        &self,
        handle: &Self::Handle,
        node: &Node,
        request: &Request,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, ExecuteError>;
}
