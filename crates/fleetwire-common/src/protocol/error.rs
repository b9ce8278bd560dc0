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

use thiserror::Error;

/// Every way a logical call (or a piece of transport setup) can fail.
///
/// The variants fall into three groups:
///
/// - **Per-attempt failures** (`Connection`, `Timeout`, `ServerUnavailable`,
///   `PingFailed`) are absorbed by the request pipeline up to the retry
///   budget and mark the node dead.
/// - **Terminal call outcomes** (`BadResponse`, `Cancelled`,
///   `NoNodesAvailable`, `MaxRetriesReached`, `MaxTimeoutReached`) end the
///   call immediately.
/// - **Setup errors** (`InvalidConfig`, `InvalidNodeAddress`, ...) come from
///   constructing a transport or parsing input.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection to {node} failed: {message}")]
    Connection { node: String, message: String },

    #[error("Request to {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Node {node} is unavailable (HTTP {status})")]
    ServerUnavailable { node: String, status: u16 },

    #[error("Ping of {node} failed: {reason}")]
    PingFailed { node: String, reason: String },

    #[error("Node {node} rejected the request (HTTP {status}): {body}")]
    BadResponse {
        node: String,
        status: u16,
        body: String,
    },

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("No nodes available")]
    NoNodesAvailable,

    #[error("Maximum retries reached after {attempts} attempts: {last}")]
    MaxRetriesReached {
        attempts: usize,
        last: Box<TransportError>,
    },

    #[error("Maximum call timeout reached after {elapsed_ms}ms")]
    MaxTimeoutReached {
        elapsed_ms: u64,
        last: Option<Box<TransportError>>,
    },

    #[error("Sniff failed: {0}")]
    Sniff(String),

    #[error("Invalid node address: {0}")]
    InvalidNodeAddress(String),

    /// The request cannot be put on the wire (e.g. an unencodable path)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node registry does not support reseeding")]
    ReseedingNotSupported,

    #[error("Refusing to replace topology with an empty node set")]
    EmptyTopology,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the pipeline may try another node after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. }
                | TransportError::Timeout { .. }
                | TransportError::ServerUnavailable { .. }
                | TransportError::PingFailed { .. }
        )
    }

    /// Whether the node that produced this failure should be marked dead.
    ///
    /// Identical to [`is_retryable`](Self::is_retryable) today: a node is only
    /// blamed for failures another node could plausibly avoid.
    pub fn marks_node_dead(&self) -> bool {
        self.is_retryable()
    }

    /// The innermost per-attempt cause, unwrapping retry/timeout summaries.
    pub fn root_cause(&self) -> &TransportError {
        match self {
            TransportError::MaxRetriesReached { last, .. } => last.root_cause(),
            TransportError::MaxTimeoutReached {
                last: Some(last), ..
            } => last.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
