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


//! Fleetwire HTTP Executor
//!
//! The production [`RequestExecutor`](fleetwire_transport::RequestExecutor):
//! one hyper-util keep-alive client per node handle, HTTP/1.1, JSON content
//! type for request bodies, and response bodies read fully into memory.
//!
//! ```no_run
//! # fn main() -> fleetwire_common::Result<()> {
//! use fleetwire_common::TransportConfig;
//! use fleetwire_http::{HttpExecutor, HttpExecutorConfig};
//! use fleetwire_transport::{Node, Transport};
//!
//! let executor = HttpExecutor::new(HttpExecutorConfig::default());
//! let transport = Transport::new(
//!     TransportConfig::default().with_sniff_on_startup(true),
//!     vec![Node::seed("http://localhost:9200")?],
//!     executor,
//! )?;
//! # drop(transport);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;

pub use client::{HttpExecutor, NodeChannel};
pub use config::HttpExecutorConfig;
