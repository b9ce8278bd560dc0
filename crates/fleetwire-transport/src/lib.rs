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


//! Fleetwire Transport
//!
//! Cluster-aware request transport: the caller hands over one logical
//! request and the transport decides which node serves it, retries on other
//! nodes when one fails, keeps a view of node health, refreshes the topology
//! by sniffing, and records an [`AuditTrail`] of everything it did.
//!
//! # Components
//!
//! - [`NodeRegistry`] - node set, health and round-robin selection
//! - [`HandleCache`] - per-node connection handles with bounded lifetime
//! - [`Sniffer`] - topology discovery through `GET /_nodes/http`
//! - [`Transport`] - the request pipeline tying the above together
//! - [`RequestExecutor`] - the port a concrete wire client implements
//!
//! # Example
//!
//! ```no_run
//! # async fn run<E: fleetwire_transport::RequestExecutor>(executor: E) -> fleetwire_common::Result<()> {
//! use fleetwire_common::{Request, TransportConfig};
//! use fleetwire_transport::{CallContext, Node, Transport};
//!
//! let seeds = vec![Node::seed("http://10.0.0.1:9200")?, Node::seed("http://10.0.0.2:9200")?];
//! let transport = Transport::new(TransportConfig::default(), seeds, executor)?;
//!
//! let executed = transport.execute(&Request::get("/_cluster/health"), &CallContext::new()).await;
//! println!("{}", executed.audit_trail);
//! let response = executed.into_result()?;
//! println!("{} answered {}", response.node, response.status);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod executor;
pub mod handle_cache;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod sniffer;

pub use audit::{AuditEvent, AuditKind, AuditTrail, SniffTrigger};
pub use executor::{ExecuteError, RequestExecutor};
pub use handle_cache::{CachedHandle, HandleCache};
pub use node::{BackoffPolicy, Node, NodeAddress, NodeHealth, NodeId, NodeRoles};
pub use pipeline::{CallContext, Executed, Transport};
pub use registry::{NodeRegistry, RegistryCapabilities, SelectedNode};
pub use sniffer::{parse_nodes_response, ClusterTopology, Sniffer};
