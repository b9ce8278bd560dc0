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

//! Topology discovery ("sniffing").
//!
//! A sniff asks one live node for the cluster's current HTTP-reachable
//! members and swaps the registry's topology for the answer. Sniffs are
//! best effort: a failed sniff leaves the registry untouched and never fails
//! the call that triggered it.

use fleetwire_common::protocol::error::{Result, TransportError};
use fleetwire_common::{Request, TransportConfig};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditKind, AuditTrail, SniffTrigger};
use crate::executor::RequestExecutor;
use crate::handle_cache::HandleCache;
use crate::node::{Node, NodeAddress, NodeId, NodeRoles};
use crate::pipeline::CallContext;
use crate::registry::NodeRegistry;

/// Nodes tried per sniff invocation: one, plus one alternate.
const MAX_SNIFF_NODES: usize = 2;

/// Topology prober bound to one transport.
pub struct Sniffer<E: RequestExecutor> {
    executor: Arc<E>,
    registry: Arc<NodeRegistry>,
    handles: Arc<HandleCache<NodeId, E::Handle>>,
    config: TransportConfig,
    in_progress: tokio::sync::Mutex<()>,
    last_refresh: Mutex<Instant>,
    /// Set by the first successful sniff, whatever triggered it
    discovered: AtomicBool,
}

impl<E: RequestExecutor> Sniffer<E> {
    pub fn new(
        executor: Arc<E>,
        registry: Arc<NodeRegistry>,
        handles: Arc<HandleCache<NodeId, E::Handle>>,
        config: TransportConfig,
    ) -> Self {
        Self {
            executor,
            registry,
            handles,
            config,
            in_progress: tokio::sync::Mutex::new(()),
            last_refresh: Mutex::new(Instant::now()),
            discovered: AtomicBool::new(false),
        }
    }

    /// Queries `node` for the cluster topology without touching the registry.
    ///
    /// # Errors
    ///
    /// `TransportError::Sniff` on transport failure, a non-2xx answer, or a
    /// response listing no HTTP-reachable node; `TransportError::Json` when
    /// the body is not a nodes-info document.
    pub async fn sniff_once(&self, node: &Node) -> Result<Vec<Node>> {
        let timeout = self.config.sniff_timeout;
        let request = Request::get(format!("/_nodes/http?timeout={}ms", timeout.as_millis()));
        let handle = self.handles.acquire(node.id())?;
        let channel: &E::Handle = &handle;

        let raw = tokio::time::timeout(
            timeout,
            self.executor.execute(channel, node, &request, timeout),
        )
        .await
        .map_err(|_| TransportError::Sniff(format!("{} timed out after {:?}", node.id(), timeout)))?
        .map_err(|e| TransportError::Sniff(format!("{}: {}", node.id(), e)))?;

        if !(200..300).contains(&raw.status) {
            return Err(TransportError::Sniff(format!(
                "{} answered HTTP {}",
                node.id(),
                raw.status
            )));
        }

        let topology = parse_nodes_response(&raw.body, &node.address.scheme)?;
        if topology.nodes.is_empty() {
            return Err(TransportError::Sniff(format!(
                "{} reported no node with an HTTP publish address",
                node.id()
            )));
        }
        Ok(topology.nodes)
    }

    /// Runs the startup sniff, if configured, until one succeeds.
    ///
    /// Callers arriving while it runs wait for it instead of going out
    /// against the seed list, then return without sniffing again if it
    /// succeeded.
    pub async fn sniff_on_startup_if_configured(&self, context: &CallContext, trail: &mut AuditTrail) -> bool {
        if !self.config.sniff_on_startup || self.startup_done() || !self.registry.capabilities().supports_reseeding {
            return false;
        }
        let _guard = tokio::select! {
            biased;
            _ = context.cancellation().cancelled() => return false,
            guard = self.in_progress.lock() => guard,
        };
        if self.startup_done() {
            return false;
        }
        self.refresh_locked(SniffTrigger::Startup, None, context, trail).await
    }

    /// Refreshes the topology through a node other than `failed`, if
    /// configured.
    pub async fn sniff_on_failure_if_configured(
        &self,
        failed: &NodeId,
        context: &CallContext,
        trail: &mut AuditTrail,
    ) -> bool {
        if !self.config.sniff_on_connection_failure {
            return false;
        }
        self.refresh(SniffTrigger::ConnectionFailure, Some(failed), context, trail).await
    }

    /// Refreshes the topology when the last one is older than
    /// `sniff_lifespan`.
    pub async fn sniff_on_stale_if_configured(&self, context: &CallContext, trail: &mut AuditTrail) -> bool {
        if !self.is_stale() {
            return false;
        }
        self.refresh(SniffTrigger::Stale, None, context, trail).await
    }

    pub fn is_stale(&self) -> bool {
        let Some(lifespan) = self.config.sniff_lifespan else {
            return false;
        };
        let last = *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now() >= last + lifespan
    }

    /// Whether any sniff has succeeded; the startup sniff stops once one has.
    pub fn startup_done(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    /// Runs a sniff unless another one is in flight.
    async fn refresh(
        &self,
        trigger: SniffTrigger,
        exclude: Option<&NodeId>,
        context: &CallContext,
        trail: &mut AuditTrail,
    ) -> bool {
        if !self.registry.capabilities().supports_reseeding {
            return false;
        }
        let Ok(_guard) = self.in_progress.try_lock() else {
            debug!(?trigger, "Sniff already in progress, skipping");
            return false;
        };
        self.refresh_locked(trigger, exclude, context, trail).await
    }

    /// Must be called with `in_progress` held.
    async fn refresh_locked(
        &self,
        trigger: SniffTrigger,
        exclude: Option<&NodeId>,
        context: &CallContext,
        trail: &mut AuditTrail,
    ) -> bool {
        let mut tried: HashSet<NodeId> = exclude.into_iter().cloned().collect();
        for _ in 0..MAX_SNIFF_NODES {
            let Ok(selected) = self.registry.select_node(&tried) else {
                break;
            };
            let node = selected.node;
            tried.insert(node.id().clone());

            let timestamp = SystemTime::now();
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = context.cancellation().cancelled() => Err(TransportError::Cancelled),
                outcome = self.sniff_once(&node) => outcome,
            };
            let event = AuditEvent::new(AuditKind::SniffSuccess, Some(node.id().clone()), timestamp, started.elapsed())
                .with_sniff_trigger(trigger);

            let applied = outcome.and_then(|nodes| {
                let count = nodes.len();
                self.apply(nodes)?;
                Ok(count)
            });
            match applied {
                Ok(count) => {
                    *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                    self.discovered.store(true, Ordering::Release);
                    info!(?trigger, via = %node.id(), nodes = count, "Sniff succeeded");
                    trail.record(event);
                    return true;
                }
                Err(e) => {
                    let cancelled = matches!(e, TransportError::Cancelled);
                    if cancelled {
                        debug!(?trigger, via = %node.id(), "Sniff cancelled");
                    } else {
                        warn!(?trigger, via = %node.id(), error = %e, "Sniff failed");
                    }
                    let mut event = event.with_detail(e.to_string());
                    event.kind = AuditKind::SniffFailure;
                    trail.record(event);
                    if cancelled {
                        return false;
                    }
                }
            }
        }
        false
    }

    /// Swaps in `nodes` and evicts handles of nodes that left.
    fn apply(&self, nodes: Vec<Node>) -> Result<()> {
        let before: HashSet<NodeId> = self.registry.nodes().iter().map(|n| n.id().clone()).collect();
        let after: HashSet<NodeId> = nodes.iter().map(|n| n.id().clone()).collect();
        self.registry.replace_topology(nodes)?;

        for gone in before.difference(&after) {
            if self.handles.expire(gone) {
                debug!(node = %gone, "Evicted handle of departed node");
            }
        }
        Ok(())
    }
}

/// Decoded `GET /_nodes/http` answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTopology {
    pub cluster_name: Option<String>,
    /// Usable nodes, ordered by address
    pub nodes: Vec<Node>,
}

#[derive(Deserialize)]
struct NodesInfoBody {
    cluster_name: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, NodeInfoBody>,
}

#[derive(Deserialize)]
struct NodeInfoBody {
    name: Option<String>,
    roles: Option<Vec<String>>,
    http: Option<HttpInfoBody>,
}

#[derive(Deserialize)]
struct HttpInfoBody {
    publish_address: Option<String>,
}

/// Parses a nodes-info document. Nodes without an HTTP publish address are
/// skipped, as are addresses that do not parse.
pub fn parse_nodes_response(body: &[u8], scheme: &str) -> Result<ClusterTopology> {
    let info: NodesInfoBody = serde_json::from_slice(body)?;

    let mut nodes: Vec<Node> = info
        .nodes
        .into_iter()
        .filter_map(|(node_id, node)| {
            let publish = node.http?.publish_address?;
            let Some(address) = parse_publish_address(&publish, scheme) else {
                debug!(%node_id, %publish, "Skipping node with unparseable publish address");
                return None;
            };

            let roles = match &node.roles {
                Some(names) => NodeRoles::from_names(names.iter().map(String::as_str)),
                None => NodeRoles::all(),
            };
            let mut parsed = Node::new(address).with_node_id(node_id).with_roles(roles);
            if let Some(name) = node.name {
                parsed = parsed.with_name(name);
            }
            Some(parsed)
        })
        .collect();
    nodes.sort_by(|a, b| a.id().cmp(b.id()));

    Ok(ClusterTopology {
        cluster_name: info.cluster_name,
        nodes,
    })
}

/// Accepts `ip:port`, `host/ip:port` and `[v6]:port`. The host name wins
/// over the IP when both are present.
fn parse_publish_address(publish: &str, scheme: &str) -> Option<NodeAddress> {
    let (host_part, port) = publish.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;

    let host = match host_part.split_once('/') {
        Some((name, _)) if !name.is_empty() => name,
        Some((_, ip)) => ip,
        None => host_part,
    };
    if host.is_empty() {
        return None;
    }
    Some(NodeAddress::new(scheme, host, port))
}
