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

//! Node registry: the known node set, per-node health and round-robin selection.
//!
//! # Concurrency
//!
//! The node set is an immutable [`Topology`] snapshot behind an
//! [`ArcSwap`]. Selection loads one snapshot and works on it, so a concurrent
//! [`NodeRegistry::replace_topology`] is observed either entirely or not at
//! all. Each node's health sits behind its own mutex, held only for the
//! in-memory update, and the round-robin cursor is a plain atomic.

use arc_swap::ArcSwap;
use fleetwire_common::protocol::error::{Result, TransportError};
use fleetwire_common::TransportConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::node::{BackoffPolicy, Node, NodeHealth, NodeId};

/// Behavioural variant of a registry.
///
/// - static list: neither capability
/// - sniffing: `supports_reseeding`
/// - sticky: `supports_pinning` (always prefer the first usable node in
///   order rather than rotating)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryCapabilities {
    pub supports_reseeding: bool,
    pub supports_pinning: bool,
}

impl RegistryCapabilities {
    pub fn static_list() -> Self {
        Self::default()
    }

    /// A single fixed node. Behaves like a static list of one.
    pub fn single_node() -> Self {
        Self::default()
    }

    pub fn sniffing() -> Self {
        Self {
            supports_reseeding: true,
            supports_pinning: false,
        }
    }

    pub fn sticky() -> Self {
        Self {
            supports_reseeding: false,
            supports_pinning: true,
        }
    }

    pub fn sticky_sniffing() -> Self {
        Self {
            supports_reseeding: true,
            supports_pinning: true,
        }
    }
}

/// Result of a successful selection.
#[derive(Debug, Clone)]
pub struct SelectedNode {
    pub node: Node,
    /// The node was dead when selected (backoff elapsed, or last resort)
    pub was_dead: bool,
}

struct NodeSlot {
    node: Node,
    health: Mutex<NodeHealth>,
}

impl NodeSlot {
    fn new(node: Node, health: NodeHealth) -> Self {
        Self {
            node,
            health: Mutex::new(health),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeHealth> {
        // Health is a Copy value, a poisoned guard still holds a valid state
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn health(&self) -> NodeHealth {
        *self.lock()
    }
}

/// Immutable snapshot of the node set.
struct Topology {
    slots: Vec<Arc<NodeSlot>>,
    index: HashMap<NodeId, usize>,
}

impl Topology {
    fn build(slots: Vec<Arc<NodeSlot>>) -> Self {
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.node.id().clone(), i))
            .collect();
        Self { slots, index }
    }

    fn slot(&self, id: &NodeId) -> Option<&Arc<NodeSlot>> {
        self.index.get(id).map(|&i| &self.slots[i])
    }
}

/// The set of known cluster nodes and their health.
pub struct NodeRegistry {
    topology: ArcSwap<Topology>,
    cursor: AtomicUsize,
    backoff: BackoffPolicy,
    capabilities: RegistryCapabilities,
}

impl NodeRegistry {
    /// Creates a registry from seed nodes. Duplicate addresses are collapsed,
    /// keeping the first occurrence.
    pub fn new(seeds: Vec<Node>, backoff: BackoffPolicy, capabilities: RegistryCapabilities) -> Self {
        let slots = dedupe(seeds)
            .into_iter()
            .map(|node| Arc::new(NodeSlot::new(node, NodeHealth::Alive)))
            .collect();

        Self {
            topology: ArcSwap::from_pointee(Topology::build(slots)),
            cursor: AtomicUsize::new(0),
            backoff,
            capabilities,
        }
    }

    /// Creates a registry whose backoff comes from `config`.
    pub fn from_config(
        seeds: Vec<Node>,
        config: &TransportConfig,
        capabilities: RegistryCapabilities,
    ) -> Self {
        Self::new(
            seeds,
            BackoffPolicy::new(config.dead_node_backoff_base, config.dead_node_backoff_cap),
            capabilities,
        )
    }

    pub fn capabilities(&self) -> RegistryCapabilities {
        self.capabilities
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Picks the node for the next attempt, skipping `excluding`.
    pub fn select_node(&self, excluding: &HashSet<NodeId>) -> Result<SelectedNode> {
        self.select_node_matching(excluding, |_| true)
    }

    /// Picks the node for the next attempt among nodes accepted by `filter`.
    ///
    /// Nodes that are alive, or dead with an elapsed backoff window, are
    /// scanned in round-robin order. When none qualifies, the non-excluded
    /// dead node that becomes available soonest is returned as a last resort.
    ///
    /// # Errors
    ///
    /// `TransportError::NoNodesAvailable` when the set is empty or every
    /// matching node is excluded.
    pub fn select_node_matching<F>(&self, excluding: &HashSet<NodeId>, filter: F) -> Result<SelectedNode>
    where
        F: Fn(&Node) -> bool,
    {
        let topology = self.topology.load();
        let count = topology.slots.len();
        if count == 0 {
            return Err(TransportError::NoNodesAvailable);
        }

        let start = if self.capabilities.supports_pinning {
            0
        } else {
            self.cursor.fetch_add(1, Ordering::Relaxed) % count
        };
        let now = Instant::now();
        let mut last_resort: Option<(Instant, &Arc<NodeSlot>)> = None;

        for offset in 0..count {
            let slot = &topology.slots[(start + offset) % count];
            if excluding.contains(slot.node.id()) || !filter(&slot.node) {
                continue;
            }

            let health = slot.health();
            if health.is_available_at(now) {
                return Ok(SelectedNode {
                    node: slot.node.clone(),
                    was_dead: !health.is_alive(),
                });
            }

            if let Some(available_at) = health.next_available_at() {
                let sooner = last_resort
                    .map(|(best, _)| available_at < best)
                    .unwrap_or(true);
                if sooner {
                    last_resort = Some((available_at, slot));
                }
            }
        }

        match last_resort {
            Some((_, slot)) => {
                debug!(node = %slot.node.id(), "All candidate nodes are dead, using last resort");
                Ok(SelectedNode {
                    node: slot.node.clone(),
                    was_dead: true,
                })
            }
            None => Err(TransportError::NoNodesAvailable),
        }
    }

    /// Marks a node alive and resets its failure count. Unknown ids are ignored.
    pub fn mark_alive(&self, id: &NodeId) {
        let topology = self.topology.load();
        let Some(slot) = topology.slot(id) else {
            return;
        };

        let mut health = slot.lock();
        if !health.is_alive() {
            info!(node = %id, attempts = health.attempt_count(), "Node resurrected");
        }
        *health = NodeHealth::Alive;
    }

    /// Records a failure of the node, extending its backoff window.
    ///
    /// Returns the new health, or `None` for an unknown id.
    pub fn mark_dead(&self, id: &NodeId) -> Option<NodeHealth> {
        let topology = self.topology.load();
        let slot = topology.slot(id)?;

        let mut health = slot.lock();
        let updated = health.after_failure(Instant::now(), &self.backoff);
        if health.is_alive() {
            warn!(node = %id, "Node marked dead");
        } else {
            debug!(node = %id, attempts = updated.attempt_count(), "Dead node failed again");
        }
        *health = updated;
        Some(updated)
    }

    /// Atomically replaces the node set.
    ///
    /// Nodes whose identity survives keep their health; dropped nodes lose
    /// theirs. Readers observe either the old or the new set.
    ///
    /// # Errors
    ///
    /// - `TransportError::ReseedingNotSupported` for registries without the
    ///   reseeding capability
    /// - `TransportError::EmptyTopology` when `nodes` is empty
    pub fn replace_topology(&self, nodes: Vec<Node>) -> Result<()> {
        if !self.capabilities.supports_reseeding {
            return Err(TransportError::ReseedingNotSupported);
        }
        let nodes = dedupe(nodes);
        if nodes.is_empty() {
            return Err(TransportError::EmptyTopology);
        }

        self.topology.rcu(|current| {
            let slots = nodes
                .iter()
                .map(|node| match current.slot(node.id()) {
                    Some(existing) if existing.node == *node => Arc::clone(existing),
                    Some(existing) => Arc::new(NodeSlot::new(node.clone(), existing.health())),
                    None => Arc::new(NodeSlot::new(node.clone(), NodeHealth::Alive)),
                })
                .collect();
            Topology::build(slots)
        });

        info!(nodes = nodes.len(), "Replaced cluster topology");
        Ok(())
    }

    /// The current node set, in selection order.
    pub fn nodes(&self) -> Vec<Node> {
        self.topology
            .load()
            .slots
            .iter()
            .map(|slot| slot.node.clone())
            .collect()
    }

    /// The current node set with each node's health.
    pub fn snapshot(&self) -> Vec<(Node, NodeHealth)> {
        self.topology
            .load()
            .slots
            .iter()
            .map(|slot| (slot.node.clone(), slot.health()))
            .collect()
    }

    pub fn health(&self, id: &NodeId) -> Option<NodeHealth> {
        self.topology.load().slot(id).map(|slot| slot.health())
    }

    pub fn node_count(&self) -> usize {
        self.topology.load().slots.len()
    }

    pub fn alive_count(&self) -> usize {
        self.topology
            .load()
            .slots
            .iter()
            .filter(|slot| slot.health().is_alive())
            .count()
    }
}

fn dedupe(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| seen.insert(node.id().clone()))
        .collect()
}
