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

use fleetwire_common::protocol::error::{Result, TransportError};
use fleetwire_common::NodeRole;
use hyper::Uri;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Canonical identity of a node: `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses a base URL such as `http://10.0.0.1:9200`.
    ///
    /// A missing port defaults to 80 for `http` and 443 for `https`. Any path
    /// component is ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let uri: Uri = s
            .parse()
            .map_err(|e| TransportError::InvalidNodeAddress(format!("{}: {}", s, e)))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| TransportError::InvalidNodeAddress(format!("{}: missing scheme", s)))?
            .to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            other => {
                return Err(TransportError::InvalidNodeAddress(format!(
                    "{}: unsupported scheme '{}'",
                    s, other
                )))
            }
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidNodeAddress(format!("{}: missing host", s)))?
            .to_string();

        Ok(Self {
            scheme,
            host,
            port: uri.port_u16().unwrap_or(default_port),
        })
    }

    pub fn id(&self) -> NodeId {
        NodeId(self.to_string())
    }

    /// Absolute URL for `path_and_query` on this node.
    pub fn url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self, path_and_query)
        } else {
            format!("{}/{}", self, path_and_query)
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Roles a node advertises; used to filter candidates for role-bound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRoles {
    pub data: bool,
    pub ingest: bool,
    pub master: bool,
}

impl NodeRoles {
    /// Every role. Seed nodes are assumed capable of anything until a sniff
    /// says otherwise.
    pub fn all() -> Self {
        Self {
            data: true,
            ingest: true,
            master: true,
        }
    }

    pub fn none() -> Self {
        Self {
            data: false,
            ingest: false,
            master: false,
        }
    }

    /// Builds roles from advertised role names. Data tier roles
    /// (`data_hot`, `data_content`, ...) count as data; unknown names are
    /// ignored.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut roles = Self::none();
        for name in names {
            match name {
                "master" => roles.master = true,
                "ingest" => roles.ingest = true,
                n if n == "data" || n.starts_with("data_") => roles.data = true,
                _ => {}
            }
        }
        roles
    }

    pub fn has(&self, role: NodeRole) -> bool {
        match role {
            NodeRole::Data => self.data,
            NodeRole::Ingest => self.ingest,
            NodeRole::Master => self.master,
        }
    }
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self::all()
    }
}

/// A cluster member the transport can talk to.
///
/// This is the immutable identity part; health lives in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: NodeAddress,
    /// Cluster-assigned node id, known after a sniff
    pub node_id: Option<String>,
    pub name: Option<String>,
    pub roles: NodeRoles,
    id: NodeId,
}

impl Node {
    pub fn new(address: NodeAddress) -> Self {
        let id = address.id();
        Self {
            address,
            node_id: None,
            name: None,
            roles: NodeRoles::all(),
            id,
        }
    }

    /// Parses a seed URL into a node with every role.
    pub fn seed(url: &str) -> Result<Self> {
        Ok(Self::new(NodeAddress::parse(url)?))
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = roles;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn url(&self, path_and_query: &str) -> String {
        self.address.url(path_and_query)
    }

    /// Whether the node may serve a request that needs `role`.
    pub fn satisfies(&self, role: Option<NodeRole>) -> bool {
        role.map(|r| self.roles.has(r)).unwrap_or(true)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.id, name),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Health of a node as seen by this transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Alive,
    Dead {
        dead_since: Instant,
        attempt_count: u32,
        next_available_at: Instant,
    },
}

impl NodeHealth {
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeHealth::Alive)
    }

    /// Alive, or dead with an elapsed backoff window.
    pub fn is_available_at(&self, now: Instant) -> bool {
        match self {
            NodeHealth::Alive => true,
            NodeHealth::Dead {
                next_available_at, ..
            } => *next_available_at <= now,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        match self {
            NodeHealth::Alive => 0,
            NodeHealth::Dead { attempt_count, .. } => *attempt_count,
        }
    }

    pub fn next_available_at(&self) -> Option<Instant> {
        match self {
            NodeHealth::Alive => None,
            NodeHealth::Dead {
                next_available_at, ..
            } => Some(*next_available_at),
        }
    }

    /// The health after one more failure observed at `now`.
    pub fn after_failure(&self, now: Instant, backoff: &BackoffPolicy) -> NodeHealth {
        let attempt_count = self.attempt_count().saturating_add(1);
        NodeHealth::Dead {
            dead_since: now,
            attempt_count,
            next_available_at: now + backoff.calculate(attempt_count),
        }
    }
}

/// Exponential dead-node backoff: `base * 2^(attempts - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn calculate(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        if exponent >= 32 {
            return self.cap;
        }
        self.base
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(30 * 60),
        }
    }
}
