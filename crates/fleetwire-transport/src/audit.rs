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

//! Per-call audit trail.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::node::NodeId;

/// What happened in one audited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    HealthyResponse,
    /// The node answered with a status the caller must see (not retried)
    BadResponse,
    /// The node answered 502/503/504
    ServerUnavailable,
    TransportFailure,
    Timeout,
    Cancelled,
    PingSuccess,
    PingFailure,
    SniffSuccess,
    SniffFailure,
}

impl AuditKind {
    /// Whether the event consumed one attempt of the retry budget.
    pub fn is_attempt(&self) -> bool {
        !matches!(
            self,
            AuditKind::PingSuccess | AuditKind::SniffSuccess | AuditKind::SniffFailure
        )
    }

    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            AuditKind::HealthyResponse | AuditKind::PingSuccess | AuditKind::SniffSuccess
        )
    }
}

/// Why a sniff ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffTrigger {
    Startup,
    ConnectionFailure,
    Stale,
}

/// One audited step of a logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub node: Option<NodeId>,
    pub timestamp: SystemTime,
    pub latency: Duration,
    pub status: Option<u16>,
    /// Present only when diagnostics are enabled
    pub bytes_sent: Option<u64>,
    /// Present only when diagnostics are enabled
    pub bytes_received: Option<u64>,
    /// Failure reason
    pub detail: Option<String>,
    pub sniff_trigger: Option<SniffTrigger>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, node: Option<NodeId>, timestamp: SystemTime, latency: Duration) -> Self {
        Self {
            kind,
            node,
            timestamp,
            latency,
            status: None,
            bytes_sent: None,
            bytes_received: None,
            detail: None,
            sniff_trigger: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_bytes(mut self, sent: u64, received: u64) -> Self {
        self.bytes_sent = Some(sent);
        self.bytes_received = Some(received);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_sniff_trigger(mut self, trigger: SniffTrigger) -> Self {
        self.sniff_trigger = Some(trigger);
        self
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(trigger) = self.sniff_trigger {
            write!(f, " ({:?})", trigger)?;
        }
        match &self.node {
            Some(node) => write!(f, " node: {}", node)?,
            None => write!(f, " node: -")?,
        }
        write!(f, " took: {}ms", self.latency.as_millis())?;
        if let Some(status) = self.status {
            write!(f, " status: {}", status)?;
        }
        if let (Some(sent), Some(received)) = (self.bytes_sent, self.bytes_received) {
            write!(f, " bytes: {}/{}", sent, received)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " reason: {}", detail)?;
        }
        Ok(())
    }
}

/// Ordered, append-only record of everything one logical call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditTrail {
    events: Vec<AuditEvent>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    /// Events that consumed an attempt, in order.
    pub fn attempts(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter().filter(|e| e.kind.is_attempt())
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts().count()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

impl<'a> IntoIterator for &'a AuditTrail {
    type Item = &'a AuditEvent;
    type IntoIter = std::slice::Iter<'a, AuditEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl fmt::Display for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Audit trail ({} events)", self.events.len())?;
        for (i, event) in self.events.iter().enumerate() {
            writeln!(f, " - [{}] {}", i + 1, event)?;
        }
        Ok(())
    }
}
