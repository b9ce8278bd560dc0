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

//! Transport configuration.

use std::time::Duration;

use crate::protocol::error::{Result, TransportError};

/// Configuration for one transport instance.
///
/// Every policy knob the request pipeline, node registry, sniffer and handle
/// cache consult lives here. A transport never reads process-wide state.
///
/// # Default Configuration
///
/// - `max_retries`: 3 (so at most 4 attempts per call)
/// - `request_timeout`: 60 seconds
/// - `overall_timeout`: none (one per-attempt timeout per allowed attempt)
/// - `sniff_on_startup`: false
/// - `sniff_on_connection_failure`: false
/// - `sniff_lifespan`: none
/// - `sniff_timeout`: 2 seconds
/// - `ping_timeout`: 2 seconds
/// - `ping_resurrected_nodes`: true
/// - `handler_lifetime`: 5 minutes
/// - `dead_node_backoff_base`: 1 minute
/// - `dead_node_backoff_cap`: 30 minutes
/// - `enable_diagnostics`: false
///
/// # Example
///
/// ```
/// use fleetwire_common::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::default()
///     .with_max_retries(2)
///     .with_request_timeout(Duration::from_secs(10))
///     .with_sniff_on_connection_failure(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Maximum number of retries after the initial attempt.
    ///
    /// Total attempts = max_retries + 1
    pub max_retries: usize,
    /// Timeout applied to each individual attempt
    pub request_timeout: Duration,
    /// Deadline for the whole call across all retries
    ///
    /// When `None`, `request_timeout` bounds the whole call as well.
    pub overall_timeout: Option<Duration>,
    /// Discover the cluster topology before the first call
    pub sniff_on_startup: bool,
    /// Refresh the topology after a node fails
    pub sniff_on_connection_failure: bool,
    /// Refresh the topology once the last refresh is older than this
    pub sniff_lifespan: Option<Duration>,
    /// Timeout for a single topology discovery request
    pub sniff_timeout: Duration,
    /// Timeout for the ping sent to a node coming back from the dead
    pub ping_timeout: Duration,
    /// Ping dead nodes before sending them a real request
    pub ping_resurrected_nodes: bool,
    /// Maximum lifetime of a cached connection handle
    pub handler_lifetime: Duration,
    /// First dead-node backoff window; doubles per consecutive failure
    pub dead_node_backoff_base: Duration,
    /// Upper bound of the dead-node backoff window
    pub dead_node_backoff_cap: Duration,
    /// Record request and response byte counts in the audit trail
    pub enable_diagnostics: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(60),
            overall_timeout: None,
            sniff_on_startup: false,
            sniff_on_connection_failure: false,
            sniff_lifespan: None,
            sniff_timeout: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(2),
            ping_resurrected_nodes: true,
            handler_lifetime: Duration::from_secs(5 * 60),
            dead_node_backoff_base: Duration::from_secs(60),
            dead_node_backoff_cap: Duration::from_secs(30 * 60),
            enable_diagnostics: false,
        }
    }
}

impl TransportConfig {
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn with_sniff_on_startup(mut self, enabled: bool) -> Self {
        self.sniff_on_startup = enabled;
        self
    }

    pub fn with_sniff_on_connection_failure(mut self, enabled: bool) -> Self {
        self.sniff_on_connection_failure = enabled;
        self
    }

    pub fn with_sniff_lifespan(mut self, lifespan: Duration) -> Self {
        self.sniff_lifespan = Some(lifespan);
        self
    }

    pub fn with_sniff_timeout(mut self, timeout: Duration) -> Self {
        self.sniff_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_ping_resurrected_nodes(mut self, enabled: bool) -> Self {
        self.ping_resurrected_nodes = enabled;
        self
    }

    pub fn with_handler_lifetime(mut self, lifetime: Duration) -> Self {
        self.handler_lifetime = lifetime;
        self
    }

    pub fn with_dead_node_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.dead_node_backoff_base = base;
        self.dead_node_backoff_cap = cap;
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.enable_diagnostics = enabled;
        self
    }

    /// The deadline budget for one logical call whose attempts each get
    /// `attempt_timeout`.
    ///
    /// Without an `overall_timeout` every allowed attempt gets its full
    /// timeout, so a timed-out attempt still leaves room to fail over.
    pub fn call_budget(&self, attempt_timeout: Duration) -> Duration {
        self.overall_timeout.unwrap_or_else(|| {
            let attempts = u32::try_from(self.max_retries).unwrap_or(u32::MAX).saturating_add(1);
            attempt_timeout.saturating_mul(attempts)
        })
    }

    /// Checks the invariants the transport relies on.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidConfig` if:
    /// - `request_timeout`, `handler_lifetime` or `dead_node_backoff_base` is zero
    /// - `dead_node_backoff_cap` is smaller than `dead_node_backoff_base`
    /// - `overall_timeout` is set to zero
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.overall_timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransportError::InvalidConfig(
                "overall_timeout must be greater than zero".to_string(),
            ));
        }
        if self.handler_lifetime.is_zero() {
            return Err(TransportError::InvalidConfig(
                "handler_lifetime must be greater than zero".to_string(),
            ));
        }
        if self.dead_node_backoff_base.is_zero() {
            return Err(TransportError::InvalidConfig(
                "dead_node_backoff_base must be greater than zero".to_string(),
            ));
        }
        if self.dead_node_backoff_cap < self.dead_node_backoff_base {
            return Err(TransportError::InvalidConfig(format!(
                "dead_node_backoff_cap ({:?}) is smaller than dead_node_backoff_base ({:?})",
                self.dead_node_backoff_cap, self.dead_node_backoff_base
            )));
        }
        Ok(())
    }
}
