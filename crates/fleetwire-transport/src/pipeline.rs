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

//! Request pipeline.
//!
//! [`Transport::execute`] turns one logical request into a sequence of node
//! attempts:
//!
//! 1. Optional startup and staleness sniffs
//! 2. Node selection, skipping nodes already tried in this call
//! 3. A `HEAD /` ping when the chosen node was dead
//! 4. The attempt itself, raced against the caller's cancellation token
//! 5. Classification: success and terminal answers end the call, retryable
//!    failures mark the node dead and move on to the next one
//!
//! Every step lands in the call's [`AuditTrail`].

use fleetwire_common::protocol::error::{Result, TransportError};
use fleetwire_common::{RawResponse, Request, Response, TransportConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditKind, AuditTrail};
use crate::executor::{ExecuteError, RequestExecutor};
use crate::handle_cache::{HandleCache, HandleFactory};
use crate::node::{Node, NodeAddress, NodeId};
use crate::registry::{NodeRegistry, RegistryCapabilities};
use crate::sniffer::Sniffer;

/// Longest response body excerpt carried in a `BadResponse` error.
const MAX_ERROR_BODY: usize = 512;

/// Per-call inputs that are not part of the request itself.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the call to `token`; cancelling it aborts the in-flight attempt.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Outcome of a logical call together with everything it did.
#[derive(Debug)]
pub struct Executed {
    pub result: Result<Response>,
    pub audit_trail: AuditTrail,
}

impl Executed {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Response> {
        self.result
    }
}

enum AttemptOutcome {
    Success(Response),
    Retryable(TransportError),
    Terminal(TransportError),
    Cancelled,
}

impl From<TransportError> for AttemptOutcome {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Cancelled => AttemptOutcome::Cancelled,
            e if e.is_retryable() => AttemptOutcome::Retryable(e),
            e => AttemptOutcome::Terminal(e),
        }
    }
}

#[derive(Debug, Error)]
enum DispatchFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error(transparent)]
    Executor(ExecuteError),

    #[error(transparent)]
    Setup(TransportError),
}

impl DispatchFailure {
    fn into_error(self, node: &NodeId) -> TransportError {
        match self {
            DispatchFailure::Cancelled => TransportError::Cancelled,
            DispatchFailure::Timeout(timeout) => TransportError::Timeout {
                node: node.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            DispatchFailure::Executor(ExecuteError::InvalidRequest(message)) => {
                TransportError::InvalidRequest(message)
            }
            DispatchFailure::Executor(e) => TransportError::Connection {
                node: node.to_string(),
                message: e.to_string(),
            },
            DispatchFailure::Setup(e) => e,
        }
    }
}

/// Cluster-aware transport: node registry, handle cache and sniffer behind a
/// single `execute`.
///
/// `Transport` is shared by reference (typically `Arc<Transport<E>>`) across
/// concurrent calls.
pub struct Transport<E: RequestExecutor> {
    config: TransportConfig,
    executor: Arc<E>,
    registry: Arc<NodeRegistry>,
    handles: Arc<HandleCache<NodeId, E::Handle>>,
    sniffer: Sniffer<E>,
}

impl<E: RequestExecutor> Transport<E> {
    /// Creates a transport over `seeds`.
    ///
    /// The registry supports reseeding when any sniff option is enabled and
    /// is a static list otherwise.
    ///
    /// # Errors
    ///
    /// `TransportError::InvalidConfig` for an invalid configuration or an
    /// empty seed list.
    pub fn new(config: TransportConfig, seeds: Vec<Node>, executor: E) -> Result<Self> {
        let sniffs = config.sniff_on_startup
            || config.sniff_on_connection_failure
            || config.sniff_lifespan.is_some();
        let capabilities = if sniffs {
            RegistryCapabilities::sniffing()
        } else {
            RegistryCapabilities::static_list()
        };

        let registry = Arc::new(NodeRegistry::from_config(seeds, &config, capabilities));
        Self::with_registry(config, registry, executor)
    }

    /// Creates a transport over an existing registry.
    pub fn with_registry(config: TransportConfig, registry: Arc<NodeRegistry>, executor: E) -> Result<Self> {
        config.validate()?;
        if registry.node_count() == 0 {
            return Err(TransportError::InvalidConfig(
                "at least one seed node is required".to_string(),
            ));
        }

        let executor = Arc::new(executor);
        let opener = Arc::clone(&executor);
        let factory: HandleFactory<NodeId, E::Handle> = Arc::new(move |id: &NodeId| -> Result<E::Handle> {
            opener.open_handle(&NodeAddress::parse(id.as_str())?)
        });
        let handles = Arc::new(HandleCache::new(config.handler_lifetime, factory));
        let sniffer = Sniffer::new(
            Arc::clone(&executor),
            Arc::clone(&registry),
            Arc::clone(&handles),
            config.clone(),
        );

        Ok(Self {
            config,
            executor,
            registry,
            handles,
            sniffer,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn handles(&self) -> &HandleCache<NodeId, E::Handle> {
        &self.handles
    }

    pub fn sniffer(&self) -> &Sniffer<E> {
        &self.sniffer
    }

    /// Runs the startup sniff now instead of on the first call.
    pub async fn sniff_on_startup(&self) -> AuditTrail {
        let mut trail = AuditTrail::new();
        self.sniffer
            .sniff_on_startup_if_configured(&CallContext::new(), &mut trail)
            .await;
        trail
    }

    /// Pings `node` with `HEAD /` and returns the round-trip time. The
    /// registry is not updated.
    pub async fn ping_node(&self, node: &Node, context: &CallContext) -> Result<Duration> {
        let started = Instant::now();
        match self
            .dispatch(node, &Request::head("/"), self.config.ping_timeout, context)
            .await
        {
            Ok(raw) if !is_unavailable(raw.status) => Ok(started.elapsed()),
            Ok(raw) => Err(TransportError::ServerUnavailable {
                node: node.id().to_string(),
                status: raw.status,
            }),
            Err(failure) => Err(failure.into_error(node.id())),
        }
    }

    /// Executes one logical request with failover across the cluster.
    pub async fn execute(&self, request: &Request, context: &CallContext) -> Executed {
        let mut audit_trail = AuditTrail::new();
        let result = self.run(request, context, &mut audit_trail).await;
        Executed {
            result,
            audit_trail,
        }
    }

    async fn run(&self, request: &Request, context: &CallContext, trail: &mut AuditTrail) -> Result<Response> {
        let started = Instant::now();
        let attempt_timeout = request.timeout.unwrap_or(self.config.request_timeout);
        // `None` when the budget is too large to represent: no deadline
        let deadline = started.checked_add(self.config.call_budget(attempt_timeout));
        let past_deadline = || deadline.is_some_and(|d| Instant::now() >= d);
        let timeout_left = || match deadline {
            Some(d) => attempt_timeout.min(d.saturating_duration_since(Instant::now())),
            None => attempt_timeout,
        };
        let timed_out = |last: Option<TransportError>| TransportError::MaxTimeoutReached {
            elapsed_ms: started.elapsed().as_millis() as u64,
            last: last.map(Box::new),
        };

        self.sniffer.sniff_on_startup_if_configured(context, trail).await;
        self.sniffer.sniff_on_stale_if_configured(context, trail).await;

        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut retries = 0;
        loop {
            if context.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if past_deadline() {
                return Err(timed_out(None));
            }

            let selected = self
                .registry
                .select_node_matching(&tried, |node| node.satisfies(request.required_role))?;
            let node = selected.node;
            tried.insert(node.id().clone());

            let pinged = if selected.was_dead && self.config.ping_resurrected_nodes {
                Some(self.ping(&node, timeout_left(), context, trail).await)
            } else {
                None
            };
            let outcome = match pinged {
                Some(Err(outcome)) => outcome,
                // A slow ping may leave no time for the request; the node
                // answered, so it is not blamed
                Some(Ok(())) if past_deadline() => return Err(timed_out(None)),
                _ => self.attempt(&node, request, timeout_left(), context, trail).await,
            };

            match outcome {
                AttemptOutcome::Success(response) => {
                    self.registry.mark_alive(node.id());
                    return Ok(response);
                }
                AttemptOutcome::Terminal(e) => return Err(e),
                AttemptOutcome::Cancelled => return Err(TransportError::Cancelled),
                AttemptOutcome::Retryable(e) => {
                    if e.marks_node_dead() {
                        self.registry.mark_dead(node.id());
                    }
                    self.sniffer
                        .sniff_on_failure_if_configured(node.id(), context, trail)
                        .await;

                    if context.is_cancelled() {
                        return Err(TransportError::Cancelled);
                    }
                    if retries >= self.config.max_retries {
                        return Err(TransportError::MaxRetriesReached {
                            attempts: retries + 1,
                            last: Box::new(e),
                        });
                    }
                    if past_deadline() {
                        return Err(timed_out(Some(e)));
                    }
                    retries += 1;
                }
            }
        }
    }

    /// Pings a node that was dead at selection. `Err` carries the outcome
    /// that replaces the attempt.
    async fn ping(
        &self,
        node: &Node,
        budget: Duration,
        context: &CallContext,
        trail: &mut AuditTrail,
    ) -> std::result::Result<(), AttemptOutcome> {
        let timestamp = SystemTime::now();
        let started = Instant::now();
        let result = self
            .dispatch(node, &Request::head("/"), self.config.ping_timeout.min(budget), context)
            .await;
        let latency = started.elapsed();
        let event = |kind| AuditEvent::new(kind, Some(node.id().clone()), timestamp, latency);

        let reason = match result {
            Ok(raw) if !is_unavailable(raw.status) => {
                trail.record(event(AuditKind::PingSuccess).with_status(raw.status));
                return Ok(());
            }
            Ok(raw) => {
                trail.record(
                    event(AuditKind::PingFailure)
                        .with_status(raw.status)
                        .with_detail(format!("HTTP {}", raw.status)),
                );
                format!("HTTP {}", raw.status)
            }
            Err(DispatchFailure::Cancelled) => {
                trail.record(event(AuditKind::Cancelled));
                return Err(AttemptOutcome::Cancelled);
            }
            Err(DispatchFailure::Setup(e)) => {
                trail.record(event(AuditKind::TransportFailure).with_detail(e.to_string()));
                return Err(e.into());
            }
            Err(failure) => {
                let reason = failure.to_string();
                trail.record(event(AuditKind::PingFailure).with_detail(reason.clone()));
                reason
            }
        };

        Err(TransportError::PingFailed {
            node: node.id().to_string(),
            reason,
        }
        .into())
    }

    async fn attempt(
        &self,
        node: &Node,
        request: &Request,
        timeout: Duration,
        context: &CallContext,
        trail: &mut AuditTrail,
    ) -> AttemptOutcome {
        let timestamp = SystemTime::now();
        let started = Instant::now();
        let result = self.dispatch(node, request, timeout, context).await;
        let latency = started.elapsed();
        let event = |kind| AuditEvent::new(kind, Some(node.id().clone()), timestamp, latency);

        match result {
            Ok(raw) => {
                let status = raw.status;
                let received = raw.body.len() as u64;
                let (kind, outcome) = classify(request, node.id(), raw);

                let mut audited = event(kind).with_status(status);
                if let AttemptOutcome::Terminal(TransportError::BadResponse { body, .. }) = &outcome {
                    audited = audited.with_detail(body.clone());
                }
                if self.config.enable_diagnostics {
                    audited = audited.with_bytes(request.body_len(), received);
                }
                trail.record(audited);
                outcome
            }
            Err(DispatchFailure::Cancelled) => {
                trail.record(event(AuditKind::Cancelled));
                AttemptOutcome::Cancelled
            }
            Err(failure) => {
                let kind = match failure {
                    DispatchFailure::Timeout(_) => AuditKind::Timeout,
                    _ => AuditKind::TransportFailure,
                };
                trail.record(event(kind).with_detail(failure.to_string()));
                failure.into_error(node.id()).into()
            }
        }
    }

    /// One raw exchange, bounded by `timeout` and the caller's token.
    async fn dispatch(
        &self,
        node: &Node,
        request: &Request,
        timeout: Duration,
        context: &CallContext,
    ) -> std::result::Result<RawResponse, DispatchFailure> {
        let handle = self.handles.acquire(node.id()).map_err(DispatchFailure::Setup)?;
        let channel: &E::Handle = &handle;

        tokio::select! {
            biased;
            _ = context.cancellation().cancelled() => Err(DispatchFailure::Cancelled),
            result = tokio::time::timeout(timeout, self.executor.execute(channel, node, request, timeout)) => {
                match result {
                    Ok(Ok(raw)) => Ok(raw),
                    Ok(Err(ExecuteError::Timeout)) | Err(_) => Err(DispatchFailure::Timeout(timeout)),
                    Ok(Err(e)) => Err(DispatchFailure::Executor(e)),
                }
            }
        }
    }
}

impl<E: RequestExecutor> Drop for Transport<E> {
    fn drop(&mut self) {
        self.handles.expire_all();
    }
}

fn is_unavailable(status: u16) -> bool {
    matches!(status, 502..=504)
}

fn classify(request: &Request, node: &NodeId, raw: RawResponse) -> (AuditKind, AttemptOutcome) {
    let status = raw.status;
    if request.is_allowed_status(status) {
        return (
            AuditKind::HealthyResponse,
            AttemptOutcome::Success(Response::from_raw(raw, node.as_str())),
        );
    }
    if is_unavailable(status) {
        let error = TransportError::ServerUnavailable {
            node: node.to_string(),
            status,
        };
        return (AuditKind::ServerUnavailable, error.into());
    }
    let error = TransportError::BadResponse {
        node: node.to_string(),
        status,
        body: raw.body_snippet(MAX_ERROR_BODY),
    };
    (AuditKind::BadResponse, error.into())
}
