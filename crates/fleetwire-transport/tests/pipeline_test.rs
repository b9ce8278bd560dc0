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

//! Request Pipeline Integration Tests
//!
//! Drives `Transport::execute` against a scripted in-memory cluster. Time is
//! paused so backoff windows and timeouts elapse instantly.

use async_trait::async_trait;
use fleetwire_common::{Request, RawResponse, TransportConfig, TransportError};
use fleetwire_transport::{
    AuditKind, CallContext, ExecuteError, Node, NodeAddress, NodeHealth, RequestExecutor, SniffTrigger,
    Transport,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted Cluster
// ============================================================================

#[derive(Debug, Clone)]
enum Behavior {
    Respond(u16, &'static str),
    Refuse,
    Hang,
    /// Answers with the status after the delay
    Slow(Duration, u16),
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    node: String,
    method: String,
    path: String,
}

#[derive(Default)]
struct ClusterState {
    behaviors: Mutex<HashMap<String, Behavior>>,
    nodes_info: Mutex<HashMap<String, String>>,
    nodes_info_delay: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
    opened: AtomicUsize,
}

/// In-memory cluster keyed by node id. Nodes without a behavior answer
/// `200 {}`.
#[derive(Clone, Default)]
struct ScriptedCluster(Arc<ClusterState>);

impl ScriptedCluster {
    fn set(&self, name: &str, behavior: Behavior) {
        self.0.behaviors.lock().unwrap().insert(id(name), behavior);
    }

    /// Body served by `name` for `GET /_nodes/http`.
    fn serve_nodes_info(&self, name: &str, body: &str) {
        self.0.nodes_info.lock().unwrap().insert(id(name), body.to_string());
    }

    fn delay_nodes_info(&self, delay: Duration) {
        *self.0.nodes_info_delay.lock().unwrap() = delay;
    }

    fn calls(&self) -> Vec<Call> {
        self.0.calls.lock().unwrap().clone()
    }

    /// Nodes that received a request other than a ping or a sniff.
    fn contacted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != "HEAD" && !c.path.starts_with("/_nodes"))
            .map(|c| c.node)
            .collect()
    }

    fn opened(&self) -> usize {
        self.0.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestExecutor for ScriptedCluster {
    type Handle = String;

    fn open_handle(&self, address: &NodeAddress) -> fleetwire_common::Result<String> {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(address.to_string())
    }

    async fn execute(
        &self,
        handle: &String,
        node: &Node,
        request: &Request,
        _timeout: Duration,
    ) -> Result<RawResponse, ExecuteError> {
        assert_eq!(handle, node.id().as_str());
        let node_id = node.id().to_string();
        self.0.calls.lock().unwrap().push(Call {
            node: node_id.clone(),
            method: request.method.to_string(),
            path: request.path.clone(),
        });

        if request.path.starts_with("/_nodes/http") {
            let delay = *self.0.nodes_info_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let info = self.0.nodes_info.lock().unwrap().get(&node_id).cloned();
            if let Some(body) = info {
                return Ok(RawResponse::ok(body));
            }
        }

        let behavior = self
            .0
            .behaviors
            .lock()
            .unwrap()
            .get(&node_id)
            .cloned()
            .unwrap_or(Behavior::Respond(200, "{}"));
        match behavior {
            Behavior::Respond(status, body) => Ok(RawResponse::new(status, body)),
            Behavior::Refuse => Err(ExecuteError::Connection("connection refused".to_string())),
            Behavior::Hang => std::future::pending().await,
            Behavior::Slow(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(RawResponse::new(status, "{}"))
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn id(name: &str) -> String {
    format!("http://{}:9200", name)
}

fn node(name: &str) -> Node {
    Node::seed(&id(name)).unwrap()
}

fn config() -> TransportConfig {
    TransportConfig::default().with_dead_node_backoff(Duration::from_secs(1), Duration::from_secs(30))
}

fn transport(config: TransportConfig, names: &[&str], cluster: &ScriptedCluster) -> Transport<ScriptedCluster> {
    let seeds = names.iter().map(|n| node(n)).collect();
    Transport::new(config, seeds, cluster.clone()).unwrap()
}

fn health(transport: &Transport<ScriptedCluster>, name: &str) -> NodeHealth {
    transport.registry().health(node(name).id()).unwrap()
}

fn kinds(executed: &fleetwire_transport::Executed) -> Vec<AuditKind> {
    executed.audit_trail.iter().map(|e| e.kind).collect()
}

fn nodes_info(names: &[&str]) -> String {
    let nodes: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                r#""n{i}": {{ "name": "{name}", "roles": ["master", "data"], "http": {{ "publish_address": "{name}/10.0.0.{i}:9200" }} }}"#
            )
        })
        .collect();
    format!(r#"{{ "cluster_name": "test", "nodes": {{ {} }} }}"#, nodes.join(", "))
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_healthy_response_single_event() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Respond(200, r#"{"status":"green"}"#));
    let transport = transport(config(), &["a", "b"], &cluster);

    let executed = transport.execute(&Request::get("/_cluster/health"), &CallContext::new()).await;

    assert_eq!(kinds(&executed), vec![AuditKind::HealthyResponse]);
    let event = &executed.audit_trail.events()[0];
    assert_eq!(event.node.as_ref().unwrap().as_str(), id("a"));
    assert_eq!(event.status, Some(200));
    assert_eq!(event.bytes_sent, None);

    let response = executed.into_result().unwrap();
    assert_eq!(response.node, id("a"));
    assert_eq!(response.text(), r#"{"status":"green"}"#);
}

#[tokio::test(start_paused = true)]
async fn test_bad_request_is_not_retried() {
    let cluster = ScriptedCluster::default();
    for name in ["a", "b", "c"] {
        cluster.set(name, Behavior::Respond(400, r#"{"error":"parsing_exception"}"#));
    }
    let transport = transport(config(), &["a", "b", "c"], &cluster);

    let executed = transport.execute(&Request::get("/logs/_search"), &CallContext::new()).await;

    assert_eq!(kinds(&executed), vec![AuditKind::BadResponse]);
    assert_eq!(cluster.contacted().len(), 1);
    assert!(health(&transport, "a").is_alive());
    match executed.result {
        Err(TransportError::BadResponse { status, body, .. }) => {
            assert_eq!(status, 400);
            assert!(body.contains("parsing_exception"));
        }
        other => panic!("expected bad response, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_allowed_status_counts_as_success() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Respond(404, ""));
    let transport = transport(config(), &["a"], &cluster);

    let request = Request::head("/missing-index").allow_status(404);
    let executed = transport.execute(&request, &CallContext::new()).await;

    assert_eq!(kinds(&executed), vec![AuditKind::HealthyResponse]);
    assert_eq!(executed.result.unwrap().status, 404);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_record_byte_counts() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Respond(200, "hello"));
    let transport = transport(config().with_diagnostics(true), &["a"], &cluster);

    let request = Request::new(hyper::Method::POST, "/logs/_doc").with_json_body(r#"{"x":1}"#);
    let executed = transport.execute(&request, &CallContext::new()).await;

    let event = executed.audit_trail.last().unwrap();
    assert_eq!(event.bytes_sent, Some(7));
    assert_eq!(event.bytes_received, Some(5));
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failover_after_connection_refused() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    let transport = transport(config(), &["a", "b"], &cluster);

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(
        kinds(&executed),
        vec![AuditKind::TransportFailure, AuditKind::HealthyResponse]
    );
    assert!(executed.audit_trail.events()[0]
        .detail
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(executed.result.unwrap().node, id("b"));
    assert!(!health(&transport, "a").is_alive());
    assert!(health(&transport, "b").is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_service_unavailable_is_retried() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Respond(503, "overloaded"));
    let transport = transport(config(), &["a", "b"], &cluster);

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(
        kinds(&executed),
        vec![AuditKind::ServerUnavailable, AuditKind::HealthyResponse]
    );
    assert!(executed.is_success());
    assert!(!health(&transport, "a").is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_max_retries_reached() {
    let cluster = ScriptedCluster::default();
    for name in ["a", "b", "c"] {
        cluster.set(name, Behavior::Refuse);
    }
    let transport = transport(config().with_max_retries(2), &["a", "b", "c"], &cluster);

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(executed.audit_trail.len(), 3);
    assert_eq!(executed.audit_trail.attempt_count(), 3);
    match executed.result {
        Err(TransportError::MaxRetriesReached { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, TransportError::Connection { .. }));
        }
        other => panic!("expected max retries, got {:?}", other),
    }
    assert_eq!(transport.registry().alive_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_never_contacts_a_node_twice() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    cluster.set("b", Behavior::Refuse);
    let transport = transport(config().with_max_retries(5), &["a", "b"], &cluster);

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert!(matches!(executed.result, Err(TransportError::NoNodesAvailable)));
    let contacted = cluster.contacted();
    assert_eq!(contacted.len(), 2);
    let distinct: HashSet<&String> = contacted.iter().collect();
    assert_eq!(distinct.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_required_role_filters_nodes() {
    let cluster = ScriptedCluster::default();
    let config = config();
    let registry = Arc::new(fleetwire_transport::NodeRegistry::from_config(
        vec![
            node("master-only").with_roles(fleetwire_transport::NodeRoles::from_names(["master"])),
            node("data-only").with_roles(fleetwire_transport::NodeRoles::from_names(["data_hot"])),
        ],
        &config,
        fleetwire_transport::RegistryCapabilities::static_list(),
    ));
    let transport = Transport::with_registry(config, registry, cluster.clone()).unwrap();

    for _ in 0..3 {
        let request = Request::get("/logs/_search").with_required_role(fleetwire_common::NodeRole::Data);
        let response = transport.execute(&request, &CallContext::new()).await.into_result().unwrap();
        assert_eq!(response.node, id("data-only"));
    }
}

// ============================================================================
// Timeouts and Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_over() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Hang);
    let transport = transport(
        config().with_request_timeout(Duration::from_secs(1)),
        &["a", "b"],
        &cluster,
    );

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(kinds(&executed), vec![AuditKind::Timeout, AuditKind::HealthyResponse]);
    assert!(executed.audit_trail.events()[0].latency >= Duration::from_secs(1));
    assert!(!health(&transport, "a").is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_override() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Hang);
    let transport = transport(config().with_max_retries(0), &["a"], &cluster);

    let request = Request::get("/").with_timeout(Duration::from_millis(200));
    let executed = transport.execute(&request, &CallContext::new()).await;

    match executed.result {
        Err(TransportError::MaxRetriesReached { last, .. }) => {
            assert!(matches!(*last, TransportError::Timeout { timeout_ms: 200, .. }));
        }
        other => panic!("expected max retries, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_bounds_the_call() {
    let cluster = ScriptedCluster::default();
    for name in ["a", "b", "c"] {
        cluster.set(name, Behavior::Hang);
    }
    let config = config()
        .with_max_retries(5)
        .with_request_timeout(Duration::from_secs(1))
        .with_overall_timeout(Duration::from_millis(1500));
    let transport = transport(config, &["a", "b", "c"], &cluster);

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(kinds(&executed), vec![AuditKind::Timeout, AuditKind::Timeout]);
    match executed.result {
        Err(TransportError::MaxTimeoutReached { elapsed_ms, last }) => {
            assert!(elapsed_ms >= 1500);
            assert!(matches!(last.as_deref(), Some(TransportError::Timeout { .. })));
        }
        other => panic!("expected max timeout, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_does_not_mark_node_dead() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Hang);
    let transport = transport(config(), &["a", "b"], &cluster);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let executed = transport
        .execute(&Request::get("/"), &CallContext::with_cancellation(token))
        .await;

    assert!(matches!(executed.result, Err(TransportError::Cancelled)));
    assert_eq!(kinds(&executed), vec![AuditKind::Cancelled]);
    assert!(health(&transport, "a").is_alive());
    assert_eq!(cluster.contacted(), vec![id("a")]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_startup_sniff() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Hang);
    let transport = transport(
        config()
            .with_sniff_on_startup(true)
            .with_sniff_timeout(Duration::from_secs(30)),
        &["a"],
        &cluster,
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let executed = transport
        .execute(&Request::get("/"), &CallContext::with_cancellation(token))
        .await;

    assert!(matches!(executed.result, Err(TransportError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(kinds(&executed), vec![AuditKind::SniffFailure]);
    assert!(cluster.contacted().is_empty());
    assert!(!transport.sniffer().startup_done());
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_call_contacts_nothing() {
    let cluster = ScriptedCluster::default();
    let transport = transport(config(), &["a"], &cluster);

    let token = CancellationToken::new();
    token.cancel();
    let executed = transport
        .execute(&Request::get("/"), &CallContext::with_cancellation(token))
        .await;

    assert!(matches!(executed.result, Err(TransportError::Cancelled)));
    assert!(executed.audit_trail.is_empty());
    assert!(cluster.calls().is_empty());
}

// ============================================================================
// Resurrection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resurrected_node_is_pinged_first() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    let transport = transport(config().with_max_retries(0), &["a"], &cluster);

    let first = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert!(matches!(first.result, Err(TransportError::MaxRetriesReached { attempts: 1, .. })));
    assert!(!health(&transport, "a").is_alive());

    cluster.set("a", Behavior::Respond(200, "{}"));
    tokio::time::advance(Duration::from_secs(2)).await;

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::PingSuccess, AuditKind::HealthyResponse]);
    assert_eq!(second.audit_trail.attempt_count(), 1);
    assert!(health(&transport, "a").is_alive());

    let methods: Vec<String> = cluster.calls().into_iter().map(|c| c.method).collect();
    assert_eq!(methods, vec!["GET", "HEAD", "GET"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ping_counts_as_attempt() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    let transport = transport(config(), &["a", "b"], &cluster);

    let first = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert!(first.is_success());

    tokio::time::advance(Duration::from_secs(2)).await;

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::PingFailure, AuditKind::HealthyResponse]);
    assert_eq!(second.audit_trail.attempt_count(), 2);
    assert_eq!(health(&transport, "a").attempt_count(), 2);
    assert_eq!(second.result.unwrap().node, id("b"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_ping_past_deadline_does_not_blame_node() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    let transport = transport(
        config()
            .with_max_retries(0)
            .with_overall_timeout(Duration::from_secs(2)),
        &["a"],
        &cluster,
    );

    transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(health(&transport, "a").attempt_count(), 1);

    // The ping answers exactly when the call's deadline runs out
    cluster.set("a", Behavior::Slow(Duration::from_secs(2), 200));
    tokio::time::advance(Duration::from_secs(2)).await;

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::PingSuccess]);
    assert!(matches!(
        second.result,
        Err(TransportError::MaxTimeoutReached { last: None, .. })
    ));
    assert_eq!(health(&transport, "a").attempt_count(), 1);

    let methods: Vec<String> = cluster.calls().into_iter().map(|c| c.method).collect();
    assert_eq!(methods, vec!["GET", "HEAD"]);
}

#[tokio::test(start_paused = true)]
async fn test_pings_can_be_disabled() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    let transport = transport(
        config().with_max_retries(0).with_ping_resurrected_nodes(false),
        &["a"],
        &cluster,
    );

    transport.execute(&Request::get("/"), &CallContext::new()).await;
    cluster.set("a", Behavior::Respond(200, "{}"));
    tokio::time::advance(Duration::from_secs(2)).await;

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::HealthyResponse]);
}

// ============================================================================
// Sniffing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sniff_on_startup_runs_once() {
    let cluster = ScriptedCluster::default();
    cluster.serve_nodes_info("a", &nodes_info(&["a", "b"]));
    let transport = transport(config().with_sniff_on_startup(true), &["a"], &cluster);

    let first = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&first), vec![AuditKind::SniffSuccess, AuditKind::HealthyResponse]);
    assert_eq!(first.audit_trail.events()[0].sniff_trigger, Some(SniffTrigger::Startup));
    assert_eq!(first.audit_trail.attempt_count(), 1);
    assert_eq!(transport.registry().node_count(), 2);

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::HealthyResponse]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_startup_sniff_is_retried() {
    let cluster = ScriptedCluster::default();
    cluster.serve_nodes_info("a", r#"{ "cluster_name": "test", "nodes": {} }"#);
    let transport = transport(config().with_sniff_on_startup(true), &["a"], &cluster);

    let first = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&first), vec![AuditKind::SniffFailure, AuditKind::HealthyResponse]);
    assert!(!transport.sniffer().startup_done());
    assert_eq!(transport.registry().node_count(), 1);

    cluster.serve_nodes_info("a", &nodes_info(&["a", "b"]));

    let second = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&second), vec![AuditKind::SniffSuccess, AuditKind::HealthyResponse]);
    assert_eq!(second.audit_trail.events()[0].sniff_trigger, Some(SniffTrigger::Startup));
    assert!(transport.sniffer().startup_done());
    assert_eq!(transport.registry().node_count(), 2);

    let third = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(kinds(&third), vec![AuditKind::HealthyResponse]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_calls_wait_for_startup_sniff() {
    let cluster = ScriptedCluster::default();
    cluster.serve_nodes_info("a", &nodes_info(&["b", "c"]));
    cluster.delay_nodes_info(Duration::from_millis(100));
    let transport = Arc::new(transport(config().with_sniff_on_startup(true), &["a"], &cluster));

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let transport = Arc::clone(&transport);
        set.spawn(async move {
            transport.execute(&Request::get("/"), &CallContext::new()).await
        });
    }

    let mut sniffs = 0;
    while let Some(result) = set.join_next().await {
        let executed = result.unwrap();
        sniffs += executed.audit_trail.count(AuditKind::SniffSuccess);
        assert_ne!(executed.into_result().unwrap().node, id("a"));
    }
    assert_eq!(sniffs, 1);

    let sniff_requests = cluster
        .calls()
        .iter()
        .filter(|c| c.path.starts_with("/_nodes"))
        .count();
    assert_eq!(sniff_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_startup_sniff() {
    let cluster = ScriptedCluster::default();
    cluster.serve_nodes_info("a", &nodes_info(&["a", "b", "c"]));
    let transport = transport(config().with_sniff_on_startup(true), &["a"], &cluster);

    let trail = transport.sniff_on_startup().await;
    assert_eq!(trail.count(AuditKind::SniffSuccess), 1);
    assert_eq!(transport.registry().node_count(), 3);
    assert!(transport.sniffer().startup_done());

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(executed.audit_trail.count(AuditKind::SniffSuccess), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sniff_on_connection_failure_replaces_topology() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    cluster.serve_nodes_info("b", &nodes_info(&["b", "c"]));
    let transport = transport(
        config().with_sniff_on_connection_failure(true),
        &["a", "b"],
        &cluster,
    );

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(
        kinds(&executed),
        vec![
            AuditKind::TransportFailure,
            AuditKind::SniffSuccess,
            AuditKind::HealthyResponse
        ]
    );
    assert_eq!(
        executed.audit_trail.events()[1].sniff_trigger,
        Some(SniffTrigger::ConnectionFailure)
    );
    assert_eq!(executed.audit_trail.events()[1].node.as_ref().unwrap().as_str(), id("b"));
    assert!(executed.is_success());

    let ids: Vec<String> = transport.registry().nodes().iter().map(|n| n.id().to_string()).collect();
    assert_eq!(ids, vec![id("b"), id("c")]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_sniff_leaves_topology_untouched() {
    let cluster = ScriptedCluster::default();
    cluster.set("a", Behavior::Refuse);
    cluster.serve_nodes_info("b", r#"{ "nodes": { "x": { "name": "no-http" } } }"#);
    let transport = transport(
        config().with_sniff_on_connection_failure(true),
        &["a", "b"],
        &cluster,
    );

    let executed = transport.execute(&Request::get("/"), &CallContext::new()).await;

    assert_eq!(executed.audit_trail.count(AuditKind::SniffFailure), 1);
    assert!(executed.is_success());
    assert_eq!(transport.registry().node_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_topology_is_refreshed() {
    let cluster = ScriptedCluster::default();
    cluster.serve_nodes_info("a", &nodes_info(&["a"]));
    let transport = transport(
        config().with_sniff_lifespan(Duration::from_secs(10)),
        &["a"],
        &cluster,
    );

    let fresh = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(fresh.audit_trail.count(AuditKind::SniffSuccess), 0);

    tokio::time::advance(Duration::from_secs(11)).await;

    let stale = transport.execute(&Request::get("/"), &CallContext::new()).await;
    assert_eq!(stale.audit_trail.events()[0].sniff_trigger, Some(SniffTrigger::Stale));
    assert!(!transport.sniffer().is_stale());
}

// ============================================================================
// Handles and Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_handles_are_reused_until_lifetime() {
    let cluster = ScriptedCluster::default();
    let transport = transport(
        config().with_handler_lifetime(Duration::from_secs(60)),
        &["a"],
        &cluster,
    );

    for _ in 0..5 {
        assert!(transport.execute(&Request::get("/"), &CallContext::new()).await.is_success());
    }
    assert_eq!(cluster.opened(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(transport.execute(&Request::get("/"), &CallContext::new()).await.is_success());
    assert_eq!(cluster.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_transport() {
    let cluster = ScriptedCluster::default();
    cluster.set("b", Behavior::Refuse);
    let transport = Arc::new(transport(config(), &["a", "b", "c"], &cluster));

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..30 {
        let transport = Arc::clone(&transport);
        set.spawn(async move {
            transport.execute(&Request::get("/"), &CallContext::new()).await
        });
    }

    let mut successes = 0;
    while let Some(result) = set.join_next().await {
        let executed = result.unwrap();
        let response = executed.into_result().unwrap();
        assert_ne!(response.node, id("b"));
        successes += 1;
    }
    assert_eq!(successes, 30);
    assert!(!health(&transport, "b").is_alive());
}

#[test]
fn test_invalid_config_is_rejected() {
    let cluster = ScriptedCluster::default();
    let result = Transport::new(
        TransportConfig::default().with_request_timeout(Duration::ZERO),
        vec![node("a")],
        cluster.clone(),
    );
    assert!(matches!(result, Err(TransportError::InvalidConfig(_))));

    let result = Transport::new(TransportConfig::default(), Vec::new(), cluster);
    assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
}
