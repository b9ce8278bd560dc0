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

//! # Fleetwire CLI Entry Point
//!
//! Drives a real cluster through the Fleetwire transport.
//!
//! ## Usage
//!
//! ```bash
//! # One logical call with failover across two seeds
//! fleetwire call GET /_cluster/health -n http://10.0.0.1:9200 -n http://10.0.0.2:9200
//!
//! # Index a document and print the audit trail to stderr
//! fleetwire call PUT /logs/_doc/1 --body '{"message":"hi"}' -n http://10.0.0.1:9200 --audit
//!
//! # Discover the cluster topology through a seed
//! fleetwire sniff -n http://10.0.0.1:9200
//!
//! # Ping every seed
//! fleetwire ping -n http://10.0.0.1:9200 -n http://10.0.0.2:9200
//! ```
//!
//! Seed URLs must include the `http://` or `https://` prefix.

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use fleetwire_common::{Request, TransportConfig};
use fleetwire_http::{HttpExecutor, HttpExecutorConfig};
use fleetwire_transport::{AuditKind, CallContext, Node, NodeRoles, Transport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Validates that a URL string starts with http:// or https://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

#[derive(FromArgs)]
/// Fleetwire - cluster-aware HTTP transport
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
    Sniff(SniffArgs),
    Ping(PingArgs),
}

/// Arguments for one logical call.
///
/// The response body goes to stdout untouched so it can be piped into `jq`;
/// errors and the optional audit trail go to stderr.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// execute one request against the cluster
struct CallArgs {
    /// request method (GET, PUT, POST, DELETE, HEAD)
    #[argh(positional)]
    method: String,

    /// path and query, e.g. /logs/_search?size=1
    #[argh(positional)]
    path: String,

    /// seed node URL; repeat for several seeds
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// request body, as JSON
    #[argh(option, short = 'b')]
    body: Option<String>,

    /// extra header sent with every request, as "Name: value"
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,

    /// retries after the first attempt
    #[argh(option, long = "max-retries", default = "3")]
    max_retries: usize,

    /// per-attempt timeout in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// refresh the topology from the seeds before the call
    #[argh(switch, long = "sniff-on-startup")]
    sniff_on_startup: bool,

    /// refresh the topology when a node fails
    #[argh(switch, long = "sniff-on-failure")]
    sniff_on_failure: bool,

    /// print the audit trail to stderr
    #[argh(switch)]
    audit: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "sniff")]
/// print the cluster topology as seen by a seed
struct SniffArgs {
    /// seed node URL; the second one is only used if the first fails
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// sniff timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// ping every given node with HEAD /
struct PingArgs {
    /// node URL; repeat for several nodes
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<String>,

    /// ping timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call: keep stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Call(args) => run_call(args).await,
        Commands::Sniff(args) => run_sniff(args).await,
        Commands::Ping(args) => run_ping(args).await,
    }
}

fn parse_seeds(urls: &[String]) -> Result<Vec<Node>> {
    if urls.is_empty() {
        bail!("At least one node is required (-n http://host:port)");
    }
    urls.iter()
        .map(|url| {
            validate_http_url(url, "node address")?;
            Node::seed(url).with_context(|| format!("Invalid node address '{}'", url))
        })
        .collect()
}

/// Splits `"Name: value"`.
fn parse_header(header: &str) -> Result<(&str, &str)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}': expected \"Name: value\"", header))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header '{}': empty name", header);
    }
    Ok((name, value.trim()))
}

fn format_roles(roles: &NodeRoles) -> String {
    let names: Vec<&str> = [
        (roles.master, "master"),
        (roles.data, "data"),
        (roles.ingest, "ingest"),
    ]
    .into_iter()
    .filter_map(|(has, name)| has.then_some(name))
    .collect();

    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}

/// Cancels `token` on Ctrl-C so the in-flight attempt is abandoned cleanly.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn run_call(args: CallArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let method: hyper::Method = args
        .method
        .to_ascii_uppercase()
        .parse()
        .map_err(|e| anyhow!("Invalid HTTP method '{}': {}", args.method, e))?;

    let mut executor_config = HttpExecutorConfig::default();
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        executor_config = executor_config.with_header(name, value)?;
    }

    let mut config = TransportConfig::default()
        .with_max_retries(args.max_retries)
        .with_sniff_on_startup(args.sniff_on_startup)
        .with_sniff_on_connection_failure(args.sniff_on_failure);
    if let Some(ms) = args.timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }

    let mut request = Request::new(method, args.path);
    if let Some(body) = args.body {
        serde_json::from_str::<serde_json::Value>(&body)
            .map_err(|e| anyhow!("Invalid JSON in --body: {}", e))?;
        request = request.with_json_body(body);
    }

    let transport = Transport::new(config, seeds, HttpExecutor::new(executor_config))?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let executed = transport
        .execute(&request, &CallContext::with_cancellation(token))
        .await;
    if args.audit {
        eprint!("{}", executed.audit_trail);
    }

    let response = executed.into_result()?;
    println!("{}", response.text());
    Ok(())
}

async fn run_sniff(args: SniffArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let config = TransportConfig::default()
        .with_sniff_on_startup(true)
        .with_sniff_timeout(Duration::from_millis(args.timeout_ms));
    let transport = Transport::new(config, seeds, HttpExecutor::default())?;

    let trail = transport.sniff_on_startup().await;
    if trail.count(AuditKind::SniffSuccess) == 0 {
        bail!("Sniff failed\n{}", trail);
    }

    for node in transport.registry().nodes() {
        println!(
            "{}\t{}\t{}\t{}",
            node.id(),
            node.node_id.as_deref().unwrap_or("-"),
            node.name.as_deref().unwrap_or("-"),
            format_roles(&node.roles)
        );
    }
    Ok(())
}

async fn run_ping(args: PingArgs) -> Result<()> {
    let seeds = parse_seeds(&args.nodes)?;
    let config = TransportConfig::default().with_ping_timeout(Duration::from_millis(args.timeout_ms));
    let transport = Transport::new(config, seeds.clone(), HttpExecutor::default())?;

    let context = CallContext::new();
    let results = futures::future::join_all(seeds.iter().map(|node| transport.ping_node(node, &context))).await;

    let mut failures = 0;
    for (node, result) in seeds.iter().zip(results) {
        match result {
            Ok(rtt) => println!("{}\tok\t{}ms", node.id(), rtt.as_millis()),
            Err(e) => {
                failures += 1;
                println!("{}\tfailed\t{}", node.id(), e);
            }
        }
    }

    tracing::info!(nodes = seeds.len(), failures, "Ping complete");
    if failures > 0 {
        bail!("{} of {} nodes failed to answer", failures, seeds.len());
    }
    Ok(())
}
