use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadwalk::{
    hash_key, Identity, LookupConfig, LookupEngine, LookupRequest, SimConfig, SimulatedNetwork,
};

/// Run one iterative node lookup over a simulated Kademlia network.
#[derive(Parser, Debug)]
#[command(name = "kadwalk")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated peers.
    #[arg(short, long, default_value = "200")]
    nodes: usize,

    /// Result-set size and routing bucket size.
    #[arg(short, long, default_value = "20")]
    k: usize,

    /// RPCs issued per round.
    #[arg(short, long, default_value = "3")]
    alpha: usize,

    /// Replies required before a round may advance.
    #[arg(short, long, default_value = "1")]
    beta: usize,

    /// Fraction of peers that fail every RPC.
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Upper bound of per-peer simulated latency.
    #[arg(long, default_value = "0")]
    max_latency_ms: u64,

    #[arg(long, default_value = "3000")]
    rpc_timeout_ms: u64,

    /// 0 disables the lookup-wide deadline.
    #[arg(long, default_value = "10000")]
    lookup_timeout_ms: u64,

    /// RNG seed for the simulated population.
    #[arg(short, long, default_value = "0")]
    seed: u64,

    /// Lookup target: 64 hex characters, or any string to be hashed.
    #[arg(short, long)]
    target: Option<String>,
}

fn parse_target(raw: Option<&str>, seed: u64) -> Identity {
    match raw {
        Some(text) => Identity::from_hex(text).unwrap_or_else(|_| hash_key(text.as_bytes())),
        None => hash_key(format!("kadwalk-{seed}").as_bytes()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let lookup_timeout =
        (args.lookup_timeout_ms > 0).then(|| Duration::from_millis(args.lookup_timeout_ms));
    let config = LookupConfig::default()
        .with_k(args.k)
        .with_alpha(args.alpha)
        .with_beta(args.beta)
        .with_rpc_timeout(Duration::from_millis(args.rpc_timeout_ms))
        .with_lookup_timeout(lookup_timeout);

    let network = Arc::new(SimulatedNetwork::generate(&SimConfig {
        nodes: args.nodes,
        k: args.k,
        failure_rate: args.failure_rate,
        max_latency: Duration::from_millis(args.max_latency_ms),
        seed: args.seed,
    }));

    let origin = network
        .peer(0)
        .context("simulated network needs at least one node")?;
    let local_id = origin.contact.identity;
    let engine = LookupEngine::new(network.clone(), origin.routing.clone(), config)
        .context("invalid lookup parameters")?
        .with_local_identity(local_id);

    let target = parse_target(args.target.as_deref(), args.seed);
    info!(
        origin = %local_id,
        target = %target,
        nodes = network.len(),
        "starting lookup"
    );

    let started = Instant::now();
    let found = engine.find_nodes_async(LookupRequest::new(target)).await;
    let elapsed = started.elapsed();

    let exclude: HashSet<Identity> = [local_id].into_iter().collect();
    let expected = network.closest_alive(&target, args.k, &exclude).await;
    let expected_ids: HashSet<Identity> = expected.iter().map(|c| c.identity).collect();
    let hits = found
        .iter()
        .filter(|c| expected_ids.contains(&c.identity))
        .count();

    for (rank, contact) in found.iter().enumerate() {
        info!(
            rank,
            identity = %contact.identity,
            addr = %contact.addr,
            distance = %hex::encode(&contact.distance_to(&target)[..8]),
            "closest"
        );
    }

    info!(
        found = found.len(),
        true_closest = hits,
        expected = expected.len(),
        rpcs = network.call_count(),
        elapsed_ms = elapsed.as_millis(),
        "lookup finished"
    );
    if hits < expected.len() {
        warn!(
            missed = expected.len() - hits,
            "lookup did not find every true closest peer"
        );
    }

    Ok(())
}
