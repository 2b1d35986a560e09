// nearlink-cli — loopback demonstration of the discovery and bridging engine
//
// Runs two complete engines on an in-process radio hub: discovery, handle
// negotiation, bridging, and overlay traffic across the bridge. Useful as a
// smoke test and as a worked example of wiring the engine to a transport.

use anyhow::{bail, Result};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use nearlink_core::engine::LinkState;
use nearlink_core::overlay::{MemoryConduit, MemoryOverlay};
use nearlink_core::transport::memory::{MemoryAdapter, MemoryHub};
use nearlink_core::{DiscoveryService, EngineConfig, EngineState, PeerAddress, TransportKind};

#[derive(Parser)]
#[command(name = "nearlink")]
#[command(about = "Nearlink — short-range overlay bridging demo", long_about = None)]
#[command(version)]
struct Cli {
    /// Payload carried across the bridge each round
    #[arg(short, long, default_value = "hello over the air")]
    message: String,

    /// Number of round trips to run
    #[arg(short, long, default_value_t = 3)]
    rounds: u32,

    /// Log filter, e.g. "nearlink_core=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

struct Node {
    name: &'static str,
    adapter: Arc<MemoryAdapter>,
    overlay: Arc<MemoryOverlay>,
    service: DiscoveryService,
}

impl Node {
    fn new(hub: &Arc<MemoryHub>, name: &'static str, address: &str) -> Self {
        let adapter = hub.create_adapter(address);
        let overlay = MemoryOverlay::new();
        let service = DiscoveryService::spawn_with_kind(
            adapter.clone(),
            overlay.clone(),
            EngineConfig::default(),
            TransportKind::Local,
        );
        Self {
            name,
            adapter,
            overlay,
            service,
        }
    }

    fn address(&self) -> PeerAddress {
        self.adapter.address().clone()
    }

    fn conduit(&self) -> Option<Arc<MemoryConduit>> {
        self.overlay.open_conduits().into_iter().next()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    println!("{}", "Nearlink loopback demo".bold());

    let hub = MemoryHub::new();
    let alpha = Node::new(&hub, "alpha", "AA:BB:CC:DD:EE:01");
    let beta = Node::new(&hub, "beta", "AA:BB:CC:DD:EE:02");

    alpha.service.start();
    beta.service.start();
    if !wait_until(Duration::from_secs(2), || {
        alpha.service.state() == EngineState::Active && beta.service.state() == EngineState::Active
    }) {
        bail!("engines failed to reach Active");
    }
    println!("  {} both engines active, advertising", "✓".green());

    // stand in for the platform's scan callback
    for result in hub.visible_to(&alpha.address()) {
        alpha.service.handle_scan_result(result);
    }
    if !wait_until(Duration::from_secs(2), || {
        alpha.service.registry().state_of(&beta.address()) == Some(LinkState::Bridging)
            && beta.service.registry().state_of(&alpha.address()) == Some(LinkState::Bridging)
    }) {
        bail!("bridge was not established");
    }
    println!(
        "  {} bridge established: {} ↔ {}",
        "✓".green(),
        alpha.address().to_string().cyan(),
        beta.address().to_string().cyan()
    );

    let (alpha_conduit, beta_conduit) = match (alpha.conduit(), beta.conduit()) {
        (Some(a), Some(b)) => (a, b),
        _ => bail!("conduits missing after bridging"),
    };

    for round in 1..=cli.rounds {
        let outbound = format!("{} #{round}", cli.message);
        let expected = beta_conduit.received().len() + outbound.len();
        alpha_conduit.inject(outbound.as_bytes());
        if !wait_until(Duration::from_secs(2), || {
            beta_conduit.received().len() >= expected
        }) {
            bail!("round {round}: payload never arrived at beta");
        }
        println!(
            "  {} round {round}: {} → {}: {:?}",
            "✓".green(),
            alpha.name,
            beta.name,
            outbound
        );

        let reply = format!("ack #{round}");
        let expected = alpha_conduit.received().len() + reply.len();
        beta_conduit.inject(reply.as_bytes());
        if !wait_until(Duration::from_secs(2), || {
            alpha_conduit.received().len() >= expected
        }) {
            bail!("round {round}: reply never arrived at alpha");
        }
        println!(
            "  {} round {round}: {} → {}: {:?}",
            "✓".green(),
            beta.name,
            alpha.name,
            reply
        );
    }

    for node in [&alpha, &beta] {
        let stats = node.service.stats();
        println!(
            "{}: {} bridge(s), {} B to overlay, {} B to peers, {} overlay peer(s)",
            node.name.bold(),
            stats.bridges_opened,
            stats.bytes_to_overlay,
            stats.bytes_to_peer,
            node.service.peer_count()
        );
    }

    alpha.service.shutdown();
    beta.service.shutdown();
    println!("{}", "done".bold());
    Ok(())
}
