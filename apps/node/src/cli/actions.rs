//! Node startup, bootstrap and signal handling.

use eyre::WrapErr;
use tokio::select;
use tokio::signal::unix::{self, SignalKind};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use minode_p2p::node::Node;
use minode_p2p::state::State;

use crate::cli::arguments::Args;
use crate::config;

/// DNS names seeding the unchecked pool on first start.
const DNS_BOOTSTRAP: [(&str, u16); 2] = [
    ("bootstrap8080.bitmessage.org", 8080),
    ("bootstrap8444.bitmessage.org", 8444),
];

pub async fn run(args: Args) -> eyre::Result<()> {
    init_logging(args.debug)?;

    let config = config::from_args(&args)?;
    info!("Starting MiNode");
    info!("Data directory: {}", config.data_dir.display());
    if !config.data_dir.exists() {
        std::fs::create_dir_all(&config.data_dir).wrap_err_with(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;
    }

    let state = State::new(config);
    state.objects.load(&state.config.data_dir);
    state.pools.load(&state.config.data_dir);
    load_seed_nodes(&state);
    if state.config.trusted_peer.is_none()
        && state.config.send_outgoing_connections
        && state.config.ip_enabled
    {
        bootstrap_dns(&state).await;
    }

    let node = Node::new(state);
    node.run().await?;

    let mut sigterm =
        unix::signal(SignalKind::terminate()).wrap_err("failed to install SIGTERM handler")?;
    let mut sigint =
        unix::signal(SignalKind::interrupt()).wrap_err("failed to install SIGINT handler")?;
    select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
        _ = sigint.recv() => info!("Received SIGINT signal"),
    }

    info!("Gracefully shutting down MiNode");
    node.shutdown().await;
    Ok(())
}

fn init_logging(debug: bool) -> eyre::Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = Targets::new()
        .with_target("minode_p2p", level)
        .with_target("minoded", level)
        .with_default(Level::WARN);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|err| eyre::eyre!("failed to initialize logging: {}", err))
}

/// Optional CSV seed files in the data directory: `host,port` per line
/// for IP peers, one destination per line for I2P peers.
fn load_seed_nodes(state: &State) {
    let path = state.config.data_dir.join("core_nodes.csv");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let parsed = line
                .trim()
                .split_once(',')
                .and_then(|(host, port)| Some((host.parse().ok()?, port.parse().ok()?)));
            match parsed {
                Some((host, port)) => state.pools.add_known_ip(host, port),
                None => warn!("Ignoring malformed seed entry: {}", line),
            }
        }
    }

    let path = state.config.data_dir.join("i2p_core_nodes.csv");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            state.pools.add_unchecked_i2p(line.trim().to_string());
        }
    }
}

async fn bootstrap_dns(state: &State) {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    for (seed, port) in DNS_BOOTSTRAP {
        match resolver.lookup_ip(seed.to_string()).await {
            Ok(response) => {
                for ip in response {
                    debug!("Adding {} to the unchecked pool from DNS bootstrap", ip);
                    state.pools.add_unchecked_ip(ip, port);
                }
            }
            Err(err) => error!("Error during DNS bootstrap from {}: {}", seed, err),
        }
    }
}
