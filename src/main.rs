use ack_registry::config::NodeConfig;
use ack_registry::ddata::gossip::GossipReplicator;
use ack_registry::ddata::store::{PeerSource, ReplicatedStore};
use ack_registry::membership::monitor::MembershipMonitor;
use ack_registry::membership::service::MembershipService;
use ack_registry::registry::coordinator::AckCoordinator;
use ack_registry::registry::types::Subscriber;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>]... [--config <file>] [--labels a,b [--group g]]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000 --labels created,modified",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<String> = None;
    let mut labels: Vec<String> = vec![];
    let mut group: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse().context("invalid --bind address")?);
                i += 2;
            }
            ("--seed", Some(value)) => {
                seed_nodes.push(value.parse().context("invalid --seed address")?);
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(value.clone());
                i += 2;
            }
            ("--labels", Some(value)) => {
                labels = value
                    .split(',')
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
                    .collect();
                i += 2;
            }
            ("--group", Some(value)) => {
                group = Some(value.clone());
                i += 2;
            }
            (flag, _) => {
                tracing::warn!("Ignoring argument {}", flag);
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.context("--bind is required")?;
    let config = match config_path {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::default(),
    };

    tracing::info!("Starting node on {}", bind_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let data_port = bind_addr
        .port()
        .checked_add(1000)
        .context("bind port leaves no room for the data port")?;
    let data_addr = SocketAddr::new(bind_addr.ip(), data_port);
    let membership =
        MembershipService::new(bind_addr, data_addr, seed_nodes, &config.membership).await?;
    let own_address = membership.address();
    tracing::info!("Node ID: {:?} (address {})", membership.local_node.id, own_address);

    // 2. Replicated store, peers taken from membership:
    let peers: Arc<dyn PeerSource> = membership.clone();
    let replicator =
        GossipReplicator::new(data_addr, own_address.clone(), peers, &config.replicator).await?;
    let store: Arc<dyn ReplicatedStore> = replicator.clone();

    // 3. Registry coordinator:
    let (registry, coordinator) =
        AckCoordinator::spawn(own_address.clone(), config.registry.clone(), store.clone());

    // 4. Membership monitor:
    let monitor = MembershipMonitor::new(store.clone(), registry.clone())
        .spawn(membership.subscribe_events());

    // 5. Spawn membership service and replicator:
    membership.clone().start().await;
    replicator.start().await;

    // 6. Optional demo declaration:
    let mut demo_lifetime = None;
    if !labels.is_empty() {
        let (subscriber, lifetime) = Subscriber::new();
        match registry.declare(&subscriber, group.as_deref(), labels).await {
            Ok(ack) => {
                tracing::info!(
                    "Declared {:?} (group {:?}) as {} on {}",
                    ack.declaration.labels,
                    ack.declaration.group,
                    subscriber.id(),
                    ack.responder
                );
                demo_lifetime = Some(lifetime);
            }
            Err(e) => tracing::warn!("Demo declaration rejected: {}", e),
        }
    }

    // 7. Spawn stats reporter:
    let stats_service = membership.clone();
    let stats_store = store.clone();
    let stats_address = own_address.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            tracing::info!("Cluster stats: {} alive nodes", alive.len());
            for node in alive {
                tracing::info!(
                    "  - {:?} gossip={} data={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.data_addr,
                    node.incarnation
                );
            }

            for (address, update) in stats_store.table() {
                let marker = if address == stats_address { " (local)" } else { "" };
                tracing::info!(
                    "  claims of {}{}: {} entries",
                    address,
                    marker,
                    update.entries.len()
                );
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    drop(demo_lifetime);
    if let Err(e) = registry.flush().await {
        tracing::warn!("Final publication failed: {}", e);
    }
    monitor.abort();
    let _ = monitor.await;
    drop(registry);
    coordinator.await?;

    Ok(())
}
