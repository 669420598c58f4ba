mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rlink_net::{Listener, RpcClient, Server};
use rlink_net_tcp::{TcpConnector, TcpListener, TcpSocket};
use rlink_types::{Address, RegionId};
use rlink_verbs::soft::{SoftDeviceSpec, SoftDriver};
use rlink_verbs::{Device, Driver, LocalBuf, MemoryService, RegistrationRegistry, ReliableConnection};

use crate::config::NodeConfig;

/// rlink node: publishes memory registrations to peers and fetches theirs.
#[derive(Parser, Debug)]
#[command(name = "rlink-node", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the configured regions and serve them until CTRL+C or SIGTERM.
    Serve,
    /// Fetch a peer's region attribute.
    Fetch {
        /// Peer address, e.g. `TCP://10.0.0.2:8600`
        #[arg(long)]
        peer: Address,

        /// Region id on the peer
        #[arg(long)]
        id: u64,

        /// Overrides `fetch_timeout_ms` from the configuration
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => { tracing::info!("Received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
    }
    Ok(())
}

async fn serve(config: &NodeConfig) -> anyhow::Result<()> {
    let specs = config.devices.iter().map(SoftDeviceSpec::new).collect();
    let driver: Arc<dyn Driver> = SoftDriver::new(specs);
    let device = match &config.device {
        Some(name) => Device::open(&driver, name, config.port)?,
        None => Device::open_first(&driver, config.port)?,
    };
    if !device.ready() {
        bail!("device {} port {} is not active", device.name(), config.port);
    }

    let registry = Arc::new(RegistrationRegistry::new());
    for region in &config.regions {
        let buf = Arc::new(LocalBuf::new(region.size)?);
        registry.register(region.region_id(), buf, &device, region.access())?;
        let attr = registry
            .lookup(region.region_id())
            .map(|reg| reg.attribute())
            .unwrap_or_default();
        tracing::info!(
            id = region.id,
            size = region.size,
            base_address = attr.base_address,
            remote_token = attr.remote_token,
            "region published"
        );
    }

    // Check the queue-pair configuration against the device before serving.
    let probe = ReliableConnection::create(&device, config.qp.clone())?;
    tracing::info!(identity = ?probe.identity(), "queue pair configuration accepted");
    drop(probe);

    let listener = TcpListener::bind(config.listen_addr()?).await?;
    let addr = listener.local_addr();
    let mut server = Server::new();
    server.register_service(Arc::new(MemoryService::new(Arc::clone(&registry))));
    server.start(listener);
    tracing::info!(%addr, device = device.name(), regions = registry.len(), "rlink node serving");

    wait_for_shutdown_signal().await?;
    tracing::info!("rlink node shutting down");
    server.stop();
    Ok(())
}

async fn fetch(config: &NodeConfig, peer: Address, id: u64, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.fetch_timeout_ms));
    let client: RpcClient<TcpSocket, TcpConnector> = RpcClient::new(TcpConnector::new());
    let attr = match RegistrationRegistry::fetch_remote(&client, RegionId(id), peer, timeout).await {
        Ok(attr) => attr,
        Err(status) => {
            tracing::warn!(%peer, id, code = status.code(), transient = status.is_transient(), "fetch failed");
            return Err(status).with_context(|| format!("fetching region {id} from {peer}"));
        }
    };
    println!(
        "region {id} at {peer}: base_address={:#x} remote_token={:#x}",
        attr.base_address, attr.remote_token
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&NodeConfig::default())?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let _log_guard = rlink_logging::init_logging(&config.log)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Fetch {
            peer,
            id,
            timeout_ms,
        } => fetch(&config, peer, id, timeout_ms).await,
    }
}
