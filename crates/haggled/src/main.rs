//! Entry point: wires every manager to the kernel's event bus, opens the
//! data store, and drives the daemon until a shutdown signal arrives.

mod config;
mod event;
mod kernel;
mod managers;
mod node_store;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use haggle_net::{TcpTransport, UdpApplicationTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use kernel::Kernel;
use managers::application::ApplicationManager;
use managers::data::DataManager;
use managers::forwarding::ForwardingManager;
use managers::node::NodeManager;
use managers::protocol::ProtocolManager;
use managers::security::SecurityManager;
use node_store::{InterfaceStore, NodeStore};
use store::{DataStore, SledDataStore};

const MANAGERS: &[&str] = &[
    "NodeManager",
    "DataManager",
    "SecurityManager",
    "ProtocolManager",
    "ApplicationManager",
    "ForwardingManager",
];

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `-f`/`filelog` redirect debug output to a file under the data directory
/// rather than stderr. Daemonizing the classic double-fork way (`-d`) has no
/// clean equivalent once a tokio runtime is already up, so this crate treats
/// `-d` as "run detached from the controlling terminal's stdio" (handled by
/// whatever process supervisor launches it) rather than forking itself; see
/// DESIGN.md.
fn write_pid_file(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::write(config.pid_file(), std::process::id().to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;
    init_tracing(&config);

    if config.delete_datastore && config.data_dir.exists() {
        info!(dir = %config.data_dir.display(), "removing existing data store (--delete-datastore)");
        std::fs::remove_dir_all(&config.data_dir)?;
    }
    write_pid_file(&config)?;

    let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(&config.data_dir)?);
    let nodes = Arc::new(NodeStore::new());
    let interfaces = Arc::new(InterfaceStore::new());
    nodes.seed(store.all_nodes()?);

    let kernel = Kernel::new(MANAGERS.to_vec());
    let handle = kernel.handle();

    let security = SecurityManager::load_or_create(handle.clone(), store.clone(), config.security_level())?;
    let node_manager = NodeManager::new(handle.clone(), store.clone(), nodes.clone(), security.clone(), config::NodeState::default());
    let data_manager = DataManager::new(handle.clone(), store.clone(), nodes.clone(), node_manager.clone(), config.create_time_on_bloomfilter_update);
    let forwarding_manager = ForwardingManager::new(handle.clone(), store.clone(), nodes.clone(), node_manager.clone())?;

    let peer_addr = SocketAddr::from(([0, 0, 0, 0], config.peer_port));
    let tcp_transport = Arc::new(TcpTransport::new(peer_addr));
    let protocol_manager = ProtocolManager::new(handle.clone(), nodes.clone(), interfaces.clone(), node_manager.clone(), tcp_transport.clone());

    let app_addr = SocketAddr::from(([127, 0, 0, 1], config.application_port));
    let app_transport = Arc::new(UdpApplicationTransport::bind(app_addr).await?);
    let application_manager = ApplicationManager::new(handle.clone(), store.clone(), node_manager.clone(), security.clone(), app_transport);

    tokio::spawn(security.clone().run());
    tokio::spawn(node_manager.clone().run());
    tokio::spawn(data_manager.run());
    tokio::spawn(forwarding_manager.run());
    tokio::spawn(protocol_manager.clone().run());
    tokio::spawn(application_manager.run());

    let (accept_tx, accept_rx) = mpsc::channel(16);
    let listener_transport = tcp_transport.clone();
    tokio::spawn(async move {
        if let Err(e) = listener_transport.listen(accept_tx).await {
            warn!(error = %e, "protocol: accept loop exited");
        }
    });
    tokio::spawn(protocol_manager.run_accept_loop(accept_rx));

    info!(peer_port = config.peer_port, application_port = config.application_port, "haggled started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    kernel.request_shutdown();
    kernel.run_shutdown_sequence().await;
    store.flush()?;
    let _ = std::fs::remove_file(config.pid_file());

    Ok(())
}
