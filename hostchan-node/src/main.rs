//! Hosted-channel provider plugin binary.
//!
//! Runs as a Core Lightning plugin: answers `getmanifest` immediately,
//! finishes bootstrapping on `init` (store, RPC socket, node key, chain
//! and height), then hands everything to the channel master's event
//! loop.

mod channel;
mod cli;
mod commands;
mod config;
mod event;
mod master;
mod plugin;
mod rpc;
mod shutdown;
mod upstream;

use std::path::PathBuf;

use secp256k1::{PublicKey, Secp256k1};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use hostchan_core::crypto::node_key_from_hsm_secret;
use hostchan_store::ChannelStore;

use crate::cli::Cli;
use crate::config::Config;
use crate::event::Event;
use crate::master::ChannelMaster;
use crate::rpc::RpcClient;
use crate::upstream::{chain_hash_for_network, ClnUpstream, UpstreamNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    // stdout is the plugin protocol; all logging goes to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    tracing::info!("hostchan-node v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = cli.expanded_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let config = Config::load(&data_dir)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let _plugin = plugin::start(events_tx.clone());

    // Everything else waits for lightningd's init.
    let configuration = loop {
        match events_rx.recv().await {
            Some(Event::Init { configuration, responder }) => {
                responder.respond(json!({}));
                break configuration;
            }
            Some(Event::Shutdown) | None => {
                tracing::info!("terminated before init");
                return Ok(());
            }
            Some(other) => {
                tracing::debug!(?other, "event before init, dropping");
            }
        }
    };

    let lightning_dir = configuration
        .get("lightning-dir")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("init without lightning-dir"))?;
    let rpc_file = configuration
        .get("rpc-file")
        .and_then(Value::as_str)
        .map(|f| lightning_dir.join(f))
        .ok_or_else(|| anyhow::anyhow!("init without rpc-file"))?;

    let hsm_secret = upstream::load_hsm_secret(&lightning_dir)?;
    let node_secret = node_key_from_hsm_secret(&hsm_secret)?;
    let node_id = PublicKey::from_secret_key(&Secp256k1::new(), &node_secret);

    let rpc = RpcClient::connect(&rpc_file).await?;
    let upstream = ClnUpstream::new(rpc);
    let info = upstream.getinfo().await?;
    if info.id != node_id {
        anyhow::bail!(
            "derived node id {} does not match lightningd's {}",
            node_id,
            info.id
        );
    }
    let chain_hash = chain_hash_for_network(&info.network)
        .ok_or_else(|| anyhow::anyhow!("unsupported network {}", info.network))?;
    tracing::info!(
        network = %info.network,
        height = info.blockheight,
        node_id = %node_id,
        "connected to lightningd"
    );

    let store = ChannelStore::open(&data_dir)?;
    let master = ChannelMaster::new(
        config,
        store,
        upstream,
        node_secret,
        node_id,
        chain_hash,
        info.blockheight,
        events_tx,
    );

    tokio::select! {
        _ = master.run(events_rx) => {}
        _ = shutdown::wait_for_shutdown_signal() => {}
    }
    Ok(())
}
