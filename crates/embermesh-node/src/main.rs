//! Embermesh Node - LoRa mesh repeater over a UDP test transport
//!
//! Runs the repeater engine against a UDP "radio" and file-backed block
//! storage. Useful for bench testing mesh behavior without hardware: point
//! several nodes at each other with `--peer` and they form a mesh.

mod radio;
mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use embermesh_core::config::RepeaterConfig;
use embermesh_core::identity::{Keypair, Location, NodeIdentity, NodeKind};
use embermesh_engine::engine::{Engine, EngineExit};
use embermesh_engine::hal::{event_channel, MonotonicClock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use radio::UdpRadio;
use storage::FileStorage;

#[derive(Parser)]
#[command(name = "embermesh-node")]
#[command(about = "Embermesh repeater node (UDP transport)")]
struct Args {
    /// Advertised node name (max 15 bytes)
    #[arg(long, short, default_value = "repeater")]
    name: String,

    /// Advertised latitude in degrees
    #[arg(long)]
    lat: Option<f64>,

    /// Advertised longitude in degrees
    #[arg(long)]
    lon: Option<f64>,

    /// Identity seed file (created on first run)
    #[arg(long, default_value = "identity.seed")]
    identity: PathBuf,

    /// Directory for persistent storage blocks
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Settings file (JSON); defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:4610")]
    listen: SocketAddr,

    /// Peer node address (repeat for several peers)
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Override the advert interval, e.g. "30m"
    #[arg(long)]
    advert_interval: Option<String>,

    /// Log filter, e.g. "info" or "embermesh_engine=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn load_or_create_identity(path: &PathBuf) -> anyhow::Result<Keypair> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .with_context(|| format!("{} is not a 32-byte seed", path.display()))?;
            Ok(Keypair::from_seed(&seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            std::fs::write(path, keypair.seed())
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "new identity generated");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn load_config(args: &Args) -> anyhow::Result<RepeaterConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RepeaterConfig::default(),
    };
    if let Some(interval) = &args.advert_interval {
        config.advert_interval =
            humantime::parse_duration(interval).context("parsing --advert-interval")?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .init();

    let keypair = load_or_create_identity(&args.identity)?;
    info!(
        name = args.name,
        hash = format_args!("{:02x}", keypair.node_hash()),
        "starting embermesh node"
    );

    let location = match (args.lat, args.lon) {
        (Some(lat), Some(lon)) => Some(Location::from_degrees(lat, lon)),
        (None, None) => None,
        _ => anyhow::bail!("--lat and --lon must be given together"),
    };
    let config = load_config(&args)?;

    // The engine exits with RebootRequested after persistent radio trouble;
    // rebuilding the whole stack here is the host equivalent of a reboot.
    loop {
        let identity = NodeIdentity::new(
            Keypair::from_seed(&keypair.seed()),
            &args.name,
            NodeKind::Repeater,
            location,
        )?;
        let (events, events_rx) = event_channel();
        let (udp, rx_task) = UdpRadio::bind(args.listen, args.peers.clone(), events.clone()).await?;
        let file_storage = FileStorage::open(&args.data_dir).await?;
        let (engine, handle) = Engine::new(
            identity,
            config.clone(),
            udp,
            file_storage,
            MonotonicClock::new(),
            events_rx,
        );
        let mut engine_task = tokio::spawn(engine.run());

        let exit = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                handle.shutdown().await;
                (&mut engine_task).await??
            }
            exit = &mut engine_task => exit??,
        };
        rx_task.abort();

        match exit {
            EngineExit::Shutdown => break,
            EngineExit::RebootRequested => {
                warn!("engine requested restart");
                continue;
            }
        }
    }
    Ok(())
}
