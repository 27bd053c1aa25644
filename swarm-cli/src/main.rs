use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swarm_core::{ClientCore, Config, TrackerEndpoint, TrackerRegistry, TrackerServer};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "swarm", about = "A swarm-based peer-to-peer file distribution tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a tracker that peers register with and query for peer lists.
    Tracker {
        #[arg(long, default_value = "0.0.0.0:6969")]
        listen: SocketAddr,
    },
    /// Share an existing local file with the swarm.
    Seed {
        /// Path to the file on disk.
        #[arg(long)]
        file: PathBuf,
        /// Name to advertise the file under; defaults to the file's own name.
        #[arg(long)]
        filename: Option<String>,
        /// Tracker(s) to register with. May be given more than once.
        #[arg(long = "tracker", required = true)]
        trackers: Vec<SocketAddr>,
        /// Address this seeder's data port listens on.
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
    },
    /// Download a file from the swarm.
    Download {
        /// Name the file is shared under.
        #[arg(long)]
        filename: String,
        /// Where to write the downloaded file.
        #[arg(long)]
        out: PathBuf,
        /// Tracker(s) to query for peers. May be given more than once.
        #[arg(long = "tracker", required = true)]
        trackers: Vec<SocketAddr>,
        /// Address this downloader's own data port listens on.
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Tracker { listen } => run_tracker(listen).await,
        Command::Seed { file, filename, trackers, listen } => run_seed(file, filename, trackers, listen).await,
        Command::Download { filename, out, trackers, listen } => run_download(filename, out, trackers, listen).await,
    }
}

async fn run_tracker(listen: SocketAddr) -> Result<()> {
    let registry = Arc::new(TrackerRegistry::new());
    let server = TrackerServer::new(registry);
    let (_tx, rx) = watch::channel(false);

    tracing::info!(%listen, "starting tracker");
    server.run(listen, rx).await.context("tracker server failed")?;
    Ok(())
}

async fn run_seed(file: PathBuf, filename: Option<String>, trackers: Vec<SocketAddr>, listen: SocketAddr) -> Result<()> {
    let filename =
        filename.unwrap_or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "file".into()));

    let mut config = Config::default();
    config.listen_address = listen;
    let client = ClientCore::spawn(config).await.context("failed to start client")?;

    let trackers = to_tracker_endpoints(trackers);
    client.share_file(filename.clone().into_bytes(), file, trackers).await.context("failed to share file")?;

    tracing::info!(%filename, "seeding; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    client.shutdown().await.context("failed to shut down cleanly")?;
    Ok(())
}

async fn run_download(filename: String, out: PathBuf, trackers: Vec<SocketAddr>, listen: SocketAddr) -> Result<()> {
    let mut config = Config::default();
    config.listen_address = listen;
    let client = ClientCore::spawn(config).await.context("failed to start client")?;

    let trackers = to_tracker_endpoints(trackers);
    let transfer = client
        .download_file(filename.clone().into_bytes(), out, trackers)
        .await
        .context("failed to start download")?;

    tracing::info!(%filename, "downloading");
    while !transfer.is_complete().await {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    tracing::info!(%filename, "download complete");

    client.shutdown().await.context("failed to shut down cleanly")?;
    Ok(())
}

fn to_tracker_endpoints(addrs: Vec<SocketAddr>) -> Vec<TrackerEndpoint> {
    addrs.into_iter().map(|addr| TrackerEndpoint::new(addr.ip().to_string(), addr.port())).collect()
}
