use std::{path::PathBuf, sync::Arc};

use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};

use crate::{
    codec::{TrackerCodec, TrackerMessage},
    config::Config,
    conn::PeerConnection,
    downloader::{Downloader, DownloaderError},
    endpoint::TrackerEndpoint,
    error::{ConnError, TransferError},
    seeder::Seeder,
    transfer::FileTransfer,
};

/// Errors a [`ClientCore`] request can fail with.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Downloader(#[from] DownloaderError),
    #[error("client actor has already shut down")]
    ActorGone,
}

impl<T> From<mpsc::error::SendError<T>> for ClientError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        ClientError::ActorGone
    }
}

enum Command {
    Share {
        filename: Vec<u8>,
        local_path: PathBuf,
        trackers: Vec<TrackerEndpoint>,
        respond_to: oneshot::Sender<Result<Arc<FileTransfer>, ClientError>>,
    },
    Download {
        filename: Vec<u8>,
        local_path: PathBuf,
        trackers: Vec<TrackerEndpoint>,
        respond_to: oneshot::Sender<Result<Arc<FileTransfer>, ClientError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Top-level client handle (spec §4.9): a single actor task owns the seeder
/// listener and every active downloader, reached through an mpsc command
/// channel. Cloning `ClientCore` just clones the channel sender, so many
/// callers (e.g. a CLI's concurrent subcommands) can share one client.
#[derive(Clone)]
pub struct ClientCore {
    commands: mpsc::Sender<Command>,
}

impl ClientCore {
    /// Spawns the actor task and binds its seeder listener immediately, so
    /// the address it will announce to trackers is known up front.
    pub async fn spawn(config: Config) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(config.listen_address).await.map_err(ConnError::Io)?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_actor(config, listener, rx));
        Ok(Self { commands: tx })
    }

    /// Shares an already-complete local file: loads its metadata off disk,
    /// registers it with every tracker given, and starts serving it.
    pub async fn share_file(
        &self,
        filename: impl Into<Vec<u8>>,
        local_path: impl Into<PathBuf>,
        trackers: Vec<TrackerEndpoint>,
    ) -> Result<Arc<FileTransfer>, ClientError> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(Command::Share { filename: filename.into(), local_path: local_path.into(), trackers, respond_to })
            .await?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Starts downloading `filename` to `local_path` using the given
    /// trackers to discover peers. Returns immediately with a handle; poll
    /// `FileTransfer::is_complete` to know when it's done.
    pub async fn download_file(
        &self,
        filename: impl Into<Vec<u8>>,
        local_path: impl Into<PathBuf>,
        trackers: Vec<TrackerEndpoint>,
    ) -> Result<Arc<FileTransfer>, ClientError> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(Command::Download { filename: filename.into(), local_path: local_path.into(), trackers, respond_to })
            .await?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Signals every downloader and the seeder listener to stop, and waits
    /// for them to drain before returning.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::Shutdown { done }).await?;
        rx.await.map_err(|_| ClientError::ActorGone)
    }
}

async fn run_actor(config: Config, listener: TcpListener, mut commands: mpsc::Receiver<Command>) {
    let seeder_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    let seeder = Arc::new(Seeder::new(256));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<()> = JoinSet::new();

    tasks.spawn({
        let seeder = Arc::clone(&seeder);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = seeder.serve(listener, shutdown_rx).await {
                tracing::error!(error = %e, "seeder listener exited with an error");
            }
        }
    });

    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Share { filename, local_path, trackers, respond_to } => {
                let result = handle_share(&config, &seeder, seeder_port, filename, local_path, trackers).await;
                let _ = respond_to.send(result);
            }
            Command::Download { filename, local_path, trackers, respond_to } => {
                let result = handle_download(
                    &config,
                    &seeder,
                    seeder_port,
                    &mut tasks,
                    shutdown_rx.clone(),
                    filename,
                    local_path,
                    trackers,
                )
                .await;
                let _ = respond_to.send(result);
            }
            Command::Shutdown { done } => {
                let _ = shutdown_tx.send(true);
                while tasks.join_next().await.is_some() {}
                let _ = done.send(());
                return;
            }
        }
    }

    // Sender side dropped without an explicit shutdown: still drain cleanly.
    let _ = shutdown_tx.send(true);
    while tasks.join_next().await.is_some() {}
}

async fn handle_share(
    config: &Config,
    seeder: &Arc<Seeder>,
    seeder_port: u16,
    filename: Vec<u8>,
    local_path: PathBuf,
    trackers: Vec<TrackerEndpoint>,
) -> Result<Arc<FileTransfer>, ClientError> {
    let transfer = Arc::new(FileTransfer::new(filename.clone(), local_path));
    transfer.load_from_existing_file(config.block_size).await?;

    for tracker in &trackers {
        transfer.add_tracker(tracker.clone()).await;
        announce(tracker, &filename, seeder_port, config.io_timeout).await?;
    }

    seeder.add_file(Arc::clone(&transfer)).await;
    Ok(transfer)
}

async fn handle_download(
    config: &Config,
    seeder: &Arc<Seeder>,
    seeder_port: u16,
    tasks: &mut JoinSet<()>,
    shutdown_rx: watch::Receiver<bool>,
    filename: Vec<u8>,
    local_path: PathBuf,
    trackers: Vec<TrackerEndpoint>,
) -> Result<Arc<FileTransfer>, ClientError> {
    let transfer = Arc::new(FileTransfer::new(filename, local_path));
    for tracker in &trackers {
        transfer.add_tracker(tracker.clone()).await;
    }

    let downloader = Arc::new(Downloader::new(Arc::clone(&transfer), config.clone()));
    let seeder = Arc::clone(seeder);
    let transfer_for_task = Arc::clone(&transfer);
    let io_timeout = config.io_timeout;
    tasks.spawn(async move {
        match downloader.run(shutdown_rx).await {
            Ok(()) => {
                // Only once a block is on disk does this peer have anything
                // to offer; registering earlier would violate invariant 4
                // (spec §9, Open Question 3).
                if transfer_for_task.is_complete().await {
                    let filename = transfer_for_task.filename.clone();
                    seeder.add_file(Arc::clone(&transfer_for_task)).await;
                    for tracker in &trackers {
                        if let Err(e) = announce(tracker, &filename, seeder_port, io_timeout).await {
                            tracing::warn!(%tracker, error = %e, "failed to register completed download with tracker");
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "downloader exited with an error"),
        }
    });

    Ok(transfer)
}

async fn announce(
    tracker: &TrackerEndpoint,
    filename: &[u8],
    data_port: u16,
    io_timeout: std::time::Duration,
) -> Result<(), ClientError> {
    let addr = tracker.socket_addr().map_err(ConnError::Io)?;
    let mut conn = PeerConnection::connect(addr, TrackerCodec, io_timeout).await?;
    let resp = conn.request(TrackerMessage::RegisterPeer { filename: filename.to_vec(), data_port }).await?;
    match resp {
        TrackerMessage::Success => Ok(()),
        TrackerMessage::TrackerError { reason } => Err(ClientError::Conn(ConnError::Remote(reason))),
        other => Err(ClientError::Conn(ConnError::Protocol(format!("unexpected tracker response: {other:?}")))),
    }
}
