use tokio::sync::mpsc;

/// Errors arising from a single [`PeerConnection`](crate::conn) — talking to
/// either a tracker or a remote peer. Never torn down the owning transfer;
/// callers log and skip the peer/tracker (spec §7).
#[derive(thiserror::Error, Debug)]
pub enum ConnError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote returned an error: {0}")]
    Remote(String),
}

impl From<tokio::time::error::Elapsed> for ConnError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ConnError::Timeout
    }
}

/// Errors surfaced by [`FileTransfer`](crate::FileTransfer) and the
/// [`Downloader`](crate::Downloader) that owns it.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("exhausted all trackers and peers without obtaining metadata")]
    NoMetadata,

    #[error("channel closed: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TransferError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TransferError::Channel(e.to_string())
    }
}

/// Errors that can end a [`TrackerServer`](crate::TrackerServer) listener
/// loop itself (not a single connection — those close silently, per §4.3).
#[derive(thiserror::Error, Debug)]
pub enum TrackerServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
