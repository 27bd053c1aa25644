use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{Arc, Mutex as StdMutex},
};

use futures::{SinkExt, StreamExt};
use lru::LruCache;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{watch, RwLock},
};
use tokio_util::codec::Framed;

use crate::{
    codec::{PeerCodec, PeerMessage},
    error::{ConnError, TrackerServerError},
    stats::ThroughputStats,
    transfer::FileTransfer,
};

type CacheKey = (Vec<u8>, u32);

/// Serves block data for every locally-shared file (spec §4.8). One seeder
/// can serve many files concurrently over a single listening socket; a
/// small LRU cache absorbs repeat reads of popular blocks without hitting
/// disk on every request.
pub struct Seeder {
    transfers: RwLock<HashMap<Vec<u8>, Arc<FileTransfer>>>,
    cache: StdMutex<LruCache<CacheKey, Vec<u8>>>,
    stats: StdMutex<ThroughputStats>,
}

impl Seeder {
    pub fn new(cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("cache_capacity must be positive");
        Self {
            transfers: RwLock::new(HashMap::new()),
            cache: StdMutex::new(LruCache::new(capacity)),
            stats: StdMutex::new(ThroughputStats::default()),
        }
    }

    /// Snapshot of bytes served since startup, sampled once a second (see
    /// [`Self::serve`]).
    pub fn stats(&self) -> ThroughputStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }

    /// Makes `transfer` servable under its filename. Callers register a file
    /// only once its metadata is loaded and at least the blocks on disk are
    /// marked present — there is nothing useful to serve before that (§9,
    /// Open Question 3).
    pub async fn add_file(&self, transfer: Arc<FileTransfer>) {
        self.transfers.write().await.insert(transfer.filename.clone(), transfer);
    }

    pub async fn remove_file(&self, filename: &[u8]) {
        self.transfers.write().await.remove(filename);
    }

    /// Binds `listen_addr` and runs the accept loop until `shutdown` carries
    /// `true`.
    pub async fn run(
        self: Arc<Self>,
        listen_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TrackerServerError> {
        let listener = TcpListener::bind(listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Runs the accept loop against an already-bound listener until
    /// `shutdown` carries `true`. Split out from [`Self::run`] so a caller
    /// that needs to know the actual bound port up front (e.g. to announce
    /// it to a tracker) can bind first and hand the listener over.
    #[tracing::instrument(skip(self, listener, shutdown), fields(addr = %listener.local_addr().ok().map(|a| a.to_string()).unwrap_or_default()))]
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TrackerServerError> {
        tracing::info!(addr = %listener.local_addr()?, "seeder listening");

        let mut stats_tick = tokio::time::interval(std::time::Duration::from_secs(1));
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let seeder = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = seeder.handle_connection(stream, peer_addr).await {
                            tracing::warn!(%peer_addr, error = %e, "seeder connection ended with an error");
                        }
                    });
                }
                _ = stats_tick.tick() => {
                    self.stats.lock().expect("stats mutex poisoned").reset();
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("seeder shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, stream), fields(peer = %peer_addr))]
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), ConnError> {
        let mut framed = Framed::new(stream, PeerCodec);
        while let Some(msg) = framed.next().await {
            let response = self.handle_message(msg?).await;
            framed.send(response).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, msg: PeerMessage) -> PeerMessage {
        match msg {
            PeerMessage::MetadataRequest { filename } => match self.lookup(&filename).await {
                Some(t) => PeerMessage::MetadataResp {
                    file_size: t.file_size().await,
                    block_size: t.block_size().await as u32,
                },
                None => PeerMessage::PeerError { reason: "file not shared".into() },
            },
            PeerMessage::BitmapRequest { filename } => match self.lookup(&filename).await {
                Some(t) => PeerMessage::BitmapResp { bits: t.snapshot_bitfield().await.into_vec() },
                None => PeerMessage::PeerError { reason: "file not shared".into() },
            },
            PeerMessage::BlockRequest { filename, block_index } => self.serve_block(&filename, block_index).await,
            other => PeerMessage::PeerError { reason: format!("unexpected request: {other:?}") },
        }
    }

    async fn lookup(&self, filename: &[u8]) -> Option<Arc<FileTransfer>> {
        self.transfers.read().await.get(filename).cloned()
    }

    async fn serve_block(&self, filename: &[u8], block_index: u32) -> PeerMessage {
        let key: CacheKey = (filename.to_vec(), block_index);
        if let Some(bytes) = self.cache.lock().expect("cache mutex poisoned").get(&key).cloned() {
            self.stats.lock().expect("stats mutex poisoned").up += bytes.len() as u64;
            return PeerMessage::BlockResp { block_index, bytes };
        }

        let Some(transfer) = self.lookup(filename).await else {
            return PeerMessage::PeerError { reason: "file not shared".into() };
        };

        let idx = block_index as usize;
        if !transfer.has_block(idx).await {
            return PeerMessage::PeerError { reason: "block not available".into() };
        }

        let len = transfer.block_len(idx).await;
        let offset = transfer.block_offset(idx).await;
        let bytes = match tokio::task::spawn_blocking(move || transfer.read_block(idx, len, offset)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return PeerMessage::PeerError { reason: format!("read failed: {e}") },
            Err(e) => return PeerMessage::PeerError { reason: format!("read task panicked: {e}") },
        };

        self.cache.lock().expect("cache mutex poisoned").put(key, bytes.clone());
        self.stats.lock().expect("stats mutex poisoned").up += bytes.len() as u64;
        PeerMessage::BlockResp { block_index, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::PeerConnection;
    use std::time::Duration;

    async fn start_seeder_with_file(contents: &[u8], block_size: usize) -> (SocketAddr, Arc<FileTransfer>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, contents).unwrap();
        std::mem::forget(dir); // keep the tempdir alive for the test's duration

        let transfer = Arc::new(FileTransfer::new(b"file.bin".to_vec(), path));
        transfer.load_from_existing_file(block_size).await.unwrap();

        let seeder = Arc::new(Seeder::new(16));
        seeder.add_file(Arc::clone(&transfer)).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            seeder.run(addr, rx).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        (addr, transfer)
    }

    #[tokio::test]
    async fn serves_metadata_bitmap_and_blocks() {
        let contents = b"hello world, this is shared data!";
        let (addr, _transfer) = start_seeder_with_file(contents, 8).await;

        let mut conn = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap();

        let resp = conn.request(PeerMessage::MetadataRequest { filename: b"file.bin".to_vec() }).await.unwrap();
        assert_eq!(resp, PeerMessage::MetadataResp { file_size: contents.len() as u64, block_size: 8 });

        let resp = conn.request(PeerMessage::BitmapRequest { filename: b"file.bin".to_vec() }).await.unwrap();
        match resp {
            PeerMessage::BitmapResp { bits } => assert!(bits.iter().all(|b| *b == 0xFF)),
            other => panic!("unexpected response: {other:?}"),
        }

        let resp = conn
            .request(PeerMessage::BlockRequest { filename: b"file.bin".to_vec(), block_index: 0 })
            .await
            .unwrap();
        assert_eq!(resp, PeerMessage::BlockResp { block_index: 0, bytes: contents[0..8].to_vec() });

        // Second request for the same block exercises the cache hit path.
        let resp = conn
            .request(PeerMessage::BlockRequest { filename: b"file.bin".to_vec(), block_index: 0 })
            .await
            .unwrap();
        assert_eq!(resp, PeerMessage::BlockResp { block_index: 0, bytes: contents[0..8].to_vec() });
    }

    #[tokio::test]
    async fn unknown_filename_is_a_peer_error() {
        let (addr, _transfer) = start_seeder_with_file(b"abc", 8).await;
        let mut conn = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap();

        let resp = conn.request(PeerMessage::MetadataRequest { filename: b"nope".to_vec() }).await.unwrap();
        assert!(matches!(resp, PeerMessage::PeerError { .. }));
    }
}
