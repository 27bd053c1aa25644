use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinSet,
};

use crate::{
    codec::{PeerCodec, PeerMessage, TrackerCodec, TrackerMessage},
    config::Config,
    conn::PeerConnection,
    endpoint::{PeerEndpoint, TrackerEndpoint},
    error::{ConnError, TransferError},
    scheduler::Decision,
    stats::ThroughputStats,
    transfer::FileTransfer,
    Bitfield,
};

/// How long a peer worker waits before re-checking a peer that currently has
/// nothing we need (spec §4.7.b: "sleep briefly and retry").
const PEER_HAS_NOTHING_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Outcome of one [`Downloader::peer_round`] cycle.
enum PeerRoundOutcome {
    /// A block was fetched; go again immediately.
    Continue,
    /// The peer has nothing useful right now; back off and retry.
    NothingToDo,
    /// The transfer is complete, or shutdown was requested mid-connect.
    Done,
}

/// Errors that can end a [`Downloader::run`] call outright, as opposed to a
/// single peer round failing (those are logged and the worker just tries
/// the next peer or gives up on that one — spec §7).
#[derive(thiserror::Error, Debug)]
pub enum DownloaderError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error("no trackers configured for this transfer")]
    NoTrackers,
}

/// Drives one [`FileTransfer`] to completion: learns metadata from a peer if
/// it isn't known yet, then runs one worker per discovered peer plus a
/// periodic tracker refresh (spec §4.7).
///
/// `active_peers` is guarded independently of `transfer`'s internal lock —
/// deciding which peers currently have a worker is a different concern from
/// the block bitmaps, and giving it its own guard keeps a slow tracker
/// refresh from blocking block-selection decisions.
pub struct Downloader {
    transfer: Arc<FileTransfer>,
    config: Config,
    active_peers: AsyncMutex<HashSet<PeerEndpoint>>,
    stats: StdMutex<ThroughputStats>,
}

impl Downloader {
    pub fn new(transfer: Arc<FileTransfer>, config: Config) -> Self {
        Self {
            transfer,
            config,
            active_peers: AsyncMutex::new(HashSet::new()),
            stats: StdMutex::new(ThroughputStats::default()),
        }
    }

    pub fn transfer(&self) -> &Arc<FileTransfer> {
        &self.transfer
    }

    /// Snapshot of bytes downloaded since startup, sampled once a second
    /// (see [`Self::run`]).
    pub fn stats(&self) -> ThroughputStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }

    /// Learns `fileSize`/`blockSize` from the first peer that answers, after
    /// asking every known tracker for the current peer set (spec §4.7.a). A
    /// no-op once metadata is already loaded.
    pub async fn bootstrap_metadata(&self) -> Result<(), DownloaderError> {
        if self.transfer.metadata_loaded().await {
            return Ok(());
        }

        let peers = self.discover_peers().await?;
        for peer in peers {
            match self.fetch_metadata_from(&peer).await {
                Ok((file_size, block_size)) => {
                    self.transfer.set_metadata(file_size, block_size as usize).await?;
                    self.transfer.add_seed(peer).await;
                    return Ok(());
                }
                Err(e) => tracing::debug!(%peer, error = %e, "peer did not answer metadata request"),
            }
        }

        Err(DownloaderError::Transfer(TransferError::NoMetadata))
    }

    async fn discover_peers(&self) -> Result<Vec<PeerEndpoint>, DownloaderError> {
        let trackers = self.transfer.trackers().await;
        if trackers.is_empty() {
            return Err(DownloaderError::NoTrackers);
        }

        let mut peers = HashSet::new();
        for tracker in &trackers {
            match self.ask_tracker(tracker).await {
                Ok(found) => peers.extend(found),
                Err(e) => tracing::warn!(%tracker, error = %e, "tracker refresh failed"),
            }
        }
        Ok(peers.into_iter().collect())
    }

    async fn ask_tracker(&self, tracker: &TrackerEndpoint) -> Result<Vec<PeerEndpoint>, ConnError> {
        let addr = tracker.socket_addr()?;
        let mut conn = PeerConnection::connect(addr, TrackerCodec, self.config.io_timeout).await?;
        let resp = conn.request(TrackerMessage::PeerList { filename: self.transfer.filename.clone() }).await?;
        match resp {
            TrackerMessage::PeerListResp { peers } => Ok(peers),
            TrackerMessage::TrackerError { reason } => Err(ConnError::Remote(reason)),
            other => Err(ConnError::Protocol(format!("unexpected tracker response: {other:?}"))),
        }
    }

    async fn fetch_metadata_from(&self, peer: &PeerEndpoint) -> Result<(u64, u32), ConnError> {
        let addr = peer.socket_addr()?;
        let mut conn = PeerConnection::connect(addr, PeerCodec, self.config.io_timeout).await?;
        let resp = conn.request(PeerMessage::MetadataRequest { filename: self.transfer.filename.clone() }).await?;
        match resp {
            PeerMessage::MetadataResp { file_size, block_size } => Ok((file_size, block_size)),
            PeerMessage::PeerError { reason } => Err(ConnError::Remote(reason)),
            other => Err(ConnError::Protocol(format!("unexpected peer response: {other:?}"))),
        }
    }

    /// Bootstraps metadata if needed, then runs one worker per known peer
    /// and a periodic tracker refresh, until the transfer is complete or
    /// `shutdown` carries `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DownloaderError> {
        self.bootstrap_metadata().await?;

        if self.transfer.is_complete().await {
            return Ok(());
        }

        let mut workers: JoinSet<()> = JoinSet::new();
        let mut refresh_interval = tokio::time::interval(self.config.tracker_refresh_interval);
        refresh_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh_interval.reset();

        self.spawn_workers(&mut workers, self.transfer.seeds().await, shutdown.clone()).await;

        let mut stats_tick = tokio::time::interval(std::time::Duration::from_secs(1));
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.transfer.is_complete().await {
                break;
            }
            tokio::select! {
                _ = refresh_interval.tick() => {
                    self.refresh_and_spawn(&mut workers, shutdown.clone()).await;
                }
                _ = stats_tick.tick() => {
                    self.stats.lock().expect("stats mutex poisoned").reset();
                }
                _ = join_next_or_pending(&mut workers) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        workers.shutdown().await;
        Ok(())
    }

    async fn refresh_and_spawn(self: &Arc<Self>, workers: &mut JoinSet<()>, shutdown: watch::Receiver<bool>) {
        match self.discover_peers().await {
            Ok(peers) => {
                for peer in &peers {
                    self.transfer.add_seed(peer.clone()).await;
                }
                self.spawn_workers(workers, peers, shutdown).await;
            }
            Err(e) => tracing::warn!(error = %e, "periodic tracker refresh failed"),
        }
    }

    async fn spawn_workers(self: &Arc<Self>, workers: &mut JoinSet<()>, peers: Vec<PeerEndpoint>, shutdown: watch::Receiver<bool>) {
        let mut active = self.active_peers.lock().await;
        for peer in peers {
            if !active.insert(peer.clone()) {
                continue;
            }
            let this = Arc::clone(self);
            let worker_shutdown = shutdown.clone();
            let cleanup_peer = peer.clone();
            workers.spawn(async move {
                this.run_peer_worker(peer, worker_shutdown).await;
                this.active_peers.lock().await.remove(&cleanup_peer);
            });
        }
    }

    #[tracing::instrument(skip(self, shutdown), fields(peer = %peer))]
    async fn run_peer_worker(&self, peer: PeerEndpoint, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() || self.transfer.is_complete().await {
                return;
            }
            match self.peer_round(&peer, &mut shutdown).await {
                Ok(PeerRoundOutcome::Continue) => continue,
                Ok(PeerRoundOutcome::Done) => return,
                Ok(PeerRoundOutcome::NothingToDo) => {
                    tokio::select! {
                        _ = tokio::time::sleep(PEER_HAS_NOTHING_RETRY_DELAY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "peer worker round failed, dropping peer");
                    return;
                }
            }
        }
    }

    /// One bitmap-fetch-plus-block-request cycle.
    async fn peer_round(
        &self,
        peer: &PeerEndpoint,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<PeerRoundOutcome, ConnError> {
        let addr = peer.socket_addr()?;
        let mut conn = tokio::select! {
            result = PeerConnection::connect(addr, PeerCodec, self.config.io_timeout) => result?,
            _ = shutdown.changed() => return Ok(PeerRoundOutcome::Done),
        };

        let resp = conn.request(PeerMessage::BitmapRequest { filename: self.transfer.filename.clone() }).await?;
        let bits = match resp {
            PeerMessage::BitmapResp { bits } => bits,
            PeerMessage::PeerError { reason } => return Err(ConnError::Remote(reason)),
            other => return Err(ConnError::Protocol(format!("unexpected peer response: {other:?}"))),
        };

        let expected_len = self.transfer.num_blocks().await;
        let mut peer_bitfield = Bitfield::from_vec(bits);
        if peer_bitfield.len() < expected_len {
            return Err(ConnError::Protocol("peer bitmap shorter than this transfer's block count".into()));
        }
        peer_bitfield.truncate(expected_len);

        match self.transfer.select_block(&peer_bitfield).await {
            Decision::Complete => Ok(PeerRoundOutcome::Done),
            // Peer has nothing useful right now; the worker sleeps briefly
            // and retries rather than giving up on the peer (spec §4.7.b).
            Decision::PeerHasNothing => Ok(PeerRoundOutcome::NothingToDo),
            Decision::Index(idx) => {
                let result = self.request_and_record(&mut conn, idx as u32).await;
                if result.is_err() {
                    self.transfer.clear_assigned(idx).await;
                }
                result?;
                Ok(PeerRoundOutcome::Continue)
            }
        }
    }

    async fn request_and_record(&self, conn: &mut PeerConnection<PeerCodec>, block_index: u32) -> Result<(), ConnError> {
        let resp = conn
            .request(PeerMessage::BlockRequest { filename: self.transfer.filename.clone(), block_index })
            .await?;
        match resp {
            PeerMessage::BlockResp { bytes, .. } => {
                self.stats.lock().expect("stats mutex poisoned").down += bytes.len() as u64;
                self.transfer
                    .record_block(block_index as usize, &bytes)
                    .await
                    .map_err(|e| ConnError::Protocol(e.to_string()))
            }
            PeerMessage::PeerError { reason } => Err(ConnError::Remote(reason)),
            other => Err(ConnError::Protocol(format!("unexpected peer response: {other:?}"))),
        }
    }
}

/// `JoinSet::join_next` resolves to `None` immediately when the set is
/// empty; polling that in a `select!` arm would spin. Parking on `pending()`
/// instead makes an empty worker set simply not a candidate branch.
async fn join_next_or_pending(workers: &mut JoinSet<()>) {
    if workers.is_empty() {
        std::future::pending::<()>().await;
    } else {
        let _ = workers.join_next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::TrackerRegistry, seeder::Seeder, tracker_server::TrackerServer};
    use std::{net::SocketAddr, time::Duration};
    use tokio::net::TcpListener;

    async fn free_addr() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn downloads_a_complete_file_from_a_single_seeder() {
        let contents = b"the quick brown fox jumps over the lazy dog".to_vec();
        let filename = b"doc.txt".to_vec();

        // Tracker.
        let tracker_addr = free_addr().await;
        let registry = Arc::new(TrackerRegistry::new());
        let tracker_server = TrackerServer::new(Arc::clone(&registry));
        let (_tracker_shutdown_tx, tracker_shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tracker_server.run(tracker_addr, tracker_shutdown_rx).await.unwrap();
        });

        // Seeder holding the complete file.
        let seed_dir = tempfile::tempdir().unwrap();
        let seed_path = seed_dir.path().join("doc.txt");
        std::fs::write(&seed_path, &contents).unwrap();
        let seed_transfer = Arc::new(FileTransfer::new(filename.clone(), seed_path));
        seed_transfer.load_from_existing_file(8).await.unwrap();

        let seeder = Arc::new(Seeder::new(16));
        seeder.add_file(Arc::clone(&seed_transfer)).await;
        let seeder_addr = free_addr().await;
        let (_seeder_shutdown_tx, seeder_shutdown_rx) = watch::channel(false);
        tokio::spawn({
            let seeder = Arc::clone(&seeder);
            async move {
                seeder.run(seeder_addr, seeder_shutdown_rx).await.unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Seeder announces itself to the tracker.
        registry.add_peer(&filename, PeerEndpoint::new("127.0.0.1", seeder_addr.port())).await;

        // Downloader side: empty transfer that only knows the tracker.
        let download_dir = tempfile::tempdir().unwrap();
        let download_path = download_dir.path().join("doc.txt");
        let downloader_transfer = Arc::new(FileTransfer::new(filename.clone(), download_path.clone()));
        downloader_transfer.add_tracker(TrackerEndpoint::new("127.0.0.1", tracker_addr.port())).await;

        let mut config = Config::default();
        config.io_timeout = Duration::from_secs(5);
        config.tracker_refresh_interval = Duration::from_secs(3600);

        let downloader = Arc::new(Downloader::new(Arc::clone(&downloader_transfer), config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run_handle = tokio::spawn({
            let downloader = Arc::clone(&downloader);
            async move { downloader.run(shutdown_rx).await }
        });

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if downloader_transfer.is_complete().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok(), "download did not complete in time");

        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap().unwrap();

        let downloaded = std::fs::read(&download_path).unwrap();
        assert_eq!(downloaded, contents);
    }

    #[tokio::test]
    async fn bootstrap_metadata_fails_with_no_trackers() {
        let transfer = Arc::new(FileTransfer::new(b"f".to_vec(), "/tmp/does-not-matter"));
        let downloader = Downloader::new(transfer, Config::default());
        let err = downloader.bootstrap_metadata().await.unwrap_err();
        assert!(matches!(err, DownloaderError::NoTrackers));
    }

    async fn start_tracker(registry: Arc<TrackerRegistry>) -> SocketAddr {
        let addr = free_addr().await;
        let server = TrackerServer::new(Arc::clone(&registry));
        let (tx, rx) = watch::channel(false);
        // Leaked: dropping the sender would close the watch channel and the
        // server would read that as a shutdown signal. The fixture needs to
        // outlive the whole test, so there is no real owner to hand it to.
        std::mem::forget(tx);
        tokio::spawn(async move {
            server.run(addr, rx).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        addr
    }

    /// Builds a seeder holding only the given blocks of `content`, zero-filled
    /// everywhere else, and starts it listening. Returns its bound address.
    async fn start_partial_seeder(filename: &[u8], content: &[u8], block_size: usize, present: &[usize]) -> SocketAddr {
        let dir = tempfile::tempdir().unwrap();
        // Leaked: the tempdir must outlive the seeder task, which runs for
        // the rest of the test process. Fine for a test fixture.
        let path = Box::leak(Box::new(dir)).path().join("part.bin");
        let transfer = Arc::new(FileTransfer::new(filename.to_vec(), path));
        transfer.set_metadata(content.len() as u64, block_size).await.unwrap();
        for &idx in present {
            let start = idx * block_size;
            let end = std::cmp::min(start + block_size, content.len());
            transfer.record_block(idx, &content[start..end]).await.unwrap();
        }

        let seeder = Arc::new(Seeder::new(16));
        seeder.add_file(transfer).await;
        let addr = free_addr().await;
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        tokio::spawn({
            let seeder = Arc::clone(&seeder);
            async move {
                seeder.run(addr, rx).await.unwrap();
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        addr
    }

    /// Spec §8 scenario 2: two seeders each hold disjoint halves of a
    /// 4-block file; one downloader completes using both concurrently, and
    /// no block is fetched outside the non-endgame exclusive-assignment
    /// path (each peer only ever advertises the blocks it actually has, so
    /// there is no overlap to deduplicate here).
    #[tokio::test]
    async fn two_seeders_holding_disjoint_halves_complete_the_file() {
        let content = b"0123456789abcdef".to_vec();
        let filename = b"split.bin".to_vec();
        let block_size = 4;

        let registry = Arc::new(TrackerRegistry::new());
        let tracker_addr = start_tracker(Arc::clone(&registry)).await;

        let s1_addr = start_partial_seeder(&filename, &content, block_size, &[0, 1]).await;
        let s2_addr = start_partial_seeder(&filename, &content, block_size, &[2, 3]).await;
        registry.add_peer(&filename, PeerEndpoint::new("127.0.0.1", s1_addr.port())).await;
        registry.add_peer(&filename, PeerEndpoint::new("127.0.0.1", s2_addr.port())).await;

        let download_dir = tempfile::tempdir().unwrap();
        let download_path = download_dir.path().join("split.bin");
        let downloader_transfer = Arc::new(FileTransfer::new(filename.clone(), download_path.clone()));
        downloader_transfer.add_tracker(TrackerEndpoint::new("127.0.0.1", tracker_addr.port())).await;

        let mut config = Config::default();
        config.io_timeout = Duration::from_secs(5);
        config.tracker_refresh_interval = Duration::from_secs(3600);

        let downloader = Arc::new(Downloader::new(Arc::clone(&downloader_transfer), config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_handle = tokio::spawn({
            let downloader = Arc::clone(&downloader);
            async move { downloader.run(shutdown_rx).await }
        });

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if downloader_transfer.is_complete().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok(), "download from two disjoint seeders did not complete in time");

        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&download_path).unwrap(), content);
    }

    /// Spec §8 scenario 3: the tracker is restarted (a fresh process loses
    /// its registry). A seeder re-registers with the new tracker instance,
    /// and the downloader's next periodic refresh discovers it and
    /// completes the transfer — the swarm reconverges rather than being
    /// permanently stuck on the stale registration.
    #[tokio::test]
    async fn swarm_reconverges_after_tracker_restart() {
        let content = b"firstpartsecondp".to_vec(); // 16 bytes, two 8-byte blocks
        let filename = b"restart.bin".to_vec();
        let block_size = 8;

        let registry1 = Arc::new(TrackerRegistry::new());
        let tracker_addr = free_addr().await;
        let tracker1 = TrackerServer::new(Arc::clone(&registry1));
        let (tracker1_shutdown_tx, tracker1_shutdown_rx) = watch::channel(false);
        let tracker1_handle = tokio::spawn(async move { tracker1.run(tracker_addr, tracker1_shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Only the first half is servable at first, from a seeder
        // registered with the original tracker.
        let s1_addr = start_partial_seeder(&filename, &content, block_size, &[0]).await;
        registry1.add_peer(&filename, PeerEndpoint::new("127.0.0.1", s1_addr.port())).await;

        let download_dir = tempfile::tempdir().unwrap();
        let download_path = download_dir.path().join("restart.bin");
        let downloader_transfer = Arc::new(FileTransfer::new(filename.clone(), download_path.clone()));
        downloader_transfer.add_tracker(TrackerEndpoint::new("127.0.0.1", tracker_addr.port())).await;

        let mut config = Config::default();
        config.io_timeout = Duration::from_secs(5);
        config.tracker_refresh_interval = Duration::from_millis(150);

        let downloader = Arc::new(Downloader::new(Arc::clone(&downloader_transfer), config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_handle = tokio::spawn({
            let downloader = Arc::clone(&downloader);
            async move { downloader.run(shutdown_rx).await }
        });

        // Wait for the first block to land before tearing the tracker down,
        // so the restart genuinely happens mid-run.
        let got_first_block = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if downloader_transfer.has_block(0).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(got_first_block.is_ok(), "first block did not arrive before the tracker restart");

        // The tracker process goes down, releasing the port, and a fresh
        // one comes up on the same address with none of the old
        // registrations.
        tracker1_shutdown_tx.send(true).unwrap();
        tracker1_handle.await.unwrap().unwrap();

        let registry2 = Arc::new(TrackerRegistry::new());
        let new_tracker = TrackerServer::new(Arc::clone(&registry2));
        let (tracker2_shutdown_tx, tracker2_shutdown_rx) = watch::channel(false);
        std::mem::forget(tracker2_shutdown_tx);
        tokio::spawn(async move {
            new_tracker.run(tracker_addr, tracker2_shutdown_rx).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The seeder holding the remaining block re-registers with the
        // restarted tracker.
        let s2_addr = start_partial_seeder(&filename, &content, block_size, &[1]).await;
        registry2.add_peer(&filename, PeerEndpoint::new("127.0.0.1", s2_addr.port())).await;

        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if downloader_transfer.is_complete().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok(), "downloader did not reconverge after the tracker restarted");

        shutdown_tx.send(true).unwrap();
        run_handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&download_path).unwrap(), content);
    }

    /// Spec §8 scenario 5: three peers all hold the last missing block.
    /// The scheduler's non-endgame branch assigns it to the first caller;
    /// the remaining two callers see it as already-assigned-but-still-
    /// missing and take the endgame (duplicate-request) branch. All three
    /// fetch the block from their own real seeder connection, but
    /// `record_block`'s presence check discards the two that land after
    /// the first — the file ends up correct regardless of arrival order.
    #[tokio::test]
    async fn endgame_duplicate_fetches_are_discarded_by_idempotent_writes() {
        let content = b"lastblock".to_vec();
        let filename = b"last.bin".to_vec();
        let block_size = content.len();

        let s1_addr = start_partial_seeder(&filename, &content, block_size, &[0]).await;
        let s2_addr = start_partial_seeder(&filename, &content, block_size, &[0]).await;
        let s3_addr = start_partial_seeder(&filename, &content, block_size, &[0]).await;

        let download_dir = tempfile::tempdir().unwrap();
        let download_path = download_dir.path().join("last.bin");
        let downloader_transfer = Arc::new(FileTransfer::new(filename.clone(), download_path.clone()));
        downloader_transfer.set_metadata(content.len() as u64, block_size).await.unwrap();

        let mut config = Config::default();
        config.io_timeout = Duration::from_secs(5);
        let downloader = Downloader::new(Arc::clone(&downloader_transfer), config);

        let peer_bitfield = Bitfield::repeat(true, 1);

        // Deterministically reproduce the race: all three workers check the
        // scheduler before any of them has written the block back to disk.
        let first = downloader_transfer.select_block(&peer_bitfield).await;
        let second = downloader_transfer.select_block(&peer_bitfield).await;
        let third = downloader_transfer.select_block(&peer_bitfield).await;
        assert_eq!(first, Decision::Index(0), "first caller gets the normal non-endgame assignment");
        assert_eq!(second, Decision::Index(0), "endgame duplicate must still resolve to the same block");
        assert_eq!(third, Decision::Index(0), "endgame duplicate must still resolve to the same block");

        for addr in [s2_addr, s3_addr, s1_addr] {
            let mut conn = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap();
            let resp = conn
                .request(PeerMessage::BlockRequest { filename: filename.clone(), block_index: 0 })
                .await
                .unwrap();
            let bytes = match resp {
                PeerMessage::BlockResp { bytes, .. } => bytes,
                other => panic!("unexpected response: {other:?}"),
            };
            downloader_transfer.record_block(0, &bytes).await.unwrap();
        }

        assert!(downloader_transfer.is_complete().await);
        assert_eq!(std::fs::read(&download_path).unwrap(), content);
        assert!(Arc::ptr_eq(downloader.transfer(), &downloader_transfer));
    }
}
