use std::{
    collections::HashSet,
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::{
    endpoint::{PeerEndpoint, TrackerEndpoint},
    error::TransferError,
    scheduler::{select_block, Decision},
    Bitfield,
};

/// `ceil(file_size / block_size)`, saturating at 0 when `file_size == 0`.
/// The source used integer division here, which silently rounds a file
/// smaller than one block down to zero blocks; §9 of the spec calls this
/// out explicitly and asks for real ceiling division instead.
pub fn num_blocks(file_size: u64, block_size: usize) -> usize {
    if file_size == 0 {
        return 0;
    }
    let block_size = block_size as u64;
    ((file_size + block_size - 1) / block_size) as usize
}

/// Length in bytes of block `idx`; the last block is short when `file_size`
/// isn't a multiple of `block_size`.
pub fn block_len(file_size: u64, block_size: usize, idx: usize) -> usize {
    let start = idx as u64 * block_size as u64;
    debug_assert!(start < file_size, "block index out of range");
    std::cmp::min(block_size as u64, file_size - start) as usize
}

#[derive(Debug, Default)]
struct Metadata {
    loaded: bool,
    file_size: u64,
    block_size: usize,
}

#[derive(Debug, Default)]
struct State {
    metadata: Metadata,
    blocks_present: Bitfield,
    blocks_assigned: Bitfield,
    trackers: HashSet<TrackerEndpoint>,
    seeds: HashSet<PeerEndpoint>,
}

/// Per-file client-side state: metadata, the two block bitmaps, and the
/// peer/tracker sets a `Downloader`/`Seeder` pair work against. Metadata and
/// both bitmaps live behind one guard (spec §5: "a single per-transfer guard
/// suffices"), which is what makes [`select_block`](Self::select_block) an
/// atomic test-and-set.
#[derive(Debug)]
pub struct FileTransfer {
    pub filename: Vec<u8>,
    pub local_path: PathBuf,
    state: RwLock<State>,
    // Guards the on-disk handle itself. Every syscall against it (open,
    // set_len, seek, read, write) runs inside `spawn_blocking`, mirroring
    // the teacher's disk-actor pattern of shelling blocking file I/O out to
    // the blocking thread pool rather than stalling an async worker thread
    // (spec §5: "disk access itself is guarded by a
    // `tokio::sync::Mutex<std::fs::File>`").
    file: AsyncMutex<Option<std::fs::File>>,
}

impl FileTransfer {
    pub fn new(filename: impl Into<Vec<u8>>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            local_path: local_path.into(),
            state: RwLock::new(State::default()),
            file: AsyncMutex::new(None),
        }
    }

    pub async fn metadata_loaded(&self) -> bool {
        self.state.read().await.metadata.loaded
    }

    /// Rejected after the first successful call: returns the values already
    /// on record rather than erroring, matching the "first write wins"
    /// semantics invariant 3 describes.
    pub async fn set_metadata(&self, file_size: u64, block_size: usize) -> Result<(u64, usize), TransferError> {
        debug_assert!(block_size > 0);
        let mut state = self.state.write().await;
        if state.metadata.loaded {
            return Ok((state.metadata.file_size, state.metadata.block_size));
        }

        let n = num_blocks(file_size, block_size);
        state.metadata = Metadata { loaded: true, file_size, block_size };
        state.blocks_present = Bitfield::repeat(false, n);
        state.blocks_assigned = Bitfield::repeat(false, n);
        drop(state);

        self.open_or_create_file(file_size).await?;
        Ok((file_size, block_size))
    }

    async fn open_or_create_file(&self, file_size: u64) -> Result<(), TransferError> {
        let path = self.local_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = std::fs::OpenOptions::new().create(true).read(true).write(true).open(&path)?;
            file.set_len(file_size)?;
            Ok(file)
        })
        .await
        .expect("open_or_create_file blocking task panicked")?;

        *self.file.lock().await = Some(file);
        Ok(())
    }

    /// Loads metadata from an already-complete local file (the seeding path:
    /// `fileSize` is the file's length on disk, every block is marked
    /// present).
    pub async fn load_from_existing_file(&self, block_size: usize) -> Result<(u64, usize), TransferError> {
        let path = self.local_path.clone();
        let (file, file_size) = tokio::task::spawn_blocking(move || -> std::io::Result<(std::fs::File, u64)> {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            let file_size = file.metadata()?.len();
            Ok((file, file_size))
        })
        .await
        .expect("load_from_existing_file blocking task panicked")?;

        *self.file.lock().await = Some(file);

        let n = num_blocks(file_size, block_size);
        let mut state = self.state.write().await;
        if state.metadata.loaded {
            return Ok((state.metadata.file_size, state.metadata.block_size));
        }
        state.metadata = Metadata { loaded: true, file_size, block_size };
        state.blocks_present = Bitfield::repeat(true, n);
        state.blocks_assigned = Bitfield::repeat(false, n);
        Ok((file_size, block_size))
    }

    pub async fn file_size(&self) -> u64 {
        self.state.read().await.metadata.file_size
    }

    pub async fn block_size(&self) -> usize {
        self.state.read().await.metadata.block_size
    }

    pub async fn num_blocks(&self) -> usize {
        self.state.read().await.blocks_present.len()
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.read().await;
        state.metadata.loaded && state.blocks_present.all()
    }

    pub async fn snapshot_bitfield(&self) -> Bitfield {
        self.state.read().await.blocks_present.clone()
    }

    pub async fn has_block(&self, idx: usize) -> bool {
        let state = self.state.read().await;
        state.blocks_present.get(idx).map(|b| *b).unwrap_or(false)
    }

    /// No-op if bit `i` is already set: last writer discarded, matching the
    /// endgame idempotence invariant.
    pub async fn record_block(&self, idx: usize, bytes: &[u8]) -> Result<(), TransferError> {
        let mut state = self.state.write().await;
        if state.blocks_present[idx] {
            return Ok(());
        }
        let block_size = state.metadata.block_size;
        drop(state);

        self.write_block(idx, block_size, bytes.to_vec()).await?;

        let mut state = self.state.write().await;
        state.blocks_present.set(idx, true);
        Ok(())
    }

    /// Takes the file handle out of its guard for the duration of the
    /// blocking write, same as [`Self::open_or_create_file`]; the guard
    /// itself stays held across the `spawn_blocking` await, serializing
    /// writes the way a plain `tokio::sync::Mutex<std::fs::File>` would.
    async fn write_block(&self, idx: usize, block_size: usize, bytes: Vec<u8>) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.take().expect("write_block called before metadata loaded");
        let offset = idx as u64 * block_size as u64;

        let (file, result) = tokio::task::spawn_blocking(move || {
            let mut file = file;
            let result = file.seek(SeekFrom::Start(offset)).and_then(|_| file.write_all(&bytes));
            (file, result)
        })
        .await
        .expect("write_block blocking task panicked");

        *guard = Some(file);
        result
    }

    /// Reads block `idx` back off disk for serving to a peer. Caller must
    /// already know `blocksPresent[idx]` is set. Synchronous: callers (the
    /// [`Seeder`](crate::Seeder)) run this inside `spawn_blocking`
    /// themselves, so the lock is taken with [`tokio::sync::Mutex::blocking_lock`]
    /// rather than the async `lock().await` — this function never runs on
    /// an async worker thread.
    pub fn read_block(&self, idx: usize, len: usize, offset: u64) -> std::io::Result<Vec<u8>> {
        let mut guard = self.file.blocking_lock();
        let file = guard.as_mut().expect("read_block called before metadata loaded");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub async fn block_len(&self, idx: usize) -> usize {
        let state = self.state.read().await;
        block_len(state.metadata.file_size, state.metadata.block_size, idx)
    }

    pub async fn block_offset(&self, idx: usize) -> u64 {
        let state = self.state.read().await;
        idx as u64 * state.metadata.block_size as u64
    }

    /// The decision point: one lock acquisition covering the read of
    /// `local`/`assigned` and, for the non-endgame branch, the write that
    /// marks `assigned[i]`, per spec §4.6's atomicity requirement.
    pub async fn select_block(&self, peer_bitfield: &Bitfield) -> Decision {
        let mut state = self.state.write().await;
        let State { blocks_present, blocks_assigned, .. } = &mut *state;
        select_block(blocks_present, peer_bitfield, blocks_assigned)
    }

    /// Frees a previously-assigned (non-endgame) block so another worker
    /// may pick it up, after an I/O failure or peer disconnect (spec §4.7.c).
    pub async fn clear_assigned(&self, idx: usize) {
        let mut state = self.state.write().await;
        if idx < state.blocks_assigned.len() {
            state.blocks_assigned.set(idx, false);
        }
    }

    pub async fn add_tracker(&self, tracker: TrackerEndpoint) {
        self.state.write().await.trackers.insert(tracker);
    }

    pub async fn trackers(&self) -> Vec<TrackerEndpoint> {
        self.state.read().await.trackers.iter().cloned().collect()
    }

    pub async fn add_seed(&self, peer: PeerEndpoint) -> bool {
        self.state.write().await.seeds.insert(peer)
    }

    pub async fn seeds(&self) -> Vec<PeerEndpoint> {
        self.state.read().await.seeds.iter().cloned().collect()
    }
}
