use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::endpoint::PeerEndpoint;

/// Per-file set of currently-registered peers. Keys appear on first
/// registration and are never removed (spec §4.2) — memory grows
/// monotonically for the life of the tracker process.
///
/// The outer map is guarded independently of each filename's peer set, so
/// registrations against different files never contend with one another;
/// only concurrent registrations against the *same* filename share a lock.
#[derive(Debug, Default)]
pub struct TrackerRegistry {
    files: RwLock<HashMap<Vec<u8>, RwLock<HashSet<PeerEndpoint>>>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: registering the same peer twice leaves the set unchanged.
    pub async fn add_peer(&self, filename: &[u8], endpoint: PeerEndpoint) {
        // Fast path: filename already known, only need a read lock on the map.
        {
            let files = self.files.read().await;
            if let Some(peers) = files.get(filename) {
                peers.write().await.insert(endpoint);
                return;
            }
        }

        // Slow path: filename not yet present, take the map write lock.
        let mut files = self.files.write().await;
        let peers = files.entry(filename.to_vec()).or_insert_with(|| RwLock::new(HashSet::new()));
        peers.write().await.insert(endpoint);
    }

    /// Returns a stable snapshot; empty for unknown filenames.
    pub async fn peers_of(&self, filename: &[u8]) -> Vec<PeerEndpoint> {
        let files = self.files.read().await;
        match files.get(filename) {
            Some(peers) => peers.read().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }
}
