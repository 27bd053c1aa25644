mod client_core;
mod codec;
mod config;
mod conn;
mod downloader;
mod endpoint;
mod error;
mod registry;
mod scheduler;
mod seeder;
mod stats;
mod tracker_server;
mod transfer;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// Block size used when a newly-seeded file's layout is not otherwise
// specified by the caller. Existing swarms may use any block size; it
// travels with a file's metadata, not this constant.
pub const DEFAULT_BLOCK_SIZE: usize = 0x4000;

pub use client_core::{ClientCore, ClientError};
pub use config::Config;
pub use downloader::{Downloader, DownloaderError};
pub use endpoint::{PeerEndpoint, TrackerEndpoint};
pub use error::{ConnError, TrackerServerError, TransferError};
pub use registry::TrackerRegistry;
pub use scheduler::{select_block, Decision};
pub use seeder::Seeder;
pub use stats::ThroughputStats;
pub use tracker_server::TrackerServer;
pub use transfer::FileTransfer;
