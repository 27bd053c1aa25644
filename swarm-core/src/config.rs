use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Tunables shared by the downloader, seeder and tracker client. Per-file
/// block size itself is not here — it travels with a file's metadata once
/// learned — but the default used when *creating* a new shared file is.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block size used for a freshly-seeded file that doesn't already have one.
    pub block_size: usize,

    /// Interval between unsolicited tracker refreshes.
    pub tracker_refresh_interval: Duration,

    /// Per-operation timeout for connects and request/response round trips.
    pub io_timeout: Duration,

    /// Address the seeder's data port listens on.
    pub listen_address: SocketAddr,

    // Kept for parity with a connection-management policy a future
    // Downloader could enforce; the scheduler itself does not consult this.
    pub min_max_peers: (u32, u32),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: crate::DEFAULT_BLOCK_SIZE,
            tracker_refresh_interval: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            min_max_peers: (5, 100),
        }
    }
}
