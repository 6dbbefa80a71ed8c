//! # Client Configuration
//!
//! Tunables shared by the tracker client, peer connections and the download
//! scheduler. [`Config::default`] gives values suitable for public swarms;
//! the command line overrides some of them.

use std::time::Duration;

use rand::Rng;

// Default port for BitTorrent client connections
pub const PORT: u16 = 6881;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port reported to the tracker
    pub port: u16,
    /// 20-byte identifier of this client, random per run
    pub peer_id: [u8; 20],
    /// Upper bound on pieces downloaded at once (defaults to one per connected peer)
    pub max_workers: Option<usize>,
    /// Capacity of the job queue before submitters block
    pub queue_capacity: usize,
    /// Time allowed to establish a TCP connection
    pub connect_timeout: Duration,
    /// Time allowed for any single socket read or write
    pub io_timeout: Duration,
    /// Time allowed for the tracker HTTP request
    pub tracker_timeout: Duration,
    /// Number of connections a piece is tried on before it is marked failed
    pub max_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: PORT,
            peer_id: generate_peer_id(),
            max_workers: None,
            queue_capacity: 16,
            connect_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(15),
            max_attempts: 2,
        }
    }
}

impl Config {
    /// Workers to run for `connections` usable peer connections.
    pub fn workers_for(&self, connections: usize) -> usize {
        self.max_workers.unwrap_or(connections).max(1)
    }
}

/// Generate a random 20-byte peer id.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}
