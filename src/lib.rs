//! # Leech
//!
//! A BitTorrent leecher for single-file torrents.
//!
//! ## Features
//!
//! - Bencode decoding and encoding over borrowed byte slices
//! - Torrent metadata parsing with the info hash taken over the raw bytes
//! - HTTP tracker announces with compact peer lists
//! - Peer wire protocol as an explicit connection state machine
//! - Concurrent piece download with bounded workers, per-piece SHA-1
//!   verification and cooperative cancellation
//!
//! ## Architecture
//!
//! - **Main thread**: loads the torrent, asks the tracker for peers,
//!   connects and submits one job per piece
//! - **Dispatcher thread**: hands jobs to at most `max_workers` worker threads
//! - **Worker threads**: each downloads one piece over one locked connection
//!
//! Logging goes through the `log` facade and stays silent until the binary
//! installs a logger.

#[macro_use]
extern crate log;

pub mod bencode;
pub mod client;
pub mod config;
pub mod downloader;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bencode::{decode, encode, Value};
pub use client::{ConnectionState, PeerConnection, Transport};
pub use config::Config;
pub use downloader::{download, download_with_progress, run_scheduler, DownloadReport};
pub use error::{Error, Result, SyntaxError};
pub use peer::Peer;
pub use piece::{verify_piece, DownloadJob, JobOutcome};
pub use torrent::{parse_metadata, Metadata};
pub use tracker::{announce, fetch_peer_list};
pub use worker::{cancellation, CancelHandle, Cancellation};
