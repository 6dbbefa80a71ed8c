//! # Concurrent Download
//!
//! Downloads every piece of a torrent over a set of handshaken peer
//! connections.
//!
//! ## Architecture
//!
//! - **Jobs**: one [`DownloadJob`] per piece, fed to a [`Dispatcher`]
//! - **Assignment**: piece `i` goes to connection `i % connections`; when it
//!   fails there it moves on to the next connection, up to
//!   `Config::max_attempts` connections
//! - **Connections**: each one sits behind its own `Mutex`, so a connection
//!   serves one piece at a time and its request/response pairs never
//!   interleave
//! - **Output**: verified pieces are copied into a shared [`OutputBuffer`]
//!
//! A piece is verified, then written, then marked completed. A piece that
//! fails verification is never written.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use indicatif::ProgressBar;

use crate::client::{ConnectionState, PeerConnection, Transport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::piece::{verify_piece, DownloadJob, OutputBuffer};
use crate::torrent::Metadata;
use crate::worker::{Cancellation, Dispatcher, Work};

/// Result of a whole-torrent download.
#[derive(Debug)]
pub struct DownloadReport {
    /// File content; pieces that did not complete are left zeroed
    pub data: Vec<u8>,
    pub completed: usize,
    pub failed: usize,
    /// Pieces that never ran because the download was cancelled
    pub abandoned: usize,
}

impl DownloadReport {
    /// Whether every piece was downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.abandoned == 0
    }
}

type SharedConnection<S> = Arc<Mutex<PeerConnection<S>>>;

/// Downloads pieces for the dispatcher.
pub struct Downloader<S = TcpStream> {
    metadata: Arc<Metadata>,
    connections: Vec<SharedConnection<S>>,
    output: Arc<OutputBuffer>,
    progress: ProgressBar,
    max_attempts: usize,
}

impl<S: Transport + 'static> Downloader<S> {
    /// `output` must hold `metadata.length` bytes.
    pub fn new(
        metadata: Arc<Metadata>,
        connections: Vec<PeerConnection<S>>,
        output: OutputBuffer,
        max_attempts: usize,
    ) -> Downloader<S> {
        Downloader {
            metadata,
            connections: connections
                .into_iter()
                .map(|conn| Arc::new(Mutex::new(conn)))
                .collect(),
            output: Arc::new(output),
            progress: ProgressBar::hidden(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Report downloaded bytes to `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Downloader<S> {
        self.progress = progress;
        self
    }

    /// Close every connection. Connections already closed are left alone.
    pub fn close_connections(&self) {
        for conn in &self.connections {
            lock(conn).close();
        }
    }

    fn run_job(&self, job: &DownloadJob) -> Result<()> {
        let count = self.connections.len();
        let mut last_error = Error::Validity("no connection to download from".into());

        for attempt in 0..self.max_attempts {
            let slot = (job.index as usize + attempt) % count;
            match self.attempt(slot, job) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Piece {} failed on connection {} (attempt {}/{}): {}",
                        job.index,
                        slot,
                        attempt + 1,
                        self.max_attempts,
                        e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn attempt(&self, slot: usize, job: &DownloadJob) -> Result<()> {
        let data = {
            let mut conn = lock(&self.connections[slot]);

            if conn.state() == ConnectionState::Handshaken {
                if let Err(e) = conn.initialize() {
                    conn.close();
                    return Err(e);
                }
            }
            if conn.is_initialized() && !conn.has_piece(job.index) {
                return Err(Error::protocol(format!(
                    "peer {} does not have piece {}",
                    conn.peer(),
                    job.index
                )));
            }

            conn.download_unit(&self.metadata, job.index)?
        };

        verify_piece(job.index, &data, &job.hash)?;
        let offset = self.metadata.piece_offset(job.index)?;
        self.output.write_at(offset, &data)?;

        Ok(())
    }
}

impl<S: Transport + 'static> Work for Downloader<S> {
    type Job = Arc<DownloadJob>;

    fn work(&self, job: Arc<DownloadJob>) {
        match self.run_job(&job) {
            Ok(()) => {
                job.complete();
                self.progress.inc(job.length as u64);
                debug!("Piece {} completed", job.index);
            }
            Err(e) => {
                error!("Could not download piece {}: {}", job.index, e);
                job.fail(e.to_string());
            }
        }
    }
}

fn lock<S>(conn: &SharedConnection<S>) -> MutexGuard<'_, PeerConnection<S>> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

/// Download `jobs` over `connections` and return the assembled file.
///
/// The connections must be handshaken. Every connection is closed before
/// returning. Job outcomes are left on the jobs themselves.
///
/// # Errors
///
/// [`Error::Validity`] for an empty connection list, zero workers or a file
/// too large to hold in memory, before any network traffic.
pub fn run_scheduler<S: Transport + 'static>(
    metadata: &Metadata,
    jobs: &[Arc<DownloadJob>],
    mut connections: Vec<PeerConnection<S>>,
    max_workers: usize,
    cancel: Cancellation,
    config: &Config,
) -> Result<Vec<u8>> {
    let output = match OutputBuffer::new(metadata.length) {
        Ok(output) => output,
        Err(e) => {
            connections.iter_mut().for_each(PeerConnection::close);
            return Err(e);
        }
    };
    let downloader = Downloader::new(
        Arc::new(metadata.clone()),
        connections,
        output,
        config.max_attempts,
    );
    schedule(downloader, jobs, max_workers, cancel, config.queue_capacity)
}

fn schedule<S: Transport + 'static>(
    downloader: Downloader<S>,
    jobs: &[Arc<DownloadJob>],
    max_workers: usize,
    cancel: Cancellation,
    queue_capacity: usize,
) -> Result<Vec<u8>> {
    if downloader.connections.is_empty() {
        return Err(Error::Validity("no peer connections to download from".into()));
    }
    if max_workers == 0 {
        downloader.close_connections();
        return Err(Error::Validity("max workers must be at least 1".into()));
    }

    let downloader = Arc::new(downloader);
    let mut dispatcher = Dispatcher::new(Arc::clone(&downloader), max_workers, queue_capacity)?;
    dispatcher.start(cancel)?;

    info!(
        "Downloading {} pieces from {} peers with {} workers",
        jobs.len(),
        downloader.connections.len(),
        max_workers
    );

    for job in jobs {
        if let Err(e) = dispatcher.submit(Arc::clone(job)) {
            info!("Stopped submitting pieces at piece {}: {}", job.index, e);
            break;
        }
    }

    dispatcher.wait();
    downloader.close_connections();

    Ok(downloader.output.take())
}

/// Connect to and handshake every peer at once, keeping the ones that answer.
pub fn connect_peers(
    metadata: &Metadata,
    peers: &[Peer],
    config: &Config,
) -> Vec<PeerConnection<TcpStream>> {
    thread::scope(|scope| {
        let handles: Vec<_> = peers
            .iter()
            .map(|&peer| {
                scope.spawn(move || -> Result<PeerConnection<TcpStream>> {
                    let mut conn = PeerConnection::connect(peer, config)?;
                    conn.handshake(metadata)?;
                    Ok(conn)
                })
            })
            .collect();

        handles
            .into_iter()
            .zip(peers)
            .filter_map(|(handle, peer)| match handle.join() {
                Ok(Ok(conn)) => Some(conn),
                Ok(Err(e)) => {
                    warn!("Skipping peer {}: {}", peer, e);
                    None
                }
                Err(_) => {
                    error!("Connection thread for peer {} panicked", peer);
                    None
                }
            })
            .collect()
    })
}

/// Download the whole torrent from `peers`.
pub fn download(
    metadata: &Metadata,
    peers: &[Peer],
    config: &Config,
    cancel: Cancellation,
) -> Result<DownloadReport> {
    download_with_progress(metadata, peers, config, cancel, ProgressBar::hidden())
}

/// [`download`], reporting downloaded bytes to `progress`.
pub fn download_with_progress(
    metadata: &Metadata,
    peers: &[Peer],
    config: &Config,
    cancel: Cancellation,
    progress: ProgressBar,
) -> Result<DownloadReport> {
    // Everything the torrent file alone can rule out is checked before
    // connecting.
    let output = OutputBuffer::new(metadata.length)?;
    let jobs: Vec<Arc<DownloadJob>> = DownloadJob::for_metadata(metadata)?
        .into_iter()
        .map(Arc::new)
        .collect();

    let connections = connect_peers(metadata, peers, config);
    if connections.is_empty() {
        return Err(Error::Validity(format!(
            "none of the {} peers could be reached",
            peers.len()
        )));
    }
    info!("Connected to {}/{} peers", connections.len(), peers.len());

    let max_workers = config.workers_for(connections.len());
    let downloader = Downloader::new(
        Arc::new(metadata.clone()),
        connections,
        output,
        config.max_attempts,
    )
    .with_progress(progress);
    let data = schedule(downloader, &jobs, max_workers, cancel, config.queue_capacity)?;

    Ok(tally(data, &jobs))
}

fn tally(data: Vec<u8>, jobs: &[Arc<DownloadJob>]) -> DownloadReport {
    let completed = jobs.iter().filter(|job| job.is_completed()).count();
    let failed = jobs.iter().filter(|job| job.is_failed()).count();
    DownloadReport {
        data,
        completed,
        failed,
        abandoned: jobs.len() - completed - failed,
    }
}
