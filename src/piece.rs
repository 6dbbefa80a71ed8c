//! # Piece Jobs and Output
//!
//! Pieces are the verification units of the torrent data, typically
//! 256KB-1MB in size. Each piece becomes one [`DownloadJob`]; a worker
//! downloads it, checks it against the SHA-1 hash from the metadata and
//! copies it into the shared [`OutputBuffer`].
//!
//! ## Job outcome
//!
//! A job starts without an outcome and receives exactly one, `Completed` or
//! `Failed`. A job that was never run (cancelled before it was dequeued)
//! keeps no outcome.

use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::torrent::{sha1_digest, Metadata, SHA1_HASH_SIZE};

/// Final state of a download job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// One piece to download.
#[derive(Debug)]
pub struct DownloadJob {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// SHA-1 hash of the piece for verification
    pub hash: [u8; SHA1_HASH_SIZE],
    /// Total length of the piece in bytes
    pub length: u32,
    outcome: OnceLock<JobOutcome>,
}

impl DownloadJob {
    pub fn new(index: u32, hash: [u8; SHA1_HASH_SIZE], length: u32) -> DownloadJob {
        DownloadJob {
            index,
            hash,
            length,
            outcome: OnceLock::new(),
        }
    }

    /// One job per piece of `metadata`, in index order.
    pub fn for_metadata(metadata: &Metadata) -> Result<Vec<DownloadJob>> {
        (0..metadata.piece_count() as u32)
            .map(|index| {
                Ok(DownloadJob::new(
                    index,
                    *metadata.piece_hash(index)?,
                    metadata.piece_len(index)?,
                ))
            })
            .collect()
    }

    /// Mark the job completed. Ignored if an outcome is already set.
    pub fn complete(&self) {
        self.settle(JobOutcome::Completed);
    }

    /// Mark the job failed. Ignored if an outcome is already set.
    pub fn fail(&self, reason: impl Into<String>) {
        self.settle(JobOutcome::Failed(reason.into()));
    }

    fn settle(&self, outcome: JobOutcome) {
        if let Err(rejected) = self.outcome.set(outcome) {
            warn!(
                "Piece {} already has outcome {:?}, ignoring {:?}",
                self.index,
                self.outcome.get(),
                rejected
            );
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome.get(), Some(JobOutcome::Completed))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome.get(), Some(JobOutcome::Failed(_)))
    }

    /// Outcome of the job, `None` while pending or if it never ran.
    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.get()
    }
}

/// Verify the integrity of a downloaded piece.
///
/// # Arguments
///
/// * `index` - Piece index, for the error message.
/// * `data` - Assembled piece data.
/// * `expected` - SHA-1 hash from the torrent metadata.
///
pub fn verify_piece(index: u32, data: &[u8], expected: &[u8; SHA1_HASH_SIZE]) -> Result<()> {
    let expected = hex::encode(expected);
    let actual = hex::encode(sha1_digest(data));

    if actual != expected {
        return Err(Error::Integrity {
            index,
            expected,
            actual,
        });
    }

    debug!("Successfully verified integrity of piece {}", index);

    Ok(())
}

/// Output file assembled in memory.
///
/// Workers write disjoint ranges; the lock is only held for the copy.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Mutex<Vec<u8>>,
}

impl OutputBuffer {
    /// Zero-filled buffer of `len` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Validity`] when `len` does not fit in memory. The length
    /// comes from the torrent file, so it is checked rather than trusted.
    pub fn new(len: u64) -> Result<OutputBuffer> {
        let too_large = |reason: String| {
            Error::Validity(format!("cannot hold {} bytes in memory: {}", len, reason))
        };

        let size = usize::try_from(len).map_err(|e| too_large(e.to_string()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| too_large(e.to_string()))?;
        data.resize(size, 0);

        Ok(OutputBuffer {
            data: Mutex::new(data),
        })
    }

    /// Copy `bytes` to `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());

        let start = usize::try_from(offset)
            .map_err(|_| Error::Validity(format!("offset {} out of range", offset)))?;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::Validity(format!(
                    "write of {} bytes at {} overflows buffer of {} bytes",
                    bytes.len(),
                    offset,
                    data.len()
                ))
            })?;

        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the assembled bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
