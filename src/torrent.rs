//! # Torrent Metadata
//!
//! A single-file torrent is a bencoded dictionary:
//!
//! - **announce**: tracker URL used for peer discovery
//! - **info**: dictionary describing the content
//!   - **length**: total file size in bytes
//!   - **name**: suggested filename
//!   - **piece length**: nominal size of each piece
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//!
//! The SHA-1 of the bencoded `info` dictionary (the info hash) identifies the
//! torrent to trackers and peers.
//!
//! ## Piece sizing
//!
//! Every piece is `piece length` bytes except the last, which holds the
//! remainder of the file. For `length = 1000000` and `piece length = 262144`
//! there are 4 pieces and the last one is `1000000 - 3 * 262144` bytes.

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::{Error, Result};

// Size of SHA-1 hash in bytes
pub const SHA1_HASH_SIZE: usize = 20;

/// Immutable view of a torrent file, shared by every download job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Tracker URL
    pub announce: String,
    /// Suggested filename
    pub name: String,
    /// Total size of the file in bytes
    pub length: u64,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// One SHA-1 hash per piece
    pub piece_hashes: Vec<[u8; SHA1_HASH_SIZE]>,
    /// SHA-1 hash of the bencoded info dictionary
    pub info_hash: [u8; SHA1_HASH_SIZE],
}

/// Build metadata from an already decoded torrent.
///
/// Without the raw file bytes the info hash is computed over the canonical
/// re-encoding of the `info` dictionary. Prefer [`Metadata::from_bytes`]
/// when the file is at hand.
pub fn parse_metadata(value: &Value) -> Result<Metadata> {
    let info = value
        .get("info")
        .ok_or_else(|| missing("info"))?;
    if info.as_dict().is_none() {
        return Err(Error::Metadata("info is not a dictionary".into()));
    }
    let info_hash = sha1_digest(&info.encode());
    Metadata::from_parts(value, info, info_hash)
}

impl Metadata {
    /// Parse a torrent file, hashing the info dictionary exactly as it
    /// appears in `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Metadata> {
        let value = bencode::decode_exact(bytes)?;
        let (entries, _) = bencode::dict_entries_raw(bytes)?;
        let raw_info = entries
            .iter()
            .find(|(key, _)| *key == b"info")
            .map(|(_, raw)| *raw)
            .ok_or_else(|| missing("info"))?;

        let info = value.get("info").ok_or_else(|| missing("info"))?;
        if info.as_dict().is_none() {
            return Err(Error::Metadata("info is not a dictionary".into()));
        }

        Metadata::from_parts(&value, info, sha1_digest(raw_info))
    }

    fn from_parts(root: &Value, info: &Value, info_hash: [u8; SHA1_HASH_SIZE]) -> Result<Metadata> {
        let announce = root
            .get("announce")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("announce"))?
            .to_string();
        let name = info
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("name"))?
            .to_string();

        let length = info
            .get("length")
            .and_then(Value::as_integer)
            .ok_or_else(|| missing("length"))?;
        let length = u64::try_from(length)
            .map_err(|_| Error::Metadata(format!("negative length {}", length)))?;

        let piece_length = info
            .get("piece length")
            .and_then(Value::as_integer)
            .ok_or_else(|| missing("piece length"))?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::Metadata(format!("invalid piece length {}", piece_length)))?;

        let pieces = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| missing("pieces"))?;
        let piece_hashes = split_piece_hashes(pieces)?;

        let expected = length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected {
            return Err(Error::Metadata(format!(
                "{} piece hashes for {} pieces",
                piece_hashes.len(),
                expected
            )));
        }

        Ok(Metadata {
            announce,
            name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Real length of piece `index`; the last piece may be short.
    pub fn piece_len(&self, index: u32) -> Result<u32> {
        let begin = self.piece_offset(index)?;
        let end = (begin + self.piece_length as u64).min(self.length);
        Ok((end - begin) as u32)
    }

    /// Byte offset of piece `index` in the file.
    pub fn piece_offset(&self, index: u32) -> Result<u64> {
        self.check_index(index)?;
        Ok(index as u64 * self.piece_length as u64)
    }

    pub fn piece_hash(&self, index: u32) -> Result<&[u8; SHA1_HASH_SIZE]> {
        self.check_index(index)?;
        Ok(&self.piece_hashes[index as usize])
    }

    /// Canonical single-file info dictionary rebuilt from the parsed fields.
    pub fn encode_info(&self) -> Vec<u8> {
        let pieces: Vec<u8> = self.piece_hashes.concat();
        bencode::encode_info(self.length, &self.name, self.piece_length, &pieces)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.piece_hashes.len() {
            return Err(Error::Validity(format!(
                "piece index {} out of range (torrent has {} pieces)",
                index,
                self.piece_hashes.len()
            )));
        }
        Ok(())
    }
}

/// Split concatenated piece hashes into 20-byte arrays.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; SHA1_HASH_SIZE]>> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(Error::Metadata(format!(
            "pieces length {} is not a multiple of {}",
            pieces.len(),
            SHA1_HASH_SIZE
        )));
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

pub(crate) fn sha1_digest(data: &[u8]) -> [u8; SHA1_HASH_SIZE] {
    Sha1::digest(data).into()
}

fn missing(field: &str) -> Error {
    Error::Metadata(format!("missing or invalid field '{}'", field))
}
