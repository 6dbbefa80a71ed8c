//! # BitTorrent Handshake Protocol
//!
//! The handshake is the first thing sent on a peer connection, in both
//! directions. It is a fixed 68-byte message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: 19 bytes - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros (extension negotiation, unused here)
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! The info hash keeps peers from joining the wrong swarm; the remote peer id
//! is only kept for diagnostics.

use crate::error::{Error, Result};

pub const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake on the wire: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// A BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 8 reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a handshake with all reserved bytes cleared.
    pub fn new(peer_id: [u8; 20], info_hash: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize into the 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }
}

/// Parse a received handshake.
///
/// Only the framing is checked (size and protocol string length); comparing
/// the info hash is left to the caller.
pub fn deserialize_handshake(buf: &[u8]) -> Result<Handshake> {
    if buf.len() != HANDSHAKE_LEN {
        return Err(Error::protocol(format!(
            "handshake of {} bytes, expected {}",
            buf.len(),
            HANDSHAKE_LEN
        )));
    }
    if buf[0] as usize != PROTOCOL_ID.len() {
        return Err(Error::protocol(format!(
            "handshake protocol length {}, expected {}",
            buf[0],
            PROTOCOL_ID.len()
        )));
    }

    let mut handshake = Handshake::new([0; 20], [0; 20]);
    handshake.reserved.copy_from_slice(&buf[20..28]);
    handshake.info_hash.copy_from_slice(&buf[28..48]);
    handshake.peer_id.copy_from_slice(&buf[48..68]);

    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_layout() {
        let handshake = Handshake::new([2; 20], [1; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[1; 20]);
        assert_eq!(&bytes[48..68], &[2; 20]);
    }

    #[test]
    fn deserializes_own_output() {
        let handshake = Handshake::new(*b"-LE0001-abcdefghijkl", [9; 20]);
        assert_eq!(deserialize_handshake(&handshake.serialize()).unwrap(), handshake);
    }

    #[test]
    fn rejects_bad_framing() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).serialize();
        assert!(deserialize_handshake(&bytes[..67]).is_err());
        bytes[0] = 18;
        assert!(matches!(
            deserialize_handshake(&bytes),
            Err(Error::Protocol(_))
        ));
    }
}
