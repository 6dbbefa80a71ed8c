//! # BitTorrent Peer Information
//!
//! Trackers answer with a compact peer list: one 6-byte entry per peer.
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

const PEER_SIZE: usize = 6;

type PeerId = u32;

/// A peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Ordinal assigned locally, used in log lines
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: Ipv4Addr, port: u16) -> Peer {
        Peer { id, ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Peer {
    type Err = Error;

    /// Parse `a.b.c.d:port`.
    fn from_str(s: &str) -> Result<Peer> {
        let addr: SocketAddrV4 = s
            .parse()
            .map_err(|_| Error::Validity(format!("invalid peer address '{}'", s)))?;
        Ok(Peer::new(0, *addr.ip(), addr.port()))
    }
}

/// Parse a compact peer list.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the list length is not a multiple of 6.
pub fn parse_compact_peers(compact: &[u8]) -> Result<Vec<Peer>> {
    if compact.len() % PEER_SIZE != 0 {
        return Err(Error::protocol(format!(
            "compact peer list of {} bytes is not a multiple of {}",
            compact.len(),
            PEER_SIZE
        )));
    }

    compact
        .chunks_exact(PEER_SIZE)
        .enumerate()
        .map(|(i, entry)| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = Cursor::new(&entry[4..6])
                .read_u16::<BigEndian>()
                .map_err(|e| Error::transport("could not read peer port", e))?;
            Ok(Peer::new(i as PeerId, ip, port))
        })
        .collect()
}
