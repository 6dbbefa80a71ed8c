//! # BitTorrent Peer Connection
//!
//! This module implements the downloading side of the peer wire protocol
//! for one connection.
//!
//! ## Connection States
//!
//! ```text
//! Connected -> Handshaken -> BitfieldReceived -> Interested -> Unchoked
//!                                                                 |
//!                                        +--> Requesting <--------+
//!                                        |        |
//!                                        +--- Receiving
//!
//! any state -> Done (closed, or a transport error)
//! ```
//!
//! - **Handshake**: exchange the 68-byte handshake, checking the info hash
//! - **Initialization**: the peer sends BITFIELD, we send INTERESTED, the
//!   peer answers UNCHOKE
//! - **Piece download**: the piece is split into 16 KiB blocks and each
//!   block is requested and received before the next one is requested
//!
//! An operation attempted in the wrong state is a protocol error. Socket
//! errors close the connection for good; an unexpected message while
//! downloading only fails the piece being downloaded.
//!
//! Reads always fill the whole frame: TCP hands data over in arbitrary
//! chunks and a short read is never a complete message.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};

use byteorder::{BigEndian, ReadBytesExt};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake::*;
use crate::message::*;
use crate::peer::Peer;
use crate::torrent::Metadata;

/// Standard block size for piece downloads (16KB)
pub const BLOCK_SIZE_MAX: u32 = 16384;

/// Largest frame accepted from a peer: a full block plus headers, or a
/// bitfield for a very large torrent.
pub const MAX_MESSAGE_LEN: usize = 1 << 22;

/// Byte stream a peer connection runs over.
pub trait Transport: Read + Write + Send {
    /// Close both directions of the stream.
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Handshaken,
    BitfieldReceived,
    Interested,
    Unchoked,
    Requesting,
    Receiving,
    Done,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A connection to a remote peer.
pub struct PeerConnection<S = TcpStream> {
    /// Address of the remote peer
    peer: Peer,
    /// Underlying byte stream
    stream: S,
    /// Protocol state
    state: ConnectionState,
    /// 20-byte identifier of this client
    peer_id: [u8; 20],
    /// Identifier announced by the remote peer in its handshake
    remote_id: Option<[u8; 20]>,
    /// Pieces the peer announced, most significant bit first
    bitfield: Vec<u8>,
}

impl PeerConnection<TcpStream> {
    /// Dial `peer` over TCP.
    ///
    /// Reads and writes on the returned connection time out after
    /// `config.io_timeout`, so a silent peer cannot stall a download.
    pub fn connect(peer: Peer, config: &Config) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&peer.socket_addr(), config.connect_timeout)
            .map_err(|e| Error::transport(format!("could not connect to peer {}", peer), e))?;

        stream
            .set_read_timeout(Some(config.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(config.io_timeout)))
            .map_err(|e| Error::transport("could not set connection timeout", e))?;

        info!("Connected to peer {} ({})", peer.id, peer);

        Ok(PeerConnection::new(peer, stream, config.peer_id))
    }
}

impl<S: Transport> PeerConnection<S> {
    /// Wrap an already established stream.
    pub fn new(peer: Peer, stream: S, peer_id: [u8; 20]) -> Self {
        PeerConnection {
            peer,
            stream,
            state: ConnectionState::Connected,
            peer_id,
            remote_id: None,
            bitfield: vec![],
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the BITFIELD/INTERESTED/UNCHOKE sequence has completed.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Unchoked | ConnectionState::Requesting | ConnectionState::Receiving
        )
    }

    /// Peer id received in the handshake.
    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_id.as_ref()
    }

    /// Checks the peer's bitfield for piece `index`.
    ///
    /// ```text
    /// Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]   (MSB first)
    /// ```
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;
        self.bitfield
            .get(byte_index)
            .is_some_and(|byte| byte >> (7 - offset) & 1 != 0)
    }

    /// Exchange handshakes and return the remote peer id.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the connection is not fresh, the reply is
    ///   badly framed or it names another torrent
    /// - [`Error::Transport`] if the socket fails
    pub fn handshake(&mut self, metadata: &Metadata) -> Result<[u8; 20]> {
        self.require(&[ConnectionState::Connected], "handshake")?;

        let handshake = Handshake::new(self.peer_id, metadata.info_hash);
        self.write_all(&handshake.serialize(), "handshake")?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut buf, "handshake")?;
        let reply = deserialize_handshake(&buf)?;

        if reply.info_hash != metadata.info_hash {
            return Err(Error::protocol(format!(
                "peer {} answered for info hash {}, expected {}",
                self.peer,
                hex::encode(reply.info_hash),
                metadata.info_hash_hex()
            )));
        }

        debug!(
            "Handshake with peer {} done, remote id {}",
            self.peer.id,
            hex::encode(reply.peer_id)
        );

        self.remote_id = Some(reply.peer_id);
        self.state = ConnectionState::Handshaken;

        Ok(reply.peer_id)
    }

    /// Read one message.
    ///
    /// Returns `None` for a keep-alive (a frame of length 0).
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        self.require_open("read message")?;

        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf, "message length")?;
        let message_len = Cursor::new(len_buf)
            .read_u32::<BigEndian>()
            .map_err(|e| Error::transport("could not read message length", e))?
            as usize;

        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {}", self.peer.id);
            return Ok(None);
        }
        if message_len > MAX_MESSAGE_LEN {
            return Err(Error::protocol(format!(
                "peer {} announced a {} byte message",
                self.peer, message_len
            )));
        }

        let mut message_buf = vec![0u8; message_len];
        self.read_exact(&mut message_buf, "message")?;

        let message = deserialize_message(&message_buf)?;
        debug!(
            "Receive {} ({} bytes) from peer {}",
            message_name(message.id),
            message.payload.len(),
            self.peer.id
        );

        Ok(Some(message))
    }

    /// Send one message.
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        self.require_open("send message")?;
        debug!("Send {} to peer {}", message_name(message.id), self.peer.id);
        self.write_all(&message.serialize(), message_name(message.id))
    }

    /// Run BITFIELD -> INTERESTED -> UNCHOKE. Does nothing if the
    /// connection is already initialized.
    pub fn initialize(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.require(&[ConnectionState::Handshaken], "initialize")?;

        let bitfield = self.expect_message(MESSAGE_BITFIELD)?;
        self.bitfield = bitfield.payload;
        self.state = ConnectionState::BitfieldReceived;

        // Length prefix 1 covers the id alone, so the frame is five bytes.
        // A prefix of 5 would announce four payload bytes that never come.
        self.send_message(&Message::new(MESSAGE_INTERESTED))?;
        self.state = ConnectionState::Interested;

        self.expect_message(MESSAGE_UNCHOKE)?;
        self.state = ConnectionState::Unchoked;

        info!("Peer {} unchoked us", self.peer.id);

        Ok(())
    }

    /// Download piece `index`, block by block.
    ///
    /// The returned bytes are not verified; see [`crate::piece::verify_piece`].
    ///
    /// # Errors
    ///
    /// - [`Error::Validity`] for an index outside the torrent
    /// - [`Error::Protocol`] for a message other than PIECE or a block of the
    ///   wrong size; the connection stays usable
    /// - [`Error::Transport`] if the socket fails; the connection is closed
    pub fn download_unit(&mut self, metadata: &Metadata, index: u32) -> Result<Vec<u8>> {
        let length = metadata.piece_len(index)?;

        if self.state == ConnectionState::Handshaken {
            self.initialize()?;
        }
        self.require(&[ConnectionState::Unchoked], "download piece")?;

        let result = self.request_blocks(index, length);
        if self.state != ConnectionState::Done {
            self.state = ConnectionState::Unchoked;
        }

        let data = result?;
        info!(
            "Downloaded piece {} ({} bytes) from peer {}",
            index, length, self.peer.id
        );

        Ok(data)
    }

    fn request_blocks(&mut self, index: u32, length: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length as usize);

        for begin in (0..length).step_by(BLOCK_SIZE_MAX as usize) {
            let block_size = BLOCK_SIZE_MAX.min(length - begin);

            self.state = ConnectionState::Requesting;
            self.send_message(&Message::request(index, begin, block_size))?;

            self.state = ConnectionState::Receiving;
            let message = self.expect_message(MESSAGE_PIECE)?;
            let block = message.parse_piece()?;

            if block.index != index || block.begin != begin {
                debug!(
                    "Peer {} echoed piece {} [{}] for request {} [{}]",
                    self.peer.id, block.index, block.begin, index, begin
                );
            }
            if block.data.len() != block_size as usize {
                return Err(Error::protocol(format!(
                    "peer {} sent {} bytes for piece {} [{}:{}], expected {}",
                    self.peer,
                    block.data.len(),
                    index,
                    begin,
                    begin + block_size,
                    block_size
                )));
            }

            data.extend_from_slice(block.data);
        }

        Ok(data)
    }

    /// Shut the connection down. Later calls do nothing.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Done {
            return;
        }
        self.state = ConnectionState::Done;
        if let Err(e) = self.stream.shutdown() {
            warn!("Error shutting down connection to peer {}: {}", self.peer, e);
        }
        debug!("Closed connection to peer {}", self.peer.id);
    }

    /// Read the next message and require it to be `id`.
    fn expect_message(&mut self, id: MessageId) -> Result<Message> {
        match self.read_message()? {
            Some(message) if message.id == id => Ok(message),
            Some(message) => Err(Error::protocol(format!(
                "expected {} from peer {}, got {} (id {})",
                message_name(id),
                self.peer,
                message_name(message.id),
                message.id
            ))),
            None => Err(Error::protocol(format!(
                "expected {} from peer {}, got keep-alive",
                message_name(id),
                self.peer
            ))),
        }
    }

    fn require(&self, allowed: &[ConnectionState], operation: &str) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::protocol(format!(
                "cannot {} with peer {} in state {}",
                operation, self.peer, self.state
            )));
        }
        Ok(())
    }

    fn require_open(&self, operation: &str) -> Result<()> {
        if self.state == ConnectionState::Done {
            return Err(Error::protocol(format!(
                "cannot {} on closed connection to peer {}",
                operation, self.peer
            )));
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        if let Err(e) = self.stream.read_exact(buf) {
            self.state = ConnectionState::Done;
            return Err(Error::transport(
                format!("could not read {} from peer {}", what, self.peer),
                e,
            ));
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8], what: &str) -> Result<()> {
        if let Err(e) = self.stream.write_all(buf).and_then(|_| self.stream.flush()) {
            self.state = ConnectionState::Done;
            return Err(Error::transport(
                format!("could not send {} to peer {}", what, self.peer),
                e,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_metadata, MockPeer, PeerBehavior};
    use crate::piece::verify_piece;

    fn connection(peer: MockPeer) -> PeerConnection<MockPeer> {
        PeerConnection::new(Peer::new(0, std::net::Ipv4Addr::LOCALHOST, 6881), peer, [1; 20])
    }

    #[test]
    fn handshake_exposes_remote_id() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mut conn = connection(MockPeer::new(7, &metadata, data));
        let remote = conn.handshake(&metadata).unwrap();
        assert_eq!(remote, [7; 20]);
        assert_eq!(conn.remote_peer_id(), Some(&[7; 20]));
        assert_eq!(conn.state(), ConnectionState::Handshaken);
    }

    #[test]
    fn handshake_survives_partial_reads() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data.clone()).with_read_chunk(3);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        let piece = conn.download_unit(&metadata, 1).unwrap();
        assert_eq!(piece, data[16384..32768]);
    }

    #[test]
    fn handshake_rejects_other_torrent() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::WrongInfoHash);
        let mut conn = connection(mock);
        assert!(matches!(conn.handshake(&metadata), Err(Error::Protocol(_))));
    }

    #[test]
    fn short_handshake_is_a_transport_error() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::ShortHandshake);
        let mut conn = connection(mock);
        let err = conn.handshake(&metadata).unwrap_err();
        assert!(err.is_connection_fatal());
        assert_eq!(conn.state(), ConnectionState::Done);
    }

    #[test]
    fn handshake_twice_is_rejected() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mut conn = connection(MockPeer::new(1, &metadata, data));
        conn.handshake(&metadata).unwrap();
        assert!(matches!(conn.handshake(&metadata), Err(Error::Protocol(_))));
    }

    #[test]
    fn download_before_handshake_is_rejected() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mut conn = connection(MockPeer::new(1, &metadata, data));
        assert!(matches!(
            conn.download_unit(&metadata, 0),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(conn.initialize(), Err(Error::Protocol(_))));
    }

    #[test]
    fn initialization_sequence() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data);
        let log = mock.log();
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        conn.initialize().unwrap();
        assert!(conn.is_initialized());
        assert!(conn.has_piece(0) && conn.has_piece(2));
        assert!(!conn.has_piece(3));
        // A second call is a no-op.
        conn.initialize().unwrap();
        assert_eq!(log.interested_count(), 1);
    }

    #[test]
    fn interested_goes_out_as_a_five_byte_frame() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data);
        let log = mock.log();
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        conn.initialize().unwrap();
        assert_eq!(log.frames_for(1), vec![vec![0, 0, 0, 1, MESSAGE_INTERESTED]]);
    }

    #[test]
    fn missing_bitfield_is_a_protocol_error() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::NoBitfield);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        let err = conn.initialize().unwrap_err();
        assert!(err.to_string().contains("expected bitfield"));
    }

    #[test]
    fn choke_instead_of_unchoke_is_a_protocol_error() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::StayChoked);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        let err = conn.initialize().unwrap_err();
        assert!(err.to_string().contains("expected unchoke"));
        assert!(!conn.is_initialized());
    }

    #[test]
    fn keep_alive_is_surfaced_as_none() {
        let (metadata, data) = sample_metadata(40000, 16384);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::KeepAliveFirst);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        assert_eq!(conn.read_message().unwrap(), None);
        let bitfield = conn.read_message().unwrap().unwrap();
        assert_eq!(bitfield.id, MESSAGE_BITFIELD);
    }

    #[test]
    fn downloads_every_piece_in_blocks() {
        let (metadata, data) = sample_metadata(40000, 20000);
        let mock = MockPeer::new(1, &metadata, data.clone());
        let log = mock.log();
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();

        let first = conn.download_unit(&metadata, 0).unwrap();
        let second = conn.download_unit(&metadata, 1).unwrap();
        assert_eq!(first, data[..20000]);
        assert_eq!(second, data[20000..]);
        verify_piece(0, &first, &metadata.piece_hashes[0]).unwrap();

        // 20000 = 16384 + 3616 for each piece.
        let requests = log.requests_for(1);
        assert_eq!(
            requests,
            vec![(0, 0, 16384), (0, 16384, 3616), (1, 0, 16384), (1, 16384, 3616)]
        );
        assert!(!log.saw_pipelining());
        assert_eq!(conn.state(), ConnectionState::Unchoked);
    }

    #[test]
    fn short_last_piece() {
        let (metadata, data) = sample_metadata(1000000, 262144);
        let mock = MockPeer::new(1, &metadata, data.clone());
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();
        let last = conn.download_unit(&metadata, 3).unwrap();
        assert_eq!(last.len(), 1000000 - 3 * 262144);
        assert_eq!(last, data[3 * 262144..]);
    }

    #[test]
    fn out_of_range_piece_is_a_validity_error() {
        let (metadata, data) = sample_metadata(40000, 20000);
        let mut conn = connection(MockPeer::new(1, &metadata, data));
        conn.handshake(&metadata).unwrap();
        assert!(matches!(
            conn.download_unit(&metadata, 2),
            Err(Error::Validity(_))
        ));
    }

    #[test]
    fn unexpected_message_fails_only_the_piece() {
        let (metadata, data) = sample_metadata(40000, 20000);
        let mock = MockPeer::new(1, &metadata, data.clone())
            .with_behavior(PeerBehavior::HaveInsteadOfFirstPiece);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();

        let err = conn.download_unit(&metadata, 0).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("got have"));
        assert_eq!(conn.state(), ConnectionState::Unchoked);

        assert_eq!(conn.download_unit(&metadata, 1).unwrap(), data[20000..]);
    }

    #[test]
    fn transport_failure_closes_the_connection() {
        let (metadata, data) = sample_metadata(40000, 20000);
        let mock = MockPeer::new(1, &metadata, data).with_behavior(PeerBehavior::HangUpOnRequest);
        let mut conn = connection(mock);
        conn.handshake(&metadata).unwrap();

        assert!(conn.download_unit(&metadata, 0).unwrap_err().is_connection_fatal());
        assert_eq!(conn.state(), ConnectionState::Done);
        assert!(matches!(
            conn.download_unit(&metadata, 1),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (metadata, data) = sample_metadata(40000, 20000);
        let mock = MockPeer::new(1, &metadata, data);
        let log = mock.log();
        let mut conn = connection(mock);
        conn.close();
        conn.close();
        assert_eq!(log.shutdowns(), 1);
        assert!(matches!(conn.read_message(), Err(Error::Protocol(_))));
    }
}
