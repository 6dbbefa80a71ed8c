//! # BitTorrent Peer Wire Messages
//!
//! Every message after the handshake is framed the same way:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | - |
//! | 1 | UNCHOKE | - |
//! | 2 | INTERESTED | - |
//! | 3 | NOT INTERESTED | - |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//!
//! A frame with length 0 is a keep-alive and carries no ID.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

pub type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// Human-readable message name for log lines and errors.
pub fn message_name(id: MessageId) -> &'static str {
    match id {
        MESSAGE_CHOKE => "choke",
        MESSAGE_UNCHOKE => "unchoke",
        MESSAGE_INTERESTED => "interested",
        MESSAGE_NOT_INTERESTED => "not interested",
        MESSAGE_HAVE => "have",
        MESSAGE_BITFIELD => "bitfield",
        MESSAGE_REQUEST => "request",
        MESSAGE_PIECE => "piece",
        MESSAGE_CANCEL => "cancel",
        _ => "unknown",
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

/// Block carried by a PIECE message.
#[derive(Debug, PartialEq, Eq)]
pub struct Block<'a> {
    pub index: u32,
    pub begin: u32,
    pub data: &'a [u8],
}

impl Message {
    /// Build a message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// REQUEST for `length` bytes at `begin` within piece `index`.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        for field in [index, begin, length] {
            payload.extend_from_slice(&field.to_be_bytes());
        }
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// PIECE carrying `data` at `begin` within piece `index`.
    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        Message::new_with_payload(MESSAGE_PIECE, payload)
    }

    /// Serialize message.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(5 + self.payload.len());
        serialized.extend_from_slice(&(1 + self.payload.len() as u32).to_be_bytes());
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);
        serialized
    }

    /// Fields of a REQUEST payload: `(index, begin, length)`.
    pub fn parse_request(&self) -> Result<(u32, u32, u32)> {
        if self.id != MESSAGE_REQUEST || self.payload.len() != 12 {
            return Err(Error::protocol(format!(
                "malformed request ({}, {} byte payload)",
                message_name(self.id),
                self.payload.len()
            )));
        }
        let mut cursor = Cursor::new(self.payload.as_slice());
        let index = read_u32(&mut cursor)?;
        let begin = read_u32(&mut cursor)?;
        let length = read_u32(&mut cursor)?;
        Ok((index, begin, length))
    }

    /// View the payload of a PIECE message.
    pub fn parse_piece(&self) -> Result<Block<'_>> {
        if self.id != MESSAGE_PIECE || self.payload.len() < 8 {
            return Err(Error::protocol(format!(
                "malformed piece ({}, {} byte payload)",
                message_name(self.id),
                self.payload.len()
            )));
        }
        let mut cursor = Cursor::new(&self.payload[..8]);
        let index = read_u32(&mut cursor)?;
        let begin = read_u32(&mut cursor)?;
        Ok(Block {
            index,
            begin,
            data: &self.payload[8..],
        })
    }
}

/// Deserialize the body of a frame (everything after the length prefix).
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    let (&id, payload) = message_buf
        .split_first()
        .ok_or_else(|| Error::protocol("empty message body"))?;
    Ok(Message::new_with_payload(id, payload.to_vec()))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::transport("could not read message field", e))
}
