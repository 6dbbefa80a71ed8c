//! Scripted in-memory peer for unit tests.
//!
//! A [`MockPeer`] stands in for the TCP stream of a [`crate::client::PeerConnection`]:
//! bytes written to it are parsed as handshake and messages, and its replies
//! are queued for the next reads. Every peer records what it received in an
//! [`EventLog`], which can be shared between peers to observe ordering across
//! connections.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bencode;
use crate::client::Transport;
use crate::handshake::{deserialize_handshake, Handshake, HANDSHAKE_LEN};
use crate::message::*;
use crate::torrent::{sha1_digest, Metadata};

/// Torrent metadata over deterministic content, plus that content.
pub fn sample_metadata(length: u64, piece_length: u32) -> (Metadata, Vec<u8>) {
    let data: Vec<u8> = (0..length).map(|i| (i * 31 % 251) as u8).collect();
    let piece_hashes: Vec<[u8; 20]> = data
        .chunks(piece_length as usize)
        .map(sha1_digest)
        .collect();
    let pieces = piece_hashes.concat();
    let info_hash = sha1_digest(&bencode::encode_info(length, "sample.bin", piece_length, &pieces));

    let metadata = Metadata {
        announce: "http://tracker.example/announce".into(),
        name: "sample.bin".into(),
        length,
        piece_length,
        piece_hashes,
        info_hash,
    };
    (metadata, data)
}

/// How a [`MockPeer`] deviates from an honest seeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    Honest,
    WrongInfoHash,
    ShortHandshake,
    NoBitfield,
    KeepAliveFirst,
    StayChoked,
    HaveInsteadOfFirstPiece,
    HangUpOnRequest,
    /// Flips the first byte of every block it serves
    Corrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Handshake,
    Interested,
    Request { index: u32, begin: u32, length: u32 },
    Shutdown,
}

#[derive(Default)]
struct LogInner {
    events: Vec<(u8, Event)>,
    frames: Vec<(u8, Vec<u8>)>,
    pipelined: bool,
}

/// What a set of mock peers received, in arrival order.
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
}

impl EventLog {
    fn record(&self, peer: u8, event: Event) {
        self.inner.lock().unwrap().events.push((peer, event));
    }

    pub fn events(&self) -> Vec<(u8, Event)> {
        self.inner.lock().unwrap().events.clone()
    }

    /// `(index, begin, length)` of every request received by `peer`.
    pub fn requests_for(&self, peer: u8) -> Vec<(u32, u32, u32)> {
        self.events()
            .into_iter()
            .filter_map(|(id, event)| match event {
                Event::Request {
                    index,
                    begin,
                    length,
                } if id == peer => Some((index, begin, length)),
                _ => None,
            })
            .collect()
    }

    /// Raw bytes of every message frame `peer` received, length prefix
    /// included.
    pub fn frames_for(&self, peer: u8) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .frames
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn interested_count(&self) -> usize {
        self.count(|event| *event == Event::Interested)
    }

    pub fn shutdowns(&self) -> usize {
        self.count(|event| *event == Event::Shutdown)
    }

    /// Whether any peer got a request before its previous reply was read.
    pub fn saw_pipelining(&self) -> bool {
        self.inner.lock().unwrap().pipelined
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|(_, event)| pred(event)).count()
    }
}

/// Scripted seeder holding the full content of one torrent.
pub struct MockPeer {
    id: u8,
    info_hash: [u8; 20],
    piece_length: u64,
    piece_count: usize,
    data: Vec<u8>,
    behavior: PeerBehavior,
    read_chunk: usize,
    request_delay: Duration,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    handshaken: bool,
    sent_have: bool,
    closed: bool,
    log: EventLog,
}

impl MockPeer {
    /// Honest seeder with peer id `[id; 20]`.
    pub fn new(id: u8, metadata: &Metadata, data: Vec<u8>) -> MockPeer {
        MockPeer {
            id,
            info_hash: metadata.info_hash,
            piece_length: metadata.piece_length as u64,
            piece_count: metadata.piece_count(),
            data,
            behavior: PeerBehavior::Honest,
            read_chunk: usize::MAX,
            request_delay: Duration::ZERO,
            inbox: vec![],
            outbox: VecDeque::new(),
            handshaken: false,
            sent_have: false,
            closed: false,
            log: EventLog::default(),
        }
    }

    pub fn with_behavior(mut self, behavior: PeerBehavior) -> MockPeer {
        self.behavior = behavior;
        self
    }

    /// Hand out at most `chunk` bytes per read.
    pub fn with_read_chunk(mut self, chunk: usize) -> MockPeer {
        self.read_chunk = chunk;
        self
    }

    /// Stall for `delay` before answering each request.
    pub fn with_request_delay(mut self, delay: Duration) -> MockPeer {
        self.request_delay = delay;
        self
    }

    pub fn with_log(mut self, log: EventLog) -> MockPeer {
        self.log = log;
        self
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    fn push(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    fn push_message(&mut self, message: Message) {
        self.push(&message.serialize());
    }

    fn bitfield(&self) -> Vec<u8> {
        let mut bitfield = vec![0u8; self.piece_count.div_ceil(8)];
        for index in 0..self.piece_count {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
        bitfield
    }

    fn process(&mut self) -> io::Result<()> {
        loop {
            if !self.handshaken {
                if self.inbox.len() < HANDSHAKE_LEN {
                    return Ok(());
                }
                let frame: Vec<u8> = self.inbox.drain(..HANDSHAKE_LEN).collect();
                deserialize_handshake(&frame).map_err(invalid_data)?;
                self.handshaken = true;
                self.log.record(self.id, Event::Handshake);
                self.answer_handshake();
                continue;
            }

            if self.inbox.len() < 4 {
                return Ok(());
            }
            let len = u32::from_be_bytes([self.inbox[0], self.inbox[1], self.inbox[2], self.inbox[3]])
                as usize;
            if self.inbox.len() < 4 + len {
                return Ok(());
            }
            let frame: Vec<u8> = self.inbox.drain(..4 + len).collect();
            self.log.inner.lock().unwrap().frames.push((self.id, frame.clone()));
            if len == 0 {
                continue;
            }
            let message = deserialize_message(&frame[4..]).map_err(invalid_data)?;
            self.answer(message)?;
        }
    }

    fn answer_handshake(&mut self) {
        let mut info_hash = self.info_hash;
        if self.behavior == PeerBehavior::WrongInfoHash {
            info_hash[0] ^= 0xff;
        }
        let reply = Handshake::new([self.id; 20], info_hash).serialize();

        match self.behavior {
            PeerBehavior::ShortHandshake => {
                self.push(&reply[..40]);
                self.closed = true;
            }
            PeerBehavior::NoBitfield => {
                self.push(&reply);
                self.push_message(Message::new(MESSAGE_UNCHOKE));
            }
            PeerBehavior::KeepAliveFirst => {
                self.push(&reply);
                self.push(&[0, 0, 0, 0]);
                let bitfield = self.bitfield();
                self.push_message(Message::new_with_payload(MESSAGE_BITFIELD, bitfield));
            }
            _ => {
                self.push(&reply);
                let bitfield = self.bitfield();
                self.push_message(Message::new_with_payload(MESSAGE_BITFIELD, bitfield));
            }
        }
    }

    fn answer(&mut self, message: Message) -> io::Result<()> {
        match message.id {
            MESSAGE_INTERESTED => {
                self.log.record(self.id, Event::Interested);
                match self.behavior {
                    PeerBehavior::StayChoked => self.push_message(Message::new(MESSAGE_CHOKE)),
                    PeerBehavior::NoBitfield => {}
                    _ => self.push_message(Message::new(MESSAGE_UNCHOKE)),
                }
            }
            MESSAGE_REQUEST => {
                let (index, begin, length) = message.parse_request().map_err(invalid_data)?;
                if !self.outbox.is_empty() {
                    self.log.inner.lock().unwrap().pipelined = true;
                }
                self.log.record(
                    self.id,
                    Event::Request {
                        index,
                        begin,
                        length,
                    },
                );
                if !self.request_delay.is_zero() {
                    thread::sleep(self.request_delay);
                }

                match self.behavior {
                    PeerBehavior::HangUpOnRequest => {
                        self.closed = true;
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "peer hung up",
                        ));
                    }
                    PeerBehavior::HaveInsteadOfFirstPiece if !self.sent_have => {
                        self.sent_have = true;
                        self.push_message(Message::new_with_payload(
                            MESSAGE_HAVE,
                            index.to_be_bytes().to_vec(),
                        ));
                        return Ok(());
                    }
                    _ => {}
                }

                let start = (index as u64 * self.piece_length + begin as u64) as usize;
                let end = (start + length as usize).min(self.data.len());
                let mut block = self.data[start.min(end)..end].to_vec();
                if self.behavior == PeerBehavior::Corrupt {
                    if let Some(byte) = block.first_mut() {
                        *byte ^= 0xff;
                    }
                }
                self.push_message(Message::piece(index, begin, &block));
            }
            _ => {}
        }
        Ok(())
    }
}

fn invalid_data(e: crate::error::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl Read for MockPeer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.read_chunk).min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPeer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        self.inbox.extend_from_slice(buf);
        self.process()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockPeer {
    fn shutdown(&mut self) -> io::Result<()> {
        self.log.record(self.id, Event::Shutdown);
        self.closed = true;
        Ok(())
    }
}
