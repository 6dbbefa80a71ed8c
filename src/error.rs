//! # Error Types
//!
//! Every fallible operation of the library returns [`Error`]. The variants
//! follow the failure classes of a download:
//!
//! - **Syntax**: malformed bencode, see [`SyntaxError`]
//! - **Metadata**: well-formed bencode that is not a usable torrent
//! - **Protocol**: the peer broke the wire protocol or an operation was
//!   attempted out of order; fatal to the connection step that saw it
//! - **Integrity**: a downloaded piece failed its SHA-1 check
//! - **Transport**: a socket dial/read/write failed
//! - **Validity**: bad input rejected before touching the network
//! - **Tracker**: the tracker answered with a failure
//! - **Cancelled**: the download was cancelled

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("invalid torrent: {0}")]
    Metadata(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("piece {index} failed verification: expected {expected}, got {actual}")]
    Integrity {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid input: {0}")]
    Validity(String),

    #[error("tracker failure: {0}")]
    Tracker(String),

    #[error("download cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

/// Malformed bencode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("malformed string length")]
    MalformedLength,

    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    Truncated { declared: usize, remaining: usize },

    #[error("invalid integer {0:?}")]
    InvalidInteger(String),

    #[error("unterminated integer")]
    UnterminatedInteger,

    #[error("unterminated list")]
    UnterminatedList,

    #[error("unterminated dictionary")]
    UnterminatedDict,

    #[error("dictionary key is not a string")]
    NonStringKey,

    #[error("dictionary key {0:?} has no value")]
    MissingValue(String),

    #[error("duplicate dictionary key {0:?}")]
    DuplicateKey(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("containers nested deeper than {0} levels")]
    TooDeep(usize),
}
