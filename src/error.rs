//! Error taxonomy of the engine.
//!
//! Each kind maps to one protocol reaction: `FormatError` drops the datagram,
//! `EncodingError` is returned to the caller before anything is sent,
//! `SequencingError` aborts a block-wise transfer with 4.08,
//! `DeliveryFailure` ends an exchange whose retransmissions ran out and
//! `UnknownCriticalOption` answers with 4.02.
use std::io;

use thiserror::Error;

/// Malformed wire bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("message shorter than the 4 byte header")]
    TruncatedHeader,
    #[error("unsupported version {0}")]
    InvalidVersion(u8),
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    #[error("token truncated")]
    TruncatedToken,
    #[error("option truncated")]
    TruncatedOption,
    #[error("reserved option delta")]
    InvalidOptionDelta,
    #[error("reserved option length")]
    InvalidOptionLength,
    #[error("option number overflow")]
    OptionNumberOverflow,
    #[error("non-repeatable option {0} repeated")]
    RepeatedOption(u16),
    #[error("payload marker followed by an empty payload")]
    EmptyPayload,
    #[error("empty message carries bytes after the header")]
    MalformedEmptyMessage,
}

/// A message supplied by the caller cannot be put on the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingError {
    #[error("token of {0} bytes exceeds 8 bytes")]
    InvalidTokenLength(usize),
    #[error("unsupported version {0}")]
    InvalidVersion(u8),
    #[error("empty message must not carry a token, options or a payload")]
    NonEmptyEmptyMessage,
    #[error("option {number} value of {length} bytes is out of bounds")]
    InvalidOptionLength { number: u16, length: usize },
    #[error("non-repeatable option {0} has several values")]
    RepeatedOption(u16),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

/// A block-wise transfer received a block it cannot accept.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencingError {
    #[error("block {num} at offset {offset} does not follow the {expected} bytes received")]
    OutOfOrder {
        num: u32,
        offset: usize,
        expected: usize,
    },
    #[error("non-final block {num} carries {length} bytes instead of {size}")]
    WrongSize { num: u32, length: usize, size: usize },
    #[error("transfer body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("invalid block option value")]
    InvalidBlockValue,
}

/// The retransmission budget of a confirmable message is exhausted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message {message_id} not acknowledged after {retransmissions} retransmissions")]
pub struct DeliveryFailure {
    pub message_id: u16,
    pub retransmissions: u32,
}

/// A critical option the engine does not understand.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unrecognized critical option {0}")]
pub struct UnknownCriticalOption(pub u16);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("ACK_TIMEOUT must not be zero")]
    AckTimeout,
    #[error("ACK_RANDOM_FACTOR must be at least 1.0, got {0}")]
    AckRandomFactor(f64),
    #[error("NSTART must be at least 1")]
    Nstart,
    #[error("block size {0} is not a power of two between 16 and 1024")]
    BlockSize(usize),
    #[error("message size limit {0} is outside the supported range")]
    MaxMessageSize(usize),
    #[error("ACK_TIMEOUT of {0:?} exceeds the supported maximum")]
    AckTimeoutTooLarge(std::time::Duration),
    #[error("MAX_RETRANSMIT {0} exceeds the supported maximum")]
    MaxRetransmit(u32),
    #[error("lifetime or latency of {0:?} exceeds the supported maximum")]
    Lifetime(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Sequencing(#[from] SequencingError),
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),
    #[error(transparent)]
    UnknownCriticalOption(#[from] UnknownCriticalOption),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("every message ID towards the peer is in flight")]
    MessageIdsExhausted,
    #[error("message is not a request")]
    NotARequest,
    #[error("token already used by a pending request")]
    TokenInUse,
    #[error("no response before the request's lifetime ran out")]
    NoResponse,
    #[error("exchange reset by the peer")]
    Reset,
    #[error("exchange cancelled")]
    Cancelled,
    #[error("engine stopped")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match &err {
            Error::Io(e) => return io::Error::new(e.kind(), e.to_string()),
            Error::Delivery(_) | Error::NoResponse => io::ErrorKind::TimedOut,
            Error::Encoding(_) | Error::Config(_) => io::ErrorKind::InvalidInput,
            Error::Reset => io::ErrorKind::ConnectionReset,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Closed => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
