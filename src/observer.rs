//! Observe (RFC 7641): observer identity, sequence numbers and the freshness
//! rule used to drop reordered notifications.
use std::time::{Duration, Instant};

/// Observe option values are 24 bit.
pub const SEQUENCE_MODULO: u32 = 1 << 24;

const HALF_SEQUENCE_SPACE: u32 = 1 << 23;

/// After this long a notification is considered fresh regardless of its
/// sequence number.
pub const FRESHNESS_TIMEOUT: Duration = Duration::from_secs(128);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOption {
    Register,
    Deregister,
}

impl TryFrom<u32> for ObserveOption {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObserveOption::Register),
            1 => Ok(ObserveOption::Deregister),
            other => Err(other),
        }
    }
}

impl From<ObserveOption> for u32 {
    fn from(option: ObserveOption) -> u32 {
        match option {
            ObserveOption::Register => 0,
            ObserveOption::Deregister => 1,
        }
    }
}

/// A registered observer, identified by its endpoint and request token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observer<Endpoint> {
    pub peer: Endpoint,
    pub token: Vec<u8>,
}

/// Per-resource notification counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveSequence(u32);

impl ObserveSequence {
    pub fn new(start: u32) -> Self {
        ObserveSequence(start % SEQUENCE_MODULO)
    }

    pub fn current(&self) -> u32 {
        self.0
    }

    /// Advances the counter, wrapping at 2^24.
    pub fn advance(&mut self) -> u32 {
        self.0 = (self.0 + 1) % SEQUENCE_MODULO;
        self.0
    }
}

/// Whether notification `(v2, t2)` is newer than `(v1, t1)`.
pub fn is_fresh(v1: u32, t1: Instant, v2: u32, t2: Instant) -> bool {
    (v1 < v2 && v2 - v1 < HALF_SEQUENCE_SPACE)
        || (v1 > v2 && v1 - v2 > HALF_SEQUENCE_SPACE)
        || t2 > t1 + FRESHNESS_TIMEOUT
}

/// The newest notification a client has accepted for one observation.
#[derive(Debug, Clone, Default)]
pub struct Freshness {
    last: Option<(u32, Instant)>,
}

impl Freshness {
    /// Records `sequence` if it is newer than the last one accepted.
    pub fn accept(&mut self, sequence: u32, received: Instant) -> bool {
        let fresh = match self.last {
            Some((v1, t1)) => is_fresh(v1, t1, sequence, received),
            None => true,
        };
        if fresh {
            self.last = Some((sequence, received));
        }
        fresh
    }
}
