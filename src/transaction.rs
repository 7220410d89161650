//! Bookkeeping for confirmable exchanges and received message IDs.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::TransmissionParameters;
use crate::error::{DeliveryFailure, Error};

pub type ExchangeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Sent, with the number of retransmissions so far.
    Sent(u32),
    Completed,
    Failed,
}

/// A confirmable message awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct Exchange<Endpoint> {
    pub id: ExchangeId,
    pub peer: Endpoint,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub state: ExchangeState,
    bytes: Vec<u8>,
    retransmissions: u32,
    timeout: Duration,
    deadline: Instant,
}

impl<Endpoint> Exchange<Endpoint> {
    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Result of a retransmission timer firing.
#[derive(Debug)]
pub enum Expired<Endpoint> {
    Retransmit {
        id: ExchangeId,
        peer: Endpoint,
        bytes: Vec<u8>,
    },
    Failed {
        exchange: Exchange<Endpoint>,
        error: DeliveryFailure,
    },
}

/// Whether a received message ID has been seen within its lifetime.
#[derive(Debug, PartialEq, Eq)]
pub enum Duplicate {
    New,
    /// Seen before; carries the reply sent the first time, if any.
    Replay(Option<Vec<u8>>),
}

#[derive(Debug)]
struct Received {
    expires: Instant,
    reply: Option<Vec<u8>>,
}

pub struct TransactionTracker<Endpoint> {
    params: TransmissionParameters,
    rng: StdRng,
    next_message_id: u16,
    next_exchange_id: ExchangeId,
    exchanges: HashMap<ExchangeId, Exchange<Endpoint>>,
    in_flight: HashMap<(Endpoint, u16), ExchangeId>,
    schedule: BinaryHeap<Reverse<(Instant, ExchangeId)>>,
    received: HashMap<(Endpoint, u16), Received>,
    received_order: VecDeque<(Instant, (Endpoint, u16))>,
}

impl<Endpoint: Clone + Eq + Hash> TransactionTracker<Endpoint> {
    pub fn new(params: TransmissionParameters, mut rng: StdRng) -> Self {
        let next_message_id = rng.gen();
        Self {
            params,
            rng,
            next_message_id,
            next_exchange_id: 0,
            exchanges: HashMap::new(),
            in_flight: HashMap::new(),
            schedule: BinaryHeap::new(),
            received: HashMap::new(),
            received_order: VecDeque::new(),
        }
    }

    pub fn params(&self) -> &TransmissionParameters {
        &self.params
    }

    /// Allocates a message ID not in flight towards `peer`.
    pub fn next_message_id(&mut self, peer: &Endpoint) -> Result<u16, Error> {
        for _ in 0..=u16::MAX as u32 {
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            if !self.in_flight.contains_key(&(peer.clone(), message_id)) {
                return Ok(message_id);
            }
        }
        Err(Error::MessageIdsExhausted)
    }

    /// Starts tracking a confirmable message that was just sent.
    pub fn start(
        &mut self,
        now: Instant,
        peer: Endpoint,
        message_id: u16,
        token: Vec<u8>,
        bytes: Vec<u8>,
    ) -> ExchangeId {
        let id = self.next_exchange_id;
        self.next_exchange_id += 1;
        let timeout = self.initial_timeout();
        let deadline = now + timeout;
        self.in_flight.insert((peer.clone(), message_id), id);
        self.schedule.push(Reverse((deadline, id)));
        self.exchanges.insert(
            id,
            Exchange {
                id,
                peer,
                message_id,
                token,
                state: ExchangeState::Sent(0),
                bytes,
                retransmissions: 0,
                timeout,
                deadline,
            },
        );
        trace!("exchange {} (mid {}) timeout {:?}", id, message_id, timeout);
        id
    }

    /// `ACK_TIMEOUT` scaled by a factor drawn from `[1, ACK_RANDOM_FACTOR)`.
    fn initial_timeout(&mut self) -> Duration {
        let factor = self.params.ack_random_factor;
        let jitter = if factor > 1.0 {
            self.rng.gen_range(1.0..factor)
        } else {
            1.0
        };
        self.params.ack_timeout.mul_f64(jitter)
    }

    /// Completes the exchange acknowledged (or reset) by `peer`.
    pub fn complete(&mut self, peer: &Endpoint, message_id: u16) -> Option<Exchange<Endpoint>> {
        let id = self.in_flight.remove(&(peer.clone(), message_id))?;
        let mut exchange = self.exchanges.remove(&id)?;
        exchange.state = ExchangeState::Completed;
        debug!("exchange {} (mid {}) completed", id, message_id);
        Some(exchange)
    }

    /// Stops retransmitting; the stale schedule entry is skipped later.
    pub fn cancel(&mut self, id: ExchangeId) -> Option<Exchange<Endpoint>> {
        let exchange = self.exchanges.remove(&id)?;
        self.in_flight
            .remove(&(exchange.peer.clone(), exchange.message_id));
        debug!("exchange {} (mid {}) cancelled", id, exchange.message_id);
        Some(exchange)
    }

    pub fn get(&self, id: ExchangeId) -> Option<&Exchange<Endpoint>> {
        self.exchanges.get(&id)
    }

    pub fn contains(&self, id: ExchangeId) -> bool {
        self.exchanges.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// The earliest pending retransmission deadline.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.schedule.peek().copied() {
            if self.is_live(deadline, id) {
                return Some(deadline);
            }
            self.schedule.pop();
        }
        None
    }

    fn is_live(&self, deadline: Instant, id: ExchangeId) -> bool {
        self.exchanges
            .get(&id)
            .map_or(false, |e| e.deadline == deadline)
    }

    /// Fires every deadline at or before `now`.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Expired<Endpoint>> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.schedule.peek().copied() {
            if deadline > now {
                break;
            }
            self.schedule.pop();
            if !self.is_live(deadline, id) {
                continue;
            }
            let max_retransmit = self.params.max_retransmit;
            let Some(exchange) = self.exchanges.get_mut(&id) else {
                continue;
            };
            if exchange.retransmissions < max_retransmit {
                exchange.retransmissions += 1;
                exchange.timeout *= 2;
                exchange.deadline = deadline + exchange.timeout;
                exchange.state = ExchangeState::Sent(exchange.retransmissions);
                self.schedule.push(Reverse((exchange.deadline, id)));
                debug!(
                    "retransmitting mid {} ({}/{})",
                    exchange.message_id, exchange.retransmissions, max_retransmit
                );
                expired.push(Expired::Retransmit {
                    id,
                    peer: exchange.peer.clone(),
                    bytes: exchange.bytes.clone(),
                });
            } else if let Some(mut exchange) = self.exchanges.remove(&id) {
                self.in_flight
                    .remove(&(exchange.peer.clone(), exchange.message_id));
                exchange.state = ExchangeState::Failed;
                let error = DeliveryFailure {
                    message_id: exchange.message_id,
                    retransmissions: exchange.retransmissions,
                };
                expired.push(Expired::Failed { exchange, error });
            }
        }
        expired
    }

    /// Looks a received message ID up in the deduplication cache, recording
    /// it when new.
    pub fn check_duplicate(
        &mut self,
        now: Instant,
        peer: &Endpoint,
        message_id: u16,
        confirmable: bool,
    ) -> Duplicate {
        self.purge_received(now);
        let key = (peer.clone(), message_id);
        if let Some(entry) = self.received.get(&key) {
            if entry.expires > now {
                return Duplicate::Replay(entry.reply.clone());
            }
        }
        let lifetime = if confirmable {
            self.params.exchange_lifetime()
        } else {
            self.params.non_lifetime()
        };
        let expires = now + lifetime;
        self.received.insert(
            key.clone(),
            Received {
                expires,
                reply: None,
            },
        );
        self.received_order.push_back((expires, key));
        Duplicate::New
    }

    /// Remembers the reply to a received message for later replay.
    pub fn set_reply(&mut self, peer: &Endpoint, message_id: u16, reply: Vec<u8>) {
        if let Some(entry) = self.received.get_mut(&(peer.clone(), message_id)) {
            entry.reply = Some(reply);
        }
    }

    fn purge_received(&mut self, now: Instant) {
        while let Some((expires, _)) = self.received_order.front() {
            if *expires > now {
                break;
            }
            if let Some((expires, key)) = self.received_order.pop_front() {
                if self.received.get(&key).map_or(false, |e| e.expires == expires) {
                    self.received.remove(&key);
                }
            }
        }
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }
}
