//! The protocol engine: a sans-IO state machine joining the codec, the
//! transaction tracker, block-wise transfers and the resource router.
//!
//! The engine never touches a socket or a clock. Datagrams and the current
//! time go in through [`Engine::handle_datagram`] and
//! [`Engine::handle_timeout`]; datagrams to send and application events come
//! out of [`Engine::poll_transmit`] and [`Engine::poll_event`]. A runtime
//! drives it by sleeping until [`Engine::poll_timeout`].
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::BlockValue;
use crate::block_transfer::{Block1Progress, BlockManager, TransferKey};
use crate::config::Config;
use crate::error::{Error, SequencingError};
use crate::message::header::{MessageClass, MessageType, Method, Status};
use crate::message::option::{encode_uint, CoapOption};
use crate::message::packet::Packet;
use crate::observer::{Freshness, ObserveOption, Observer};
use crate::router::request::Request;
use crate::router::response::{IntoResponse, Outcome, Response};
use crate::router::Router;
use crate::transaction::{Duplicate, ExchangeId, Expired, TransactionTracker};

/// Identifies a request started with [`Engine::send_request`] for its whole
/// life, across retransmissions and blocks.
pub type RequestId = u64;

const TOKEN_LENGTH: usize = 4;

/// A datagram the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit<Endpoint> {
    pub peer: Endpoint,
    pub bytes: Vec<u8>,
}

/// A request whose handler chose to answer later.
///
/// Pass it back to [`Engine::respond`] with the response.
#[derive(Debug, Clone)]
pub struct Deferred<Endpoint> {
    peer: Endpoint,
    token: Vec<u8>,
    confirmable: bool,
    method: Method,
    path: String,
    block2: Option<BlockValue>,
}

impl<Endpoint> Deferred<Endpoint> {
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

#[derive(Debug)]
pub enum Event<Endpoint> {
    /// The final response to a request, reassembled if it came in blocks.
    Response {
        request: RequestId,
        peer: Endpoint,
        response: Packet,
    },
    /// A response carrying Observe for a registered observation.
    Notification {
        request: RequestId,
        peer: Endpoint,
        notification: Packet,
    },
    /// The request ended without a response.
    Failed {
        request: RequestId,
        peer: Endpoint,
        error: Error,
    },
    /// A handler deferred its answer.
    Deferred {
        handle: Deferred<Endpoint>,
        request: Packet,
    },
}

#[derive(Debug, Clone)]
enum ExchangeKind<Endpoint> {
    Request(RequestId),
    SeparateResponse,
    Notification(Observer<Endpoint>, String),
}

#[derive(Debug)]
enum Purpose {
    Application,
    /// Fetches the remaining blocks of a notification for `observation`.
    NotificationFetch { observation: RequestId, first: Packet },
}

/// Client-side state of one request.
#[derive(Debug)]
struct Outgoing<Endpoint> {
    peer: Endpoint,
    token: Vec<u8>,
    template: Packet,
    confirmable: bool,
    observe: bool,
    upload: Option<BlockValue>,
    block2: Option<BlockValue>,
    download: Vec<u8>,
    message_id: Option<u16>,
    exchange: Option<ExchangeId>,
    /// Gives up on the response at this point. Unset while a confirmable
    /// message is being retransmitted and once notifications flow.
    deadline: Option<Instant>,
    freshness: Freshness,
    purpose: Purpose,
}

impl<Endpoint> Outgoing<Endpoint> {
    /// The next message to put on the wire for this request.
    fn message(&self) -> Packet {
        let mut packet = self.template.clone();
        packet.header.set_type(if self.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        packet.set_token(self.token.clone());

        if let Some(block) = self.upload {
            let body = &self.template.payload;
            let (block, chunk) = block.slice(body).unwrap_or((block, &body[..0]));
            packet.payload = chunk.to_vec();
            packet.set_option(CoapOption::Block1, block.to_option());
            if block.num == 0 {
                packet.set_option(CoapOption::Size1, encode_uint(body.len() as u32));
            }
        }
        if let Some(block) = self.block2 {
            packet.payload.clear();
            packet.clear_option(CoapOption::Block1);
            packet.clear_option(CoapOption::Size1);
            packet.clear_option(CoapOption::Observe);
            packet.set_option(CoapOption::Block2, block.to_option());
        }
        packet
    }
}

/// A notification sent within the last EXCHANGE_LIFETIME, kept so a Reset
/// naming its message ID still cancels the observation after it has been
/// superseded.
#[derive(Debug)]
struct SentNotification<Endpoint> {
    observer: Observer<Endpoint>,
    path: String,
    message_id: u16,
    expires: Instant,
}

pub struct Engine<Endpoint> {
    config: Config,
    router: Router<Endpoint>,
    tracker: TransactionTracker<Endpoint>,
    blocks: BlockManager<Endpoint>,
    rng: StdRng,
    exchanges: HashMap<ExchangeId, ExchangeKind<Endpoint>>,
    requests: HashMap<RequestId, Outgoing<Endpoint>>,
    tokens: HashMap<(Endpoint, Vec<u8>), RequestId>,
    queued: VecDeque<RequestId>,
    deadlines: BinaryHeap<Reverse<(Instant, RequestId)>>,
    notification_exchanges: HashMap<Observer<Endpoint>, ExchangeId>,
    sent_notifications: VecDeque<SentNotification<Endpoint>>,
    next_request_id: RequestId,
    transmits: VecDeque<Transmit<Endpoint>>,
    events: VecDeque<Event<Endpoint>>,
}

impl<Endpoint> Engine<Endpoint>
where
    Endpoint: Clone + Eq + Hash + Debug + 'static,
{
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_router(config, Router::new())
    }

    pub fn with_router(config: Config, router: Router<Endpoint>) -> Result<Self, Error> {
        Self::with_rng(config, router, StdRng::from_entropy())
    }

    /// Builds an engine drawing tokens, message IDs and jitter from `rng`.
    pub fn with_rng(config: Config, router: Router<Endpoint>, mut rng: StdRng) -> Result<Self, Error> {
        config.validate()?;
        let tracker = TransactionTracker::new(
            config.transmission.clone(),
            StdRng::seed_from_u64(rng.gen()),
        );
        let blocks = BlockManager::new(
            config.block_size,
            config.max_body_size,
            config.transmission.exchange_lifetime(),
        );
        Ok(Self {
            config,
            router,
            tracker,
            blocks,
            rng,
            exchanges: HashMap::new(),
            requests: HashMap::new(),
            tokens: HashMap::new(),
            queued: VecDeque::new(),
            deadlines: BinaryHeap::new(),
            notification_exchanges: HashMap::new(),
            sent_notifications: VecDeque::new(),
            next_request_id: 0,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router<Endpoint> {
        &self.router
    }

    /// Requests that have not yet completed, queued ones included.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Confirmable messages awaiting an acknowledgement.
    pub fn exchanges_in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Live block-wise upload and download contexts.
    pub fn block_contexts(&self) -> usize {
        self.blocks.len()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit<Endpoint>> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event<Endpoint>> {
        self.events.pop_front()
    }

    /// When [`Engine::handle_timeout`] should next be called.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, request))) = self.deadlines.peek().copied() {
            if self.deadline_of(request) == Some(at) {
                break;
            }
            self.deadlines.pop();
        }
        let deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
        match (self.tracker.poll_timeout(), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Retransmits or fails confirmable messages whose timer ran out, and
    /// fails requests that waited too long for their response.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.blocks.expire(now);
        self.expire_notifications(now);
        while let Some(Reverse((at, request))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if self.deadline_of(request) == Some(at) {
                warn!("request {}: {}", request, Error::NoResponse);
                self.fail(request, Error::NoResponse);
            }
        }
        for expired in self.tracker.handle_timeout(now) {
            match expired {
                Expired::Retransmit { peer, bytes, .. } => self.queue(peer, bytes),
                Expired::Failed { exchange, error } => match self.exchanges.remove(&exchange.id) {
                    Some(ExchangeKind::Request(request)) => {
                        warn!("request {} to {:?}: {}", request, exchange.peer, error);
                        if let Some(outgoing) = self.requests.get_mut(&request) {
                            outgoing.exchange = None;
                        }
                        self.fail(request, error.into());
                    }
                    Some(ExchangeKind::Notification(observer, path)) => {
                        warn!("notification of /{} to {:?}: {}", path, observer.peer, error);
                        self.drop_observer(&observer, &path);
                    }
                    Some(ExchangeKind::SeparateResponse) | None => {
                        warn!("response to {:?}: {}", exchange.peer, error);
                    }
                },
            }
        }
        self.release_queued(now);
    }

    /// Feeds one received datagram into the engine.
    ///
    /// Undecodable datagrams are dropped without a reply.
    pub fn handle_datagram(&mut self, now: Instant, peer: Endpoint, datagram: &[u8]) {
        trace!("received {} bytes from {:?}", datagram.len(), peer);
        self.blocks.expire(now);
        self.expire_notifications(now);
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", peer, e);
                return;
            }
        };
        trace!("{:?} -> {}", peer, packet);
        match packet.header.get_type() {
            MessageType::Acknowledgement => self.handle_ack(now, peer, packet),
            MessageType::Reset => self.handle_reset(now, peer, packet),
            MessageType::Confirmable | MessageType::NonConfirmable => {
                self.handle_message(now, peer, packet)
            }
        }
    }

    /// Starts a request and returns its id.
    ///
    /// An empty token is replaced by a random one. Bodies larger than the
    /// configured block size are uploaded with Block1. Confirmable requests
    /// beyond NSTART outstanding ones to the same peer wait in a queue.
    pub fn send_request(
        &mut self,
        now: Instant,
        peer: Endpoint,
        mut request: Packet,
    ) -> Result<RequestId, Error> {
        if !request.header.code.is_request() {
            return Err(Error::NotARequest);
        }
        let confirmable = match request.header.get_type() {
            MessageType::Confirmable => true,
            MessageType::NonConfirmable => false,
            _ => return Err(Error::NotARequest),
        };
        let token = if request.get_token().is_empty() {
            self.fresh_token(&peer)
        } else if self.tokens.contains_key(&(peer.clone(), request.get_token().to_vec())) {
            return Err(Error::TokenInUse);
        } else {
            request.get_token().to_vec()
        };
        request.set_token(token.clone());

        let upload = if request.payload.len() > self.config.block_size {
            Some(BlockValue::new(0, true, self.config.block_size)?)
        } else {
            None
        };
        let outgoing = Outgoing {
            peer: peer.clone(),
            token: token.clone(),
            observe: request.get_observe_value() == Some(ObserveOption::Register.into()),
            template: request,
            confirmable,
            upload,
            block2: None,
            download: Vec::new(),
            message_id: None,
            exchange: None,
            deadline: None,
            freshness: Freshness::default(),
            purpose: Purpose::Application,
        };
        outgoing
            .message()
            .to_bytes_with_limit(self.config.max_message_size)?;

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.insert(id, outgoing);
        self.tokens.insert((peer.clone(), token), id);

        if confirmable && self.outstanding(&peer) >= self.config.transmission.nstart {
            debug!("request {} to {:?} queued behind NSTART", id, peer);
            self.queued.push_back(id);
        } else if let Err(e) = self.try_transmit(now, id) {
            self.remove_request(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Abandons a request. Cancelling an observation also tells the server
    /// with a GET carrying Observe = 1.
    pub fn cancel(&mut self, now: Instant, request: RequestId) -> bool {
        let Some(outgoing) = self.remove_request(request) else {
            return false;
        };
        debug!("request {} to {:?} cancelled", request, outgoing.peer);
        if outgoing.observe {
            let mut packet = outgoing.template;
            packet.header.set_type(MessageType::NonConfirmable);
            packet.set_token(outgoing.token);
            packet.set_observe_value(ObserveOption::Deregister.into());
            packet.payload.clear();
            match self.tracker.next_message_id(&outgoing.peer) {
                Ok(message_id) => {
                    packet.header.message_id = message_id;
                    self.encode_and_queue(outgoing.peer, &packet);
                }
                Err(e) => warn!("cannot deregister from {:?}: {}", outgoing.peer, e),
            }
        }
        self.release_queued(now);
        true
    }

    /// Sends the answer to a deferred request as a separate response.
    pub fn respond(
        &mut self,
        now: Instant,
        handle: Deferred<Endpoint>,
        response: impl IntoResponse,
    ) -> Result<(), Error> {
        let mut packet = Packet::new();
        response.into_response().fill_response(&mut packet);
        let key = TransferKey {
            peer: handle.peer.clone(),
            method: handle.method,
            path: handle.path,
        };
        let mut packet = self.fragment(now, key, packet, handle.block2);
        packet.set_token(handle.token.clone());
        packet.header.message_id = self.tracker.next_message_id(&handle.peer)?;

        if handle.confirmable {
            packet.header.set_type(MessageType::Confirmable);
            let bytes = packet.to_bytes_with_limit(self.config.max_message_size)?;
            let id = self.tracker.start(
                now,
                handle.peer.clone(),
                packet.header.message_id,
                handle.token,
                bytes.clone(),
            );
            self.exchanges.insert(id, ExchangeKind::SeparateResponse);
            self.queue(handle.peer, bytes);
        } else {
            packet.header.set_type(MessageType::NonConfirmable);
            let bytes = packet.to_bytes_with_limit(self.config.max_message_size)?;
            self.queue(handle.peer, bytes);
        }
        Ok(())
    }

    /// Notifies every observer of `path` with the resource's current state.
    ///
    /// A notification still awaiting its ACK is superseded by the new one.
    /// Returns the number of notifications sent.
    pub fn notify(&mut self, now: Instant, path: &str) -> usize {
        let path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let mut sent = 0;
        for notification in self.router.notifications(&path) {
            let observer = notification.observer;
            let success = notification.response.status().is_success();
            let mut packet = Packet::new();
            notification.response.fill_response(&mut packet);
            if success {
                packet.set_observe_value(notification.sequence);
            }
            let key = TransferKey {
                peer: observer.peer.clone(),
                method: Method::Get,
                path: path.clone(),
            };
            let mut packet = self.fragment(now, key, packet, None);
            packet.set_token(observer.token.clone());

            if let Some(id) = self.notification_exchanges.remove(&observer) {
                trace!("notification exchange {} superseded", id);
                self.tracker.cancel(id);
                self.exchanges.remove(&id);
            }
            let message_id = match self.tracker.next_message_id(&observer.peer) {
                Ok(message_id) => message_id,
                Err(e) => {
                    warn!("cannot notify {:?}: {}", observer.peer, e);
                    continue;
                }
            };
            packet.header.message_id = message_id;
            let confirmable = self.config.confirmable_notifications;
            packet.header.set_type(if confirmable {
                MessageType::Confirmable
            } else {
                MessageType::NonConfirmable
            });
            let bytes = match packet.to_bytes_with_limit(self.config.max_message_size) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("cannot encode notification of /{}: {}", path, e);
                    continue;
                }
            };

            if confirmable {
                let id = self.tracker.start(
                    now,
                    observer.peer.clone(),
                    message_id,
                    observer.token.clone(),
                    bytes.clone(),
                );
                self.exchanges
                    .insert(id, ExchangeKind::Notification(observer.clone(), path.clone()));
                self.notification_exchanges.insert(observer.clone(), id);
            }
            if success {
                self.sent_notifications.push_back(SentNotification {
                    observer: observer.clone(),
                    path: path.clone(),
                    message_id,
                    expires: now + self.config.transmission.exchange_lifetime(),
                });
            }
            self.queue(observer.peer, bytes);
            sent += 1;
        }
        sent
    }

    fn handle_message(&mut self, now: Instant, peer: Endpoint, packet: Packet) {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let message_id = packet.header.message_id;
        if packet.is_empty_message() {
            // CoAP ping
            if confirmable {
                self.send_reset(peer, message_id);
            }
            return;
        }

        match self
            .tracker
            .check_duplicate(now, &peer, message_id, confirmable)
        {
            Duplicate::New => {}
            Duplicate::Replay(Some(reply)) => {
                debug!("duplicate mid {} from {:?}, replaying reply", message_id, peer);
                self.queue(peer, reply);
                return;
            }
            Duplicate::Replay(None) => {
                debug!("duplicate mid {} from {:?} ignored", message_id, peer);
                return;
            }
        }

        match packet.header.code {
            MessageClass::Request(method) => self.handle_request(now, peer, method, packet),
            code if code.is_response() => self.handle_response(now, peer, packet),
            _ => {
                if confirmable {
                    self.send_reset(peer, message_id);
                }
            }
        }
    }

    fn handle_request(&mut self, now: Instant, peer: Endpoint, method: Method, mut request: Packet) {
        if let Err(e) = request.options_mut().strip_unrecognized() {
            debug!("request from {:?}: {}", peer, e);
            let response = (Status::BadOption, e.to_string()).into_response();
            self.reply(peer, &request, response_packet(response));
            return;
        }
        let key = TransferKey::new(&peer, method, &request);

        let mut block1_echo = None;
        if let Some(block) = request
            .get_first_option(CoapOption::Block1)
            .map(BlockValue::from_option)
        {
            let progress = block.and_then(|block| {
                let payload = std::mem::take(&mut request.payload);
                self.blocks.receive_block1(now, key.clone(), block, &payload)
            });
            match progress {
                Ok(Block1Progress::Continue(ack)) => {
                    let response = Response::new()
                        .set_response_type(Status::Continue)
                        .add_option(CoapOption::Block1, ack.to_option());
                    self.reply(peer, &request, response_packet(response));
                    return;
                }
                Ok(Block1Progress::Complete { body, last_block }) => {
                    request.payload = body;
                    block1_echo = Some(last_block);
                }
                Err(e) => {
                    let response = match e {
                        SequencingError::TooLarge(max) => Response::new()
                            .set_response_type(Status::RequestEntityTooLarge)
                            .add_option(CoapOption::Size1, encode_uint(max as u32)),
                        SequencingError::InvalidBlockValue => Status::BadRequest.into_response(),
                        _ => Status::RequestEntityIncomplete.into_response(),
                    };
                    self.reply(peer, &request, response_packet(response));
                    return;
                }
            }
        }

        let block2 = match request
            .get_first_option(CoapOption::Block2)
            .map(BlockValue::from_option)
        {
            Some(Ok(block)) => Some(block),
            Some(Err(_)) => {
                self.reply(peer, &request, response_packet(Status::BadRequest.into_response()));
                return;
            }
            None => None,
        };
        if let Some(block) = block2.filter(|b| b.num > 0) {
            if let Some(packet) = self.blocks.serve_cached(now, &key, block) {
                trace!("serving block {} of /{} from cache", block.num, key.path);
                self.reply(peer, &request, packet);
                return;
            }
        }

        let dispatch = self
            .router
            .dispatch(&Request::new(peer.clone(), request.clone()));
        if dispatch.deregistered {
            self.forget_notifications(&Observer {
                peer: peer.clone(),
                token: request.get_token().to_vec(),
            });
        }
        match dispatch.outcome {
            Outcome::Defer => {
                if request.header.get_type() == MessageType::Confirmable {
                    self.acknowledge(peer.clone(), request.header.message_id);
                }
                let handle = Deferred {
                    peer,
                    token: request.get_token().to_vec(),
                    confirmable: request.header.get_type() == MessageType::Confirmable,
                    method,
                    path: key.path,
                    block2,
                };
                self.events.push_back(Event::Deferred { handle, request });
            }
            Outcome::Respond(response) => {
                let status = response.status();
                let mut packet = response_packet(response);
                if let Some(sequence) = dispatch.observe {
                    packet.set_observe_value(sequence);
                }
                if let Some(block) = block1_echo {
                    packet.set_option(CoapOption::Block1, block.to_option());
                }
                let packet = self.fragment(now, key, packet, block2);
                if suppressed(&request, status) {
                    trace!("response {} to {:?} suppressed by No-Response", status, peer);
                    if request.header.get_type() == MessageType::Confirmable {
                        self.acknowledge(peer, request.header.message_id);
                    }
                    return;
                }
                self.reply(peer, &request, packet);
            }
        }
    }

    /// A response arriving in its own CON or NON message.
    fn handle_response(&mut self, now: Instant, peer: Endpoint, mut packet: Packet) {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let message_id = packet.header.message_id;
        let request = self
            .tokens
            .get(&(peer.clone(), packet.get_token().to_vec()))
            .copied();
        let Some(request) = request else {
            debug!("response from {:?} with unknown token {:02x?}", peer, packet.get_token());
            if confirmable {
                self.send_reset(peer, message_id);
            }
            return;
        };
        if let Err(e) = packet.options_mut().strip_unrecognized() {
            debug!("response from {:?}: {}", peer, e);
            if confirmable {
                self.send_reset(peer, message_id);
            }
            return;
        }
        if confirmable {
            self.acknowledge(peer, message_id);
        }
        self.process_response(now, request, packet);
    }

    fn handle_ack(&mut self, now: Instant, peer: Endpoint, mut packet: Packet) {
        let message_id = packet.header.message_id;
        let Some(exchange) = self.tracker.complete(&peer, message_id) else {
            trace!("unmatched ACK {} from {:?}", message_id, peer);
            return;
        };
        match self.exchanges.remove(&exchange.id) {
            Some(ExchangeKind::Request(request)) => {
                if let Some(outgoing) = self.requests.get_mut(&request) {
                    outgoing.exchange = None;
                }
                if packet.is_empty_message() {
                    debug!("request {} acknowledged, awaiting separate response", request);
                    let deadline = now + self.config.transmission.exchange_lifetime();
                    self.set_deadline(request, Some(deadline));
                } else if packet.get_token() != exchange.token.as_slice() {
                    debug!("piggybacked response from {:?} with mismatched token", peer);
                } else {
                    match packet.options_mut().strip_unrecognized() {
                        Ok(()) => self.process_response(now, request, packet),
                        Err(e) => self.fail(request, e.into()),
                    }
                }
                self.release_queued(now);
            }
            Some(ExchangeKind::Notification(observer, _)) => {
                if self.notification_exchanges.get(&observer) == Some(&exchange.id) {
                    self.notification_exchanges.remove(&observer);
                }
            }
            Some(ExchangeKind::SeparateResponse) | None => {}
        }
    }

    fn handle_reset(&mut self, now: Instant, peer: Endpoint, packet: Packet) {
        if !packet.is_empty_message() {
            return;
        }
        let message_id = packet.header.message_id;
        if let Some(exchange) = self.tracker.complete(&peer, message_id) {
            match self.exchanges.remove(&exchange.id) {
                Some(ExchangeKind::Request(request)) => {
                    if let Some(outgoing) = self.requests.get_mut(&request) {
                        outgoing.exchange = None;
                    }
                    self.fail(request, Error::Reset);
                    self.release_queued(now);
                }
                Some(ExchangeKind::Notification(observer, path)) => {
                    self.drop_observer(&observer, &path)
                }
                Some(ExchangeKind::SeparateResponse) | None => {
                    debug!("separate response reset by {:?}", peer)
                }
            }
            return;
        }

        // non-confirmable or superseded notifications, then NON requests
        let observer = self
            .sent_notifications
            .iter()
            .rev()
            .find(|sent| {
                sent.observer.peer == peer && sent.message_id == message_id && sent.expires > now
            })
            .map(|sent| (sent.observer.clone(), sent.path.clone()));
        if let Some((observer, path)) = observer {
            self.drop_observer(&observer, &path);
            return;
        }
        let request = self
            .requests
            .iter()
            .find(|(_, r)| r.peer == peer && r.message_id == Some(message_id))
            .map(|(id, _)| *id);
        if let Some(request) = request {
            self.fail(request, Error::Reset);
        }
    }

    fn process_response(&mut self, now: Instant, request: RequestId, mut packet: Packet) {
        let preferred = self.config.block_size;
        let Some(outgoing) = self.requests.get_mut(&request) else {
            return;
        };
        // a separate response also acknowledges the request
        if let Some(id) = outgoing.exchange.take() {
            self.tracker.cancel(id);
            self.exchanges.remove(&id);
        }

        if let Some(sent) = outgoing.upload.take() {
            let more = sent.offset() + sent.size() < outgoing.template.payload.len();
            if more && packet.header.code == MessageClass::Response(Status::Continue) {
                let size = packet
                    .get_first_option(CoapOption::Block1)
                    .and_then(|v| BlockValue::from_option(v).ok())
                    .map_or(sent.size(), |b| b.size().min(sent.size()));
                let offset = sent.offset() + sent.size();
                match BlockValue::new(offset / size, true, size) {
                    Ok(next) => {
                        outgoing.upload = Some(next);
                        self.transmit(now, request);
                    }
                    Err(e) => self.fail(request, e.into()),
                }
                return;
            }
        }

        let notification = outgoing.observe && packet.get_observe_value().is_some();
        if notification {
            let sequence = packet.get_observe_value().unwrap_or_default();
            if !outgoing.freshness.accept(sequence, now) {
                debug!("stale notification {} for request {} dropped", sequence, request);
                return;
            }
            outgoing.deadline = None;
        }

        let block2 = packet
            .get_first_option(CoapOption::Block2)
            .and_then(|v| BlockValue::from_option(v).ok());
        if let Some(block) = block2 {
            if notification {
                if block.more {
                    self.fetch_notification(now, request, packet, block);
                    return;
                }
            } else {
                if block.offset() != outgoing.download.len() {
                    let error = SequencingError::OutOfOrder {
                        num: block.num,
                        offset: block.offset(),
                        expected: outgoing.download.len(),
                    };
                    self.fail(request, error.into());
                    return;
                }
                outgoing.download.extend_from_slice(&packet.payload);
                if block.more {
                    let size = block.size().min(preferred);
                    match BlockValue::new(outgoing.download.len() / size, false, size) {
                        Ok(next) => {
                            outgoing.block2 = Some(next);
                            self.transmit(now, request);
                        }
                        Err(e) => self.fail(request, e.into()),
                    }
                    return;
                }
                packet.payload = std::mem::take(&mut outgoing.download);
                packet.clear_option(CoapOption::Block2);
            }
        }

        let peer = outgoing.peer.clone();
        if notification {
            self.events.push_back(Event::Notification {
                request,
                peer,
                notification: packet,
            });
            return;
        }
        let Some(outgoing) = self.remove_request(request) else {
            return;
        };
        match outgoing.purpose {
            Purpose::Application => self.events.push_back(Event::Response {
                request,
                peer,
                response: packet,
            }),
            Purpose::NotificationFetch {
                observation,
                mut first,
            } => {
                if !self.requests.contains_key(&observation) {
                    return;
                }
                first.payload = packet.payload;
                first.clear_option(CoapOption::Block2);
                self.events.push_back(Event::Notification {
                    request: observation,
                    peer,
                    notification: first,
                });
            }
        }
    }

    /// Starts a GET for the rest of a notification that arrived block-wise.
    ///
    /// The follow-up uses a fresh token so it does not touch the
    /// registration.
    fn fetch_notification(&mut self, now: Instant, observation: RequestId, first: Packet, block: BlockValue) {
        let Some(parent) = self.requests.get(&observation) else {
            return;
        };
        let size = block.size().min(self.config.block_size);
        let next = match BlockValue::new(first.payload.len() / size, false, size) {
            Ok(next) => next,
            Err(e) => {
                warn!("cannot fetch notification blocks: {}", e);
                return;
            }
        };
        let peer = parent.peer.clone();
        let mut template = parent.template.clone();
        template.clear_option(CoapOption::Observe);
        template.payload.clear();
        let fetch = Outgoing {
            peer: peer.clone(),
            token: Vec::new(),
            template,
            confirmable: parent.confirmable,
            observe: false,
            upload: None,
            block2: Some(next),
            download: first.payload.clone(),
            message_id: None,
            exchange: None,
            deadline: None,
            freshness: Freshness::default(),
            purpose: Purpose::NotificationFetch { observation, first },
        };
        let token = self.fresh_token(&peer);
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.insert(id, Outgoing { token: token.clone(), ..fetch });
        self.tokens.insert((peer, token), id);
        self.transmit(now, id);
    }

    fn transmit(&mut self, now: Instant, request: RequestId) {
        if let Err(e) = self.try_transmit(now, request) {
            self.fail(request, e);
        }
    }

    fn try_transmit(&mut self, now: Instant, request: RequestId) -> Result<(), Error> {
        let Some(outgoing) = self.requests.get(&request) else {
            return Ok(());
        };
        let mut packet = outgoing.message();
        let peer = outgoing.peer.clone();
        let message_id = self.tracker.next_message_id(&peer)?;
        packet.header.message_id = message_id;
        let bytes = packet.to_bytes_with_limit(self.config.max_message_size)?;

        let exchange = if packet.header.get_type() == MessageType::Confirmable {
            let id = self.tracker.start(
                now,
                peer.clone(),
                message_id,
                packet.get_token().to_vec(),
                bytes.clone(),
            );
            self.exchanges.insert(id, ExchangeKind::Request(request));
            Some(id)
        } else {
            None
        };
        let deadline = match exchange {
            Some(_) => None,
            None => Some(now + self.config.transmission.max_transmit_wait()),
        };
        if let Some(outgoing) = self.requests.get_mut(&request) {
            outgoing.message_id = Some(message_id);
            outgoing.exchange = exchange;
        }
        self.set_deadline(request, deadline);
        debug!("request {} to {:?}: {}", request, peer, packet);
        self.queue(peer, bytes);
        Ok(())
    }

    /// Sends queued requests for peers that dropped below NSTART.
    fn release_queued(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.queued.len() {
            let request = self.queued[i];
            let Some(peer) = self.requests.get(&request).map(|r| r.peer.clone()) else {
                self.queued.remove(i);
                continue;
            };
            if self.outstanding(&peer) < self.config.transmission.nstart {
                self.queued.remove(i);
                self.transmit(now, request);
            } else {
                i += 1;
            }
        }
    }

    fn outstanding(&self, peer: &Endpoint) -> usize {
        self.requests
            .values()
            .filter(|r| r.peer == *peer && r.exchange.is_some())
            .count()
    }

    fn remove_request(&mut self, request: RequestId) -> Option<Outgoing<Endpoint>> {
        let outgoing = self.requests.remove(&request)?;
        self.tokens
            .remove(&(outgoing.peer.clone(), outgoing.token.clone()));
        self.queued.retain(|id| *id != request);
        if let Some(id) = outgoing.exchange {
            self.tracker.cancel(id);
            self.exchanges.remove(&id);
        }
        Some(outgoing)
    }

    fn fail(&mut self, request: RequestId, error: Error) {
        let Some(outgoing) = self.remove_request(request) else {
            return;
        };
        match outgoing.purpose {
            Purpose::Application => self.events.push_back(Event::Failed {
                request,
                peer: outgoing.peer,
                error,
            }),
            Purpose::NotificationFetch { observation, .. } => {
                warn!("notification blocks for request {}: {}", observation, error)
            }
        }
    }

    fn set_deadline(&mut self, request: RequestId, deadline: Option<Instant>) {
        let Some(outgoing) = self.requests.get_mut(&request) else {
            return;
        };
        outgoing.deadline = deadline;
        if let Some(at) = deadline {
            self.deadlines.push(Reverse((at, request)));
        }
    }

    fn deadline_of(&self, request: RequestId) -> Option<Instant> {
        self.requests.get(&request).and_then(|r| r.deadline)
    }

    fn drop_observer(&mut self, observer: &Observer<Endpoint>, path: &str) {
        self.forget_notifications(observer);
        if self.router.remove_observer(path, observer) {
            debug!("observer {:?} of /{} removed", observer.peer, path);
        }
    }

    /// Stops retransmitting to `observer` and forgets what it was sent.
    fn forget_notifications(&mut self, observer: &Observer<Endpoint>) {
        if let Some(id) = self.notification_exchanges.remove(observer) {
            self.tracker.cancel(id);
            self.exchanges.remove(&id);
        }
        self.sent_notifications.retain(|sent| sent.observer != *observer);
    }

    fn expire_notifications(&mut self, now: Instant) {
        while self
            .sent_notifications
            .front()
            .map_or(false, |sent| sent.expires <= now)
        {
            self.sent_notifications.pop_front();
        }
    }

    /// Serves `packet` block-wise when the body is too large or a later
    /// block was asked for.
    fn fragment(
        &mut self,
        now: Instant,
        key: TransferKey<Endpoint>,
        packet: Packet,
        requested: Option<BlockValue>,
    ) -> Packet {
        let later_block = requested.map_or(false, |b| b.num > 0);
        if !later_block && !self.blocks.needs_fragmenting(&packet, requested) {
            return packet;
        }
        let block = requested.unwrap_or(BlockValue {
            num: 0,
            more: false,
            size_exponent: 6,
        });
        match self.blocks.fragment(now, key, packet, block) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("cannot serve block {}: {}", block.num, e);
                response_packet(Status::BadOption.into_response())
            }
        }
    }

    /// Answers `request`: piggybacked on the ACK of a confirmable request,
    /// in a new NON message otherwise.
    fn reply(&mut self, peer: Endpoint, request: &Packet, mut packet: Packet) {
        packet.set_token(request.get_token().to_vec());
        if request.header.get_type() == MessageType::Confirmable {
            packet.header.set_type(MessageType::Acknowledgement);
            packet.header.message_id = request.header.message_id;
        } else {
            packet.header.set_type(MessageType::NonConfirmable);
            match self.tracker.next_message_id(&peer) {
                Ok(message_id) => packet.header.message_id = message_id,
                Err(e) => {
                    warn!("cannot answer {:?}: {}", peer, e);
                    return;
                }
            }
        }
        let bytes = match packet.to_bytes_with_limit(self.config.max_message_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode response to {:?}: {}", peer, e);
                let mut fallback = response_packet(Status::InternalServerError.into_response());
                fallback.header.set_type(packet.header.get_type());
                fallback.header.message_id = packet.header.message_id;
                fallback.set_token(packet.get_token().to_vec());
                match fallback.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        };
        self.tracker
            .set_reply(&peer, request.header.message_id, bytes.clone());
        self.queue(peer, bytes);
    }

    fn acknowledge(&mut self, peer: Endpoint, message_id: u16) {
        if let Ok(bytes) = Packet::empty_ack(message_id).to_bytes() {
            self.tracker.set_reply(&peer, message_id, bytes.clone());
            self.queue(peer, bytes);
        }
    }

    fn send_reset(&mut self, peer: Endpoint, message_id: u16) {
        if let Ok(bytes) = Packet::reset(message_id).to_bytes() {
            self.tracker.set_reply(&peer, message_id, bytes.clone());
            self.queue(peer, bytes);
        }
    }

    fn encode_and_queue(&mut self, peer: Endpoint, packet: &Packet) {
        match packet.to_bytes_with_limit(self.config.max_message_size) {
            Ok(bytes) => self.queue(peer, bytes),
            Err(e) => warn!("cannot encode message to {:?}: {}", peer, e),
        }
    }

    fn queue(&mut self, peer: Endpoint, bytes: Vec<u8>) {
        trace!("queueing {} bytes to {:?}", bytes.len(), peer);
        self.transmits.push_back(Transmit { peer, bytes });
    }

    fn fresh_token(&mut self, peer: &Endpoint) -> Vec<u8> {
        loop {
            let token: [u8; TOKEN_LENGTH] = self.rng.gen();
            let token = token.to_vec();
            if !self.tokens.contains_key(&(peer.clone(), token.clone())) {
                return token;
            }
        }
    }
}

fn response_packet(response: Response) -> Packet {
    let mut packet = Packet::new();
    response.fill_response(&mut packet);
    packet
}

/// Whether the request's No-Response option (RFC 7967) waives a response
/// of this class.
fn suppressed(request: &Packet, status: Status) -> bool {
    let Some(mask) = request.options().get_uint(CoapOption::NoResponse) else {
        return false;
    };
    let bit = match status.class() {
        2 => 0x02,
        4 => 0x08,
        5 => 0x10,
        _ => 0,
    };
    mask & bit != 0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TransmissionParameters;
    use crate::router::resource::Resource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const CLIENT: u32 = 1;
    const SERVER: u32 = 2;

    fn engine(config: Config, router: Router<u32>, seed: u64) -> Engine<u32> {
        Engine::with_rng(config, router, StdRng::seed_from_u64(seed)).unwrap()
    }

    fn temperature_router() -> Router<u32> {
        let router = Router::new();
        router.add("temp", Resource::new().get(|_: &Request<u32>| "23.5"));
        router
    }

    /// Moves every queued datagram between the two engines until both are
    /// quiet. Returns the number of datagrams the client sent.
    fn pump(client: &mut Engine<u32>, server: &mut Engine<u32>, now: Instant) -> usize {
        let mut from_client = 0;
        loop {
            let mut moved = false;
            while let Some(transmit) = client.poll_transmit() {
                assert_eq!(transmit.peer, SERVER);
                server.handle_datagram(now, CLIENT, &transmit.bytes);
                from_client += 1;
                moved = true;
            }
            while let Some(transmit) = server.poll_transmit() {
                assert_eq!(transmit.peer, CLIENT);
                client.handle_datagram(now, SERVER, &transmit.bytes);
                moved = true;
            }
            if !moved {
                return from_client;
            }
        }
    }

    fn get(path: &str) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(Method::Get);
        packet.set_path(path);
        packet
    }

    fn drain(engine: &mut Engine<u32>) -> Vec<Transmit<u32>> {
        std::iter::from_fn(|| engine.poll_transmit()).collect()
    }

    #[test]
    fn test_piggybacked_response() {
        let mut server = engine(Config::default(), temperature_router(), 1);
        let now = Instant::now();
        let request = [0x41, 0x01, 0x00, 0x0A, 0xAB, 0xB4, b't', b'e', b'm', b'p'];
        server.handle_datagram(now, CLIENT, &request);

        let transmits = drain(&mut server);
        assert_eq!(transmits.len(), 1);
        assert_eq!(
            transmits[0].bytes,
            vec![0x61, 0x45, 0x00, 0x0A, 0xAB, 0xFF, b'2', b'3', b'.', b'5']
        );
        assert_eq!(server.poll_timeout(), None);
    }

    #[test]
    fn test_client_request_completes() {
        let mut client = engine(Config::default(), Router::new(), 1);
        let mut server = engine(Config::default(), temperature_router(), 2);
        let now = Instant::now();

        let id = client.send_request(now, SERVER, get("/temp")).unwrap();
        assert_eq!(pump(&mut client, &mut server, now), 1);
        match client.poll_event() {
            Some(Event::Response { request, response, .. }) => {
                assert_eq!(request, id);
                assert_eq!(response.header.code, MessageClass::Response(Status::Content));
                assert_eq!(response.payload, b"23.5".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.poll_timeout(), None);
        client.handle_timeout(now + Duration::from_secs(60));
        assert!(client.poll_transmit().is_none());
    }

    #[test]
    fn test_duplicate_request_replays_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new();
        let counter = calls.clone();
        router.add(
            "count",
            Resource::new().post(move |_: &Request<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Status::Changed
            }),
        );
        let mut server = engine(Config::default(), router, 1);
        let now = Instant::now();

        let mut request = get("count");
        request.header.code = MessageClass::Request(Method::Post);
        request.header.message_id = 77;
        request.set_token(vec![1]);
        let bytes = request.to_bytes().unwrap();

        server.handle_datagram(now, CLIENT, &bytes);
        server.handle_datagram(now + Duration::from_secs(1), CLIENT, &bytes);
        let transmits = drain(&mut server);
        assert_eq!(transmits.len(), 2);
        assert_eq!(transmits[0], transmits[1]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retransmission_then_failure() {
        let mut client = engine(Config::default(), Router::new(), 3);
        let start = Instant::now();
        let id = client.send_request(start, SERVER, get("temp")).unwrap();
        let first = drain(&mut client);
        assert_eq!(first.len(), 1);

        let mut retransmissions = 0;
        while let Some(deadline) = client.poll_timeout() {
            client.handle_timeout(deadline);
            for transmit in drain(&mut client) {
                assert_eq!(transmit.bytes, first[0].bytes);
                retransmissions += 1;
            }
        }
        assert_eq!(retransmissions, 4);
        match client.poll_event() {
            Some(Event::Failed {
                request,
                error: Error::Delivery(failure),
                ..
            }) => {
                assert_eq!(request, id);
                assert_eq!(failure.retransmissions, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_reset_aborts_request() {
        let mut client = engine(Config::default(), Router::new(), 4);
        let now = Instant::now();
        let id = client.send_request(now, SERVER, get("temp")).unwrap();
        let sent = Packet::from_bytes(&drain(&mut client)[0].bytes).unwrap();

        let reset = Packet::reset(sent.header.message_id).to_bytes().unwrap();
        client.handle_datagram(now, SERVER, &reset);
        assert!(matches!(
            client.poll_event(),
            Some(Event::Failed { request, error: Error::Reset, .. }) if request == id
        ));
        assert_eq!(client.poll_timeout(), None);
    }

    #[test]
    fn test_unknown_token_gets_reset() {
        let mut client = engine(Config::default(), Router::new(), 5);
        let now = Instant::now();
        let mut response = Packet::new();
        response.header.set_type(MessageType::Confirmable);
        response.header.code = MessageClass::Response(Status::Content);
        response.header.message_id = 900;
        response.set_token(vec![9, 9]);
        client.handle_datagram(now, SERVER, &response.to_bytes().unwrap());

        let reply = Packet::from_bytes(&drain(&mut client)[0].bytes).unwrap();
        assert_eq!(reply.header.get_type(), MessageType::Reset);
        assert_eq!(reply.header.message_id, 900);
    }

    #[test]
    fn test_unknown_critical_option() {
        let mut server = engine(Config::default(), temperature_router(), 6);
        let now = Instant::now();
        let mut request = get("temp");
        request.header.message_id = 3;
        request.add_option(CoapOption::Unknown(2049), vec![1]);
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        let reply = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(reply.header.code, MessageClass::Response(Status::BadOption));

        let mut request = get("temp");
        request.header.message_id = 4;
        request.add_option(CoapOption::Unknown(2050), vec![1]);
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        let reply = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(reply.header.code, MessageClass::Response(Status::Content));
    }

    #[test]
    fn test_separate_response() {
        let router = Router::new();
        router.add("slow", Resource::new().post(|_: &Request<u32>| Outcome::Defer));
        let mut client = engine(Config::default(), Router::new(), 7);
        let mut server = engine(Config::default(), router, 8);
        let now = Instant::now();

        let mut request = get("slow");
        request.header.code = MessageClass::Request(Method::Post);
        let id = client.send_request(now, SERVER, request).unwrap();
        pump(&mut client, &mut server, now);
        assert!(client.poll_event().is_none());
        assert_eq!(client.pending_requests(), 1);
        assert_eq!(client.exchanges_in_flight(), 0);

        let Some(Event::Deferred { handle, .. }) = server.poll_event() else {
            panic!("handler did not defer");
        };
        server.respond(now, handle, "done").unwrap();
        pump(&mut client, &mut server, now);
        match client.poll_event() {
            Some(Event::Response { request, response, .. }) => {
                assert_eq!(request, id);
                assert_eq!(response.payload, b"done".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.exchanges_in_flight(), 0);
    }

    #[test]
    fn test_block1_upload() {
        let received = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new();
        let (size, count) = (received.clone(), calls.clone());
        router.add(
            "upload",
            Resource::new().put(move |request: &Request<u32>| {
                size.store(request.payload().len(), Ordering::SeqCst);
                count.fetch_add(1, Ordering::SeqCst);
                Status::Changed
            }),
        );
        let client_config = Config::default().set_block_size(64);
        let mut client = engine(client_config, Router::new(), 9);
        let mut server = engine(Config::default(), router, 10);
        let now = Instant::now();

        let mut request = get("upload");
        request.header.code = MessageClass::Request(Method::Put);
        request.payload = (0..2048).map(|i| i as u8).collect();
        client.send_request(now, SERVER, request).unwrap();

        assert_eq!(pump(&mut client, &mut server, now), 32);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(received.load(Ordering::SeqCst), 2048);
        assert_eq!(server.block_contexts(), 0);
        match client.poll_event() {
            Some(Event::Response { response, .. }) => {
                assert_eq!(response.header.code, MessageClass::Response(Status::Changed));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_block2_download() {
        let body: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let router = Router::new();
        let served = body.clone();
        router.add("big", Resource::new().get(move |_: &Request<u32>| served.clone()));
        let mut client = engine(Config::default(), Router::new(), 11);
        let mut server = engine(Config::default().set_block_size(64), router, 12);
        let now = Instant::now();

        client.send_request(now, SERVER, get("big")).unwrap();
        assert_eq!(pump(&mut client, &mut server, now), 3);
        match client.poll_event() {
            Some(Event::Response { response, .. }) => assert_eq!(response.payload, body),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.block_contexts(), 0);
    }

    #[test]
    fn test_nstart_queue() {
        let mut client = engine(Config::default(), Router::new(), 13);
        let mut server = engine(Config::default(), temperature_router(), 14);
        let now = Instant::now();

        client.send_request(now, SERVER, get("temp")).unwrap();
        client.send_request(now, SERVER, get("temp")).unwrap();
        let first = drain(&mut client);
        assert_eq!(first.len(), 1);
        server.handle_datagram(now, CLIENT, &first[0].bytes);
        for transmit in drain(&mut server) {
            client.handle_datagram(now, SERVER, &transmit.bytes);
        }
        assert_eq!(drain(&mut client).len(), 1);
        assert!(matches!(client.poll_event(), Some(Event::Response { .. })));
    }

    #[test]
    fn test_no_response() {
        let mut server = engine(Config::default(), temperature_router(), 15);
        let now = Instant::now();

        let mut request = get("temp");
        request.header.set_type(MessageType::NonConfirmable);
        request.header.message_id = 20;
        request.set_option(CoapOption::NoResponse, encode_uint(2));
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        assert!(server.poll_transmit().is_none());

        let mut request = get("temp");
        request.header.message_id = 21;
        request.set_option(CoapOption::NoResponse, encode_uint(2));
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        let reply = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert!(reply.is_empty_message());
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
    }

    #[test]
    fn test_observe_and_cancel() {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new()
                .get(|_: &Request<u32>| "23.5")
                .observable(true),
        );
        let mut client = engine(Config::default(), Router::new(), 16);
        let mut server = engine(Config::default(), router.clone(), 17);
        let now = Instant::now();

        let mut request = get("temp");
        request.set_observe_value(0);
        let id = client.send_request(now, SERVER, request).unwrap();
        pump(&mut client, &mut server, now);
        assert!(matches!(
            client.poll_event(),
            Some(Event::Notification { request, .. }) if request == id
        ));
        assert_eq!(router.observer_count("temp"), 1);

        assert_eq!(server.notify(now, "/temp"), 1);
        pump(&mut client, &mut server, now);
        match client.poll_event() {
            Some(Event::Notification { notification, .. }) => {
                assert_eq!(notification.get_observe_value(), Some(1));
                assert_eq!(notification.payload, b"23.5".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.exchanges_in_flight(), 0);

        assert!(client.cancel(now, id));
        pump(&mut client, &mut server, now);
        assert_eq!(router.observer_count("temp"), 0);
        assert!(client.poll_event().is_none());
    }

    #[test]
    fn test_reset_removes_observer() {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new().get(|_: &Request<u32>| "1").observable(true),
        );
        let mut server = engine(Config::default(), router.clone(), 18);
        let now = Instant::now();

        let mut request = get("temp");
        request.header.message_id = 1;
        request.set_token(vec![7]);
        request.set_observe_value(0);
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        drain(&mut server);
        assert_eq!(router.observer_count("temp"), 1);

        server.notify(now, "temp");
        let notification = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(notification.header.get_type(), MessageType::Confirmable);
        let reset = Packet::reset(notification.header.message_id).to_bytes().unwrap();
        server.handle_datagram(now, CLIENT, &reset);
        assert_eq!(router.observer_count("temp"), 0);
        assert_eq!(server.poll_timeout(), None);
    }

    #[test]
    fn test_stale_notification_dropped() {
        let mut client = engine(Config::default(), Router::new(), 19);
        let now = Instant::now();
        let mut request = get("temp");
        request.set_token(vec![5]);
        request.header.set_type(MessageType::NonConfirmable);
        request.set_observe_value(0);
        client.send_request(now, SERVER, request).unwrap();
        drain(&mut client);

        let mut message_id = 100;
        let mut notify = |client: &mut Engine<u32>, sequence: u32| {
            let mut packet = Packet::new();
            packet.header.set_type(MessageType::NonConfirmable);
            packet.header.code = MessageClass::Response(Status::Content);
            packet.header.message_id = message_id;
            message_id += 1;
            packet.set_token(vec![5]);
            packet.set_observe_value(sequence);
            client.handle_datagram(now, SERVER, &packet.to_bytes().unwrap());
            client.poll_event().is_some()
        };
        assert!(notify(&mut client, 5));
        assert!(!notify(&mut client, 4));
        assert!(notify(&mut client, 6));
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let mut server = engine(Config::default(), temperature_router(), 20);
        server.handle_datagram(Instant::now(), CLIENT, &[0x40]);
        server.handle_datagram(Instant::now(), CLIENT, &[0x81, 0x01, 0x00, 0x01]);
        assert!(server.poll_transmit().is_none());
    }

    #[test]
    fn test_ping() {
        let mut server = engine(Config::default(), Router::new(), 21);
        let mut ping = Packet::new();
        ping.header.set_type(MessageType::Confirmable);
        ping.header.message_id = 44;
        server.handle_datagram(Instant::now(), CLIENT, &ping.to_bytes().unwrap());
        let reply = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(reply.header.get_type(), MessageType::Reset);
        assert_eq!(reply.header.message_id, 44);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config::default()
            .set_transmission(TransmissionParameters::default().set_nstart(0));
        assert!(Engine::<u32>::new(config).is_err());
    }

    fn observed_server(seed: u64) -> (Engine<u32>, Router<u32>) {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new().get(|_: &Request<u32>| "1").observable(true),
        );
        let mut server = engine(Config::default(), router.clone(), seed);
        let mut request = get("temp");
        request.header.message_id = 1;
        request.set_token(vec![7]);
        request.set_observe_value(0);
        server.handle_datagram(Instant::now(), CLIENT, &request.to_bytes().unwrap());
        drain(&mut server);
        assert_eq!(router.observer_count("temp"), 1);
        (server, router)
    }

    #[test]
    fn test_reset_of_superseded_notification() {
        let (mut server, router) = observed_server(22);
        let now = Instant::now();

        server.notify(now, "temp");
        let first = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        server.notify(now, "temp");
        let second = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_ne!(first.header.message_id, second.header.message_id);
        assert_eq!(server.exchanges_in_flight(), 1);

        let reset = Packet::reset(first.header.message_id).to_bytes().unwrap();
        server.handle_datagram(now, CLIENT, &reset);
        assert_eq!(router.observer_count("temp"), 0);
        assert_eq!(server.exchanges_in_flight(), 0);
        assert_eq!(server.poll_timeout(), None);
    }

    #[test]
    fn test_reset_after_exchange_lifetime_ignored() {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new().get(|_: &Request<u32>| "1").observable(true),
        );
        let config = Config::default().set_confirmable_notifications(false);
        let mut server = engine(config, router.clone(), 23);
        let now = Instant::now();
        let mut request = get("temp");
        request.header.message_id = 1;
        request.set_token(vec![7]);
        request.set_observe_value(0);
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        drain(&mut server);

        server.notify(now, "temp");
        let notification = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(notification.header.get_type(), MessageType::NonConfirmable);

        let later = now + Config::default().transmission.exchange_lifetime();
        let reset = Packet::reset(notification.header.message_id).to_bytes().unwrap();
        server.handle_datagram(later, CLIENT, &reset);
        assert_eq!(router.observer_count("temp"), 1);
    }

    #[test]
    fn test_deregistration_stops_retransmission() {
        let (mut server, router) = observed_server(24);
        let now = Instant::now();

        server.notify(now, "temp");
        drain(&mut server);
        assert_eq!(server.exchanges_in_flight(), 1);

        let mut request = get("temp");
        request.header.message_id = 2;
        request.set_token(vec![7]);
        server.handle_datagram(now, CLIENT, &request.to_bytes().unwrap());
        let reply = Packet::from_bytes(&drain(&mut server)[0].bytes).unwrap();
        assert_eq!(reply.get_observe_value(), None);
        assert_eq!(router.observer_count("temp"), 0);
        assert_eq!(server.exchanges_in_flight(), 0);
        assert_eq!(server.poll_timeout(), None);
    }

    #[test]
    fn test_non_request_gives_up() {
        let mut client = engine(Config::default(), Router::new(), 25);
        let now = Instant::now();
        let mut request = get("temp");
        request.header.set_type(MessageType::NonConfirmable);
        let id = client.send_request(now, SERVER, request).unwrap();
        assert_eq!(drain(&mut client).len(), 1);

        let deadline = now + Config::default().transmission.max_transmit_wait();
        assert_eq!(client.poll_timeout(), Some(deadline));
        client.handle_timeout(deadline - Duration::from_millis(1));
        assert!(client.poll_event().is_none());

        client.handle_timeout(deadline);
        assert!(matches!(
            client.poll_event(),
            Some(Event::Failed { request, error: Error::NoResponse, .. }) if request == id
        ));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.poll_timeout(), None);
        assert!(client.poll_transmit().is_none());
    }

    #[test]
    fn test_separate_response_never_arrives() {
        let router = Router::new();
        router.add("slow", Resource::new().post(|_: &Request<u32>| Outcome::Defer));
        let mut client = engine(Config::default(), Router::new(), 26);
        let mut server = engine(Config::default(), router, 27);
        let now = Instant::now();

        let mut request = get("slow");
        request.header.code = MessageClass::Request(Method::Post);
        let id = client.send_request(now, SERVER, request).unwrap();
        pump(&mut client, &mut server, now);
        assert_eq!(client.exchanges_in_flight(), 0);

        let deadline = now + Config::default().transmission.exchange_lifetime();
        assert_eq!(client.poll_timeout(), Some(deadline));
        client.handle_timeout(deadline);
        assert!(matches!(
            client.poll_event(),
            Some(Event::Failed { request, error: Error::NoResponse, .. }) if request == id
        ));
        assert_eq!(client.poll_timeout(), None);
    }

    #[test]
    fn test_observation_keeps_no_deadline() {
        let router = Router::new();
        router.add(
            "temp",
            Resource::new().get(|_: &Request<u32>| "1").observable(true),
        );
        let mut client = engine(Config::default(), Router::new(), 28);
        let mut server = engine(Config::default(), router, 29);
        let now = Instant::now();

        let mut request = get("temp");
        request.header.set_type(MessageType::NonConfirmable);
        request.set_observe_value(0);
        client.send_request(now, SERVER, request).unwrap();
        pump(&mut client, &mut server, now);
        assert!(matches!(client.poll_event(), Some(Event::Notification { .. })));
        assert_eq!(client.poll_timeout(), None);
        assert_eq!(client.pending_requests(), 1);
    }

    fn upload_server(config: Config, seed: u64) -> Engine<u32> {
        let router = Router::new();
        router.add("upload", Resource::new().put(|_: &Request<u32>| Status::Changed));
        engine(config, router, seed)
    }

    fn block1(message_id: u16, num: usize, more: bool, payload: &[u8]) -> Vec<u8> {
        let mut request = get("upload");
        request.header.code = MessageClass::Request(Method::Put);
        request.header.message_id = message_id;
        request.set_token(vec![3]);
        let block = BlockValue::new(num, more, 64).unwrap();
        request.set_option(CoapOption::Block1, block.to_option());
        request.payload = payload.to_vec();
        request.to_bytes().unwrap()
    }

    fn reply(server: &mut Engine<u32>) -> Packet {
        let transmits = drain(server);
        assert_eq!(transmits.len(), 1);
        Packet::from_bytes(&transmits[0].bytes).unwrap()
    }

    #[test]
    fn test_block1_out_of_order_incomplete() {
        let mut server = upload_server(Config::default(), 30);
        let now = Instant::now();

        server.handle_datagram(now, CLIENT, &block1(1, 0, true, &[0; 64]));
        assert_eq!(
            reply(&mut server).header.code,
            MessageClass::Response(Status::Continue)
        );
        assert_eq!(server.block_contexts(), 1);

        server.handle_datagram(now, CLIENT, &block1(2, 2, true, &[2; 64]));
        assert_eq!(
            reply(&mut server).header.code,
            MessageClass::Response(Status::RequestEntityIncomplete)
        );
        assert_eq!(server.block_contexts(), 0);
    }

    #[test]
    fn test_block1_wrong_size_incomplete() {
        let mut server = upload_server(Config::default(), 31);
        let now = Instant::now();

        server.handle_datagram(now, CLIENT, &block1(1, 0, true, &[0; 30]));
        assert_eq!(
            reply(&mut server).header.code,
            MessageClass::Response(Status::RequestEntityIncomplete)
        );
        assert_eq!(server.block_contexts(), 0);
    }

    #[test]
    fn test_block1_too_large() {
        let mut server = upload_server(Config::default().set_max_body_size(128), 32);
        let now = Instant::now();

        for (message_id, num) in [(1, 0), (2, 1)] {
            server.handle_datagram(now, CLIENT, &block1(message_id, num, true, &[0; 64]));
            assert_eq!(
                reply(&mut server).header.code,
                MessageClass::Response(Status::Continue)
            );
        }
        server.handle_datagram(now, CLIENT, &block1(3, 2, false, &[0; 10]));
        let too_large = reply(&mut server);
        assert_eq!(
            too_large.header.code,
            MessageClass::Response(Status::RequestEntityTooLarge)
        );
        assert_eq!(too_large.options().get_uint(CoapOption::Size1), Some(128));
        assert_eq!(server.block_contexts(), 0);
    }
}
