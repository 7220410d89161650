//! Runs an [`Engine`] on tokio.
//!
//! One task owns the engine. Received datagrams, application commands and
//! the retransmission timer all enter through a single `select!` loop, so
//! the engine is never touched concurrently.
use std::collections::HashMap;
use std::future;
use std::io::{ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use log::{debug, error, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::engine::{Deferred, Engine, Event, RequestId, Transmit};
use crate::error::Error;
use crate::message::header::Status;
use crate::message::packet::Packet;
use crate::router::response::{IntoResponse, Response};
use crate::transport::Transport;

type Replies = UnboundedSender<Result<Packet, Error>>;

enum Command<Endpoint> {
    Request {
        peer: Endpoint,
        packet: Packet,
        replies: Replies,
        started: oneshot::Sender<Result<RequestId, Error>>,
    },
    Cancel(RequestId),
    Respond {
        handle: Deferred<Endpoint>,
        response: Response,
    },
    Notify(String),
    Shutdown,
}

/// A request whose handler returned [`Outcome::Defer`](crate::Outcome::Defer).
#[derive(Debug)]
pub struct DeferredRequest<Endpoint> {
    pub handle: Deferred<Endpoint>,
    pub request: Packet,
}

/// Cloneable access to a running engine.
pub struct EndpointHandle<Endpoint> {
    commands: UnboundedSender<Command<Endpoint>>,
}

impl<Endpoint> Clone for EndpointHandle<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<Endpoint: Send + 'static> EndpointHandle<Endpoint> {
    fn send(&self, command: Command<Endpoint>) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Starts a request; responses, notifications and the failure, if any,
    /// arrive on the returned receiver.
    pub async fn start_request(
        &self,
        peer: Endpoint,
        packet: Packet,
    ) -> Result<(RequestId, UnboundedReceiver<Result<Packet, Error>>), Error> {
        let (replies, rx) = unbounded_channel();
        let (started, id) = oneshot::channel();
        self.send(Command::Request {
            peer,
            packet,
            replies,
            started,
        })?;
        let id = id.await.map_err(|_| Error::Closed)??;
        Ok((id, rx))
    }

    /// Sends a request and waits for its final response.
    pub async fn request(&self, peer: Endpoint, packet: Packet) -> Result<Packet, Error> {
        let (_, mut rx) = self.start_request(peer, packet).await?;
        rx.recv().await.unwrap_or(Err(Error::Closed))
    }

    /// Sends a registration (GET with Observe = 0) and streams what comes
    /// back. Dropping the stream cancels the observation.
    pub async fn observe(&self, peer: Endpoint, packet: Packet) -> Result<Observation<Endpoint>, Error> {
        let (id, rx) = self.start_request(peer, packet).await?;
        Ok(Observation {
            id,
            handle: self.clone(),
            stream: UnboundedReceiverStream::new(rx),
        })
    }

    pub fn cancel(&self, request: RequestId) -> Result<(), Error> {
        self.send(Command::Cancel(request))
    }

    /// Answers a deferred request with a separate response.
    pub fn respond(&self, handle: Deferred<Endpoint>, response: impl IntoResponse) -> Result<(), Error> {
        self.send(Command::Respond {
            handle,
            response: response.into_response(),
        })
    }

    /// Notifies the observers of `path`.
    pub fn notify(&self, path: &str) -> Result<(), Error> {
        self.send(Command::Notify(path.to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }
}

/// Notifications of one observation.
///
/// The stream ends after a response without Observe or a failure.
pub struct Observation<Endpoint: Send + 'static> {
    id: RequestId,
    handle: EndpointHandle<Endpoint>,
    stream: UnboundedReceiverStream<Result<Packet, Error>>,
}

impl<Endpoint: Send + 'static> Observation<Endpoint> {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl<Endpoint: Send + 'static> Stream for Observation<Endpoint> {
    type Item = Result<Packet, Error>;

    fn poll_next(mut self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(ctx)
    }
}

impl<Endpoint: Send + 'static> Drop for Observation<Endpoint> {
    fn drop(&mut self) {
        let _ = self.handle.cancel(self.id);
    }
}

/// Spawns the task driving `engine` over `transport`.
///
/// The task ends on [`EndpointHandle::shutdown`], when every handle is
/// dropped, or on a fatal transport error.
pub fn spawn<T: Transport>(
    transport: T,
    engine: Engine<T::Endpoint>,
) -> (
    EndpointHandle<T::Endpoint>,
    UnboundedReceiver<DeferredRequest<T::Endpoint>>,
    JoinHandle<IoResult<()>>,
) {
    let (commands_tx, commands) = unbounded_channel();
    let (deferred, deferred_rx) = unbounded_channel();
    let driver = Driver {
        transport,
        engine,
        commands,
        deferred,
        pending: HashMap::new(),
    };
    let task = tokio::spawn(driver.run());
    (
        EndpointHandle {
            commands: commands_tx,
        },
        deferred_rx,
        task,
    )
}

struct Driver<T: Transport> {
    transport: T,
    engine: Engine<T::Endpoint>,
    commands: UnboundedReceiver<Command<T::Endpoint>>,
    deferred: UnboundedSender<DeferredRequest<T::Endpoint>>,
    pending: HashMap<RequestId, Replies>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) -> IoResult<()> {
        debug!("Started driver on {:?}", self.transport.local_endpoint());
        let result = self.serve().await;
        for (_, replies) in self.pending.drain() {
            let _ = replies.send(Err(Error::Closed));
        }
        debug!("Stopped driver");
        result
    }

    async fn serve(&mut self) -> IoResult<()> {
        loop {
            self.flush().await;
            let deadline = self.engine.poll_timeout();
            tokio::select! {
                received = self.transport.recv() => match received {
                    Ok((peer, datagram)) => {
                        self.engine.handle_datagram(Instant::now(), peer, &datagram)
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                        debug!("Ignoring receive error: {}", e)
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        return Err(e);
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => return Ok(()),
                    Some(command) => self.handle_command(command),
                },
                _ = sleep(deadline) => self.engine.handle_timeout(Instant::now()),
            }
        }
    }

    async fn flush(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            self.dispatch(event);
        }
        while let Some(Transmit { peer, bytes }) = self.engine.poll_transmit() {
            if let Err(e) = self.transport.send(&peer, &bytes).await {
                error!("Error sending to {:?}: {}", peer, e);
            }
        }
    }

    fn handle_command(&mut self, command: Command<T::Endpoint>) {
        let now = Instant::now();
        match command {
            Command::Request {
                peer,
                packet,
                replies,
                started,
            } => match self.engine.send_request(now, peer, packet) {
                Ok(id) => {
                    self.pending.insert(id, replies);
                    let _ = started.send(Ok(id));
                }
                Err(e) => {
                    let _ = started.send(Err(e));
                }
            },
            Command::Cancel(id) => {
                self.pending.remove(&id);
                self.engine.cancel(now, id);
            }
            Command::Respond { handle, response } => {
                if let Err(e) = self.engine.respond(now, handle, response) {
                    warn!("Error sending separate response: {}", e);
                }
            }
            Command::Notify(path) => {
                let sent = self.engine.notify(now, &path);
                debug!("Notified {} observers of {}", sent, path);
            }
            Command::Shutdown => {}
        }
    }

    fn dispatch(&mut self, event: Event<T::Endpoint>) {
        match event {
            Event::Response {
                request, response, ..
            } => {
                if let Some(replies) = self.pending.remove(&request) {
                    let _ = replies.send(Ok(response));
                }
            }
            Event::Notification {
                request,
                notification,
                ..
            } => {
                let delivered = self
                    .pending
                    .get(&request)
                    .map_or(false, |replies| replies.send(Ok(notification)).is_ok());
                if !delivered {
                    self.pending.remove(&request);
                    self.engine.cancel(Instant::now(), request);
                }
            }
            Event::Failed { request, error, .. } => {
                if let Some(replies) = self.pending.remove(&request) {
                    let _ = replies.send(Err(error));
                }
            }
            Event::Deferred { handle, request } => {
                if let Err(unanswered) = self.deferred.send(DeferredRequest { handle, request }) {
                    let handle = unanswered.0.handle;
                    warn!("Nobody answers deferred requests, rejecting one from {:?}", handle.peer());
                    if let Err(e) = self.engine.respond(Instant::now(), handle, Status::ServiceUnavailable) {
                        warn!("Error sending separate response: {}", e);
                    }
                }
            }
        }
    }
}

async fn sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}
