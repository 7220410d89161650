use std::io::{Error, ErrorKind, Result as IoResult};
use std::net::SocketAddr;

use log::debug;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::driver::{self, DeferredRequest, EndpointHandle};
use crate::engine::Engine;
use crate::router::Router;
use crate::transport::UdpTransport;

/// A CoAP server on a UDP socket.
///
/// The server starts on construction; [`Server::run`] waits for it to stop.
pub struct Server {
    local_addr: SocketAddr,
    router: Router<SocketAddr>,
    handle: EndpointHandle<SocketAddr>,
    deferred: Option<UnboundedReceiver<DeferredRequest<SocketAddr>>>,
    task: JoinHandle<IoResult<()>>,
}

impl Server {
    /// Creates a CoAP server listening on the given address.
    pub async fn new_udp<A: ToSocketAddrs>(addr: A, router: Router<SocketAddr>) -> IoResult<Self> {
        Self::with_config(addr, router, Config::default()).await
    }

    pub async fn with_config<A: ToSocketAddrs>(
        addr: A,
        router: Router<SocketAddr>,
        config: Config,
    ) -> IoResult<Self> {
        let engine = Engine::with_router(config, router.clone())?;
        let transport = UdpTransport::bind(addr).await?;
        let local_addr = transport.local_addr()?;
        let (handle, deferred, task) = driver::spawn(transport, engine);
        debug!("CoAP server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            router,
            handle,
            deferred: Some(deferred),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Router<SocketAddr> {
        &self.router
    }

    /// A handle for notifying observers and answering deferred requests
    /// from other tasks.
    pub fn handle(&self) -> EndpointHandle<SocketAddr> {
        self.handle.clone()
    }

    /// Notifies every observer of `path` with its current representation.
    pub fn notify(&self, path: &str) -> IoResult<()> {
        Ok(self.handle.notify(path)?)
    }

    /// Takes the stream of requests whose handlers deferred their answer.
    /// Answer each through [`EndpointHandle::respond`].
    pub fn take_deferred(&mut self) -> Option<UnboundedReceiver<DeferredRequest<SocketAddr>>> {
        self.deferred.take()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Waits until the server is shut down or its socket fails.
    ///
    /// Deferred requests are rejected with 5.03 unless their stream was
    /// taken first.
    pub async fn run(self) -> IoResult<()> {
        let Server {
            handle, deferred, task, ..
        } = self;
        drop(deferred);
        let result = task.await.map_err(|e| Error::new(ErrorKind::Other, e))?;
        drop(handle);
        result
    }
}
