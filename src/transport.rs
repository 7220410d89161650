//! Datagram transports the runtime drives an [`Engine`](crate::engine::Engine)
//! over.
use std::fmt::Debug;
use std::hash::Hash;
use std::io::{Error, ErrorKind, Result as IoResult};
use std::net::SocketAddr;

use async_trait::async_trait;
use log::{debug, error, trace};
use tokio::net::{ToSocketAddrs, UdpSocket};

/// Largest datagram accepted from the network. Longer ones are dropped
/// rather than handed on truncated.
pub const COAP_MTU: usize = 1600;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Endpoint: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    async fn send(&self, peer: &Self::Endpoint, bytes: &[u8]) -> IoResult<usize>;
    async fn recv(&self) -> IoResult<(Self::Endpoint, Vec<u8>)>;
    fn local_endpoint(&self) -> IoResult<Self::Endpoint>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> IoResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            error!("Error binding local socket: {:?}", e);
            e
        })?;
        debug!("Bound to socket: {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Binds an ephemeral port of the same IP family as `peer`.
    pub async fn for_peer<A: ToSocketAddrs>(peer: A) -> IoResult<(Self, SocketAddr)> {
        let peer = tokio::net::lookup_host(peer).await?.next().ok_or_else(|| {
            error!("No peer address found");
            Error::new(ErrorKind::NotFound, "no peer address found")
        })?;
        let bind_addr = match peer {
            SocketAddr::V6(_) => ":::0",
            SocketAddr::V4(_) => "0.0.0.0:0",
        };
        Ok((Self::bind(bind_addr).await?, peer))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    type Endpoint = SocketAddr;

    async fn send(&self, peer: &SocketAddr, bytes: &[u8]) -> IoResult<usize> {
        trace!("Transmit data: {:02x?} to {}", bytes, peer);
        self.socket.send_to(bytes, peer).await
    }

    async fn recv(&self) -> IoResult<(SocketAddr, Vec<u8>)> {
        // one spare byte tells an oversized datagram from one of exactly COAP_MTU
        let mut buf = vec![0u8; COAP_MTU + 1];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            if n > COAP_MTU {
                debug!("Dropping datagram of more than {} bytes from {}", COAP_MTU, peer);
                continue;
            }
            trace!("Received data: {:02x?} from {}", &buf[..n], peer);
            buf.truncate(n);
            return Ok((peer, buf));
        }
    }

    fn local_endpoint(&self) -> IoResult<SocketAddr> {
        self.socket.local_addr()
    }
}
