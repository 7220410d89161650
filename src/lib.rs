//! Implementation of the [CoAP Protocol][spec] as a sans-IO engine with a
//! tokio runtime around it.
//!
//! The [`Engine`] holds all protocol state: message deduplication,
//! retransmission with exponential back-off, the resource tree, Observe and
//! block-wise transfers. It is driven by feeding it datagrams and timer
//! expiries. [`Server`] and [`UdpCoAPClient`] run it over UDP.
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Resource discovery in CoRE Link Format [RFC 6690](https://tools.ietf.org/html/rfc6690)
//! - No-Response option [RFC 7967](https://tools.ietf.org/html/rfc7967)
//! - Custom transports through the [`Transport`] trait
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coap_engine::{Request, Resource, Router, Server, Status};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new();
//!     router.add(
//!         "temp",
//!         Resource::new()
//!             .get(|_: &Request<SocketAddr>| "23.5")
//!             .put(|request: &Request<SocketAddr>| {
//!                 println!("new value {:?}", request.payload());
//!                 Status::Changed
//!             })
//!             .observable(true),
//!     );
//!
//!     let server = Server::new_udp("127.0.0.1:5683", router).await.unwrap();
//!     println!("Server up on {}", server.local_addr());
//!     server.run().await.unwrap();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coap_engine::UdpCoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = UdpCoAPClient::new_udp("127.0.0.1:5683").await.unwrap();
//!     let response = client.get("temp").await.unwrap();
//!     println!("Server reply: {}", String::from_utf8_lossy(&response.payload));
//! }
//! ```
//!
//! [spec]: https://tools.ietf.org/html/rfc7252

#[cfg(test)]
extern crate quickcheck;

pub use self::block::BlockValue;
pub use self::client::{RequestOptions, UdpCoAPClient};
pub use self::config::{Config, TransmissionParameters};
pub use self::driver::{DeferredRequest, EndpointHandle, Observation};
pub use self::engine::{Deferred, Engine, Event, RequestId, Transmit};
pub use self::error::{Error, Result};
pub use self::message::header::{MessageClass, MessageType, Method, Status};
pub use self::message::option::{CoapOption, ContentFormat};
pub use self::message::packet::Packet;
pub use self::message::Codec;
pub use self::observer::{ObserveOption, Observer};
pub use self::request::RequestBuilder;
pub use self::router::{IntoResponse, Outcome, Request, Resource, Response, Router, WELL_KNOWN_CORE};
pub use self::server::Server;
pub use self::transport::{Transport, UdpTransport};

pub mod block;
pub mod block_transfer;
pub mod client;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod message;
pub mod observer;
pub mod request;
pub mod router;
pub mod server;
pub mod transaction;
pub mod transport;
