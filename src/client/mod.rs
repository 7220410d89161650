use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use percent_encoding::percent_decode_str;
use regex::Regex;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;
use tokio::time;
use url::{Host, Url};

use crate::config::{Config, TransmissionParameters};
use crate::driver::{self, EndpointHandle, Observation};
use crate::engine::Engine;
use crate::message::header::{MessageClass, MessageType, Method};
use crate::message::option::CoapOption;
use crate::message::packet::Packet;
use crate::observer::ObserveOption;
use crate::request::RequestBuilder;
use crate::transport::UdpTransport;

pub const DEFAULT_PORT: u16 = 5683;

/// RequestOptions for configuring CoAP client requests
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Send requests as confirmable messages
    pub confirmable: bool,
    /// Give up waiting for a response after this long
    pub timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            confirmable: true,
            timeout: TransmissionParameters::default().max_transmit_wait(),
        }
    }
}

/// A CoAP client talking to one peer over UDP.
pub struct UdpCoAPClient {
    peer_addr: SocketAddr,
    handle: EndpointHandle<SocketAddr>,
    task: JoinHandle<Result<()>>,
    options: RequestOptions,
}

impl UdpCoAPClient {
    pub async fn new_udp<A: ToSocketAddrs>(peer_addr: A) -> Result<Self> {
        Self::with_config(peer_addr, Config::default()).await
    }

    pub async fn with_config<A: ToSocketAddrs>(peer_addr: A, config: Config) -> Result<Self> {
        let engine = Engine::new(config)?;
        let (transport, peer_addr) = UdpTransport::for_peer(peer_addr).await?;
        let (handle, _deferred, task) = driver::spawn(transport, engine);
        debug!("CoAP client for {}", peer_addr);
        Ok(Self {
            peer_addr,
            handle,
            task,
            options: RequestOptions::default(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_request_options(&mut self, options: RequestOptions) {
        self.options = options;
    }

    pub fn request_options(&self) -> &RequestOptions {
        &self.options
    }

    /// Convenience method to perform a Get request
    pub async fn get(&self, path: &str) -> Result<Packet> {
        self.request_path(path, Method::Get, None).await
    }

    /// Convenience method to perform a Post request
    pub async fn post(&self, path: &str, data: Vec<u8>) -> Result<Packet> {
        self.request_path(path, Method::Post, Some(data)).await
    }

    /// Convenience method to perform a Put request
    pub async fn put(&self, path: &str, data: Vec<u8>) -> Result<Packet> {
        self.request_path(path, Method::Put, Some(data)).await
    }

    /// Convenience method to perform a Delete request
    pub async fn delete(&self, path: &str) -> Result<Packet> {
        self.request_path(path, Method::Delete, None).await
    }

    async fn request_path(&self, path: &str, method: Method, data: Option<Vec<u8>>) -> Result<Packet> {
        let request = RequestBuilder::new(path, method)
            .data(data)
            .confirmable(self.options.confirmable)
            .build();
        self.send(request).await
    }

    /// Sends a request and waits for the response, reassembled if the
    /// server sent it block-wise.
    pub async fn send(&self, request: Packet) -> Result<Packet> {
        let (id, mut rx) = self.handle.start_request(self.peer_addr, request).await?;
        match time::timeout(self.options.timeout, rx.recv()).await {
            Ok(Some(response)) => Ok(response?),
            Ok(None) => Err(crate::error::Error::Closed.into()),
            Err(_) => {
                warn!("request {} to {} timed out", id, self.peer_addr);
                let _ = self.handle.cancel(id);
                Err(Error::new(ErrorKind::TimedOut, "no response"))
            }
        }
    }

    /// Start observation on a resource. The registration response is the
    /// first item of the stream.
    pub async fn observe(&self, path: &str) -> Result<Observation<SocketAddr>> {
        let request = RequestBuilder::new(path, Method::Get)
            .observe(Some(ObserveOption::Register.into()))
            .confirmable(self.options.confirmable)
            .build();
        Ok(self.handle.observe(self.peer_addr, request).await?)
    }

    /// Stops the client's background task.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown();
        self.task.await.map_err(|e| Error::new(ErrorKind::Other, e))?
    }

    /// Performs a single request to a `coap://` URL.
    pub async fn request_url(url: &str, method: Method, data: Option<Vec<u8>>) -> Result<Packet> {
        let (scheme, host, port, _) = parse_coap_url(url)?;
        if scheme != "coap" {
            return Err(Error::new(ErrorKind::Unsupported, format!("unsupported scheme {}", scheme)));
        }
        let request = request_for_url(url, method, data)?;
        let client = Self::new_udp((host.as_str(), port)).await?;
        let response = client.send(request).await;
        client.handle.shutdown();
        response
    }
}

/// Builds a confirmable request for a `coap://` URL (RFC 7252 §6.4).
///
/// A host name becomes Uri-Host, while IP literals are left out. The port is
/// always the request's destination port, so Uri-Port is never needed. Path
/// segments and `&`-separated query arguments are percent-decoded into
/// Uri-Path and Uri-Query.
pub fn request_for_url(url: &str, method: Method, data: Option<Vec<u8>>) -> Result<Packet> {
    let url = Url::parse(url).map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
    let mut request = Packet::new();
    request.header.set_type(MessageType::Confirmable);
    request.header.code = MessageClass::Request(method);
    // coap is not a special scheme, so the url crate leaves IPv4 hosts opaque
    if let Some(Host::Domain(name)) = url.host() {
        if name.parse::<Ipv4Addr>().is_err() {
            request.add_option(CoapOption::UriHost, name.to_ascii_lowercase().into_bytes());
        }
    }
    for segment in path_segments(url.path()) {
        request.add_option(CoapOption::UriPath, segment);
    }
    for argument in url.query().unwrap_or_default().split('&').filter(|q| !q.is_empty()) {
        request.add_option(CoapOption::UriQuery, percent_decode_str(argument).collect());
    }
    if let Some(data) = data {
        request.payload = data;
    }
    Ok(request)
}

/// Splits a URL path into percent-decoded Uri-Path values.
pub fn path_segments(path: &str) -> Vec<Vec<u8>> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).collect())
        .collect()
}

pub fn parse_coap_url(url: &str) -> Result<(String, String, u16, String)> {
    let url_params = match Url::parse(url) {
        Ok(url_params) => url_params,
        Err(_) => return Err(Error::new(ErrorKind::InvalidInput, "url error")),
    };

    let scheme = url_params.scheme().to_string();

    let host = match url_params.host_str() {
        Some("") => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
        Some(h) => h,
        None => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
    };
    let brackets = Regex::new(r"^\[(.*?)]$").map_err(|e| Error::new(ErrorKind::Other, e))?;
    let host = brackets.replace(host, "$1").to_string();

    let port = url_params.port().unwrap_or(DEFAULT_PORT);

    let path = url_params.path().to_string();

    Ok((scheme, host, port, path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_coap_url_good_url() {
        assert!(parse_coap_url("coap://127.0.0.1").is_ok());
        assert!(parse_coap_url("coap://127.0.0.1:5683").is_ok());
        assert!(parse_coap_url("coap://[::1]").is_ok());
        assert!(parse_coap_url("coap://[::1]:5683").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]:5683").is_ok());
    }

    #[test]
    fn test_parse_coap_url_bad_url() {
        assert!(parse_coap_url("coap://127.0.0.1:65536").is_err());
        assert!(parse_coap_url("coap://").is_err());
        assert!(parse_coap_url("coap://:5683").is_err());
        assert!(parse_coap_url("127.0.0.1").is_err());
    }

    #[test]
    fn test_parse_coap_url_parts() {
        let (scheme, host, port, path) =
            parse_coap_url("coap://[::1]:5684/sensors/temp").unwrap();
        assert_eq!(scheme, "coap");
        assert_eq!(host, "::1");
        assert_eq!(port, 5684);
        assert_eq!(path, "/sensors/temp");
        assert_eq!(parse_coap_url("coap://localhost").unwrap().2, DEFAULT_PORT);
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(
            path_segments("/a%20b//c/"),
            vec![b"a b".to_vec(), b"c".to_vec()]
        );
        assert!(path_segments("/").is_empty());
    }

    #[test]
    fn test_request_for_url() {
        let request =
            request_for_url("coap://Sensor.example:61616/a%2Fb/temp?unit=%C2%B0C&&x", Method::Get, None)
                .unwrap();
        assert_eq!(request.header.get_type(), MessageType::Confirmable);
        assert_eq!(request.header.code, MessageClass::Request(Method::Get));
        assert_eq!(
            request.get_first_option(CoapOption::UriHost),
            Some(&b"sensor.example"[..])
        );
        assert!(request.get_option(CoapOption::UriPort).is_none());
        assert_eq!(
            request.get_option(CoapOption::UriPath).unwrap(),
            &[b"a/b".to_vec(), b"temp".to_vec()][..]
        );
        assert_eq!(
            request.get_option(CoapOption::UriQuery).unwrap(),
            &["unit=°C".as_bytes().to_vec(), b"x".to_vec()][..]
        );

        let request = request_for_url("coap://[::1]/", Method::Put, Some(b"on".to_vec())).unwrap();
        assert!(request.get_option(CoapOption::UriHost).is_none());
        assert!(request.get_option(CoapOption::UriPath).is_none());
        assert_eq!(request.payload, b"on".to_vec());
        let request = request_for_url("coap://127.0.0.1/x", Method::Get, None).unwrap();
        assert!(request.get_option(CoapOption::UriHost).is_none());
        assert!(request_for_url("not a url", Method::Get, None).is_err());
    }
}
