use crate::message::header::{MessageClass, Method};
use crate::message::option::CoapOption;
use crate::message::packet::Packet;
use crate::observer::ObserveOption;

/// A request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request<Endpoint> {
    pub source: Endpoint,
    pub message: Packet,
}

impl<Endpoint> Request<Endpoint> {
    pub fn new(source: Endpoint, message: Packet) -> Self {
        Self { source, message }
    }

    pub fn method(&self) -> Option<Method> {
        match self.message.header.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    pub fn path_as_vec(&self) -> Vec<String> {
        self.message
            .get_option(CoapOption::UriPath)
            .unwrap_or_default()
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    pub fn path(&self) -> String {
        self.path_as_vec().join("/")
    }

    pub fn query_as_vec(&self) -> Vec<String> {
        let mut vec = Vec::new();
        if let Some(options) = self.message.get_option(CoapOption::UriQuery) {
            for option in options.iter() {
                if let Ok(seg) = core::str::from_utf8(option) {
                    vec.push(seg.to_string());
                }
            }
        };
        vec
    }

    pub fn query(&self) -> String {
        self.query_as_vec().join("&")
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn token(&self) -> &[u8] {
        self.message.get_token()
    }

    /// The Observe option of the request, `Err` for values other than 0 or 1.
    pub fn observe_flag(&self) -> Option<Result<ObserveOption, u32>> {
        self.message
            .get_observe_value()
            .map(ObserveOption::try_from)
    }
}
