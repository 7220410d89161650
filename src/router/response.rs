use crate::message::header::{MessageClass, Status};
use crate::message::option::{encode_uint, CoapOption, ContentFormat};
use crate::message::packet::Packet;
use std::convert::Infallible;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub response_type: Option<Status>,
    pub payload: Option<Vec<u8>>,
    pub content_format: Option<ContentFormat>,
    pub options: Vec<(CoapOption, Vec<u8>)>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response_type(mut self, response_type: Status) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn set_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn set_content_format(mut self, content_format: ContentFormat) -> Self {
        self.content_format = Some(content_format);
        self
    }

    pub fn add_option(mut self, option: CoapOption, value: Vec<u8>) -> Self {
        self.options.push((option, value));
        self
    }

    pub fn set_max_age(self, seconds: u32) -> Self {
        self.add_option(CoapOption::MaxAge, encode_uint(seconds))
    }

    /// The status sent on the wire; 2.05 Content when unset.
    pub fn status(&self) -> Status {
        self.response_type.unwrap_or(Status::Content)
    }

    /// Writes code, payload and options into an outgoing packet.
    pub fn fill_response(self, packet: &mut Packet) {
        packet.header.code = MessageClass::Response(self.status());
        if let Some(payload) = self.payload {
            packet.payload = payload;
        }
        if let Some(content_format) = self.content_format {
            packet.set_content_format(content_format);
        }
        for (option, value) in self.options {
            packet.add_option(option, value);
        }
    }
}

/// Trait for generating responses.
///
/// Types that implement `IntoResponse` can be returned from handlers.
pub trait IntoResponse {
    /// Create a response.
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Response {
        Response::new()
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> Response {
        match self {}
    }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        Response::new().set_response_type(self)
    }
}

impl<T: IntoResponse> IntoResponse for (Status, T) {
    fn into_response(self) -> Response {
        self.1.into_response().set_response_type(self.0)
    }
}

impl<T: IntoResponse, E: IntoResponse> IntoResponse for Result<T, E> {
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(err) => err.into_response(),
        }
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::new().set_payload(self)
    }
}

impl<const N: usize> IntoResponse for &[u8; N] {
    fn into_response(self) -> Response {
        self.to_vec().into_response()
    }
}

impl IntoResponse for &[u8] {
    fn into_response(self) -> Response {
        self.to_vec().into_response()
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        self.into_bytes().into_response()
    }
}

impl IntoResponse for &str {
    fn into_response(self) -> Response {
        self.as_bytes().into_response()
    }
}

impl<T: IntoResponse> IntoResponse for Box<T> {
    fn into_response(self) -> Response {
        (*self).into_response()
    }
}

/// What a handler decided to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Respond(Response),
    /// Answer later through the engine's `respond`; a confirmable request is
    /// acknowledged right away.
    Defer,
}

impl<T: IntoResponse> From<T> for Outcome {
    fn from(response: T) -> Outcome {
        Outcome::Respond(response.into_response())
    }
}
