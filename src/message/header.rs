use std::fmt;

/// Protocol version carried in every message.
pub const VERSION: u8 = 1;

/// Size of the fixed header that starts every message.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl From<u8> for MessageType {
    fn from(number: u8) -> MessageType {
        match number & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        })
    }
}

/// Request methods (code class 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Fetch,
    Patch,
    IPatch,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Fetch,
        Method::Patch,
        Method::IPatch,
    ];

    fn code(self) -> u8 {
        match self {
            Method::Get => 0x01,
            Method::Post => 0x02,
            Method::Put => 0x03,
            Method::Delete => 0x04,
            Method::Fetch => 0x05,
            Method::Patch => 0x06,
            Method::IPatch => 0x07,
        }
    }

    fn from_code(code: u8) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.code() == code)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Fetch => "FETCH",
            Method::Patch => "PATCH",
            Method::IPatch => "iPATCH",
        })
    }
}

/// Response codes (classes 2, 4 and 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    Conflict,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,
    UnprocessableEntity,
    TooManyRequests,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

impl Status {
    const TABLE: [(Status, u8); 26] = [
        (Status::Created, 0x41),
        (Status::Deleted, 0x42),
        (Status::Valid, 0x43),
        (Status::Changed, 0x44),
        (Status::Content, 0x45),
        (Status::Continue, 0x5F),
        (Status::BadRequest, 0x80),
        (Status::Unauthorized, 0x81),
        (Status::BadOption, 0x82),
        (Status::Forbidden, 0x83),
        (Status::NotFound, 0x84),
        (Status::MethodNotAllowed, 0x85),
        (Status::NotAcceptable, 0x86),
        (Status::RequestEntityIncomplete, 0x88),
        (Status::Conflict, 0x89),
        (Status::PreconditionFailed, 0x8C),
        (Status::RequestEntityTooLarge, 0x8D),
        (Status::UnsupportedContentFormat, 0x8F),
        (Status::UnprocessableEntity, 0x96),
        (Status::TooManyRequests, 0x9D),
        (Status::InternalServerError, 0xA0),
        (Status::NotImplemented, 0xA1),
        (Status::BadGateway, 0xA2),
        (Status::ServiceUnavailable, 0xA3),
        (Status::GatewayTimeout, 0xA4),
        (Status::ProxyingNotSupported, 0xA5),
    ];

    fn code(self) -> u8 {
        Self::TABLE
            .iter()
            .find(|(status, _)| *status == self)
            .map(|(_, code)| *code)
            .unwrap_or(0xA0)
    }

    fn from_code(code: u8) -> Option<Status> {
        Self::TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(status, _)| *status)
    }

    /// The code class: 2, 4 or 5.
    pub fn class(self) -> u8 {
        self.code() >> 5
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&MessageClass::Response(*self), f)
    }
}

/// The code byte of a message.
///
/// Codes without a named variant are kept as `Reserved` so that decoding
/// followed by encoding reproduces the original byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(Method),
    Response(Status),
    Reserved(u8),
}

impl MessageClass {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageClass::Request(_))
    }

    pub fn is_response(&self) -> bool {
        match self {
            MessageClass::Response(_) => true,
            MessageClass::Reserved(code) => matches!(code >> 5, 2 | 4 | 5),
            _ => false,
        }
    }
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> MessageClass {
        if code == 0 {
            return MessageClass::Empty;
        }
        if let Some(method) = Method::from_code(code) {
            return MessageClass::Request(method);
        }
        match Status::from_code(code) {
            Some(status) => MessageClass::Response(status),
            None => MessageClass::Reserved(code),
        }
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        match class {
            MessageClass::Empty => 0x00,
            MessageClass::Request(method) => method.code(),
            MessageClass::Response(status) => status.code(),
            MessageClass::Reserved(code) => code,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = u8::from(*self);
        write!(f, "{}.{:02}", code >> 5, code & 0x1F)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    version: u8,
    message_type: MessageType,
    pub code: MessageClass,
    pub message_id: u16,
}

impl Default for Header {
    fn default() -> Header {
        Header::new()
    }
}

impl Header {
    pub fn new() -> Header {
        Header {
            version: VERSION,
            message_type: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: 0,
        }
    }

    /// Splits the four fixed bytes into the header and the token length.
    pub fn from_raw(raw: [u8; HEADER_SIZE]) -> (Header, u8) {
        let header = Header {
            version: raw[0] >> 6,
            message_type: MessageType::from((raw[0] >> 4) & 0x03),
            code: MessageClass::from(raw[1]),
            message_id: u16::from_be_bytes([raw[2], raw[3]]),
        };
        (header, raw[0] & 0x0F)
    }

    pub fn to_raw(&self, token_length: u8) -> [u8; HEADER_SIZE] {
        let [mid_high, mid_low] = self.message_id.to_be_bytes();
        [
            (self.version & 0x03) << 6 | u8::from(self.message_type) << 4 | (token_length & 0x0F),
            u8::from(self.code),
            mid_high,
            mid_low,
        ]
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.version = v;
    }

    #[inline]
    pub fn get_version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn set_type(&mut self, t: MessageType) {
        self.message_type = t;
    }

    #[inline]
    pub fn get_type(&self) -> MessageType {
        self.message_type
    }

    /// Sets the code from its dotted form, e.g. `"2.05"`.
    pub fn set_code(&mut self, code: &str) -> Option<()> {
        let (class, detail) = code.split_once('.')?;
        let class = class.parse::<u8>().ok().filter(|c| *c <= 7)?;
        let detail = detail.parse::<u8>().ok().filter(|d| *d <= 31)?;
        self.code = MessageClass::from(class << 5 | detail);
        Some(())
    }

    pub fn get_code(&self) -> String {
        self.code.to_string()
    }
}
