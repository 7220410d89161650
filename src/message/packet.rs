use std::fmt;

use super::header::{Header, MessageClass, MessageType, HEADER_SIZE, VERSION};
use super::option::{encode_uint, write_hex, CoapOption, ContentFormat, OptionTable};
use crate::error::{EncodingError, FormatError};

/// Default datagram size limit (RFC 7252 §4.6).
pub const MAX_MESSAGE_SIZE: usize = 1152;

pub const MAX_TOKEN_LENGTH: usize = 8;

const PAYLOAD_MARKER: u8 = 0xFF;

/// Longest text payload [`Packet`]'s `Display` shows inline.
const PAYLOAD_PREVIEW: usize = 64;

/// A CoAP message: header, token, options and payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    token: Vec<u8>,
    options: OptionTable,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    /// An empty acknowledgement for `message_id`.
    pub fn empty_ack(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Acknowledgement);
        packet.header.message_id = message_id;
        packet
    }

    /// A reset for `message_id`.
    pub fn reset(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Reset);
        packet.header.message_id = message_id;
        packet
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    pub fn options(&self) -> &OptionTable {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut OptionTable {
        &mut self.options
    }

    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.add(tp, value);
    }

    pub fn set_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.set(tp, value);
    }

    pub fn get_option(&self, tp: CoapOption) -> Option<&[Vec<u8>]> {
        self.options.get(tp)
    }

    pub fn get_first_option(&self, tp: CoapOption) -> Option<&[u8]> {
        self.options.get_first(tp)
    }

    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(tp);
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_option(CoapOption::ContentFormat, encode_uint(u16::from(cf).into()));
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        self.options
            .get_uint(CoapOption::ContentFormat)
            .and_then(|v| u16::try_from(v).ok())
            .map(ContentFormat::from)
    }

    pub fn set_observe_value(&mut self, value: u32) {
        self.set_option(CoapOption::Observe, encode_uint(value & 0xFF_FFFF));
    }

    pub fn get_observe_value(&self) -> Option<u32> {
        self.options.get_uint(CoapOption::Observe)
    }

    /// Replaces the Uri-Path options with the segments of `path`.
    pub fn set_path(&mut self, path: &str) {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
            .collect();
        self.options.set_all(CoapOption::UriPath, segments);
    }

    /// The Uri-Path segments joined with `/`, without a leading slash.
    pub fn get_path(&self) -> String {
        self.options
            .get(CoapOption::UriPath)
            .unwrap_or_default()
            .iter()
            .map(|s| String::from_utf8_lossy(s))
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_empty_message(&self) -> bool {
        self.header.code == MessageClass::Empty
    }

    /// Decodes a byte slice and constructs the equivalent Packet.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, FormatError> {
        let raw: [u8; HEADER_SIZE] = buf
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(FormatError::TruncatedHeader)?;
        let (header, token_length) = Header::from_raw(raw);
        if header.get_version() != VERSION {
            return Err(FormatError::InvalidVersion(header.get_version()));
        }
        if token_length as usize > MAX_TOKEN_LENGTH {
            return Err(FormatError::InvalidTokenLength(token_length));
        }
        if header.code == MessageClass::Empty {
            if buf.len() != HEADER_SIZE || token_length != 0 {
                return Err(FormatError::MalformedEmptyMessage);
            }
            return Ok(Packet {
                header,
                ..Packet::default()
            });
        }

        let options_start = HEADER_SIZE + token_length as usize;
        let token = buf
            .get(HEADER_SIZE..options_start)
            .ok_or(FormatError::TruncatedToken)?
            .to_vec();

        let mut idx = options_start;
        let mut number: u32 = 0;
        let mut options = OptionTable::new();
        let mut payload = Vec::new();
        while idx < buf.len() {
            let byte = buf[idx];
            idx += 1;
            if byte == PAYLOAD_MARKER {
                if idx == buf.len() {
                    return Err(FormatError::EmptyPayload);
                }
                payload = buf[idx..].to_vec();
                break;
            }

            let delta = read_extended(buf, &mut idx, byte >> 4)
                .map_err(|e| e.unwrap_or(FormatError::InvalidOptionDelta))?;
            let length = read_extended(buf, &mut idx, byte & 0x0F)
                .map_err(|e| e.unwrap_or(FormatError::InvalidOptionLength))?;

            number += delta;
            let option_number =
                u16::try_from(number).map_err(|_| FormatError::OptionNumberOverflow)?;

            let end = idx
                .checked_add(length as usize)
                .filter(|end| *end <= buf.len())
                .ok_or(FormatError::TruncatedOption)?;
            options
                .push_decoded(option_number, buf[idx..end].to_vec())
                .map_err(FormatError::RepeatedOption)?;
            idx = end;
        }

        Ok(Packet {
            header,
            token,
            options,
            payload,
        })
    }

    /// Returns the wire bytes, bounded by [`MAX_MESSAGE_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        self.to_bytes_with_limit(MAX_MESSAGE_SIZE)
    }

    pub fn to_bytes_with_limit(&self, limit: usize) -> Result<Vec<u8>, EncodingError> {
        if self.header.get_version() != VERSION {
            return Err(EncodingError::InvalidVersion(self.header.get_version()));
        }
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(EncodingError::InvalidTokenLength(self.token.len()));
        }
        if self.is_empty_message()
            && !(self.token.is_empty() && self.options.is_empty() && self.payload.is_empty())
        {
            return Err(EncodingError::NonEmptyEmptyMessage);
        }
        self.options.validate()?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.token.len() + self.payload.len() + 16);
        buf.extend_from_slice(&self.header.to_raw(self.token.len() as u8));
        buf.extend_from_slice(&self.token);

        let mut last_number = 0u16;
        for (number, value) in self.options.iter() {
            let delta = number - last_number;
            if value.len() > 269 + u16::MAX as usize {
                return Err(EncodingError::InvalidOptionLength {
                    number,
                    length: value.len(),
                });
            }

            let (delta_nibble, delta_ext) = extended(delta as usize);
            let (length_nibble, length_ext) = extended(value.len());
            buf.push(delta_nibble << 4 | length_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&length_ext);
            buf.extend_from_slice(value);
            last_number = number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }

        if buf.len() > limit {
            return Err(EncodingError::MessageTooLarge {
                size: buf.len(),
                limit,
            });
        }
        Ok(buf)
    }
}

impl fmt::Display for Packet {
    /// One line for logs: `CON 0.01 mid 10 token 0xabb4 [Uri-Path: "temp"] 4 bytes "23.5"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mid {}",
            self.header.get_type(),
            self.header.code,
            self.header.message_id
        )?;
        if !self.token.is_empty() {
            f.write_str(" token ")?;
            write_hex(f, &self.token)?;
        }
        if !self.options.is_empty() {
            write!(f, " [{}]", self.options)?;
        }
        if !self.payload.is_empty() {
            write!(f, " {} bytes", self.payload.len())?;
            match std::str::from_utf8(&self.payload) {
                Ok(text) if text.len() <= PAYLOAD_PREVIEW => write!(f, " {:?}", text)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Reads the extension bytes announced by a delta or length nibble.
///
/// `Err(None)` reports the reserved nibble 15, leaving the caller to name it.
fn read_extended(buf: &[u8], idx: &mut usize, nibble: u8) -> Result<u32, Option<FormatError>> {
    match nibble {
        13 => {
            let b = *buf.get(*idx).ok_or(Some(FormatError::TruncatedOption))?;
            *idx += 1;
            Ok(u32::from(b) + 13)
        }
        14 => {
            let b = buf
                .get(*idx..*idx + 2)
                .ok_or(Some(FormatError::TruncatedOption))?;
            *idx += 2;
            Ok(u32::from(u16::from_be_bytes([b[0], b[1]])) + 269)
        }
        15 => Err(None),
        n => Ok(u32::from(n)),
    }
}

/// Splits a delta or length into its nibble and extension bytes.
fn extended(value: usize) -> (u8, Vec<u8>) {
    if value <= 12 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}
