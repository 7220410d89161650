pub mod header;
pub mod option;
pub mod packet;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use packet::{Packet, MAX_MESSAGE_SIZE};

/// Frames whole datagrams as packets, for use with `tokio_util::udp::UdpFramed`.
pub struct Codec {
    max_message_size: usize,
}

impl Codec {
    pub fn new() -> Codec {
        Codec::with_limit(MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(max_message_size: usize) -> Codec {
        Codec { max_message_size }
    }
}

impl Default for Codec {
    fn default() -> Codec {
        Codec::new()
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split();
        Ok(Some(Packet::from_bytes(&datagram)?))
    }
}

impl Encoder<Packet> for Codec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(&packet.to_bytes_with_limit(self.max_message_size)?);
        Ok(())
    }
}
