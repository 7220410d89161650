//! Server side of block-wise transfers: Block1 reassembly and the Block2
//! response cache.
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::block::BlockValue;
use crate::error::SequencingError;
use crate::message::header::Method;
use crate::message::option::{encode_uint, CoapOption};
use crate::message::packet::Packet;

/// Identifies one transfer: who is sending what to where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey<Endpoint> {
    pub peer: Endpoint,
    pub method: Method,
    pub path: String,
}

impl<Endpoint: Clone> TransferKey<Endpoint> {
    pub fn new(peer: &Endpoint, method: Method, packet: &Packet) -> Self {
        Self {
            peer: peer.clone(),
            method,
            path: packet.get_path(),
        }
    }
}

#[derive(Debug)]
struct Upload {
    payload: Vec<u8>,
    last_block: BlockValue,
    expires: Instant,
}

#[derive(Debug)]
struct Download {
    response: Packet,
    expires: Instant,
}

/// What to do with an accepted Block1 block.
#[derive(Debug, PartialEq, Eq)]
pub enum Block1Progress {
    /// Acknowledge with 2.31 Continue carrying this Block1 value.
    Continue(BlockValue),
    /// The body is complete; the handler runs once with it.
    Complete { body: Vec<u8>, last_block: BlockValue },
}

pub struct BlockManager<Endpoint> {
    uploads: HashMap<TransferKey<Endpoint>, Upload>,
    downloads: HashMap<TransferKey<Endpoint>, Download>,
    max_body_size: usize,
    preferred_size: usize,
    lifetime: Duration,
}

impl<Endpoint: Clone + Eq + Hash> BlockManager<Endpoint> {
    pub fn new(preferred_size: usize, max_body_size: usize, lifetime: Duration) -> Self {
        Self {
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            max_body_size,
            preferred_size,
            lifetime,
        }
    }

    /// Accepts the next Block1 block of an upload.
    ///
    /// A block is taken only when its offset equals the bytes received so
    /// far. Any failure discards the transfer.
    pub fn receive_block1(
        &mut self,
        now: Instant,
        key: TransferKey<Endpoint>,
        block: BlockValue,
        payload: &[u8],
    ) -> Result<Block1Progress, SequencingError> {
        let result = self.accept_block1(now, &key, block, payload);
        if let Err(e) = &result {
            warn!("aborting block-wise upload to /{}: {}", key.path, e);
            self.uploads.remove(&key);
        }
        result
    }

    fn accept_block1(
        &mut self,
        now: Instant,
        key: &TransferKey<Endpoint>,
        block: BlockValue,
        payload: &[u8],
    ) -> Result<Block1Progress, SequencingError> {
        if block.more && payload.len() != block.size() {
            return Err(SequencingError::WrongSize {
                num: block.num,
                length: payload.len(),
                size: block.size(),
            });
        }
        if !block.more && payload.len() > block.size() {
            return Err(SequencingError::WrongSize {
                num: block.num,
                length: payload.len(),
                size: block.size(),
            });
        }

        if block.num == 0 {
            self.uploads.insert(
                key.clone(),
                Upload {
                    payload: Vec::new(),
                    last_block: block,
                    expires: now + self.lifetime,
                },
            );
        }
        let upload = self
            .uploads
            .get_mut(key)
            .filter(|u| u.expires > now)
            .ok_or(SequencingError::OutOfOrder {
                num: block.num,
                offset: block.offset(),
                expected: 0,
            })?;

        let repeat = block.num != 0
            && block == upload.last_block
            && block.offset() + payload.len() == upload.payload.len();
        if repeat {
            debug!("block {} of /{} received again", block.num, key.path);
            return Ok(Block1Progress::Continue(self.acknowledged(block)));
        }
        if block.offset() != upload.payload.len() {
            return Err(SequencingError::OutOfOrder {
                num: block.num,
                offset: block.offset(),
                expected: upload.payload.len(),
            });
        }
        if upload.payload.len() + payload.len() > self.max_body_size {
            return Err(SequencingError::TooLarge(self.max_body_size));
        }

        upload.payload.extend_from_slice(payload);
        upload.last_block = block;
        upload.expires = now + self.lifetime;

        if block.more {
            return Ok(Block1Progress::Continue(self.acknowledged(block)));
        }
        let body = self
            .uploads
            .remove(key)
            .map(|u| u.payload)
            .unwrap_or_default();
        debug!("block-wise upload to /{} complete, {} bytes", key.path, body.len());
        Ok(Block1Progress::Complete {
            body,
            last_block: block,
        })
    }

    /// The Block1 value echoed in a 2.31, suggesting a smaller size if ours is.
    fn acknowledged(&self, block: BlockValue) -> BlockValue {
        let size_exponent = BlockValue::new(0, false, self.preferred_size)
            .map(|b| b.size_exponent.min(block.size_exponent))
            .unwrap_or(block.size_exponent);
        BlockValue {
            num: block.num,
            more: true,
            size_exponent,
        }
    }

    /// Whether a response body must be served block-wise.
    pub fn needs_fragmenting(&self, response: &Packet, requested: Option<BlockValue>) -> bool {
        let limit = requested.map_or(self.preferred_size, |b| b.size().min(self.preferred_size));
        response.payload.len() > limit
    }

    /// Serves a later block of a cached response, or `None` on a cache miss.
    pub fn serve_cached(
        &mut self,
        now: Instant,
        key: &TransferKey<Endpoint>,
        block: BlockValue,
    ) -> Option<Packet> {
        let download = self.downloads.get(key).filter(|d| d.expires > now)?;
        let response = download.response.clone();
        self.fragment(now, key.clone(), response, block).ok()
    }

    /// Cuts the block named by `block` out of `response`, keeping the whole
    /// response cached while more blocks remain.
    ///
    /// When our preferred size is smaller than the requested one the block
    /// number is scaled so the reply starts at the requested byte offset.
    pub fn fragment(
        &mut self,
        now: Instant,
        key: TransferKey<Endpoint>,
        response: Packet,
        block: BlockValue,
    ) -> Result<Packet, SequencingError> {
        let size = block.size().min(self.preferred_size);
        let block = BlockValue::new(block.offset() / size, false, size)?;
        let Some((block, chunk)) = block.slice(&response.payload) else {
            self.downloads.remove(&key);
            return Err(SequencingError::InvalidBlockValue);
        };

        let mut packet = response.clone();
        packet.payload = chunk.to_vec();
        packet.set_option(CoapOption::Block2, block.to_option());
        if block.num == 0 {
            packet.set_option(CoapOption::Size2, encode_uint(response.payload.len() as u32));
        }

        if block.more {
            self.downloads.insert(
                key,
                Download {
                    response,
                    expires: now + self.lifetime,
                },
            );
        } else {
            self.downloads.remove(&key);
        }
        Ok(packet)
    }

    /// Drops contexts whose lifetime has passed.
    pub fn expire(&mut self, now: Instant) {
        let before = self.len();
        self.uploads.retain(|_, u| u.expires > now);
        self.downloads.retain(|_, d| d.expires > now);
        if self.len() != before {
            debug!("expired {} block-wise contexts", before - self.len());
        }
    }

    /// Number of live upload and download contexts.
    pub fn len(&self) -> usize {
        self.uploads.len() + self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
