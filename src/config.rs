//! Transmission parameters (RFC 7252 §4.8) and engine limits.
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::packet::MAX_MESSAGE_SIZE;
use crate::transport::COAP_MTU;

const MAX_ACK_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ACK_RANDOM_FACTOR: f64 = 16.0;
const MAX_RETRANSMIT_LIMIT: u32 = 20;
const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// The protocol's timing knobs and the lifetimes derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParameters {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    pub nstart: usize,
    pub default_leisure: Duration,
    /// Bytes per second towards a peer that does not respond.
    pub probing_rate: u32,
    pub max_latency: Duration,
    exchange_lifetime: Option<Duration>,
    non_lifetime: Option<Duration>,
}

impl Default for TransmissionParameters {
    fn default() -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_secs(5),
            probing_rate: 1,
            max_latency: Duration::from_secs(100),
            exchange_lifetime: None,
            non_lifetime: None,
        }
    }
}

impl TransmissionParameters {
    pub fn set_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn set_ack_random_factor(mut self, factor: f64) -> Self {
        self.ack_random_factor = factor;
        self
    }

    pub fn set_max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }

    pub fn set_nstart(mut self, nstart: usize) -> Self {
        self.nstart = nstart;
        self
    }

    pub fn set_exchange_lifetime(mut self, lifetime: Duration) -> Self {
        self.exchange_lifetime = Some(lifetime);
        self
    }

    pub fn set_non_lifetime(mut self, lifetime: Duration) -> Self {
        self.non_lifetime = Some(lifetime);
        self
    }

    /// `ACK_TIMEOUT * (2^MAX_RETRANSMIT - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_span(&self) -> Duration {
        self.ack_timeout
            .mul_f64(self.backoff_sum(self.max_retransmit) * self.ack_random_factor)
    }

    /// `ACK_TIMEOUT * (2^(MAX_RETRANSMIT + 1) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_wait(&self) -> Duration {
        self.ack_timeout
            .mul_f64(self.backoff_sum(self.max_retransmit + 1) * self.ack_random_factor)
    }

    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_rtt(&self) -> Duration {
        2 * self.max_latency + self.processing_delay()
    }

    /// How long a confirmable message ID stays in the deduplication cache.
    pub fn exchange_lifetime(&self) -> Duration {
        self.exchange_lifetime.unwrap_or_else(|| {
            self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
        })
    }

    /// How long a non-confirmable message ID stays in the deduplication cache.
    pub fn non_lifetime(&self) -> Duration {
        self.non_lifetime
            .unwrap_or_else(|| self.max_transmit_span() + self.max_latency)
    }

    fn backoff_sum(&self, exponent: u32) -> f64 {
        2f64.powi(exponent as i32) - 1.0
    }

    /// Checks every value, bounding the ones the back-off arithmetic grows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::AckTimeout);
        }
        if self.ack_timeout > MAX_ACK_TIMEOUT {
            return Err(ConfigError::AckTimeoutTooLarge(self.ack_timeout));
        }
        if !(1.0..=MAX_ACK_RANDOM_FACTOR).contains(&self.ack_random_factor) {
            return Err(ConfigError::AckRandomFactor(self.ack_random_factor));
        }
        if self.max_retransmit > MAX_RETRANSMIT_LIMIT {
            return Err(ConfigError::MaxRetransmit(self.max_retransmit));
        }
        if self.nstart == 0 {
            return Err(ConfigError::Nstart);
        }
        let lifetimes = [Some(self.max_latency), self.exchange_lifetime, self.non_lifetime];
        if let Some(lifetime) = lifetimes.into_iter().flatten().find(|l| *l > MAX_LIFETIME) {
            return Err(ConfigError::Lifetime(lifetime));
        }
        Ok(())
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub transmission: TransmissionParameters,
    /// Largest datagram the engine will emit.
    pub max_message_size: usize,
    /// Preferred block size for outgoing block-wise transfers.
    pub block_size: usize,
    /// Largest body accepted through Block1 reassembly.
    pub max_body_size: usize,
    pub confirmable_notifications: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            transmission: TransmissionParameters::default(),
            max_message_size: MAX_MESSAGE_SIZE,
            block_size: 1024,
            max_body_size: 1024 * 1024,
            confirmable_notifications: true,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn set_transmission(mut self, transmission: TransmissionParameters) -> Self {
        self.transmission = transmission;
        self
    }

    pub fn set_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn set_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn set_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn set_confirmable_notifications(mut self, confirmable: bool) -> Self {
        self.confirmable_notifications = confirmable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transmission.validate()?;
        if !self.block_size.is_power_of_two() || !(16..=1024).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        // a full block plus header, token and a few options must fit, and
        // the whole datagram must fit the receive buffer
        if self.max_message_size < self.block_size + 64 || self.max_message_size > COAP_MTU {
            return Err(ConfigError::MaxMessageSize(self.max_message_size));
        }
        Ok(())
    }
}
