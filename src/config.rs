//! Connector and per-transport parameters

use std::time::Duration;

use thiserror::Error;

use crate::{Transport, DEVICE_ID_LEN, PACKET_SIZE_SMS, PACKET_SIZE_UDP};

/// Parameters governing one datagram transport
///
/// Defaults are sized for small devices: two concurrent sessions, no multipart, no
/// compression, and no response timeout.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub(crate) max_sessions: usize,
    pub(crate) max_segments: u8,
    pub(crate) rx_timeout: Option<Duration>,
    pub(crate) mtu: Option<usize>,
    #[cfg(feature = "compression")]
    pub(crate) compression: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_sessions: 2,
            max_segments: 1,
            rx_timeout: None,
            mtu: None,
            #[cfg(feature = "compression")]
            compression: false,
        }
    }
}

impl TransportConfig {
    /// Maximum number of concurrently open sessions, both origins combined
    ///
    /// When the table is full, inbound requests are silently discarded and client
    /// initiations stay pending until a session completes.
    pub fn max_sessions(&mut self, value: usize) -> &mut Self {
        self.max_sessions = value;
        self
    }

    /// Maximum number of segments a single session's payload may span
    ///
    /// `1` disables multipart entirely; inbound multipart segments are then dropped.
    pub fn max_segments(&mut self, value: u8) -> &mut Self {
        self.max_segments = value;
        self
    }

    /// How long a session waits for a response before timing out
    ///
    /// `None` waits forever.
    pub fn rx_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.rx_timeout = value;
        self
    }

    /// Cap the datagram size below the transport's own limit
    pub fn mtu(&mut self, value: usize) -> &mut Self {
        self.mtu = Some(value);
        self
    }

    /// Whether outbound payloads too large for one segment are deflate-compressed
    #[cfg(feature = "compression")]
    pub fn compression(&mut self, value: bool) -> &mut Self {
        self.compression = value;
        self
    }

    /// Effective datagram limit for `transport`
    pub(crate) fn packet_size(&self, transport: Transport) -> usize {
        let ceiling = match transport {
            Transport::Sms => PACKET_SIZE_SMS,
            _ => PACKET_SIZE_UDP,
        };
        self.mtu.map_or(ceiling, |m| m.min(ceiling))
    }

    pub(crate) fn compression_enabled(&self) -> bool {
        #[cfg(feature = "compression")]
        {
            self.compression
        }
        #[cfg(not(feature = "compression"))]
        {
            false
        }
    }
}

/// SMS transport parameters
#[derive(Debug, Clone, Default)]
pub struct SmsConfig {
    /// Common transport parameters
    pub transport: TransportConfig,
    pub(crate) service_id: Option<String>,
    pub(crate) destination: String,
}

impl SmsConfig {
    /// Messages go to `destination` (a phone number or short code)
    pub fn new(destination: impl Into<String>) -> Self {
        SmsConfig {
            transport: TransportConfig::default(),
            service_id: None,
            destination: destination.into(),
        }
    }

    /// Shared-code service id, carried as a `(<id>):` prefix on every message
    ///
    /// Required when the destination is a shared short code, absent otherwise.
    pub fn service_id(&mut self, value: impl Into<String>) -> &mut Self {
        self.service_id = Some(value.into());
        self
    }
}

/// Top-level connector parameters
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub(crate) device_id: [u8; DEVICE_ID_LEN],
    pub(crate) cloud_url: String,
    pub(crate) udp: Option<TransportConfig>,
    pub(crate) sms: Option<SmsConfig>,
    pub(crate) request_id_seed: Option<u16>,
}

impl ConnectorConfig {
    /// Configuration for a device identified by `device_id` talking to `cloud_url`
    ///
    /// No transport is enabled yet; add at least one with
    /// [`ConnectorConfig::udp`] or [`ConnectorConfig::sms`].
    pub fn new(device_id: [u8; DEVICE_ID_LEN], cloud_url: impl Into<String>) -> Self {
        ConnectorConfig {
            device_id,
            cloud_url: cloud_url.into(),
            udp: None,
            sms: None,
            request_id_seed: None,
        }
    }

    /// Enable the UDP transport
    pub fn udp(&mut self, config: TransportConfig) -> &mut Self {
        self.udp = Some(config);
        self
    }

    /// Enable the SMS transport
    pub fn sms(&mut self, config: SmsConfig) -> &mut Self {
        self.sms = Some(config);
        self
    }

    /// Fix the starting point of client request id allocation
    ///
    /// Ids are normally seeded randomly so a rebooted device does not collide with
    /// its own pre-reboot sessions. Fixing the seed is useful in tests.
    pub fn request_id_seed(&mut self, value: u16) -> &mut Self {
        self.request_id_seed = Some(value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.udp.is_none() && self.sms.is_none() {
            return Err(ConfigError::NoTransport);
        }
        for (transport, config) in [
            (Transport::Udp, self.udp.as_ref()),
            (Transport::Sms, self.sms.as_ref().map(|s| &s.transport)),
        ] {
            let Some(config) = config else { continue };
            if config.max_sessions == 0 {
                return Err(ConfigError::NoSessions);
            }
            if config.max_segments == 0 {
                return Err(ConfigError::NoSegments);
            }
            #[cfg(not(feature = "multipart"))]
            if config.max_segments > 1 {
                return Err(ConfigError::NoSegments);
            }
            // Room for the largest segment header plus at least one payload byte
            if config.packet_size(transport) < crate::packet::SEGMENT0_MULTIPART_HEADER_BYTES + 1 {
                return Err(ConfigError::MtuTooSmall);
            }
        }
        Ok(())
    }
}

/// Errors in the application-supplied configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// Neither UDP nor SMS is enabled
    #[error("no transport configured")]
    NoTransport,
    /// `max_sessions` is zero
    #[error("max_sessions must be at least 1")]
    NoSessions,
    /// `max_segments` is zero, or above 1 without the `multipart` feature
    #[error("unsupported max_segments value")]
    NoSegments,
    /// The configured MTU cannot hold a segment header
    #[error("MTU too small for a segment header")]
    MtuTooSmall,
}
