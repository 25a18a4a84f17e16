//! Low-level protocol logic for the Session Message (SM) device-to-cloud protocol
//!
//! sm-proto contains a fully deterministic implementation of the SM protocol used by
//! small devices to exchange request/response sessions with a cloud endpoint over
//! MTU-constrained datagram transports (UDP and SMS). It contains no networking code:
//! all I/O, time, and application services are reached through the [`Platform`] trait,
//! and the engine is driven by repeatedly calling [`Connector::step`].
//!
//! The most important types are [`Connector`], which owns one transport state machine
//! per configured datagram transport and dispatches inbound datagrams to the related
//! session, and [`Platform`], which the embedding application implements to provide
//! network I/O and the application-level facilities (data service, ping, CLI, ...).

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

use std::fmt;

mod base85;
mod coding;
mod crc16;
mod packet;
mod reassembly;
#[cfg(test)]
mod tests;
#[cfg(feature = "compression")]
mod zlib;

mod session;
pub use crate::session::{SessionError, SessionStatus};

mod session_table;

mod transport;

mod config;
pub use crate::config::{ConfigError, ConnectorConfig, SmsConfig, TransportConfig};

mod platform;
pub use crate::platform::{
    Callback, CliResponse, CloseStatus, NetworkHandle, Platform, UserContext,
};

mod connector;
pub use crate::connector::{Connector, InitiateError, SendRequest, Status, StopCondition};

/// The SM/UDP protocol version implemented
const SM_UDP_VERSION: u8 = 0x1;

/// Datagram size limit for SM over UDP, in bytes
const PACKET_SIZE_UDP: usize = 1472;
/// Datagram size limit for SM over SMS, in encoded characters
const PACKET_SIZE_SMS: usize = 160;

/// Length of the binary device identity carried in every UDP preamble
pub const DEVICE_ID_LEN: usize = 16;

/// Which endpoint originated a session
///
/// Client- and cloud-originated sessions use independent request id spaces, so both
/// values are needed to identify a session on one transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Origin {
    /// The device initiated the session
    Client = 0,
    /// The cloud initiated the session
    Cloud = 1,
}

impl Origin {
    /// Shorthand for `self == Origin::Client`
    #[inline]
    pub fn is_client(self) -> bool {
        self == Origin::Client
    }
}

/// Transports a session can ride on
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Transport {
    /// Framed TCP; driven outside this crate, reachable only via the `connect` command
    Tcp,
    /// SM over UDP datagrams
    Udp,
    /// SM over base85-encoded SMS messages
    Sms,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Sms => "SMS",
        })
    }
}

/// Identifier distinguishing concurrently open sessions of one origin on one transport
///
/// 10 bits on the wire: two high bits ride in the segment info byte, the low byte in
/// its own field. Wraps and is reused once the owning session completes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(u16);

impl RequestId {
    /// The largest representable request id
    pub const MAX: u16 = 0x3FF;

    pub(crate) fn new(value: u16) -> Self {
        RequestId(value & Self::MAX)
    }

    /// The numeric id value
    pub fn value(self) -> u16 {
        self.0
    }

    /// High two bits, as carried in the segment info byte
    pub(crate) fn high_bits(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Low byte, as carried in the request field
    pub(crate) fn low_byte(self) -> u8 {
        self.0 as u8
    }

    /// The next id in wrapping order
    pub(crate) fn wrapping_next(self) -> Self {
        RequestId((self.0 + 1) & Self::MAX)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
