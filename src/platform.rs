//! The callback boundary between the engine and the embedding application
//!
//! Everything the engine cannot do itself — network I/O, time, reboot, and the
//! application-level facilities (data service, ping/status, CLI, data points,
//! opaque responses) — is reached through the [`Platform`] trait. All methods are
//! non-blocking: a [`Callback::Busy`] return is retried with identical arguments on
//! the next tick, and no state may have been mutated by the aborted attempt.

use std::fmt;
use std::time::Duration;

use crate::connector::Status;
use crate::session::SessionStatus;
use crate::{RequestId, Transport};

/// Result of a platform callback
///
/// `Busy` yields the engine for one tick; `Abort` tears the whole connector down;
/// `Unrecognized` means the facility is not implemented, which is tolerated where
/// that is safe and treated as an error elsewhere.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Callback<T> {
    /// The callback completed
    Continue(T),
    /// Not ready; retry with identical arguments next tick
    Busy,
    /// The callback failed
    Error,
    /// Fatal; stop the connector
    Abort,
    /// The application does not implement this facility
    Unrecognized,
}

/// Opaque token correlating facility callbacks with an application request
///
/// The engine stores it per session and passes it back unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UserContext(pub u64);

/// Opaque handle to a network connection owned by the platform
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NetworkHandle(pub u64);

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a transport's network connection is being closed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseStatus {
    /// A protocol-level failure; the transport will reopen if configured to
    DeviceError,
    /// The application asked the transport to stop
    DeviceStopped,
    /// The whole connector is shutting down permanently
    DeviceTerminated,
    /// A fatal callback result
    Abort,
}

/// A CLI response chunk produced by the application
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CliResponse {
    /// Bytes written into the buffer handed to [`Platform::cli_response`]
    pub bytes: usize,
    /// Session disposition; anything but `Success`/`Complete` errors the session
    pub status: SessionStatus,
}

/// Platform and facility callbacks implemented by the embedding application
///
/// Network and time methods are required. Facility methods default to
/// [`Callback::Unrecognized`] so an application implements only the services it
/// uses.
pub trait Platform {
    // --- network I/O ---

    /// Open the datagram channel for `transport` towards `url`
    fn network_open(&mut self, transport: Transport, url: &str) -> Callback<NetworkHandle>;

    /// Send `data`; partial writes are reported by the returned byte count
    fn network_send(&mut self, transport: Transport, handle: NetworkHandle, data: &[u8])
        -> Callback<usize>;

    /// Receive one datagram into `buf`, non-blocking; `Busy` when none is pending
    fn network_receive(
        &mut self,
        transport: Transport,
        handle: NetworkHandle,
        buf: &mut [u8],
    ) -> Callback<usize>;

    /// Close the channel
    fn network_close(
        &mut self,
        transport: Transport,
        handle: NetworkHandle,
        status: CloseStatus,
    ) -> Callback<()>;

    // --- system ---

    /// Monotonic time since an arbitrary epoch
    fn uptime(&mut self) -> Duration;

    /// Called between ticks by [`crate::Connector::run`] so the caller can idle
    fn os_yield(&mut self, status: Status) {
        let _ = status;
    }

    /// Reboot the device; invoked only at session teardown after a reboot command
    fn reboot(&mut self) -> Callback<()> {
        Callback::Unrecognized
    }

    // --- transport lifecycle ---

    /// A stop requested via [`crate::Connector::stop`] has completed
    fn transport_stopped(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
    ) -> Callback<()> {
        let _ = (transport, user);
        Callback::Continue(())
    }

    /// The cloud asked the device to bring up another transport (the `connect` command)
    fn transport_start_requested(&mut self, transport: Transport) -> Callback<()> {
        let _ = transport;
        Callback::Unrecognized
    }

    // --- ping/status facility ---

    /// Inbound ping from the cloud
    fn ping_request(&mut self, transport: Transport, response_required: bool) -> Callback<()> {
        let _ = (transport, response_required);
        Callback::Unrecognized
    }

    /// Disposition of a device-initiated ping
    fn ping_response(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        status: SessionStatus,
        error_text: Option<&str>,
    ) -> Callback<()> {
        let _ = (transport, user, status, error_text);
        Callback::Unrecognized
    }

    // --- data service facility ---

    /// Total request payload bytes of a device-initiated data send
    fn data_send_length(&mut self, transport: Transport, user: Option<UserContext>)
        -> Callback<usize> {
        let _ = (transport, user);
        Callback::Unrecognized
    }

    /// Fill `buf` with the next request payload bytes; return the count written
    fn data_to_send(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<usize> {
        let _ = (transport, user, buf);
        Callback::Unrecognized
    }

    /// Final disposition of a device-initiated data send
    fn data_send_status(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        status: SessionStatus,
        error_text: Option<&str>,
    ) -> Callback<()> {
        let _ = (transport, user, status, error_text);
        Callback::Unrecognized
    }

    /// A chunk of the cloud's response to a device-initiated data send
    fn data_response(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        data: &[u8],
        error: bool,
        last: bool,
    ) -> Callback<()> {
        let _ = (transport, user, data, error, last);
        Callback::Unrecognized
    }

    /// First chunk of an inbound device request; `target` is its destination path
    ///
    /// The returned context is attached to the session and passed to every
    /// subsequent callback for it.
    fn receive_target(
        &mut self,
        transport: Transport,
        target: Option<&str>,
        response_required: bool,
    ) -> Callback<Option<UserContext>> {
        let _ = (transport, target, response_required);
        Callback::Unrecognized
    }

    /// A chunk of an inbound device request's payload
    fn receive_data(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        data: &[u8],
        last: bool,
    ) -> Callback<()> {
        let _ = (transport, user, data, last);
        Callback::Unrecognized
    }

    /// Final disposition of an inbound device request
    fn receive_status(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        status: SessionStatus,
    ) -> Callback<()> {
        let _ = (transport, user, status);
        Callback::Unrecognized
    }

    /// Total response payload bytes the application will produce for a device request
    fn receive_reply_length(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
    ) -> Callback<usize> {
        let _ = (transport, user);
        Callback::Unrecognized
    }

    /// Fill `buf` with the next response payload bytes for a device request
    fn receive_reply_data(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<usize> {
        let _ = (transport, user, buf);
        Callback::Unrecognized
    }

    // --- data point facility ---

    /// Like [`Platform::data_send_status`], for `DataPoint/` sessions
    fn data_point_status(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        status: SessionStatus,
        error_text: Option<&str>,
    ) -> Callback<()> {
        let _ = (transport, user, status, error_text);
        Callback::Unrecognized
    }

    /// Like [`Platform::data_response`], for `DataPoint/` sessions
    fn data_point_response(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        data: &[u8],
        error: bool,
        last: bool,
    ) -> Callback<()> {
        let _ = (transport, user, data, error, last);
        Callback::Unrecognized
    }

    // --- CLI facility ---

    /// An inbound CLI command; the returned context tags the rest of the exchange
    fn cli_request(
        &mut self,
        transport: Transport,
        command: &str,
        response_required: bool,
    ) -> Callback<Option<UserContext>> {
        let _ = (transport, command, response_required);
        Callback::Unrecognized
    }

    /// Total CLI response bytes the application will produce
    fn cli_response_length(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
    ) -> Callback<usize> {
        let _ = (transport, user);
        Callback::Unrecognized
    }

    /// Fill `buf` with the next CLI response bytes
    fn cli_response(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<CliResponse> {
        let _ = (transport, user, buf);
        Callback::Unrecognized
    }

    /// The CLI session ended abnormally
    fn cli_status(
        &mut self,
        transport: Transport,
        user: Option<UserContext>,
        status: SessionStatus,
    ) -> Callback<()> {
        let _ = (transport, user, status);
        Callback::Unrecognized
    }

    // --- short-message misc ---

    /// A response arrived for a request whose command context was not retained
    fn opaque_response(
        &mut self,
        transport: Transport,
        id: RequestId,
        data: &[u8],
        error: bool,
        last: bool,
    ) -> Callback<()> {
        let _ = (transport, id, data, error, last);
        Callback::Unrecognized
    }
}
