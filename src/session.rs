//! Per-session state
//!
//! A session is one in-flight request/response exchange, identified by a request id
//! and the side that originated it. Sessions are owned by their transport's session
//! table and destroyed when they reach `Complete` or on transport-wide cancel.

use std::time::Duration;

use thiserror::Error;

use crate::packet::Command;
use crate::platform::UserContext;
use crate::reassembly::PayloadBuffer;
#[cfg(feature = "compression")]
use crate::zlib::Inflater;
use crate::{Origin, RequestId};

/// Session-level failure classes
///
/// The numeric wire codes are carried in error-response payloads and shared with the
/// cloud service; they are stable.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum SessionError {
    /// Unrecoverable internal failure
    #[error("internal error")]
    Internal,
    /// Command code not recognized
    #[error("invalid opcode")]
    InvalidOpcode,
    /// Malformed segment or payload
    #[error("malformed message")]
    Format,
    /// Request id collides with an open session
    #[error("session already in use")]
    InUse,
    /// No session open under this request id
    #[error("unknown session")]
    UnknownSession,
    /// Deflate failure while preparing outbound data
    #[error("compression failure")]
    Compression,
    /// Inflate failure on inbound data
    #[error("decompression failure")]
    Decompression,
    /// Buffer space could not be obtained
    #[error("out of memory")]
    Memory,
    /// The transport failed to send
    #[error("send failure")]
    Send,
    /// The session was cancelled
    #[error("cancelled")]
    Cancel,
    /// The owning facility was busy for too long
    #[error("busy")]
    Busy,
    /// The peer rejected the exchange
    #[error("negative acknowledgement")]
    Ack,
    /// No response arrived in time
    #[error("timeout")]
    Timeout,
    /// No facility implements this command
    #[error("no service")]
    NoService,
    /// The cloud reported an error response
    #[error("cloud error")]
    Cloud,
}

impl SessionError {
    pub(crate) fn wire_code(self) -> u16 {
        use SessionError::*;
        match self {
            Internal => 1,
            InvalidOpcode => 2,
            Format => 3,
            InUse => 4,
            UnknownSession => 5,
            Compression => 6,
            Decompression => 7,
            Memory => 8,
            Send => 9,
            Cancel => 10,
            Busy => 11,
            Ack => 12,
            Timeout => 13,
            NoService => 14,
            Cloud => 15,
        }
    }

    pub(crate) fn from_wire(code: u16) -> Option<Self> {
        use SessionError::*;
        Some(match code {
            1 => Internal,
            2 => InvalidOpcode,
            3 => Format,
            4 => InUse,
            5 => UnknownSession,
            6 => Compression,
            7 => Decompression,
            8 => Memory,
            9 => Send,
            10 => Cancel,
            11 => Busy,
            12 => Ack,
            13 => Timeout,
            14 => NoService,
            15 => Cloud,
            _ => None?,
        })
    }
}

/// Final disposition of a session, as reported to the owning facility
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionStatus {
    /// A successful response was received
    Success,
    /// The exchange completed without error (no response was requested)
    Complete,
    /// The session was cancelled before completion
    Cancel,
    /// The session timed out awaiting a response
    Timeout,
    /// The session failed
    Error(SessionError),
}

impl SessionStatus {
    pub(crate) fn from_error(error: Option<SessionError>) -> Self {
        match error {
            None => SessionStatus::Complete,
            Some(SessionError::Cancel) => SessionStatus::Cancel,
            Some(SessionError::Timeout) => SessionStatus::Timeout,
            Some(e) => SessionStatus::Error(e),
        }
    }
}

/// Where a session is in its lifecycle
///
/// Variant order is meaningful: states up to and including `SendData` are driven by
/// the transport's send sweep, states from `ReceiveData` onward by the receive sweep.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum SessionState {
    /// Ask the owning facility how many payload bytes to expect
    GetTotalLength,
    /// Allocate the outbound buffer and write any fixed prefix
    PreparePayload,
    /// Pull further payload bytes from the owning facility
    MoreData,
    /// Deflate the assembled payload
    Compress,
    /// Split the payload into wire segments
    PrepareSegment,
    /// Emit segments, one datagram per tick
    SendData,
    /// Await inbound segments
    ReceiveData,
    /// Inflate reassembled input, interleaved with payload processing
    Decompress,
    /// Hand reassembled input to the owning facility
    ProcessPayload,
    /// Tear down after a session-local failure
    Error,
    /// Release buffers and leave the table
    Complete,
}

impl SessionState {
    pub(crate) fn on_send_path(self) -> bool {
        self <= SessionState::SendData
    }

    pub(crate) fn on_recv_path(self) -> bool {
        self >= SessionState::ReceiveData
    }
}

/// Session flag bits
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct SessionFlags {
    /// The request wants a response (ours or the peer's)
    pub response_needed: bool,
    /// The current leg of the exchange is a response
    pub is_response: bool,
    /// The current leg spans multiple segments
    pub multipart: bool,
    /// The current leg's payload is deflate-compressed
    pub compressed: bool,
    /// The chunk being handed to the facility is the final one
    pub last_data: bool,
    /// The session failed; error responses and teardown pending
    pub error: bool,
    /// Reboot was requested; deferred to session teardown
    pub reboot: bool,
    /// Client data session bound for the data-point facility
    pub datapoint: bool,
    /// The data-service facility has been told this request's target
    pub target_informed: bool,
}

/// One in-flight request/response exchange
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) request_id: RequestId,
    pub(crate) origin: Origin,
    pub(crate) command: Command,
    pub(crate) state: SessionState,
    pub(crate) flags: SessionFlags,
    /// Reassembled inbound payload
    pub(crate) payload: Option<PayloadBuffer>,
    /// Index of the next inbound segment to hand to the facility
    pub(crate) segments_consumed: u8,
    /// Assembled outbound payload
    pub(crate) out: Vec<u8>,
    /// Total outbound payload bytes the facility has promised
    pub(crate) out_expected: usize,
    /// Outbound segmentation progress
    pub(crate) segments_total: u8,
    pub(crate) segments_sent: u8,
    #[cfg(feature = "compression")]
    pub(crate) inflater: Option<Inflater>,
    pub(crate) user: Option<UserContext>,
    /// Destination path of a client data request
    pub(crate) path: Option<String>,
    /// Response size cap requested by an inbound CLI command
    pub(crate) max_response_bytes: Option<usize>,
    /// Bytes of the current leg already pulled from / handed to the facility
    pub(crate) bytes_processed: usize,
    pub(crate) start_time: Duration,
    pub(crate) error: Option<SessionError>,
    /// Human-readable text carried by a cloud error response
    pub(crate) error_text: Option<String>,
}

impl Session {
    pub(crate) fn new(
        request_id: RequestId,
        origin: Origin,
        command: Command,
        state: SessionState,
        now: Duration,
    ) -> Self {
        Session {
            request_id,
            origin,
            command,
            state,
            flags: SessionFlags::default(),
            payload: None,
            segments_consumed: 0,
            out: Vec::new(),
            out_expected: 0,
            segments_total: 0,
            segments_sent: 0,
            #[cfg(feature = "compression")]
            inflater: None,
            user: None,
            path: None,
            max_response_bytes: None,
            bytes_processed: 0,
            start_time: now,
            error: None,
            error_text: None,
        }
    }

    /// Mark the session failed and queue it for the error path
    pub(crate) fn fail(&mut self, error: SessionError) {
        self.flags.error = true;
        self.error = Some(error);
        self.state = SessionState::Error;
    }

    /// Release payload buffers on every path that leaves payload processing
    pub(crate) fn release_buffers(&mut self) {
        self.payload = None;
        self.out = Vec::new();
        #[cfg(feature = "compression")]
        {
            self.inflater = None;
        }
    }
}
