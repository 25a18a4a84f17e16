//! Per-transport step driver
//!
//! One [`SmTransport`] exists per configured datagram transport and owns everything
//! that transport needs: the session table, the staged inbound/outbound datagrams,
//! the pending user action slot and the open/close lifecycle. It is driven by
//! [`SmTransport::step`], one non-blocking pass per call, alternating a receive pass
//! (poll the network, then sweep receive-path sessions) with a send pass (adopt the
//! pending action, flush the staged datagram, then sweep send-path sessions).
//!
//! Any per-session result other than idle/working/pending forces the whole transport
//! onto the close path; once the channel has shown protocol-level confusion it is
//! reconnected rather than trusted further.

mod cmd;
mod recv;
mod send;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::packet::{Command, SEGMENT0_MULTIPART_HEADER_BYTES, SEGMENT_HEADER_BYTES};
use crate::platform::{Callback, CloseStatus, NetworkHandle, Platform, UserContext};
use crate::session::{SessionError, SessionState, SessionStatus};
use crate::session_table::{CreateError, SessionTable};
use crate::{base85, InitiateError, Origin, RequestId, StopCondition, Transport, DEVICE_ID_LEN};

/// Result of one driver pass or of driving one session once
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Flow {
    /// Nothing to do
    Idle,
    /// Progress was made; step again without waiting
    Working,
    /// Blocked on a busy callback or resource; retry next tick
    Pending,
    /// The transport must close with this status
    Fatal(CloseStatus),
}

impl Flow {
    /// Combine two results, keeping the most significant
    fn merge(self, other: Flow) -> Flow {
        use Flow::*;
        match (self, other) {
            (Fatal(s), _) | (_, Fatal(s)) => Fatal(s),
            (Working, _) | (_, Working) => Working,
            (Pending, _) | (_, Pending) => Pending,
            _ => Idle,
        }
    }
}

/// Transport lifecycle state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TransportState {
    /// Not connected; opens on the next step if started
    Idle,
    /// Waiting for the network-open callback to yield a handle
    Open,
    /// Connected; this pass polls the network and sweeps receive-path sessions
    Receive,
    /// Connected; this pass adopts pending work and sweeps send-path sessions
    Send,
    /// Tearing down: cancel sessions, close the handle, notify
    Close,
    /// Permanently down
    Terminate,
}

/// A user-initiated action waiting for a free session slot
#[derive(Debug, Clone)]
pub(crate) struct PendingAction {
    pub(crate) command: Command,
    pub(crate) request_id: RequestId,
    pub(crate) response_needed: bool,
    pub(crate) user: Option<UserContext>,
    pub(crate) path: Option<String>,
    pub(crate) datapoint: bool,
}

/// Recorded reason and bookkeeping for a requested or forced close
#[derive(Debug, Clone)]
struct CloseIntent {
    status: CloseStatus,
    condition: StopCondition,
    user: Option<UserContext>,
    /// Invoke the stop-completion callback once closed
    notify: bool,
}

/// A built datagram partway through transmission
///
/// Kept until fully sent so a busy network callback is retried with identical bytes.
#[derive(Debug)]
struct OutboundDatagram {
    /// Owning session, if any; cleared along with the session on cancel
    session: Option<usize>,
    data: Vec<u8>,
    sent: usize,
}

pub(crate) struct SmTransport {
    transport: Transport,
    config: TransportConfig,
    device_id: [u8; DEVICE_ID_LEN],
    /// Cloud URL for UDP, destination number for SMS
    url: String,
    /// SMS shared-code service id, framed around every message when present
    service_id: Option<Vec<u8>>,
    state: TransportState,
    started: bool,
    handle: Option<NetworkHandle>,
    sessions: SessionTable,
    pending: Option<PendingAction>,
    close: Option<CloseIntent>,
    outbound: Option<OutboundDatagram>,
}

impl SmTransport {
    pub(crate) fn new(
        transport: Transport,
        config: TransportConfig,
        device_id: [u8; DEVICE_ID_LEN],
        url: String,
        service_id: Option<Vec<u8>>,
        seed: u16,
    ) -> Self {
        let sessions = SessionTable::new(config.max_sessions, config.max_segments, seed);
        SmTransport {
            transport,
            config,
            device_id,
            url,
            service_id,
            state: TransportState::Idle,
            started: true,
            handle: None,
            sessions,
            pending: None,
            close: None,
            outbound: None,
        }
    }

    pub(crate) fn transport(&self) -> Transport {
        self.transport
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state == TransportState::Terminate
    }

    /// Raw segment bytes one datagram can carry on this transport
    fn segment_capacity(&self) -> usize {
        match self.transport {
            Transport::Sms => {
                let framing = self
                    .service_id
                    .as_ref()
                    .map_or(0, |id| 1 + id.len() + 2);
                base85::decoded_len(self.config.packet_size(Transport::Sms) - framing)
            }
            _ => self.config.packet_size(self.transport) - (1 + DEVICE_ID_LEN),
        }
    }

    /// Payload bytes per continuation (and single) segment; also the reassembly stride
    fn stride(&self) -> usize {
        self.segment_capacity() - SEGMENT_HEADER_BYTES
    }

    /// Payload bytes the first segment of a multipart session can carry
    fn first_capacity(&self) -> usize {
        self.segment_capacity() - SEGMENT0_MULTIPART_HEADER_BYTES
    }

    fn multipart_enabled(&self) -> bool {
        cfg!(feature = "multipart") && self.config.max_segments > 1
    }

    /// One non-blocking pass over this transport's state machine
    pub(crate) fn step<P: Platform>(&mut self, platform: &mut P) -> Flow {
        // A requested stop fires once its condition is met
        if !matches!(self.state, TransportState::Close | TransportState::Terminate) {
            if let Some(intent) = &self.close {
                if intent.condition == StopCondition::Immediately
                    || (self.sessions.is_empty()
                        && self.pending.is_none()
                        && self.outbound.is_none())
                {
                    self.state = TransportState::Close;
                }
            }
        }

        match self.state {
            TransportState::Idle => {
                if self.started {
                    self.state = TransportState::Open;
                    Flow::Working
                } else {
                    Flow::Idle
                }
            }
            TransportState::Open => {
                let flow = self.open(platform);
                self.verify(flow)
            }
            TransportState::Receive => {
                let flow = self.receive_pass(platform);
                self.verify(flow)
            }
            TransportState::Send => {
                let flow = self.send_pass(platform);
                self.verify(flow)
            }
            TransportState::Close => self.close_pass(platform),
            TransportState::Terminate => Flow::Idle,
        }
    }

    /// Escalate any fatal session or channel result onto the close path
    fn verify(&mut self, flow: Flow) -> Flow {
        if let Flow::Fatal(status) = flow {
            warn!(transport = %self.transport, ?status, "transport failure, closing");
            if self.close.is_none() {
                self.close = Some(CloseIntent {
                    status,
                    condition: StopCondition::Immediately,
                    user: None,
                    notify: false,
                });
            }
            self.state = TransportState::Close;
        }
        flow
    }

    fn open<P: Platform>(&mut self, platform: &mut P) -> Flow {
        match platform.network_open(self.transport, &self.url) {
            Callback::Continue(handle) => {
                info!(transport = %self.transport, %handle, "transport open");
                self.handle = Some(handle);
                self.state = TransportState::Receive;
                Flow::Working
            }
            Callback::Busy => Flow::Pending,
            Callback::Abort => Flow::Fatal(CloseStatus::Abort),
            _ => Flow::Fatal(CloseStatus::DeviceError),
        }
    }

    /// Poll the network once, then give each receive-path session one chance to move
    fn receive_pass<P: Platform>(&mut self, platform: &mut P) -> Flow {
        let now = platform.uptime();
        let mut flow = self.poll_network(platform);
        if matches!(flow, Flow::Fatal(_)) {
            return flow;
        }

        for key in self.sessions.sweep() {
            if !self.sessions.get(key).state.on_recv_path() {
                continue;
            }
            match self.drive_recv(platform, key, now) {
                Flow::Pending => {
                    // Cooperative: a blocked session ends the sweep, and the next
                    // sweep resumes after it so it cannot starve the table
                    self.sessions.resume_after(key);
                    return flow.merge(Flow::Pending);
                }
                f @ Flow::Fatal(_) => return f,
                f => flow = flow.merge(f),
            }
        }
        self.state = TransportState::Send;
        flow
    }

    /// Adopt pending work, flush the staged datagram, sweep send-path sessions
    fn send_pass<P: Platform>(&mut self, platform: &mut P) -> Flow {
        let now = platform.uptime();
        let mut flow = Flow::Idle;

        if let Some(action) = self.pending.take() {
            match self.adopt(action, now) {
                Ok(()) => flow = Flow::Working,
                Err(action) => {
                    // Table full; the action stays queued for a later tick
                    self.pending = Some(action);
                    flow = Flow::Pending;
                }
            }
        }

        match self.flush_outbound(platform, now) {
            f @ Flow::Fatal(_) => return f,
            Flow::Pending => {
                self.state = TransportState::Receive;
                return flow.merge(Flow::Pending);
            }
            f => flow = flow.merge(f),
        }

        for key in self.sessions.sweep() {
            if !self.sessions.get(key).state.on_send_path() {
                continue;
            }
            match self.drive_send(platform, key, now) {
                Flow::Pending => {
                    self.sessions.resume_after(key);
                    self.state = TransportState::Receive;
                    return flow.merge(Flow::Pending);
                }
                f @ Flow::Fatal(_) => return f,
                f => flow = flow.merge(f),
            }
        }
        self.state = TransportState::Receive;
        flow
    }

    /// Move a queued user action into a freshly created session
    fn adopt(&mut self, action: PendingAction, now: Duration) -> Result<(), PendingAction> {
        let created = self.sessions.create(
            action.request_id,
            Origin::Client,
            action.command,
            SessionState::GetTotalLength,
            now,
        );
        match created {
            Ok(key) => {
                let session = self.sessions.get_mut(key);
                session.flags.response_needed = action.response_needed;
                session.flags.datapoint = action.datapoint;
                session.user = action.user;
                session.path = action.path;
                Ok(())
            }
            Err(CreateError::Full) | Err(CreateError::InUse) => Err(action),
        }
    }

    /// Push staged datagram bytes to the network, advancing the owner on completion
    fn flush_outbound<P: Platform>(&mut self, platform: &mut P, now: Duration) -> Flow {
        let Some(handle) = self.handle else {
            return Flow::Idle;
        };
        let Some(out) = &mut self.outbound else {
            return Flow::Idle;
        };
        match platform.network_send(self.transport, handle, &out.data[out.sent..]) {
            Callback::Continue(n) => {
                out.sent += n;
                if out.sent < out.data.len() {
                    return Flow::Pending;
                }
                let key = out.session;
                self.outbound = None;
                if let Some(key) = key {
                    let session = self.sessions.get_mut(key);
                    // A session that failed mid-flight no longer owns this datagram
                    if session.state == SessionState::SendData {
                        session.segments_sent += 1;
                        if session.segments_sent >= session.segments_total {
                            cmd::finish_send_leg(session, now);
                        }
                    }
                }
                Flow::Working
            }
            Callback::Busy => Flow::Pending,
            Callback::Abort => Flow::Fatal(CloseStatus::Abort),
            _ => {
                debug!(transport = %self.transport, "network send failed");
                let key = out.session;
                self.outbound = None;
                if let Some(key) = key {
                    self.sessions.get_mut(key).fail(SessionError::Send);
                }
                Flow::Working
            }
        }
    }

    /// Cancel every session, close the handle, notify, and settle the final state
    fn close_pass<P: Platform>(&mut self, platform: &mut P) -> Flow {
        self.cancel_all(platform);
        let status = self
            .close
            .as_ref()
            .map_or(CloseStatus::DeviceError, |c| c.status);
        if let Some(handle) = self.handle {
            match platform.network_close(self.transport, handle, status) {
                Callback::Busy => return Flow::Pending,
                _ => self.handle = None,
            }
        }

        let intent = self.close.take();
        if let Some(intent) = &intent {
            if intent.notify {
                // Best effort; a busy application does not hold the close open
                let _ = platform.transport_stopped(self.transport, intent.user);
            }
        }
        info!(transport = %self.transport, ?status, "transport closed");
        match status {
            CloseStatus::DeviceError => {
                // The channel is distrusted; reconnect from scratch
                self.state = TransportState::Idle;
                Flow::Working
            }
            CloseStatus::DeviceStopped => {
                self.started = false;
                self.state = TransportState::Idle;
                Flow::Working
            }
            CloseStatus::DeviceTerminated | CloseStatus::Abort => {
                self.state = TransportState::Terminate;
                Flow::Working
            }
        }
    }

    /// Cancel one session: inform its facility, drop its staged datagram, remove it
    fn cancel_session<P: Platform>(&mut self, platform: &mut P, key: usize) {
        if self
            .outbound
            .as_ref()
            .is_some_and(|o| o.session == Some(key))
        {
            self.outbound = None;
        }
        let session = self.sessions.get(key);
        let _ = cmd::inform_completion(platform, self.transport, session, SessionStatus::Cancel);
        self.sessions.remove(key);
    }

    /// Cancel every open session and the pending action
    fn cancel_all<P: Platform>(&mut self, platform: &mut P) {
        for key in self.sessions.sweep() {
            self.cancel_session(platform, key);
        }
        if let Some(action) = self.pending.take() {
            cmd::inform_pending_cancelled(platform, self.transport, &action);
        }
        self.outbound = None;
    }

    /// Queue a ping or data-send action; at most one may be queued at a time
    pub(crate) fn initiate(
        &mut self,
        command: Command,
        response_needed: bool,
        user: Option<UserContext>,
        path: Option<String>,
        datapoint: bool,
    ) -> Result<RequestId, InitiateError> {
        if self.close.is_some() || self.state == TransportState::Terminate {
            return Err(InitiateError::NotRunning);
        }
        if self.pending.is_some() {
            return Err(InitiateError::Busy);
        }
        let request_id = self.sessions.allocate_request_id();
        self.pending = Some(PendingAction {
            command,
            request_id,
            response_needed,
            user,
            path,
            datapoint,
        });
        Ok(request_id)
    }

    /// Cancel the session with this request id, preferring a client-owned match
    pub(crate) fn cancel<P: Platform>(
        &mut self,
        platform: &mut P,
        request_id: RequestId,
    ) -> Result<(), InitiateError> {
        if self
            .pending
            .as_ref()
            .is_some_and(|a| a.request_id == request_id)
        {
            if let Some(action) = self.pending.take() {
                cmd::inform_pending_cancelled(platform, self.transport, &action);
            }
            return Ok(());
        }
        match self.sessions.lookup_any_origin(request_id) {
            Some(key) => {
                self.cancel_session(platform, key);
                Ok(())
            }
            None => Err(InitiateError::UnknownSession),
        }
    }

    /// Cancel every open session without closing the transport
    pub(crate) fn cancel_open_sessions<P: Platform>(&mut self, platform: &mut P) {
        self.cancel_all(platform);
    }

    pub(crate) fn request_start(&mut self) -> Result<(), InitiateError> {
        if self.state == TransportState::Terminate {
            return Err(InitiateError::NotRunning);
        }
        self.started = true;
        Ok(())
    }

    pub(crate) fn request_stop(
        &mut self,
        condition: StopCondition,
        user: Option<UserContext>,
    ) -> Result<(), InitiateError> {
        if self.close.is_some() || self.state == TransportState::Terminate {
            return Err(InitiateError::NotRunning);
        }
        self.close = Some(CloseIntent {
            status: CloseStatus::DeviceStopped,
            condition,
            user,
            notify: true,
        });
        Ok(())
    }

    pub(crate) fn request_terminate(&mut self) {
        if self.state == TransportState::Terminate {
            return;
        }
        self.close = Some(CloseIntent {
            status: CloseStatus::DeviceTerminated,
            condition: StopCondition::Immediately,
            user: None,
            notify: false,
        });
        self.state = TransportState::Close;
    }
}
