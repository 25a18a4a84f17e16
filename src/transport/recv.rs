//! Inbound datagram handling and the receive-path session sweep
//!
//! One datagram is pulled per pass. Malformed, CRC-failing, or misaddressed
//! datagrams are dropped silently; noise on an unreliable transport must never wedge
//! session state. Only a version mismatch in the preamble is treated as
//! transport-fatal, since it means the channel itself cannot be trusted.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::{cmd, Flow, SmTransport};
use crate::packet::{self, Command, SegmentHeader, SegmentKind};
use crate::platform::{Callback, CloseStatus, Platform};
use crate::reassembly::{Insert, PayloadBuffer};
use crate::session::{Session, SessionError, SessionState};
#[cfg(feature = "compression")]
use crate::zlib::Inflater;
use crate::{base85, Origin, Transport};

impl SmTransport {
    /// Pull at most one datagram from the network and feed it to its session
    pub(super) fn poll_network<P: Platform>(&mut self, platform: &mut P) -> Flow {
        let Some(handle) = self.handle else {
            return Flow::Idle;
        };
        let mut buf = vec![0u8; self.config.packet_size(self.transport)];
        let read = match platform.network_receive(self.transport, handle, &mut buf) {
            Callback::Continue(n) => n,
            Callback::Busy => return Flow::Idle,
            Callback::Abort => return Flow::Fatal(CloseStatus::Abort),
            _ => return Flow::Fatal(CloseStatus::DeviceError),
        };
        // A zero-byte read is not a datagram
        if read == 0 {
            return Flow::Idle;
        }
        let datagram = &buf[..read];
        let now = platform.uptime();

        match self.transport {
            Transport::Sms => {
                let service_id = self.service_id.clone().unwrap_or_default();
                let skip = match packet::verify_sms_preamble(datagram, &service_id) {
                    Ok(skip) => skip,
                    Err(_) => {
                        trace!("SMS framing mismatch, discarding");
                        return Flow::Working;
                    }
                };
                let body = &datagram[skip..];
                let mut segment = vec![0u8; base85::decoded_len(body.len())];
                match base85::decode(&mut segment, body) {
                    Some(len) => {
                        segment.truncate(len);
                        self.process_segment(&mut segment, now)
                    }
                    None => {
                        trace!("undecodable SMS body, discarding");
                        Flow::Working
                    }
                }
            }
            _ => match packet::verify_udp_preamble(datagram, &self.device_id) {
                Ok(skip) => {
                    let mut segment = datagram[skip..].to_vec();
                    self.process_segment(&mut segment, now)
                }
                Err(packet::PreambleError::Version) => Flow::Fatal(CloseStatus::DeviceError),
                Err(_) => {
                    trace!("preamble mismatch, discarding");
                    Flow::Working
                }
            },
        }
    }

    /// Verify, admit and reassemble one wire segment
    fn process_segment(&mut self, segment: &mut [u8], now: Duration) -> Flow {
        let stride = self.stride();
        let (header, header_len) = match SegmentHeader::decode(segment, self.multipart_enabled())
        {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(?e, "segment rejected, discarding");
                return Flow::Working;
            }
        };
        let payload = &segment[header_len..];
        let origin = if header.request {
            Origin::Cloud
        } else {
            Origin::Client
        };
        let seg0 = match header.kind {
            SegmentKind::Single { cs } | SegmentKind::First { cs, .. } => Some(cs),
            SegmentKind::Continuation { .. } => None,
        };

        if let Some(cs) = seg0 {
            if cs.compressed() && !self.config.compression_enabled() {
                debug!("compressed segment with compression disabled, discarding");
                return Flow::Working;
            }
        }

        let key = match self.sessions.lookup(header.request_id, origin) {
            Some(key) => key,
            None => {
                // Packed multi-message datagrams are a vendor extension this engine
                // does not speak; recognize and drop before admitting a session
                if origin == Origin::Cloud
                    && seg0.and_then(|cs| Command::from_wire(cs.code())) == Some(Command::Pack)
                {
                    warn!("packed multi-message datagram, discarding");
                    return Flow::Working;
                }
                // The command is learned from segment 0; sessions admitted on a
                // continuation segment, and responses whose request context is
                // gone, start out with the opaque tag
                let created = self.sessions.create(
                    header.request_id,
                    origin,
                    Command::OpaqueResponse,
                    SessionState::ReceiveData,
                    now,
                );
                match created {
                    Ok(key) => key,
                    Err(_) => {
                        debug!(
                            request_id = %header.request_id,
                            "session table full, discarding inbound request"
                        );
                        return Flow::Working;
                    }
                }
            }
        };

        let max_segments = self.sessions.max_segments();
        let session = self.sessions.get_mut(key);
        if session.state != SessionState::ReceiveData {
            // Almost always a duplicated datagram for a leg that already finished
            // reassembly; duplicates are dropped, never errored
            debug!(
                request_id = %session.request_id,
                state = ?session.state,
                "segment for a session not awaiting data, discarding"
            );
            return Flow::Working;
        }

        // First segment of this leg: pin the leg's flags and allocate reassembly room
        if session.payload.is_none() {
            session.flags.multipart = header.multipart();
            if origin == Origin::Cloud {
                session.flags.response_needed = header.response_needed;
            } else {
                session.flags.is_response = true;
            }
            if header.multipart() {
                session.payload = Some(PayloadBuffer::multipart(max_segments, stride));
            }
        } else if session.flags.multipart != header.multipart() {
            session.fail(SessionError::Format);
            return Flow::Working;
        }

        match header.kind {
            SegmentKind::Single { cs } => {
                if session.payload.is_some() {
                    session.fail(SessionError::Format);
                    return Flow::Working;
                }
                session.flags.compressed = cs.compressed();
                if let Err(e) = apply_seg0(session, origin, cs) {
                    session.fail(e);
                    return Flow::Working;
                }
                session.payload = Some(PayloadBuffer::single(payload.to_vec()));
            }
            SegmentKind::First { count, cs } => {
                if count < 2 {
                    session.fail(SessionError::Format);
                    return Flow::Working;
                }
                if usize::from(count) > usize::from(max_segments) {
                    debug!(count, "multipart session exceeds segment bound");
                    session.fail(SessionError::Memory);
                    return Flow::Working;
                }
                session.flags.compressed = cs.compressed();
                if let Err(e) = apply_seg0(session, origin, cs) {
                    session.fail(e);
                    return Flow::Working;
                }
                if let Some(buf) = session.payload.as_mut() {
                    buf.set_count(count);
                    if buf.insert(0, payload) == Insert::OutOfRange {
                        session.fail(SessionError::Format);
                        return Flow::Working;
                    }
                }
            }
            SegmentKind::Continuation { number } => {
                if let Some(buf) = session.payload.as_mut() {
                    if buf.insert(number, payload) == Insert::OutOfRange {
                        session.fail(SessionError::Format);
                        return Flow::Working;
                    }
                }
            }
        }

        if session.payload.as_ref().is_some_and(|p| p.complete()) {
            session.segments_consumed = 0;
            session.bytes_processed = 0;
            session.state = if session.flags.compressed {
                SessionState::Decompress
            } else {
                SessionState::ProcessPayload
            };
            trace!(request_id = %session.request_id, "payload reassembled");
        }
        Flow::Working
    }

    /// Drive one receive-path session one step
    pub(super) fn drive_recv<P: Platform>(
        &mut self,
        platform: &mut P,
        key: usize,
        now: Duration,
    ) -> Flow {
        match self.sessions.get(key).state {
            SessionState::ReceiveData => {
                if let Some(timeout) = self.config.rx_timeout {
                    let session = self.sessions.get_mut(key);
                    if now.saturating_sub(session.start_time) >= timeout {
                        debug!(request_id = %session.request_id, "session timed out");
                        session.fail(SessionError::Timeout);
                        return Flow::Working;
                    }
                }
                Flow::Idle
            }
            SessionState::Decompress => self.drive_decompress(platform, key),
            SessionState::ProcessPayload => self.drive_process(platform, key),
            SessionState::Error => {
                self.enter_error_path(key);
                Flow::Working
            }
            SessionState::Complete => self.finish_session(platform, key),
            _ => Flow::Idle,
        }
    }

    /// Hand the next reassembled segment to the owning facility
    fn drive_process<P: Platform>(&mut self, platform: &mut P, key: usize) -> Flow {
        let (chunk, last) = {
            let session = self.sessions.get(key);
            let Some(payload) = &session.payload else {
                return Flow::Idle;
            };
            let count = payload.count().unwrap_or(1).max(1);
            let idx = session.segments_consumed.min(count - 1);
            (payload.segment(idx).to_vec(), idx + 1 >= count)
        };
        self.deliver(platform, key, chunk, last)
    }

    /// Inflate the next chunk and hand it to the owning facility
    #[cfg(feature = "compression")]
    fn drive_decompress<P: Platform>(&mut self, platform: &mut P, key: usize) -> Flow {
        let chunk_bytes = self.stride().max(64);
        let staged = {
            let session = self.sessions.get_mut(key);
            if session.inflater.is_none() {
                session.inflater = Some(Inflater::new(chunk_bytes));
            }
            let Some(payload) = &session.payload else {
                return Flow::Idle;
            };
            match session.inflater.as_mut() {
                Some(inflater) => match inflater.step(payload) {
                    Ok(last) => Some((inflater.chunk().to_vec(), last)),
                    Err(_) => None,
                },
                None => return Flow::Idle,
            }
        };
        let Some((chunk, last)) = staged else {
            debug!("inflate failure");
            self.sessions.get_mut(key).fail(SessionError::Decompression);
            return Flow::Working;
        };
        let flow = self.deliver(platform, key, chunk, last);
        if flow == Flow::Working {
            // The staged chunk was accepted; make room for the next one
            if let Some(inflater) = self.sessions.get_mut(key).inflater.as_mut() {
                inflater.reset_chunk();
            }
        }
        flow
    }

    #[cfg(not(feature = "compression"))]
    fn drive_decompress<P: Platform>(&mut self, _platform: &mut P, key: usize) -> Flow {
        self.sessions.get_mut(key).fail(SessionError::Decompression);
        Flow::Working
    }

    /// Route one payload chunk through command dispatch and apply its effects
    fn deliver<P: Platform>(
        &mut self,
        platform: &mut P,
        key: usize,
        chunk: Vec<u8>,
        last: bool,
    ) -> Flow {
        match cmd::deliver_chunk(platform, self.transport, self.sessions.get(key), &chunk, last) {
            cmd::ChunkOutcome::Busy(effects) => {
                // Effects that must not repeat on retry stick even across a busy
                cmd::apply_effects(self.sessions.get_mut(key), effects, 0);
                Flow::Pending
            }
            cmd::ChunkOutcome::Fatal => Flow::Fatal(CloseStatus::Abort),
            cmd::ChunkOutcome::Failed(e) => {
                self.sessions.get_mut(key).fail(e);
                Flow::Working
            }
            cmd::ChunkOutcome::Accepted(effects) => {
                let session = self.sessions.get_mut(key);
                cmd::apply_effects(session, effects, chunk.len());
                session.segments_consumed = session.segments_consumed.saturating_add(1);
                if last {
                    cmd::finish_recv_leg(session);
                }
                Flow::Working
            }
        }
    }

    /// Build an error response if one is owed, else fall through to completion
    fn enter_error_path(&mut self, key: usize) {
        // Any datagram staged for the old leg is abandoned
        if self
            .outbound
            .as_ref()
            .is_some_and(|o| o.session == Some(key))
        {
            self.outbound = None;
        }
        let session = self.sessions.get_mut(key);
        session.release_buffers();
        session.bytes_processed = 0;
        session.segments_consumed = 0;
        if session.origin == Origin::Cloud
            && session.flags.response_needed
            && !session.flags.is_response
        {
            // Error responses carry a 2-byte error id followed by readable text
            let error = session.error.unwrap_or(SessionError::Internal);
            let mut out = error.wire_code().to_be_bytes().to_vec();
            out.extend_from_slice(error.to_string().as_bytes());
            session.out_expected = out.len();
            session.out = out;
            session.flags.is_response = true;
            session.flags.multipart = false;
            session.flags.compressed = false;
            session.segments_total = 0;
            session.segments_sent = 0;
            session.state = SessionState::PrepareSegment;
        } else {
            session.state = SessionState::Complete;
        }
    }

    /// Inform the owning facility, honor a deferred reboot, and drop the session
    fn finish_session<P: Platform>(&mut self, platform: &mut P, key: usize) -> Flow {
        let status = cmd::final_status(self.sessions.get(key));
        match cmd::inform_completion(platform, self.transport, self.sessions.get(key), status) {
            Callback::Busy => return Flow::Pending,
            Callback::Abort => return Flow::Fatal(CloseStatus::Abort),
            _ => {}
        }
        let session = self.sessions.remove(key);
        if session.flags.reboot {
            info!("rebooting at session teardown");
            let _ = platform.reboot();
        }
        Flow::Working
    }
}

/// Record what segment 0 says about the session's command and error status
fn apply_seg0(
    session: &mut Session,
    origin: Origin,
    cs: packet::CmdStatus,
) -> Result<(), SessionError> {
    match origin {
        Origin::Cloud => {
            let Some(command) = Command::from_wire(cs.code()) else {
                return Err(SessionError::InvalidOpcode);
            };
            if command == Command::Pack {
                return Err(SessionError::InvalidOpcode);
            }
            session.command = command;
        }
        Origin::Client => {
            session.flags.error = cs.is_error();
        }
    }
    Ok(())
}
