//! Outbound leg: payload assembly, optional compression, segmentation, transmission
//!
//! The payload is pulled from the owning facility chunk by chunk, deflated when that
//! pays off, split into wire segments, and emitted one datagram per pass through the
//! transport's single staged-outbound slot. A busy network callback leaves the
//! staged datagram in place so the retry transmits identical bytes.

use std::time::Duration;

use tracing::{debug, trace};

use super::{Flow, OutboundDatagram, SmTransport};
use crate::packet::{
    encode_sms_preamble, encode_udp_preamble, finish_segment, CmdStatus, Command, SegmentHeader,
    SegmentKind, SEGMENT0_MULTIPART_HEADER_BYTES, SEGMENT_HEADER_BYTES,
};
use crate::platform::{Callback, CloseStatus, Platform};
use crate::session::{Session, SessionError, SessionState, SessionStatus};
use crate::{base85, Transport, DEVICE_ID_LEN};

impl SmTransport {
    /// Drive one send-path session one step
    pub(super) fn drive_send<P: Platform>(
        &mut self,
        platform: &mut P,
        key: usize,
        now: Duration,
    ) -> Flow {
        match self.sessions.get(key).state {
            SessionState::GetTotalLength => self.get_total_length(platform, key),
            SessionState::PreparePayload => self.prepare_payload(key),
            SessionState::MoreData => self.more_data(platform, key),
            SessionState::Compress => self.compress(key),
            SessionState::PrepareSegment => self.prepare_segment(key),
            SessionState::SendData => self.send_data(platform, key, now),
            _ => Flow::Idle,
        }
    }

    /// Ask the owning facility how many payload bytes this leg will carry
    fn get_total_length<P: Platform>(&mut self, platform: &mut P, key: usize) -> Flow {
        let session = self.sessions.get(key);
        let cb: Callback<usize> = if session.flags.is_response {
            match session.command {
                Command::Data | Command::NoPathData => {
                    platform.receive_reply_length(self.transport, session.user)
                }
                Command::Cli => platform.cli_response_length(self.transport, session.user),
                // Ping, connect and reboot are acknowledged with an empty response
                _ => Callback::Continue(0),
            }
        } else {
            match session.command {
                Command::Data | Command::NoPathData => {
                    platform.data_send_length(self.transport, session.user)
                }
                _ => Callback::Continue(0),
            }
        };
        match cb {
            Callback::Continue(total) => {
                let session = self.sessions.get_mut(key);
                session.out_expected = total;
                session.state = SessionState::PreparePayload;
                Flow::Working
            }
            Callback::Busy => Flow::Pending,
            Callback::Abort => Flow::Fatal(CloseStatus::Abort),
            Callback::Error => {
                self.sessions.get_mut(key).fail(SessionError::Internal);
                Flow::Working
            }
            Callback::Unrecognized => {
                self.sessions.get_mut(key).fail(SessionError::NoService);
                Flow::Working
            }
        }
    }

    /// Allocate the outbound buffer and write the fixed request prefix
    fn prepare_payload(&mut self, key: usize) -> Flow {
        let compress_over = self.stride();
        let compression = self.config.compression_enabled();
        let session = self.sessions.get_mut(key);
        session.out = Vec::with_capacity(session.out_expected + 64);
        session.bytes_processed = 0;
        if !session.flags.is_response && session.command == Command::Data {
            // Device requests carry a length-prefixed target path before the payload
            let Some(path) = session.path.as_deref() else {
                session.fail(SessionError::Format);
                return Flow::Working;
            };
            if path.len() > usize::from(u8::MAX) {
                session.fail(SessionError::Format);
                return Flow::Working;
            }
            session.out.push(path.len() as u8);
            session.out.extend_from_slice(path.as_bytes());
        }
        session.state = if session.out_expected > 0 {
            SessionState::MoreData
        } else {
            next_after_payload(session, compression, compress_over)
        };
        Flow::Working
    }

    /// Pull the next chunk of payload bytes from the owning facility
    fn more_data<P: Platform>(&mut self, platform: &mut P, key: usize) -> Flow {
        let stride = self.stride();
        let transport = self.transport;
        let compression = self.config.compression_enabled();
        let session = self.sessions.get_mut(key);

        let remaining = session.out_expected.saturating_sub(session.bytes_processed);
        let mut cap = remaining.min(stride);
        if let Some(max) = session.max_response_bytes {
            // An inbound CLI command may cap each response chunk
            cap = cap.min(max);
        }
        if cap == 0 {
            session.state = next_after_payload(session, compression, stride);
            return Flow::Working;
        }

        let mut buf = vec![0u8; cap];
        let pulled = if session.flags.is_response {
            match session.command {
                Command::Cli => match platform.cli_response(transport, session.user, &mut buf) {
                    Callback::Continue(reply) => match reply.status {
                        SessionStatus::Success | SessionStatus::Complete => {
                            Callback::Continue(reply.bytes)
                        }
                        SessionStatus::Cancel => {
                            session.fail(SessionError::Cancel);
                            return Flow::Working;
                        }
                        SessionStatus::Timeout => {
                            session.fail(SessionError::Timeout);
                            return Flow::Working;
                        }
                        SessionStatus::Error(e) => {
                            session.fail(e);
                            return Flow::Working;
                        }
                    },
                    Callback::Busy => Callback::Busy,
                    Callback::Abort => Callback::Abort,
                    Callback::Error => Callback::Error,
                    Callback::Unrecognized => Callback::Unrecognized,
                },
                _ => platform.receive_reply_data(transport, session.user, &mut buf),
            }
        } else {
            platform.data_to_send(transport, session.user, &mut buf)
        };

        match pulled {
            Callback::Continue(n) => {
                let n = n.min(cap);
                if n == 0 {
                    // The facility is done early; close the leg at what we have
                    session.out_expected = session.bytes_processed;
                } else {
                    session.out.extend_from_slice(&buf[..n]);
                    session.bytes_processed += n;
                }
                if session.bytes_processed >= session.out_expected {
                    session.state = next_after_payload(session, compression, stride);
                }
                Flow::Working
            }
            Callback::Busy => Flow::Pending,
            Callback::Abort => Flow::Fatal(CloseStatus::Abort),
            Callback::Error => {
                session.fail(SessionError::Internal);
                Flow::Working
            }
            Callback::Unrecognized => {
                session.fail(SessionError::NoService);
                Flow::Working
            }
        }
    }

    /// Deflate the assembled payload, keeping it only when it actually shrinks
    #[cfg(feature = "compression")]
    fn compress(&mut self, key: usize) -> Flow {
        let session = self.sessions.get_mut(key);
        match crate::zlib::deflate(&session.out) {
            Ok(stream) => {
                // The zlib header is not transmitted; the peer substitutes its own
                let wire = &stream[crate::zlib::ZLIB_HEADER_BYTES..];
                if wire.len() < session.out.len() {
                    trace!(
                        from = session.out.len(),
                        to = wire.len(),
                        "payload compressed"
                    );
                    session.out = wire.to_vec();
                    session.flags.compressed = true;
                }
                session.state = SessionState::PrepareSegment;
                Flow::Working
            }
            Err(_) => {
                session.fail(SessionError::Compression);
                Flow::Working
            }
        }
    }

    #[cfg(not(feature = "compression"))]
    fn compress(&mut self, key: usize) -> Flow {
        let session = self.sessions.get_mut(key);
        session.state = SessionState::PrepareSegment;
        Flow::Working
    }

    /// Split the payload into wire segments
    fn prepare_segment(&mut self, key: usize) -> Flow {
        let stride = self.stride();
        let first_capacity = self.first_capacity();
        let max_segments = usize::from(self.sessions.max_segments());
        let multipart_ok = self.multipart_enabled();
        let session = self.sessions.get_mut(key);

        let len = session.out.len();
        if len <= stride {
            session.segments_total = 1;
            session.flags.multipart = false;
        } else {
            if !multipart_ok {
                debug!(len, "payload does not fit a single segment");
                session.fail(SessionError::Memory);
                return Flow::Working;
            }
            let rest = len - first_capacity;
            let count = 1 + (rest + stride - 1) / stride;
            if count > max_segments || count > usize::from(u8::MAX) {
                debug!(len, count, "payload exceeds the segment bound");
                session.fail(SessionError::Memory);
                return Flow::Working;
            }
            session.segments_total = count as u8;
            session.flags.multipart = true;
        }
        session.segments_sent = 0;
        session.state = SessionState::SendData;
        Flow::Working
    }

    /// Emit the next segment through the transport's single staged-outbound slot
    fn send_data<P: Platform>(&mut self, platform: &mut P, key: usize, now: Duration) -> Flow {
        if self
            .outbound
            .as_ref()
            .is_some_and(|o| o.session != Some(key))
        {
            // Another session's datagram is still in flight
            return Flow::Pending;
        }
        if self.outbound.is_none() {
            let data = self.build_datagram(key);
            self.outbound = Some(OutboundDatagram {
                session: Some(key),
                data,
                sent: 0,
            });
        }
        self.flush_outbound(platform, now)
    }

    /// Assemble the datagram carrying segment `segments_sent` of this session
    fn build_datagram(&self, key: usize) -> Vec<u8> {
        let session = self.sessions.get(key);
        let capacity = self.segment_capacity();
        let stride = capacity - SEGMENT_HEADER_BYTES;
        let first_capacity = capacity - SEGMENT0_MULTIPART_HEADER_BYTES;

        let idx = usize::from(session.segments_sent);
        let out = &session.out;
        let (start, end) = if !session.flags.multipart {
            (0, out.len())
        } else if idx == 0 {
            (0, first_capacity.min(out.len()))
        } else {
            let start = first_capacity + (idx - 1) * stride;
            (start, (start + stride).min(out.len()))
        };

        let cs = if session.flags.is_response {
            CmdStatus::response(session.flags.error, session.flags.compressed)
        } else {
            CmdStatus::request(session.command, session.flags.compressed)
        };
        let kind = if !session.flags.multipart {
            SegmentKind::Single { cs }
        } else if idx == 0 {
            SegmentKind::First {
                count: session.segments_total,
                cs,
            }
        } else {
            SegmentKind::Continuation {
                number: session.segments_sent,
            }
        };
        let header = SegmentHeader {
            request: !session.flags.is_response,
            response_needed: !session.flags.is_response && session.flags.response_needed,
            request_id: session.request_id,
            kind,
        };

        let mut segment = Vec::with_capacity(header.len() + (end - start));
        header.encode(&mut segment);
        let header_len = segment.len();
        segment.extend_from_slice(&out[start..end]);
        finish_segment(&mut segment, header_len);
        trace!(
            request_id = %session.request_id,
            segment = idx,
            of = session.segments_total,
            bytes = segment.len(),
            "segment built"
        );

        match self.transport {
            Transport::Sms => {
                let mut message = Vec::new();
                if let Some(id) = &self.service_id {
                    encode_sms_preamble(&mut message, id);
                }
                let start = message.len();
                message.resize(start + base85::encoded_len(segment.len()), 0);
                let written = base85::encode(&mut message[start..], &segment);
                message.truncate(start + written);
                message
            }
            _ => {
                let mut datagram = Vec::with_capacity(1 + DEVICE_ID_LEN + segment.len());
                encode_udp_preamble(&mut datagram, &self.device_id);
                datagram.extend_from_slice(&segment);
                datagram
            }
        }
    }
}

/// Where the session goes once its outbound payload is fully assembled
fn next_after_payload(session: &Session, compression: bool, single_limit: usize) -> SessionState {
    if compression && session.out.len() > single_limit {
        SessionState::Compress
    } else {
        SessionState::PrepareSegment
    }
}
