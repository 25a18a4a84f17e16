//! Scripted platform and datagram builders shared by the end-to-end tests

use std::collections::VecDeque;
use std::time::Duration;

use crate::packet::{
    encode_udp_preamble, finish_segment, verify_udp_preamble, CmdStatus, Command, SegmentHeader,
    SegmentKind,
};
use crate::platform::{Callback, CliResponse, CloseStatus, NetworkHandle, Platform, UserContext};
use crate::session::SessionStatus;
use crate::{
    Connector, ConnectorConfig, RequestId, Status, Transport, TransportConfig, DEVICE_ID_LEN,
};

pub(super) const DEVICE_ID: [u8; DEVICE_ID_LEN] = [0xAB; DEVICE_ID_LEN];

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// Everything the engine told the application, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Event {
    PingRequest {
        response_required: bool,
    },
    PingResponse {
        status: SessionStatus,
        text: Option<String>,
    },
    DataSendStatus {
        status: SessionStatus,
        text: Option<String>,
    },
    DataResponse {
        data: Vec<u8>,
        last: bool,
    },
    ReceiveTarget {
        target: Option<String>,
    },
    ReceiveData {
        data: Vec<u8>,
        last: bool,
    },
    ReceiveStatus {
        status: SessionStatus,
    },
    CliRequest {
        command: String,
    },
    CliStatus {
        status: SessionStatus,
    },
    Opaque {
        id: u16,
        data: Vec<u8>,
        error: bool,
        last: bool,
    },
    Stopped,
}

/// In-memory platform with scripted network queues
#[derive(Default)]
pub(super) struct TestPlatform {
    pub(super) now: Duration,
    /// Datagrams the engine will receive, one per poll
    pub(super) inbound: VecDeque<Vec<u8>>,
    /// Datagrams the engine sent
    pub(super) sent: Vec<Vec<u8>>,
    /// Number of times network-send answers busy before succeeding
    pub(super) send_busy: usize,
    /// Keep receive-target busy to hold inbound sessions open
    pub(super) hold_receive_target: bool,
    /// Answer the next ping request with an abort
    pub(super) abort_ping: bool,
    /// Request payload for device-initiated data sends
    pub(super) outgoing: Vec<u8>,
    outgoing_cursor: usize,
    /// Reply payload for inbound data requests
    pub(super) reply: Vec<u8>,
    reply_cursor: usize,
    /// Reply payload for inbound CLI commands
    pub(super) cli_reply: Vec<u8>,
    cli_cursor: usize,
    pub(super) events: Vec<Event>,
}

impl Platform for TestPlatform {
    fn network_open(&mut self, _transport: Transport, _url: &str) -> Callback<NetworkHandle> {
        Callback::Continue(NetworkHandle(1))
    }

    fn network_send(
        &mut self,
        _transport: Transport,
        _handle: NetworkHandle,
        data: &[u8],
    ) -> Callback<usize> {
        if self.send_busy > 0 {
            self.send_busy -= 1;
            return Callback::Busy;
        }
        self.sent.push(data.to_vec());
        Callback::Continue(data.len())
    }

    fn network_receive(
        &mut self,
        _transport: Transport,
        _handle: NetworkHandle,
        buf: &mut [u8],
    ) -> Callback<usize> {
        match self.inbound.pop_front() {
            Some(datagram) => {
                assert!(datagram.len() <= buf.len(), "test datagram exceeds MTU");
                buf[..datagram.len()].copy_from_slice(&datagram);
                Callback::Continue(datagram.len())
            }
            None => Callback::Busy,
        }
    }

    fn network_close(
        &mut self,
        _transport: Transport,
        _handle: NetworkHandle,
        _status: CloseStatus,
    ) -> Callback<()> {
        Callback::Continue(())
    }

    fn uptime(&mut self) -> Duration {
        self.now
    }

    fn transport_stopped(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
    ) -> Callback<()> {
        self.events.push(Event::Stopped);
        Callback::Continue(())
    }

    fn ping_request(&mut self, _transport: Transport, response_required: bool) -> Callback<()> {
        if self.abort_ping {
            return Callback::Abort;
        }
        self.events.push(Event::PingRequest { response_required });
        Callback::Continue(())
    }

    fn ping_response(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        status: SessionStatus,
        error_text: Option<&str>,
    ) -> Callback<()> {
        self.events.push(Event::PingResponse {
            status,
            text: error_text.map(str::to_owned),
        });
        Callback::Continue(())
    }

    fn data_send_length(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
    ) -> Callback<usize> {
        Callback::Continue(self.outgoing.len())
    }

    fn data_to_send(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<usize> {
        let n = buf.len().min(self.outgoing.len() - self.outgoing_cursor);
        buf[..n].copy_from_slice(&self.outgoing[self.outgoing_cursor..self.outgoing_cursor + n]);
        self.outgoing_cursor += n;
        Callback::Continue(n)
    }

    fn data_send_status(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        status: SessionStatus,
        error_text: Option<&str>,
    ) -> Callback<()> {
        self.events.push(Event::DataSendStatus {
            status,
            text: error_text.map(str::to_owned),
        });
        Callback::Continue(())
    }

    fn data_response(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        data: &[u8],
        _error: bool,
        last: bool,
    ) -> Callback<()> {
        self.events.push(Event::DataResponse {
            data: data.to_vec(),
            last,
        });
        Callback::Continue(())
    }

    fn receive_target(
        &mut self,
        _transport: Transport,
        target: Option<&str>,
        _response_required: bool,
    ) -> Callback<Option<UserContext>> {
        if self.hold_receive_target {
            return Callback::Busy;
        }
        self.events.push(Event::ReceiveTarget {
            target: target.map(str::to_owned),
        });
        Callback::Continue(Some(UserContext(7)))
    }

    fn receive_data(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        data: &[u8],
        last: bool,
    ) -> Callback<()> {
        self.events.push(Event::ReceiveData {
            data: data.to_vec(),
            last,
        });
        Callback::Continue(())
    }

    fn receive_status(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        status: SessionStatus,
    ) -> Callback<()> {
        self.events.push(Event::ReceiveStatus { status });
        Callback::Continue(())
    }

    fn receive_reply_length(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
    ) -> Callback<usize> {
        Callback::Continue(self.reply.len())
    }

    fn receive_reply_data(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<usize> {
        let n = buf.len().min(self.reply.len() - self.reply_cursor);
        buf[..n].copy_from_slice(&self.reply[self.reply_cursor..self.reply_cursor + n]);
        self.reply_cursor += n;
        Callback::Continue(n)
    }

    fn cli_request(
        &mut self,
        _transport: Transport,
        command: &str,
        _response_required: bool,
    ) -> Callback<Option<UserContext>> {
        self.events.push(Event::CliRequest {
            command: command.to_owned(),
        });
        Callback::Continue(Some(UserContext(9)))
    }

    fn cli_response_length(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
    ) -> Callback<usize> {
        Callback::Continue(self.cli_reply.len())
    }

    fn cli_response(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        buf: &mut [u8],
    ) -> Callback<CliResponse> {
        let n = buf.len().min(self.cli_reply.len() - self.cli_cursor);
        buf[..n].copy_from_slice(&self.cli_reply[self.cli_cursor..self.cli_cursor + n]);
        self.cli_cursor += n;
        Callback::Continue(CliResponse {
            bytes: n,
            status: SessionStatus::Success,
        })
    }

    fn cli_status(
        &mut self,
        _transport: Transport,
        _user: Option<UserContext>,
        status: SessionStatus,
    ) -> Callback<()> {
        self.events.push(Event::CliStatus { status });
        Callback::Continue(())
    }

    fn opaque_response(
        &mut self,
        _transport: Transport,
        id: RequestId,
        data: &[u8],
        error: bool,
        last: bool,
    ) -> Callback<()> {
        self.events.push(Event::Opaque {
            id: id.value(),
            data: data.to_vec(),
            error,
            last,
        });
        Callback::Continue(())
    }
}

/// A UDP-only connector with a fixed request-id seed of 100
pub(super) fn udp_connector(transport: TransportConfig) -> Connector<TestPlatform> {
    let mut config = ConnectorConfig::new(DEVICE_ID, "udp://cloud.example.com");
    config.udp(transport).request_id_seed(100);
    match Connector::new(config, TestPlatform::default()) {
        Ok(c) => c,
        Err(e) => panic!("config rejected: {e}"),
    }
}

pub(super) fn tick(connector: &mut Connector<TestPlatform>, n: usize) {
    for _ in 0..n {
        let status = connector.step();
        assert_ne!(status, Status::Terminated, "unexpected termination");
    }
}

/// Encode a segment with a valid checksum
pub(super) fn segment(header: SegmentHeader, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::new();
    header.encode(&mut seg);
    let header_len = seg.len();
    seg.extend_from_slice(payload);
    finish_segment(&mut seg, header_len);
    seg
}

pub(super) fn udp_datagram(seg: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::new();
    encode_udp_preamble(&mut datagram, &DEVICE_ID);
    datagram.extend_from_slice(seg);
    datagram
}

/// A single-segment cloud request
pub(super) fn request_datagram(
    id: u16,
    command: Command,
    response_needed: bool,
    payload: &[u8],
) -> Vec<u8> {
    let header = SegmentHeader {
        request: true,
        response_needed,
        request_id: RequestId::new(id),
        kind: SegmentKind::Single {
            cs: CmdStatus::request(command, false),
        },
    };
    udp_datagram(&segment(header, payload))
}

/// A single-segment cloud response to a device request
pub(super) fn response_datagram(
    id: RequestId,
    error: bool,
    compressed: bool,
    payload: &[u8],
) -> Vec<u8> {
    let header = SegmentHeader {
        request: false,
        response_needed: false,
        request_id: id,
        kind: SegmentKind::Single {
            cs: CmdStatus::response(error, compressed),
        },
    };
    udp_datagram(&segment(header, payload))
}

pub(super) struct SentSegment {
    pub(super) header: SegmentHeader,
    pub(super) payload: Vec<u8>,
}

/// Parse a datagram the engine emitted over UDP
pub(super) fn parse_sent(datagram: &[u8]) -> SentSegment {
    let skip = verify_udp_preamble(datagram, &DEVICE_ID).unwrap();
    let mut seg = datagram[skip..].to_vec();
    let (header, header_len) = SegmentHeader::decode(&mut seg, true).unwrap();
    SentSegment {
        header,
        payload: seg[header_len..].to_vec(),
    }
}
