//! End-to-end exercises of the engine against a scripted platform
//!
//! Each test pumps a fixed number of ticks; the engine alternates receive and send
//! passes and advances one session state per pass, so a full exchange settles well
//! within a few dozen ticks.

use std::time::Duration;

use assert_matches::assert_matches;

use crate::packet::{CmdStatus, Command, SegmentHeader, SegmentKind};
use crate::{
    base85, Connector, ConnectorConfig, InitiateError, RequestId, SendRequest, SessionStatus,
    SmsConfig, Status, StopCondition, Transport, TransportConfig, UserContext,
};

mod util;
use util::*;

#[test]
fn ping_round_trip() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    let id = match c.ping(Transport::Udp, true, Some(UserContext(1))) {
        Ok(id) => id,
        Err(e) => panic!("ping refused: {e}"),
    };
    tick(&mut c, 30);

    assert_eq!(c.platform().sent.len(), 1);
    let datagram = c.platform().sent[0].clone();
    assert_eq!(datagram[0], 0x10);
    assert_eq!(&datagram[1..17], &DEVICE_ID);
    let sent = parse_sent(&datagram);
    assert!(sent.header.request);
    assert!(sent.header.response_needed);
    assert_eq!(sent.header.request_id, id);
    assert_matches!(sent.header.kind, SegmentKind::Single { cs } if cs.code() == 0x01);
    assert!(sent.payload.is_empty());
    assert!(c.platform().events.is_empty());

    c.platform_mut()
        .inbound
        .push_back(response_datagram(id, false, false, b""));
    tick(&mut c, 30);
    assert_eq!(
        c.platform().events,
        vec![Event::PingResponse {
            status: SessionStatus::Success,
            text: None,
        }]
    );
}

#[test]
fn one_pending_action_at_a_time() {
    let mut c = udp_connector(TransportConfig::default());
    c.ping(Transport::Udp, false, None).unwrap();
    assert_matches!(
        c.ping(Transport::Udp, false, None),
        Err(InitiateError::Busy)
    );
    assert_matches!(
        c.ping(Transport::Sms, false, None),
        Err(InitiateError::NotConfigured)
    );
}

#[test]
fn busy_send_retries_identical_bytes() {
    let _guard = subscribe();
    let mut smooth = udp_connector(TransportConfig::default());
    smooth.ping(Transport::Udp, true, None).unwrap();
    tick(&mut smooth, 30);
    assert_eq!(smooth.platform().sent.len(), 1);

    let mut contended = udp_connector(TransportConfig::default());
    contended.platform_mut().send_busy = 5;
    contended.ping(Transport::Udp, true, None).unwrap();
    tick(&mut contended, 60);

    assert_eq!(contended.platform().sent, smooth.platform().sent);
}

#[test]
fn cancel_emits_no_further_traffic() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().send_busy = usize::MAX;
    let id = c.ping(Transport::Udp, true, Some(UserContext(4))).unwrap();
    tick(&mut c, 20);
    assert!(c.platform().sent.is_empty());

    c.cancel(Transport::Udp, id).unwrap();
    assert_eq!(
        c.platform().events,
        vec![Event::PingResponse {
            status: SessionStatus::Cancel,
            text: None,
        }]
    );
    assert_matches!(
        c.cancel(Transport::Udp, id),
        Err(InitiateError::UnknownSession)
    );

    c.platform_mut().send_busy = 0;
    tick(&mut c, 20);
    assert!(c.platform().sent.is_empty());
}

#[test]
fn inbound_ping_is_answered() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut()
        .inbound
        .push_back(request_datagram(5, Command::Ping, true, b""));
    tick(&mut c, 30);

    assert_eq!(
        c.platform().events,
        vec![Event::PingRequest {
            response_required: true,
        }]
    );
    assert_eq!(c.platform().sent.len(), 1);
    let sent = parse_sent(&c.platform().sent[0]);
    assert!(!sent.header.request);
    assert_eq!(sent.header.request_id.value(), 5);
    assert_matches!(sent.header.kind, SegmentKind::Single { cs } if !cs.is_error());
    assert!(sent.payload.is_empty());
}

#[test]
fn unknown_opcode_is_nacked() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    let header = SegmentHeader {
        request: true,
        response_needed: true,
        request_id: RequestId::new(33),
        kind: SegmentKind::Single {
            cs: CmdStatus(0x20),
        },
    };
    c.platform_mut()
        .inbound
        .push_back(udp_datagram(&segment(header, b"")));
    tick(&mut c, 30);

    assert!(c.platform().events.is_empty());
    assert_eq!(c.platform().sent.len(), 1);
    let sent = parse_sent(&c.platform().sent[0]);
    assert!(!sent.header.request);
    assert_eq!(sent.header.request_id.value(), 33);
    assert_matches!(sent.header.kind, SegmentKind::Single { cs } if cs.is_error());
    assert_eq!(&sent.payload[..2], &2u16.to_be_bytes());
    assert_eq!(&sent.payload[2..], b"invalid opcode");
}

#[test]
fn corrupted_datagram_is_ignored() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    let mut datagram = request_datagram(9, Command::NoPathData, false, b"hello");
    let last = datagram.len() - 1;
    datagram[last] ^= 0x10;
    c.platform_mut().inbound.push_back(datagram);
    tick(&mut c, 20);
    assert!(c.platform().events.is_empty());
    assert!(c.platform().sent.is_empty());

    // The intact copy is admitted as a fresh session
    c.platform_mut()
        .inbound
        .push_back(request_datagram(9, Command::NoPathData, false, b"hello"));
    tick(&mut c, 20);
    assert_eq!(
        c.platform().events,
        vec![
            Event::ReceiveTarget { target: None },
            Event::ReceiveData {
                data: b"hello".to_vec(),
                last: true,
            },
            Event::ReceiveStatus {
                status: SessionStatus::Complete,
            },
        ]
    );
}

#[test]
fn session_table_bound_holds() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.max_sessions(2);
    let mut c = udp_connector(transport);
    c.platform_mut().hold_receive_target = true;
    for id in [1u16, 2, 3] {
        c.platform_mut()
            .inbound
            .push_back(request_datagram(id, Command::NoPathData, false, b"x"));
    }
    tick(&mut c, 30);
    // Two sessions are held open on the busy facility; the third was discarded
    assert!(c.platform().events.is_empty());
    assert!(c.platform().inbound.is_empty());

    c.platform_mut().hold_receive_target = false;
    tick(&mut c, 30);
    let targets = c
        .platform()
        .events
        .iter()
        .filter(|e| matches!(e, Event::ReceiveTarget { .. }))
        .count();
    assert_eq!(targets, 2);
    let done = c
        .platform()
        .events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::ReceiveStatus {
                    status: SessionStatus::Complete,
                }
            )
        })
        .count();
    assert_eq!(done, 2);
}

#[test]
fn data_request_reply_flow() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().reply = b"stored".to_vec();
    let mut payload = vec![4u8];
    payload.extend_from_slice(b"data");
    payload.extend_from_slice(b"rest");
    c.platform_mut()
        .inbound
        .push_back(request_datagram(7, Command::Data, true, &payload));
    tick(&mut c, 40);

    assert_eq!(
        c.platform().events,
        vec![
            Event::ReceiveTarget {
                target: Some("data".into()),
            },
            Event::ReceiveData {
                data: b"rest".to_vec(),
                last: true,
            },
            Event::ReceiveStatus {
                status: SessionStatus::Complete,
            },
        ]
    );
    assert_eq!(c.platform().sent.len(), 1);
    let sent = parse_sent(&c.platform().sent[0]);
    assert!(!sent.header.request);
    assert_eq!(sent.header.request_id.value(), 7);
    assert_eq!(sent.payload, b"stored");
}

#[test]
fn device_data_send_round_trip() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().outgoing = b"hello world".to_vec();
    let id = c
        .send_data(SendRequest {
            transport: Transport::Udp,
            path: Some("storage/log.txt".into()),
            response_needed: true,
            user: Some(UserContext(2)),
        })
        .unwrap();
    tick(&mut c, 40);

    assert_eq!(c.platform().sent.len(), 1);
    let sent = parse_sent(&c.platform().sent[0]);
    assert!(sent.header.request);
    assert_matches!(sent.header.kind, SegmentKind::Single { cs } if cs.code() == 0x02);
    let mut expect = vec![15u8];
    expect.extend_from_slice(b"storage/log.txt");
    expect.extend_from_slice(b"hello world");
    assert_eq!(sent.payload, expect);

    c.platform_mut()
        .inbound
        .push_back(response_datagram(id, false, false, b"ok"));
    tick(&mut c, 40);
    assert_eq!(
        c.platform().events,
        vec![
            Event::DataResponse {
                data: b"ok".to_vec(),
                last: true,
            },
            Event::DataSendStatus {
                status: SessionStatus::Success,
                text: None,
            },
        ]
    );
}

#[test]
fn overlong_path_is_refused() {
    let mut c = udp_connector(TransportConfig::default());
    let refused = c.send_data(SendRequest {
        transport: Transport::Udp,
        path: Some("x".repeat(300)),
        response_needed: false,
        user: None,
    });
    assert_matches!(refused, Err(InitiateError::PathTooLong));
}

#[test]
fn error_response_reports_code_and_text() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    let id = c.ping(Transport::Udp, true, None).unwrap();
    tick(&mut c, 30);

    let mut payload = 13u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"request timed out");
    c.platform_mut()
        .inbound
        .push_back(response_datagram(id, true, false, &payload));
    tick(&mut c, 30);
    assert_eq!(
        c.platform().events,
        vec![Event::PingResponse {
            status: SessionStatus::Timeout,
            text: Some("request timed out".into()),
        }]
    );
}

#[test]
fn response_timeout() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.rx_timeout(Some(Duration::from_secs(5)));
    let mut c = udp_connector(transport);
    c.ping(Transport::Udp, true, None).unwrap();
    tick(&mut c, 30);
    assert_eq!(c.platform().sent.len(), 1);
    assert!(c.platform().events.is_empty());

    c.platform_mut().now = Duration::from_secs(60);
    tick(&mut c, 20);
    assert_eq!(
        c.platform().events,
        vec![Event::PingResponse {
            status: SessionStatus::Timeout,
            text: None,
        }]
    );
}

#[test]
fn cli_request_and_response() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().cli_reply = b"7.1.0".to_vec();
    c.platform_mut()
        .inbound
        .push_back(request_datagram(11, Command::Cli, true, b"show version\0"));
    tick(&mut c, 40);

    // cli_status is only reported on abnormal completion
    assert_eq!(
        c.platform().events,
        vec![Event::CliRequest {
            command: "show version".into(),
        }]
    );
    assert_eq!(c.platform().sent.len(), 1);
    let sent = parse_sent(&c.platform().sent[0]);
    assert!(!sent.header.request);
    assert_eq!(sent.payload, b"7.1.0");
}

#[cfg(feature = "multipart")]
#[test]
fn multipart_reassembles_out_of_order() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.mtu(40).max_segments(4);
    let mut c = udp_connector(transport);

    // mtu 40 leaves 23 segment bytes: 16 payload in segment 0, 18 per continuation
    let payload: Vec<u8> = (0u8..40).collect();
    let id = RequestId::new(3);
    let first = SegmentHeader {
        request: true,
        response_needed: false,
        request_id: id,
        kind: SegmentKind::First {
            count: 3,
            cs: CmdStatus::request(Command::NoPathData, false),
        },
    };
    let cont = |number| SegmentHeader {
        request: true,
        response_needed: false,
        request_id: id,
        kind: SegmentKind::Continuation { number },
    };
    for datagram in [
        udp_datagram(&segment(cont(2), &payload[34..])),
        udp_datagram(&segment(first, &payload[..16])),
        udp_datagram(&segment(cont(1), &payload[16..34])),
    ] {
        c.platform_mut().inbound.push_back(datagram);
    }
    tick(&mut c, 40);

    assert_eq!(
        c.platform().events,
        vec![
            Event::ReceiveTarget { target: None },
            Event::ReceiveData {
                data: payload[..16].to_vec(),
                last: false,
            },
            Event::ReceiveData {
                data: payload[16..34].to_vec(),
                last: false,
            },
            Event::ReceiveData {
                data: payload[34..].to_vec(),
                last: true,
            },
            Event::ReceiveStatus {
                status: SessionStatus::Complete,
            },
        ]
    );
}

#[cfg(feature = "multipart")]
#[test]
fn late_duplicate_segment_leaves_the_session_intact() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.mtu(40).max_segments(4);
    let mut c = udp_connector(transport);
    // Keep the facility busy so the session is still mid-delivery when the
    // duplicated datagram arrives
    c.platform_mut().hold_receive_target = true;

    let payload: Vec<u8> = (0u8..40).collect();
    let id = RequestId::new(6);
    let first = SegmentHeader {
        request: true,
        response_needed: false,
        request_id: id,
        kind: SegmentKind::First {
            count: 3,
            cs: CmdStatus::request(Command::NoPathData, false),
        },
    };
    let cont = |number| SegmentHeader {
        request: true,
        response_needed: false,
        request_id: id,
        kind: SegmentKind::Continuation { number },
    };
    for datagram in [
        udp_datagram(&segment(first, &payload[..16])),
        udp_datagram(&segment(cont(1), &payload[16..34])),
        udp_datagram(&segment(cont(2), &payload[34..])),
        // The network duplicated a datagram; it lands after reassembly completed
        udp_datagram(&segment(cont(1), &payload[16..34])),
    ] {
        c.platform_mut().inbound.push_back(datagram);
    }
    tick(&mut c, 20);
    assert!(c.platform().inbound.is_empty());
    assert!(c.platform().events.is_empty());

    c.platform_mut().hold_receive_target = false;
    tick(&mut c, 40);
    assert_eq!(
        c.platform().events,
        vec![
            Event::ReceiveTarget { target: None },
            Event::ReceiveData {
                data: payload[..16].to_vec(),
                last: false,
            },
            Event::ReceiveData {
                data: payload[16..34].to_vec(),
                last: false,
            },
            Event::ReceiveData {
                data: payload[34..].to_vec(),
                last: true,
            },
            Event::ReceiveStatus {
                status: SessionStatus::Complete,
            },
        ]
    );
}

#[cfg(feature = "compression")]
#[test]
fn compressed_payload_is_inflated() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.compression(true);
    let mut c = udp_connector(transport);

    let payload = vec![0x42u8; 600];
    let deflated = crate::zlib::deflate(&payload).unwrap();
    let wire = &deflated[crate::zlib::ZLIB_HEADER_BYTES..];
    let header = SegmentHeader {
        request: true,
        response_needed: false,
        request_id: RequestId::new(21),
        kind: SegmentKind::Single {
            cs: CmdStatus::request(Command::NoPathData, true),
        },
    };
    c.platform_mut()
        .inbound
        .push_back(udp_datagram(&segment(header, wire)));
    tick(&mut c, 40);

    let received: Vec<u8> = c
        .platform()
        .events
        .iter()
        .filter_map(|e| match e {
            Event::ReceiveData { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(received, payload);
    assert_matches!(
        c.platform().events.last(),
        Some(Event::ReceiveStatus {
            status: SessionStatus::Complete,
        })
    );
}

#[test]
fn response_for_unknown_request_is_opaque() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut()
        .inbound
        .push_back(response_datagram(RequestId::new(555), false, false, b"late"));
    tick(&mut c, 30);
    assert_eq!(
        c.platform().events,
        vec![Event::Opaque {
            id: 555,
            data: b"late".to_vec(),
            error: false,
            last: true,
        }]
    );
    assert!(c.platform().sent.is_empty());
}

#[test]
fn stop_cancels_sessions_and_notifies() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().send_busy = usize::MAX;
    c.ping(Transport::Udp, true, None).unwrap();
    tick(&mut c, 10);

    c.stop(Transport::Udp, StopCondition::Immediately, Some(UserContext(3)))
        .unwrap();
    c.platform_mut().send_busy = 0;
    tick(&mut c, 10);
    assert_eq!(
        c.platform().events,
        vec![
            Event::PingResponse {
                status: SessionStatus::Cancel,
                text: None,
            },
            Event::Stopped,
        ]
    );
    assert!(c.platform().sent.is_empty());

    // A stopped transport can be restarted and is fully functional again
    c.start(Transport::Udp).unwrap();
    c.ping(Transport::Udp, false, None).unwrap();
    tick(&mut c, 30);
    assert_eq!(c.platform().sent.len(), 1);
}

#[test]
fn facility_abort_is_reported_distinctly() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    c.platform_mut().abort_ping = true;
    c.platform_mut()
        .inbound
        .push_back(request_datagram(8, Command::Ping, true, b""));

    let mut seen_abort = false;
    let mut last = Status::Working;
    for _ in 0..30 {
        last = c.step();
        if last == Status::Abort {
            seen_abort = true;
        }
        if last == Status::Terminated {
            break;
        }
    }
    assert!(seen_abort, "abort never surfaced through step");
    assert_eq!(last, Status::Terminated);
}

#[test]
fn terminate_brings_the_engine_down() {
    let _guard = subscribe();
    let mut c = udp_connector(TransportConfig::default());
    tick(&mut c, 5);
    c.terminate();
    let mut last = Status::Working;
    for _ in 0..10 {
        last = c.step();
        if last == Status::Terminated {
            break;
        }
    }
    assert_eq!(last, Status::Terminated);
}

#[test]
fn sms_framing_round_trip() {
    let _guard = subscribe();
    let mut config = ConnectorConfig::new(DEVICE_ID, "447700900123");
    let mut sms = SmsConfig::new("447700900123");
    sms.service_id("4242");
    config.sms(sms).request_id_seed(100);
    let mut c = Connector::new(config, TestPlatform::default()).unwrap();

    let header = SegmentHeader {
        request: true,
        response_needed: true,
        request_id: RequestId::new(12),
        kind: SegmentKind::Single {
            cs: CmdStatus::request(Command::Ping, false),
        },
    };
    let seg = segment(header, b"");
    let mut message = b"(4242):".to_vec();
    let start = message.len();
    message.resize(start + base85::encoded_len(seg.len()), 0);
    let written = base85::encode(&mut message[start..], &seg);
    message.truncate(start + written);
    c.platform_mut().inbound.push_back(message);
    tick(&mut c, 40);

    assert_eq!(
        c.platform().events,
        vec![Event::PingRequest {
            response_required: true,
        }]
    );
    assert_eq!(c.platform().sent.len(), 1);
    let reply = c.platform().sent[0].clone();
    assert_eq!(&reply[..7], b"(4242):");
    let body = &reply[7..];
    let mut seg = vec![0u8; base85::decoded_len(body.len())];
    let len = base85::decode(&mut seg, body).unwrap();
    seg.truncate(len);
    let (decoded, _) = SegmentHeader::decode(&mut seg, true).unwrap();
    assert!(!decoded.request);
    assert_eq!(decoded.request_id.value(), 12);
}
