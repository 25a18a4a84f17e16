//! SM datagram and segment header coding
//!
//! A UDP datagram is `[version << 4 | id type][device id bytes][segment]`; an SMS
//! message wraps a base85-encoded body in literal `(<id>):` framing. Each segment
//! starts with an info byte (request/response, response-needed, multipart flags plus
//! the two high bits of the request id) and the request id low byte, followed by a
//! layout that depends on the segment's position:
//!
//! * single segment: `[cmd|status][crc:2]`
//! * multipart segment 0: `[segment# = 0][count][cmd|status][crc:2]`
//! * multipart continuation: `[segment#][crc:2]`
//!
//! The CRC is computed over the entire segment (header plus payload) with the CRC
//! field itself zeroed; the decoder zeroes the field in place before checking, which
//! matches the sender's convention exactly.

use std::fmt;

use bytes::BufMut;
use tracing::{debug, trace};

use crate::coding::BufMutExt;
use crate::{crc16, RequestId, SM_UDP_VERSION};

/// Header bytes of a single-segment or continuation segment
pub(crate) const SEGMENT_HEADER_BYTES: usize = 5;
/// Header bytes of the first segment of a multipart session
pub(crate) const SEGMENT0_MULTIPART_HEADER_BYTES: usize = 7;

const INFO_REQUEST: u8 = 0x80;
const INFO_RESPONSE_NEEDED: u8 = 0x40;
const INFO_MULTIPART: u8 = 0x20;
const INFO_ID_HIGH_MASK: u8 = 0x03;

const CS_COMPRESSED: u8 = 0x80;
const CS_ERROR: u8 = 0x40;
const CS_CODE_MASK: u8 = 0x3F;

/// Device identity kinds carried in the UDP preamble type nibble
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum IdType {
    DeviceId = 0x0,
}

/// Wire command codes
///
/// `OpaqueResponse` never appears on the wire; it is assigned locally when a response
/// arrives for a request id whose command context was not retained.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Command {
    Ping,
    Data,
    NoPathData,
    Cli,
    Connect,
    Reboot,
    /// Battery-packed multi-message datagrams; recognized and dropped, never parsed
    Pack,
    OpaqueResponse,
}

impl Command {
    pub(crate) fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Command::Ping,
            0x02 => Command::Data,
            0x03 => Command::NoPathData,
            0x04 => Command::Cli,
            0x05 => Command::Connect,
            0x06 => Command::Reboot,
            0x07 => Command::Pack,
            _ => None?,
        })
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Command::Ping => 0x01,
            Command::Data => 0x02,
            Command::NoPathData => 0x03,
            Command::Cli => 0x04,
            Command::Connect => 0x05,
            Command::Reboot => 0x06,
            Command::Pack => 0x07,
            // Local-only; a session in this state never prepares request segments
            Command::OpaqueResponse => 0x3F,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Command::Ping => "ping",
            Command::Data => "data",
            Command::NoPathData => "no-path data",
            Command::Cli => "CLI",
            Command::Connect => "connect",
            Command::Reboot => "reboot",
            Command::Pack => "pack",
            Command::OpaqueResponse => "opaque response",
        })
    }
}

/// The raw command/status byte of segment 0
///
/// Requests carry a command code in the low bits; responses carry a success/error
/// status instead. Bit 7 marks a compressed payload in either direction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct CmdStatus(pub(crate) u8);

impl CmdStatus {
    pub(crate) fn request(command: Command, compressed: bool) -> Self {
        let mut byte = command.to_wire() & CS_CODE_MASK;
        if compressed {
            byte |= CS_COMPRESSED;
        }
        CmdStatus(byte)
    }

    pub(crate) fn response(error: bool, compressed: bool) -> Self {
        let mut byte = 0;
        if error {
            byte |= CS_ERROR;
        }
        if compressed {
            byte |= CS_COMPRESSED;
        }
        CmdStatus(byte)
    }

    pub(crate) fn compressed(self) -> bool {
        self.0 & CS_COMPRESSED != 0
    }

    /// Command code, meaningful only on requests
    pub(crate) fn code(self) -> u8 {
        self.0 & CS_CODE_MASK
    }

    /// Error marker, meaningful only on responses
    pub(crate) fn is_error(self) -> bool {
        self.0 & CS_ERROR != 0
    }
}

/// Position-dependent trailer of a segment header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SegmentKind {
    /// The session's entire payload fits in this segment
    Single { cs: CmdStatus },
    /// Segment 0 of a multipart session; carries the total segment count
    First { count: u8, cs: CmdStatus },
    /// Segment 1..count-1 of a multipart session
    Continuation { number: u8 },
}

/// Decoded or to-be-encoded segment header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct SegmentHeader {
    /// Set when the peer originated this exchange (i.e. this is a request)
    pub(crate) request: bool,
    /// The sender wants a response
    pub(crate) response_needed: bool,
    pub(crate) request_id: RequestId,
    pub(crate) kind: SegmentKind,
}

/// Why an inbound segment was not accepted
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SegmentDecodeError {
    /// Too short to hold its own header
    Truncated,
    /// Checksum mismatch; drop silently
    Crc,
    /// Multipart segment received while multipart support is disabled
    MultipartUnsupported,
}

impl SegmentHeader {
    pub(crate) fn multipart(&self) -> bool {
        !matches!(self.kind, SegmentKind::Single { .. })
    }

    /// Encoded size of this header
    pub(crate) fn len(&self) -> usize {
        match self.kind {
            SegmentKind::Single { .. } | SegmentKind::Continuation { .. } => SEGMENT_HEADER_BYTES,
            SegmentKind::First { .. } => SEGMENT0_MULTIPART_HEADER_BYTES,
        }
    }

    /// Append this header to `buf` with the CRC field zeroed
    ///
    /// Call [`finish_segment`] once the payload has been appended to patch the real
    /// checksum in.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        let mut info = self.request_id.high_bits() & INFO_ID_HIGH_MASK;
        if self.request {
            info |= INFO_REQUEST;
        }
        if self.response_needed {
            info |= INFO_RESPONSE_NEEDED;
        }
        if self.multipart() {
            info |= INFO_MULTIPART;
        }
        buf.write(info);
        buf.write(self.request_id.low_byte());
        match self.kind {
            SegmentKind::Single { cs } => buf.write(cs.0),
            SegmentKind::First { count, cs } => {
                buf.write(0u8);
                buf.write(count);
                buf.write(cs.0);
            }
            SegmentKind::Continuation { number } => buf.write(number),
        }
        buf.put_u16(0); // CRC, patched by finish_segment
    }

    /// Parse and checksum-verify the segment occupying all of `segment`
    ///
    /// Returns the header and its encoded length; the payload is the remainder of the
    /// slice. Zeroes the CRC field in place as a side effect of verification.
    pub(crate) fn decode(
        segment: &mut [u8],
        multipart_enabled: bool,
    ) -> Result<(Self, usize), SegmentDecodeError> {
        if segment.len() < SEGMENT_HEADER_BYTES {
            return Err(SegmentDecodeError::Truncated);
        }

        let info = segment[0];
        let request_id = RequestId::new((u16::from(info & INFO_ID_HIGH_MASK) << 8) | u16::from(segment[1]));
        let multipart = info & INFO_MULTIPART != 0;
        if multipart && !multipart_enabled {
            debug!("multipart segment received but multipart is disabled, discarding");
            return Err(SegmentDecodeError::MultipartUnsupported);
        }

        let (kind, header_len) = if multipart {
            let number = segment[2];
            if number == 0 {
                if segment.len() < SEGMENT0_MULTIPART_HEADER_BYTES {
                    return Err(SegmentDecodeError::Truncated);
                }
                (
                    SegmentKind::First {
                        count: segment[3],
                        cs: CmdStatus(segment[4]),
                    },
                    SEGMENT0_MULTIPART_HEADER_BYTES,
                )
            } else {
                (SegmentKind::Continuation { number }, SEGMENT_HEADER_BYTES)
            }
        } else {
            (
                SegmentKind::Single {
                    cs: CmdStatus(segment[2]),
                },
                SEGMENT_HEADER_BYTES,
            )
        };

        let crc_offset = header_len - 2;
        let wire_crc = u16::from_be_bytes([segment[crc_offset], segment[crc_offset + 1]]);
        segment[crc_offset] = 0;
        segment[crc_offset + 1] = 0;
        if crc16::compute(segment) != wire_crc {
            trace!("segment CRC mismatch, discarding");
            return Err(SegmentDecodeError::Crc);
        }

        Ok((
            SegmentHeader {
                request: info & INFO_REQUEST != 0,
                response_needed: info & INFO_RESPONSE_NEEDED != 0,
                request_id,
                kind,
            },
            header_len,
        ))
    }
}

/// Patch the checksum of a fully assembled segment
///
/// `segment` holds the header (with zeroed CRC field) plus payload; `header_len` is
/// the value returned by [`SegmentHeader::len`].
pub(crate) fn finish_segment(segment: &mut [u8], header_len: usize) {
    let crc = crc16::compute(segment);
    let crc_offset = header_len - 2;
    segment[crc_offset..crc_offset + 2].copy_from_slice(&crc.to_be_bytes());
}

/// Outcome of preamble verification on an inbound datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PreambleError {
    /// Unknown protocol version; the channel cannot be trusted
    Version,
    /// Well-formed but addressed to a different device; drop silently
    NotForUs,
    /// Too short to hold a preamble
    Truncated,
}

/// Append the UDP datagram preamble
pub(crate) fn encode_udp_preamble(buf: &mut Vec<u8>, device_id: &[u8]) {
    buf.write(SM_UDP_VERSION << 4 | IdType::DeviceId as u8);
    buf.extend_from_slice(device_id);
}

/// Verify an inbound UDP preamble, returning the number of bytes it occupies
pub(crate) fn verify_udp_preamble(datagram: &[u8], device_id: &[u8]) -> Result<usize, PreambleError> {
    if datagram.len() < 1 + device_id.len() {
        return Err(PreambleError::Truncated);
    }
    let version = datagram[0] >> 4;
    if version != SM_UDP_VERSION {
        debug!(version, "invalid SM/UDP version");
        return Err(PreambleError::Version);
    }
    if datagram[0] & 0x0F != IdType::DeviceId as u8 {
        return Err(PreambleError::NotForUs);
    }
    if &datagram[1..1 + device_id.len()] != device_id {
        return Err(PreambleError::NotForUs);
    }
    Ok(1 + device_id.len())
}

/// Append the SMS `(<id>):` framing
pub(crate) fn encode_sms_preamble(buf: &mut Vec<u8>, shared_id: &[u8]) {
    if !shared_id.is_empty() {
        buf.write(b'(');
        buf.extend_from_slice(shared_id);
        buf.extend_from_slice(b"):");
    }
}

/// Verify inbound SMS framing, returning the number of characters it occupies
pub(crate) fn verify_sms_preamble(message: &[u8], shared_id: &[u8]) -> Result<usize, PreambleError> {
    if shared_id.is_empty() {
        return Ok(0);
    }
    let total = 1 + shared_id.len() + 2;
    if message.len() < total {
        return Err(PreambleError::Truncated);
    }
    if message[0] != b'('
        || &message[1..1 + shared_id.len()] != shared_id
        || &message[1 + shared_id.len()..total] != b"):"
    {
        return Err(PreambleError::NotForUs);
    }
    Ok(total)
}
