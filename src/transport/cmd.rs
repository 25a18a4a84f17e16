//! Command dispatch: routing reassembled payload chunks to the owning facility
//!
//! These are free functions over an immutable [`Session`] view so the driver can
//! hold the session borrow while talking to the platform; mutations are returned as
//! [`ChunkEffects`] and applied afterwards. A busy facility may be handed the same
//! chunk again next tick, so every effect that must not repeat (informing the data
//! service of its target, for one) is recorded even on a busy outcome.

use std::time::Duration;

use tracing::debug;

use super::PendingAction;
use crate::packet::Command;
use crate::platform::{Callback, Platform, UserContext};
use crate::session::{Session, SessionError, SessionState, SessionStatus};
use crate::{Origin, Transport};

/// Result of offering one payload chunk to the owning facility
pub(super) enum ChunkOutcome {
    /// Chunk consumed; apply the effects and advance
    Accepted(ChunkEffects),
    /// Facility not ready; apply the effects, keep the chunk, retry next tick
    Busy(ChunkEffects),
    /// Session-local failure
    Failed(SessionError),
    /// Transport-fatal
    Fatal,
}

/// Session mutations produced by command dispatch
#[derive(Default)]
pub(super) struct ChunkEffects {
    /// New user context returned by the facility
    pub(super) user: Option<Option<UserContext>>,
    pub(super) target_informed: bool,
    pub(super) reboot: bool,
    /// Response size cap requested by an inbound CLI command
    pub(super) max_response: Option<usize>,
    /// Error id and text parsed from a cloud error response
    pub(super) error: Option<(SessionError, Option<String>)>,
}

/// Route one chunk of a reassembled payload to the facility owning this session
pub(super) fn deliver_chunk<P: Platform>(
    platform: &mut P,
    transport: Transport,
    session: &Session,
    chunk: &[u8],
    last: bool,
) -> ChunkOutcome {
    let first = session.bytes_processed == 0;
    if session.origin == Origin::Client || session.flags.is_response {
        deliver_response(platform, transport, session, chunk, first, last)
    } else {
        deliver_request(platform, transport, session, chunk, first, last)
    }
}

/// A response leg arriving at a client-owned (or opaque) session
fn deliver_response<P: Platform>(
    platform: &mut P,
    transport: Transport,
    session: &Session,
    chunk: &[u8],
    first: bool,
    last: bool,
) -> ChunkOutcome {
    match session.command {
        Command::OpaqueResponse => unit(platform.opaque_response(
            transport,
            session.request_id,
            chunk,
            session.flags.error,
            last,
        )),
        _ if session.flags.error => {
            // Error responses carry [error-id:2][text...]; recorded on the session
            // and surfaced through the completion callback, not as payload
            let mut effects = ChunkEffects::default();
            if first {
                if chunk.len() < 2 {
                    return ChunkOutcome::Failed(SessionError::Format);
                }
                let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                let text = (chunk.len() > 2)
                    .then(|| String::from_utf8_lossy(&chunk[2..]).into_owned());
                debug!(code, "cloud error response");
                effects.error = Some((
                    SessionError::from_wire(code).unwrap_or(SessionError::Cloud),
                    text,
                ));
            }
            ChunkOutcome::Accepted(effects)
        }
        Command::Data | Command::NoPathData => unit(if session.flags.datapoint {
            platform.data_point_response(transport, session.user, chunk, false, last)
        } else {
            platform.data_response(transport, session.user, chunk, false, last)
        }),
        // Ping and the transport commands carry no response payload worth routing
        _ => ChunkOutcome::Accepted(ChunkEffects::default()),
    }
}

/// An inbound request leg at a cloud-owned session
fn deliver_request<P: Platform>(
    platform: &mut P,
    transport: Transport,
    session: &Session,
    chunk: &[u8],
    first: bool,
    last: bool,
) -> ChunkOutcome {
    match session.command {
        Command::Ping => {
            if !first {
                return ChunkOutcome::Accepted(ChunkEffects::default());
            }
            match platform.ping_request(transport, session.flags.response_needed) {
                Callback::Busy => ChunkOutcome::Busy(ChunkEffects::default()),
                Callback::Abort => ChunkOutcome::Fatal,
                Callback::Error => ChunkOutcome::Failed(SessionError::Internal),
                // A ping can be answered without any application involvement
                Callback::Continue(()) | Callback::Unrecognized => {
                    ChunkOutcome::Accepted(ChunkEffects::default())
                }
            }
        }
        Command::Data | Command::NoPathData => {
            let mut effects = ChunkEffects::default();
            let rest = if first && session.command == Command::Data {
                let Some((target, rest)) = parse_target(chunk) else {
                    return ChunkOutcome::Failed(SessionError::Format);
                };
                if !session.flags.target_informed {
                    match platform.receive_target(
                        transport,
                        target.as_deref(),
                        session.flags.response_needed,
                    ) {
                        Callback::Continue(user) => {
                            effects.user = Some(user);
                            effects.target_informed = true;
                        }
                        Callback::Busy => return ChunkOutcome::Busy(effects),
                        Callback::Abort => return ChunkOutcome::Fatal,
                        Callback::Error => return ChunkOutcome::Failed(SessionError::Internal),
                        Callback::Unrecognized => {
                            return ChunkOutcome::Failed(SessionError::NoService)
                        }
                    }
                }
                rest
            } else if first && !session.flags.target_informed {
                match platform.receive_target(transport, None, session.flags.response_needed) {
                    Callback::Continue(user) => {
                        effects.user = Some(user);
                        effects.target_informed = true;
                    }
                    Callback::Busy => return ChunkOutcome::Busy(effects),
                    Callback::Abort => return ChunkOutcome::Fatal,
                    Callback::Error => return ChunkOutcome::Failed(SessionError::Internal),
                    Callback::Unrecognized => return ChunkOutcome::Failed(SessionError::NoService),
                }
                chunk
            } else {
                chunk
            };
            let user = effects.user.unwrap_or(session.user);
            match platform.receive_data(transport, user, rest, last) {
                Callback::Continue(()) => ChunkOutcome::Accepted(effects),
                Callback::Busy => ChunkOutcome::Busy(effects),
                Callback::Abort => ChunkOutcome::Fatal,
                Callback::Error => ChunkOutcome::Failed(SessionError::Internal),
                Callback::Unrecognized => ChunkOutcome::Failed(SessionError::NoService),
            }
        }
        Command::Cli => {
            if !first {
                // The command string must fit the first segment
                return ChunkOutcome::Failed(SessionError::Format);
            }
            let Some(nul) = chunk.iter().position(|&b| b == 0) else {
                return ChunkOutcome::Failed(SessionError::Format);
            };
            let command = String::from_utf8_lossy(&chunk[..nul]).into_owned();
            let rest = &chunk[nul + 1..];
            let mut effects = ChunkEffects::default();
            if rest.len() >= 2 {
                effects.max_response = Some(usize::from(u16::from_be_bytes([rest[0], rest[1]])));
            }
            match platform.cli_request(transport, &command, session.flags.response_needed) {
                Callback::Continue(user) => {
                    effects.user = Some(user);
                    ChunkOutcome::Accepted(effects)
                }
                Callback::Busy => ChunkOutcome::Busy(ChunkEffects::default()),
                Callback::Abort => ChunkOutcome::Fatal,
                Callback::Error => ChunkOutcome::Failed(SessionError::Internal),
                Callback::Unrecognized => ChunkOutcome::Failed(SessionError::NoService),
            }
        }
        Command::Connect => {
            if !first {
                return ChunkOutcome::Accepted(ChunkEffects::default());
            }
            // The cloud asks the device to bring up its framed TCP transport
            match platform.transport_start_requested(Transport::Tcp) {
                Callback::Busy => ChunkOutcome::Busy(ChunkEffects::default()),
                Callback::Abort => ChunkOutcome::Fatal,
                _ => ChunkOutcome::Accepted(ChunkEffects::default()),
            }
        }
        Command::Reboot => {
            // Deferred until the session tears down, after the response is out
            let effects = ChunkEffects {
                reboot: true,
                ..ChunkEffects::default()
            };
            ChunkOutcome::Accepted(effects)
        }
        Command::Pack | Command::OpaqueResponse => {
            ChunkOutcome::Failed(SessionError::InvalidOpcode)
        }
    }
}

fn unit(cb: Callback<()>) -> ChunkOutcome {
    match cb {
        Callback::Continue(()) => ChunkOutcome::Accepted(ChunkEffects::default()),
        Callback::Busy => ChunkOutcome::Busy(ChunkEffects::default()),
        Callback::Abort => ChunkOutcome::Fatal,
        Callback::Error => ChunkOutcome::Failed(SessionError::Internal),
        Callback::Unrecognized => ChunkOutcome::Failed(SessionError::NoService),
    }
}

/// Split a `[len:1][target bytes]` prefix off a device request's first chunk
fn parse_target(chunk: &[u8]) -> Option<(Option<String>, &[u8])> {
    let len = usize::from(*chunk.first()?);
    let rest = chunk.get(1..)?;
    if rest.len() < len {
        return None;
    }
    let target = (len > 0).then(|| String::from_utf8_lossy(&rest[..len]).into_owned());
    Some((target, &rest[len..]))
}

/// Apply dispatch effects to the session; `consumed` advances the chunk cursor
pub(super) fn apply_effects(session: &mut Session, effects: ChunkEffects, consumed: usize) {
    session.bytes_processed += consumed;
    if let Some(user) = effects.user {
        session.user = user;
    }
    if effects.target_informed {
        session.flags.target_informed = true;
    }
    if effects.reboot {
        session.flags.reboot = true;
    }
    if let Some(max) = effects.max_response {
        session.max_response_bytes = Some(max);
    }
    if let Some((error, text)) = effects.error {
        session.error = Some(error);
        session.error_text = text;
    }
}

/// Turn the session around after its inbound payload has been fully processed
///
/// If a response is owed the session re-enters the send path as the response leg;
/// otherwise it completes.
pub(super) fn finish_recv_leg(session: &mut Session) {
    session.release_buffers();
    session.segments_consumed = 0;
    session.bytes_processed = 0;
    if session.flags.response_needed && !session.flags.is_response {
        session.flags.is_response = true;
        session.flags.multipart = false;
        session.flags.compressed = false;
        session.segments_total = 0;
        session.segments_sent = 0;
        session.state = SessionState::GetTotalLength;
    } else {
        session.state = SessionState::Complete;
    }
}

/// Turn the session around after its outbound leg has been fully transmitted
pub(super) fn finish_send_leg(session: &mut Session, now: Duration) {
    session.release_buffers();
    session.bytes_processed = 0;
    if session.flags.response_needed && !session.flags.is_response {
        session.state = SessionState::ReceiveData;
        session.start_time = now;
    } else {
        session.state = SessionState::Complete;
    }
}

/// The status a completing session reports to its owning facility
pub(super) fn final_status(session: &Session) -> SessionStatus {
    match session.error {
        Some(_) => SessionStatus::from_error(session.error),
        None if session.origin.is_client() && session.flags.is_response => SessionStatus::Success,
        None => SessionStatus::Complete,
    }
}

/// Tell the owning facility the session is done
pub(super) fn inform_completion<P: Platform>(
    platform: &mut P,
    transport: Transport,
    session: &Session,
    status: SessionStatus,
) -> Callback<()> {
    let error_text = session.error_text.as_deref();
    match (session.origin, session.command) {
        (Origin::Client, Command::Ping) => {
            platform.ping_response(transport, session.user, status, error_text)
        }
        (Origin::Client, Command::Data | Command::NoPathData) => {
            if session.flags.datapoint {
                platform.data_point_status(transport, session.user, status, error_text)
            } else {
                platform.data_send_status(transport, session.user, status, error_text)
            }
        }
        (Origin::Cloud, Command::Data | Command::NoPathData) => {
            if session.flags.target_informed {
                platform.receive_status(transport, session.user, status)
            } else {
                Callback::Continue(())
            }
        }
        (Origin::Cloud, Command::Cli) => {
            if matches!(status, SessionStatus::Success | SessionStatus::Complete) {
                Callback::Continue(())
            } else {
                platform.cli_status(transport, session.user, status)
            }
        }
        _ => Callback::Continue(()),
    }
}

/// A queued action that never became a session still owes its facility a status
pub(super) fn inform_pending_cancelled<P: Platform>(
    platform: &mut P,
    transport: Transport,
    action: &PendingAction,
) {
    match action.command {
        Command::Ping => {
            let _ = platform.ping_response(transport, action.user, SessionStatus::Cancel, None);
        }
        Command::Data | Command::NoPathData => {
            let _ = if action.datapoint {
                platform.data_point_status(transport, action.user, SessionStatus::Cancel, None)
            } else {
                platform.data_send_status(transport, action.user, SessionStatus::Cancel, None)
            };
        }
        _ => {}
    }
}
