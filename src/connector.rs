//! Top-level connector: one state machine per configured transport, stepped fairly

use rand::Rng;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, ConnectorConfig};
use crate::packet::Command;
use crate::platform::{CloseStatus, Platform, UserContext};
use crate::transport::{Flow, SmTransport};
use crate::{RequestId, Transport};

/// What one engine tick accomplished
///
/// This is the whole status surface the embedding application sees; per-session
/// outcomes arrive through its own [`Platform`] facility callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    /// Nothing to do; the caller may idle before the next tick
    Idle,
    /// Progress was made; tick again without waiting
    Working,
    /// Blocked on a busy callback or resource; tick again after yielding
    Pending,
    /// A transport hit a fatal protocol or channel error and is reconnecting
    DeviceError,
    /// A platform callback demanded an abort; the transport is going down for good
    Abort,
    /// Every transport is permanently down
    Terminated,
}

/// When a requested transport stop takes effect
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StopCondition {
    /// Cancel all open sessions and close now
    Immediately,
    /// Close once every open session has completed
    WaitSessionsComplete,
}

/// A device-initiated data push
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Transport to ride on
    pub transport: Transport,
    /// Destination path on the cloud side; `None` sends path-less data
    pub path: Option<String>,
    /// Ask the cloud for a response
    pub response_needed: bool,
    /// Context echoed back in every callback for this session
    pub user: Option<UserContext>,
}

/// Why a user-initiated action was refused
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum InitiateError {
    /// Another initiated action is still waiting for a session slot
    #[error("another action is already pending")]
    Busy,
    /// The transport is not part of this connector's configuration
    #[error("transport not configured")]
    NotConfigured,
    /// The transport is stopping or terminated
    #[error("transport is not running")]
    NotRunning,
    /// No open session carries this request id
    #[error("unknown request id")]
    UnknownSession,
    /// A target path longer than 255 bytes cannot be encoded
    #[error("target path too long")]
    PathTooLong,
}

/// The device-side cloud connectivity engine
///
/// Owns the platform implementation and one session-message state machine per
/// configured transport. Drive it by calling [`Connector::step`] from an event loop,
/// or hand the loop over entirely with [`Connector::run`].
pub struct Connector<P: Platform> {
    platform: P,
    transports: Vec<SmTransport>,
    /// Round-robin start index so no transport starves the others
    cursor: usize,
}

impl<P: Platform> Connector<P> {
    /// Build a connector from `config`, taking ownership of the platform
    pub fn new(config: ConnectorConfig, platform: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let seed = config
            .request_id_seed
            .unwrap_or_else(|| rand::thread_rng().gen::<u16>() & RequestId::MAX);
        let mut transports = Vec::new();
        if let Some(udp) = config.udp {
            transports.push(SmTransport::new(
                Transport::Udp,
                udp,
                config.device_id,
                config.cloud_url.clone(),
                None,
                seed,
            ));
        }
        if let Some(sms) = config.sms {
            transports.push(SmTransport::new(
                Transport::Sms,
                sms.transport,
                config.device_id,
                sms.destination,
                sms.service_id.map(String::into_bytes),
                seed,
            ));
        }
        Ok(Connector {
            platform,
            transports,
            cursor: 0,
        })
    }

    /// One non-blocking tick over every transport
    pub fn step(&mut self) -> Status {
        let count = self.transports.len();
        let mut working = false;
        let mut pending = false;
        let mut failed = false;
        let mut aborted = false;
        for i in 0..count {
            let idx = (self.cursor + i) % count;
            match self.transports[idx].step(&mut self.platform) {
                Flow::Working => working = true,
                Flow::Pending => pending = true,
                Flow::Fatal(CloseStatus::Abort) => aborted = true,
                Flow::Fatal(_) => failed = true,
                Flow::Idle => {}
            }
        }
        self.cursor = (self.cursor + 1) % count.max(1);

        if self.transports.iter().all(|t| t.is_terminated()) {
            return Status::Terminated;
        }
        if aborted {
            Status::Abort
        } else if failed {
            Status::DeviceError
        } else if working {
            Status::Working
        } else if pending {
            Status::Pending
        } else {
            Status::Idle
        }
    }

    /// Tick until terminated, yielding to the platform between ticks
    pub fn run(&mut self) {
        loop {
            match self.step() {
                Status::Terminated => return,
                status => self.platform.os_yield(status),
            }
        }
    }

    /// Initiate a ping; the outcome arrives via [`Platform::ping_response`]
    pub fn ping(
        &mut self,
        transport: Transport,
        response_needed: bool,
        user: Option<UserContext>,
    ) -> Result<RequestId, InitiateError> {
        self.transport_mut(transport)?
            .initiate(Command::Ping, response_needed, user, None, false)
    }

    /// Initiate a data push; payload bytes are pulled via [`Platform::data_to_send`]
    ///
    /// Requests whose path begins with `DataPoint` report through the data-point
    /// facility callbacks instead of the plain data-service ones.
    pub fn send_data(&mut self, request: SendRequest) -> Result<RequestId, InitiateError> {
        if request
            .path
            .as_deref()
            .is_some_and(|p| p.len() > usize::from(u8::MAX))
        {
            return Err(InitiateError::PathTooLong);
        }
        let datapoint = request
            .path
            .as_deref()
            .is_some_and(|p| p.starts_with("DataPoint"));
        let command = match request.path {
            Some(_) => Command::Data,
            None => Command::NoPathData,
        };
        self.transport_mut(request.transport)?.initiate(
            command,
            request.response_needed,
            request.user,
            request.path,
            datapoint,
        )
    }

    /// Cancel the session with this request id
    ///
    /// The owning facility is informed synchronously with a cancel status, and no
    /// further network traffic is emitted for the id.
    pub fn cancel(
        &mut self,
        transport: Transport,
        request_id: RequestId,
    ) -> Result<(), InitiateError> {
        let Connector {
            platform,
            transports,
            ..
        } = self;
        let t = transports
            .iter_mut()
            .find(|t| t.transport() == transport)
            .ok_or(InitiateError::NotConfigured)?;
        t.cancel(platform, request_id)
    }

    /// Cancel every open session on `transport` without closing it
    pub fn cancel_all(&mut self, transport: Transport) -> Result<(), InitiateError> {
        let Connector {
            platform,
            transports,
            ..
        } = self;
        let t = transports
            .iter_mut()
            .find(|t| t.transport() == transport)
            .ok_or(InitiateError::NotConfigured)?;
        t.cancel_open_sessions(platform);
        Ok(())
    }

    /// (Re)start a stopped transport
    pub fn start(&mut self, transport: Transport) -> Result<(), InitiateError> {
        self.transport_mut(transport)?.request_start()
    }

    /// Stop a transport; completion is reported via [`Platform::transport_stopped`]
    pub fn stop(
        &mut self,
        transport: Transport,
        condition: StopCondition,
        user: Option<UserContext>,
    ) -> Result<(), InitiateError> {
        self.transport_mut(transport)?.request_stop(condition, user)
    }

    /// Shut every transport down permanently
    pub fn terminate(&mut self) {
        info!("connector terminating");
        for t in &mut self.transports {
            t.request_terminate();
        }
    }

    /// The owned platform implementation
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Mutable access to the owned platform implementation
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    fn transport_mut(&mut self, transport: Transport) -> Result<&mut SmTransport, InitiateError> {
        self.transports
            .iter_mut()
            .find(|t| t.transport() == transport)
            .ok_or(InitiateError::NotConfigured)
    }
}
