//! Bounded per-transport collection of in-flight sessions
//!
//! Sessions live in a slot map with free-list reuse; a hash index keyed by
//! `(request id, origin)` gives O(1) lookup since client- and cloud-originated ids
//! are independent spaces. Sweep order is insertion order with a resumable cursor so
//! the step driver never favors low request ids.

use std::time::Duration;

use rustc_hash::FxHashMap;
use slab::Slab;
use tracing::trace;

use crate::packet::Command;
use crate::session::{Session, SessionState};
use crate::{Origin, RequestId};

/// Why a session could not be created
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum CreateError {
    /// Admission bound hit; retry on a later tick
    Full,
    /// Request id already open for this origin
    InUse,
}

pub(crate) struct SessionTable {
    slab: Slab<Session>,
    index: FxHashMap<(RequestId, Origin), usize>,
    /// Slab keys in insertion order
    order: Vec<usize>,
    /// Key to resume the next sweep at
    cursor: Option<usize>,
    max_sessions: usize,
    max_segments: u8,
    active_client: usize,
    active_cloud: usize,
    last_request_id: RequestId,
}

impl SessionTable {
    pub(crate) fn new(max_sessions: usize, max_segments: u8, seed: u16) -> Self {
        SessionTable {
            slab: Slab::with_capacity(max_sessions),
            index: FxHashMap::default(),
            order: Vec::with_capacity(max_sessions),
            cursor: None,
            max_sessions,
            max_segments,
            active_client: 0,
            active_cloud: 0,
            last_request_id: RequestId::new(seed),
        }
    }

    pub(crate) fn max_segments(&self) -> u8 {
        self.max_segments
    }

    pub(crate) fn is_full(&self) -> bool {
        self.active_client + self.active_cloud >= self.max_sessions
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    /// Pick a fresh client request id, skipping ids still open in the table
    pub(crate) fn allocate_request_id(&mut self) -> RequestId {
        loop {
            self.last_request_id = self.last_request_id.wrapping_next();
            if !self
                .index
                .contains_key(&(self.last_request_id, Origin::Client))
            {
                return self.last_request_id;
            }
        }
    }

    /// Admit a new session, or report why it cannot be admitted
    pub(crate) fn create(
        &mut self,
        request_id: RequestId,
        origin: Origin,
        command: Command,
        state: SessionState,
        now: Duration,
    ) -> Result<usize, CreateError> {
        if self.is_full() {
            return Err(CreateError::Full);
        }
        if self.index.contains_key(&(request_id, origin)) {
            return Err(CreateError::InUse);
        }
        let key = self
            .slab
            .insert(Session::new(request_id, origin, command, state, now));
        self.index.insert((request_id, origin), key);
        self.order.push(key);
        match origin {
            Origin::Client => self.active_client += 1,
            Origin::Cloud => self.active_cloud += 1,
        }
        trace!(%request_id, ?origin, total = self.slab.len(), "session created");
        Ok(key)
    }

    pub(crate) fn lookup(&self, request_id: RequestId, origin: Origin) -> Option<usize> {
        self.index.get(&(request_id, origin)).copied()
    }

    /// Find a session by request id alone, preferring a client-owned match
    ///
    /// Used by cancel, which matches by id and tolerates an origin mismatch.
    pub(crate) fn lookup_any_origin(&self, request_id: RequestId) -> Option<usize> {
        self.lookup(request_id, Origin::Client)
            .or_else(|| self.lookup(request_id, Origin::Cloud))
    }

    pub(crate) fn get(&self, key: usize) -> &Session {
        &self.slab[key]
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> &mut Session {
        &mut self.slab[key]
    }

    pub(crate) fn remove(&mut self, key: usize) -> Session {
        let session = self.slab.remove(key);
        self.index.remove(&(session.request_id, session.origin));
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
        if self.cursor == Some(key) {
            self.cursor = None;
        }
        match session.origin {
            Origin::Client => self.active_client -= 1,
            Origin::Cloud => self.active_cloud -= 1,
        }
        trace!(request_id = %session.request_id, total = self.slab.len(), "session removed");
        session
    }

    /// Keys of all sessions in ring order, starting at the sweep cursor
    pub(crate) fn sweep(&self) -> Vec<usize> {
        let start = self
            .cursor
            .and_then(|c| self.order.iter().position(|&k| k == c))
            .unwrap_or(0);
        let mut keys = Vec::with_capacity(self.order.len());
        keys.extend_from_slice(&self.order[start..]);
        keys.extend_from_slice(&self.order[..start]);
        keys
    }

    /// Resume the next sweep at the session after `key` in insertion order
    pub(crate) fn resume_after(&mut self, key: usize) {
        let pos = self.order.iter().position(|&k| k == key);
        self.cursor = pos.and_then(|p| self.order.get(p + 1).copied());
    }
}
