//! Session registry.
//!
//! Sole owner of the open-connection set, the controller slot and the
//! streaming/recording flags. Every mutation is one short critical section on
//! a non-async lock, so no transition can interleave with another or span an
//! await point. Callers get back an outcome describing what changed and decide
//! what to log and broadcast.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::connection::{ClientConnection, ConnectionId};

/// Point-in-time copy of the control state.
///
/// `recording_active` implies `streaming_active`. Once a controller's
/// disconnect has been processed, no controller means both flags are false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub controller: Option<ConnectionId>,
    pub streaming_active: bool,
    pub recording_active: bool,
}

/// Result of removing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub remaining: usize,
    pub was_controller: bool,
    /// Streaming and/or recording were forced off by this departure
    pub forced_stop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRelease {
    NotController,
    Released { forced_stop: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    Started { controller_assigned: bool },
    AlreadyStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStop {
    Stopped { recording_was_active: bool },
    /// Sender is not the controller, or nothing was active
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStart {
    Started,
    /// Streaming is on but the sender does not hold the controller slot
    NotController,
    NotStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStop {
    Stopped,
    Rejected,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<dyn ClientConnection>>,
    state: SessionState,
}

impl Inner {
    fn force_stop(&mut self) -> bool {
        let was_active = self.state.streaming_active || self.state.recording_active;
        self.state.recording_active = false;
        self.state.streaming_active = false;
        was_active
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, returning the number now registered.
    pub fn register(&self, conn: Arc<dyn ClientConnection>) -> usize {
        let mut inner = self.inner.lock();
        inner.connections.insert(conn.id(), conn);
        inner.connections.len()
    }

    /// Remove a connection. If it held the controller slot, the slot is
    /// cleared and streaming/recording are forced off. This is the only path
    /// by which a disconnect revokes authority.
    pub fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.lock();
        inner.connections.remove(&id)?;

        let was_controller = inner.state.controller == Some(id);
        let mut forced_stop = false;
        if was_controller {
            forced_stop = inner.force_stop();
            inner.state.controller = None;
        }

        Some(Departure {
            remaining: inner.connections.len(),
            was_controller,
            forced_stop,
        })
    }

    pub fn is_controller(&self, id: ConnectionId) -> bool {
        self.inner.lock().state.controller == Some(id)
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles to every connection that still reports itself open
    pub fn connections(&self) -> Vec<Arc<dyn ClientConnection>> {
        self.inner
            .lock()
            .connections
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// STOP_LINK: the controller gives up the slot, stopping anything active.
    pub fn release_link(&self, sender: ConnectionId) -> LinkRelease {
        let mut inner = self.inner.lock();
        if inner.state.controller != Some(sender) {
            return LinkRelease::NotController;
        }
        let forced_stop = inner.force_stop();
        inner.state.controller = None;
        LinkRelease::Released { forced_stop }
    }

    /// START_STREAM: first claimer wins the controller slot.
    pub fn start_stream(&self, sender: ConnectionId) -> StreamStart {
        let mut inner = self.inner.lock();
        if inner.state.streaming_active {
            return StreamStart::AlreadyStreaming;
        }
        inner.state.streaming_active = true;
        let controller_assigned = inner.state.controller.is_none();
        if controller_assigned {
            inner.state.controller = Some(sender);
        }
        StreamStart::Started {
            controller_assigned,
        }
    }

    /// STOP_STREAM: recording is cleared before streaming, then the slot is released.
    pub fn stop_stream(&self, sender: ConnectionId) -> StreamStop {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        if state.controller != Some(sender) || !(state.streaming_active || state.recording_active) {
            return StreamStop::Rejected;
        }
        let recording_was_active = state.recording_active;
        state.recording_active = false;
        state.streaming_active = false;
        state.controller = None;
        StreamStop::Stopped {
            recording_was_active,
        }
    }

    pub fn start_record(&self, sender: ConnectionId) -> RecordStart {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        if !state.streaming_active {
            return RecordStart::NotStreaming;
        }
        if state.controller != Some(sender) {
            return RecordStart::NotController;
        }
        state.recording_active = true;
        RecordStart::Started
    }

    pub fn stop_record(&self, sender: ConnectionId) -> RecordStop {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        if state.controller != Some(sender) || !state.recording_active {
            return RecordStop::Rejected;
        }
        state.recording_active = false;
        RecordStop::Stopped
    }
}
