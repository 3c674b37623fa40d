use ciwatch_core::protocol::{decode_frame, FrameError};
use ciwatch_core::{Backoff, Delta, DeltaKind, Message, Query, Route, Snapshot};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Synced,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Synced => "synced",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Resource path and query string one channel is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub route: Route,
    pub query: Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Frame from a transport this connection has already replaced.
    Stale,
    Closed,
    /// Delta with no snapshot on this transport to apply it to.
    BeforeSnapshot(DeltaKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `first` is set for the first snapshot on a transport; applying it
    /// completes a (re)synchronisation.
    Snapshot { snapshot: Snapshot, first: bool },
    Delta(Delta),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    First,
    Resync,
}

/// Lifecycle of one push channel: which transport is current, whether it has
/// delivered its snapshot yet, and how long to wait before the next retry.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    target: Target,
    state: ConnectionState,
    backoff: Backoff,
    has_synced: bool,
    generation: u64,
    max_frame_bytes: usize,
}

impl ChannelConnection {
    pub fn open(target: Target, generation: u64, max_frame_bytes: usize) -> Self {
        Self {
            target,
            state: ConnectionState::Connecting,
            backoff: Backoff::default(),
            has_synced: false,
            generation,
            max_frame_bytes,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_synced(&self) -> bool {
        self.has_synced
    }

    pub fn backoff(&self) -> Duration {
        self.backoff.current()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state != ConnectionState::Closed && generation == self.generation
    }

    pub fn receive(&mut self, generation: u64, frame: &str) -> Result<Inbound, FrameError> {
        if self.state == ConnectionState::Closed {
            return Ok(Inbound::Ignored(IgnoreReason::Closed));
        }
        if generation != self.generation || self.state == ConnectionState::Reconnecting {
            return Ok(Inbound::Ignored(IgnoreReason::Stale));
        }
        match decode_frame(frame, self.max_frame_bytes)? {
            Message::Snapshot(snapshot) => Ok(Inbound::Snapshot {
                snapshot,
                first: self.state == ConnectionState::Connecting,
            }),
            Message::Delta(delta) if self.state == ConnectionState::Synced => {
                Ok(Inbound::Delta(delta))
            }
            Message::Delta(delta) => Ok(Inbound::Ignored(IgnoreReason::BeforeSnapshot(delta.kind))),
        }
    }

    /// Records that the first snapshot on the current transport was applied.
    pub fn mark_synced(&mut self) -> SyncKind {
        let kind = if self.has_synced {
            SyncKind::Resync
        } else {
            SyncKind::First
        };
        self.state = ConnectionState::Synced;
        self.has_synced = true;
        self.backoff.reset();
        kind
    }

    /// Transport dropped or failed to connect. Returns the delay before the
    /// next attempt, or `None` if the failure is for a transport that is no
    /// longer current.
    pub fn transport_failed(&mut self, generation: u64) -> Option<Duration> {
        if !self.is_current(generation) || self.state == ConnectionState::Reconnecting {
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        Some(self.backoff.on_failure())
    }

    /// Starts a new transport attempt after the retry delay. Returns false if
    /// the connection is not waiting to retry `generation`.
    pub fn reconnect(&mut self, generation: u64, next_generation: u64) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.generation = next_generation;
        true
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
