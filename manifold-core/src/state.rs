//! Diagnostic state exposed by the socket manager.
//!
//! `ManagerState` narrates which phase the poll reader is in so a hang can
//! be diagnosed from another thread without taking any lock; both cells in
//! this module are plain atomics.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// How replies are read for sockets owned by a manager.
///
/// Chosen once at construction from the host platform and never
/// user-configurable; `Abort` is entered on disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadRegime {
    /// Each bridge arranges its own asynchronous read chain.
    Async = 0,
    /// The manager-wide poll reader services every socket.
    Sync = 1,
    /// The manager is disposing; no new sockets are accepted.
    Abort = 2,
}

impl ReadRegime {
    /// Regime for the host platform.
    ///
    /// Windows dispatches async socket completions on dedicated I/O
    /// threads. Everywhere else completions share the general worker pool,
    /// which couples reply latency to whatever the host process is doing,
    /// so reading gets dedicated threads instead.
    #[must_use]
    pub fn for_host() -> Self {
        if cfg!(windows) {
            Self::Async
        } else {
            Self::Sync
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Async,
            1 => Self::Sync,
            _ => Self::Abort,
        }
    }

    /// Get the regime as a string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Sync => "sync",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for ReadRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current phase of the poll reader.
///
/// Purely diagnostic: readable at any time, from any thread, without
/// synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ManagerState {
    /// No poll reader is running.
    Inactive = 0,
    /// Reader loop entered, nothing started yet.
    Preparing = 1,
    /// Checking whether the heartbeat interval elapsed.
    CheckForHeartbeat = 2,
    /// Invoking `on_heartbeat` across the bridge snapshot.
    ExecuteHeartbeat = 3,
    /// Partitioning the lookup into live and dead sockets.
    LocateActiveSockets = 4,
    /// Removing sockets observed disconnected.
    CullDeadSockets = 5,
    /// Lookup is empty; waiting for a socket or for the exit deadline.
    NoSocketsPause = 6,
    /// Building the handle array for the readiness call.
    PrepareActiveSockets = 7,
    /// Blocked in the readiness call.
    ExecuteSelect = 8,
    /// Readiness call returned.
    ExecuteSelectComplete = 9,
    /// Invoking `read` callbacks for ready sockets.
    DispatchRead = 10,
    /// Invoking `error` callbacks for faulted sockets.
    DispatchError = 11,
    /// Readiness reported nothing usable; probing `is_data_available`.
    DispatchReadFallback = 12,
    /// Probing bridges for staleness after an idle cycle.
    CheckForStaleConnections = 13,
    /// Reader hit an unrecoverable fault.
    Faulted = 14,
    /// Reader exited because the manager was disposed.
    Terminated = 15,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Preparing,
            2 => Self::CheckForHeartbeat,
            3 => Self::ExecuteHeartbeat,
            4 => Self::LocateActiveSockets,
            5 => Self::CullDeadSockets,
            6 => Self::NoSocketsPause,
            7 => Self::PrepareActiveSockets,
            8 => Self::ExecuteSelect,
            9 => Self::ExecuteSelectComplete,
            10 => Self::DispatchRead,
            11 => Self::DispatchError,
            12 => Self::DispatchReadFallback,
            13 => Self::CheckForStaleConnections,
            14 => Self::Faulted,
            15 => Self::Terminated,
            _ => Self::Inactive,
        }
    }

    /// Get the state as a string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Preparing => "preparing",
            Self::CheckForHeartbeat => "check-for-heartbeat",
            Self::ExecuteHeartbeat => "execute-heartbeat",
            Self::LocateActiveSockets => "locate-active-sockets",
            Self::CullDeadSockets => "cull-dead-sockets",
            Self::NoSocketsPause => "no-sockets-pause",
            Self::PrepareActiveSockets => "prepare-active-sockets",
            Self::ExecuteSelect => "execute-select",
            Self::ExecuteSelectComplete => "execute-select-complete",
            Self::DispatchRead => "dispatch-read",
            Self::DispatchError => "dispatch-error",
            Self::DispatchReadFallback => "dispatch-read-fallback",
            Self::CheckForStaleConnections => "check-for-stale-connections",
            Self::Faulted => "faulted",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock-free cell holding a [`ManagerState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new(state: ManagerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn set(&self, state: ManagerState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> ManagerState {
        ManagerState::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// Lock-free cell holding a [`ReadRegime`].
#[derive(Debug)]
pub(crate) struct RegimeCell(AtomicU8);

impl RegimeCell {
    pub(crate) const fn new(regime: ReadRegime) -> Self {
        Self(AtomicU8::new(regime as u8))
    }

    pub(crate) fn set(&self, regime: ReadRegime) {
        self.0.store(regime as u8, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> ReadRegime {
        ReadRegime::from_u8(self.0.load(Ordering::Relaxed))
    }
}
