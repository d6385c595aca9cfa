//! Manager lifecycle event monitoring.
//!
//! Provides an event stream for tracking what the socket manager's threads
//! are doing: connects, socket installs, helper spawns, shutdowns.

use crate::endpoint::Endpoint;
use std::fmt;

/// Socket manager lifecycle events.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// An outbound connect completed and the bridge accepted the socket.
    Connected(Endpoint),

    /// A connect attempt failed before handover.
    ConnectFailed {
        /// Endpoint the connect was aimed at.
        endpoint: Endpoint,
        /// Why it failed.
        reason: String,
    },

    /// A socket was installed into the poll reader's lookup.
    SocketInstalled {
        /// Name of the owning bridge.
        bridge: String,
    },

    /// A socket was shut down and removed.
    SocketShutdown,

    /// The dedicated writer thread started.
    WriterStarted,

    /// The dedicated writer thread exited.
    WriterExited,

    /// A one-shot write helper thread was spawned for a burst.
    HelperSpawned,

    /// The poll reader thread started.
    ReaderStarted,

    /// The poll reader thread exited.
    ReaderExited,

    /// The manager was disposed.
    Disposed,
}

impl fmt::Display for ManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(ep) => write!(f, "Connected to {ep}"),
            Self::ConnectFailed { endpoint, reason } => {
                write!(f, "Connect failed for {endpoint}: {reason}")
            }
            Self::SocketInstalled { bridge } => write!(f, "Socket installed for {bridge}"),
            Self::SocketShutdown => write!(f, "Socket shut down"),
            Self::WriterStarted => write!(f, "Writer started"),
            Self::WriterExited => write!(f, "Writer exited"),
            Self::HelperSpawned => write!(f, "Write helper spawned"),
            Self::ReaderStarted => write!(f, "Poll reader started"),
            Self::ReaderExited => write!(f, "Poll reader exited"),
            Self::Disposed => write!(f, "Manager disposed"),
        }
    }
}

/// Handle for receiving manager events.
pub type ManagerMonitor = flume::Receiver<ManagerEvent>;

/// Internal sender for manager events.
pub(crate) type ManagerEventSender = flume::Sender<ManagerEvent>;

/// Creates a new monitoring channel pair.
pub(crate) fn create_monitor() -> (ManagerEventSender, ManagerMonitor) {
    flume::unbounded()
}
