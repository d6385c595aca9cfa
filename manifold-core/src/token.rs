//! Socket handles shared between the manager and bridges.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::Socket;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, RawSocket};

use crate::sys;

/// Raw OS handle the socket lookup is keyed by.
#[cfg(unix)]
pub type RawHandle = RawFd;
/// Raw OS handle the socket lookup is keyed by.
#[cfg(windows)]
pub type RawHandle = RawSocket;

/// Value handle over one OS socket.
///
/// Cheap to clone; every clone refers to the same socket. The empty token
/// ([`SocketToken::NONE`]) stands in wherever no connection exists. The
/// socket is closed once the last clone is dropped.
#[derive(Clone, Default)]
pub struct SocketToken {
    inner: Option<Arc<TokenInner>>,
}

struct TokenInner {
    socket: Socket,
    shut: AtomicBool,
}

impl SocketToken {
    /// The empty token.
    pub const NONE: SocketToken = SocketToken { inner: None };

    pub(crate) fn new(socket: Socket) -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                socket,
                shut: AtomicBool::new(false),
            })),
        }
    }

    /// True if this token refers to a socket.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.inner.is_some()
    }

    /// Bytes buffered by the OS for reading; zero for the empty token and
    /// after shutdown.
    pub fn available(&self) -> io::Result<usize> {
        match &self.inner {
            Some(inner) if !inner.shut.load(Ordering::Acquire) => {
                sys::bytes_available(raw_handle(&inner.socket))
            }
            _ => Ok(0),
        }
    }

    /// False for the empty token, after shutdown, and once the OS no longer
    /// reports a peer.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match &self.inner {
            Some(inner) => {
                !inner.shut.load(Ordering::Acquire) && inner.socket.peer_addr().is_ok()
            }
            None => false,
        }
    }

    /// Shut the socket down in both directions. Idempotent; returns true on
    /// the call that actually performed the shutdown.
    ///
    /// Bridges tearing down their own connection may call this directly;
    /// [`SocketManager::shutdown`](crate::manager::SocketManager::shutdown)
    /// additionally removes the handle from the poll reader's lookup.
    pub fn shutdown(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        if inner
            .shut
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(err) = inner.socket.shutdown(std::net::Shutdown::Both) {
            tracing::trace!(%err, "socket shutdown reported an error");
        }
        true
    }

    /// Raw lookup key, when a socket is present.
    pub(crate) fn handle(&self) -> Option<RawHandle> {
        self.inner.as_ref().map(|inner| raw_handle(&inner.socket))
    }

    /// Clone the underlying socket as a standard byte stream for the bridge.
    pub(crate) fn clone_stream(&self) -> io::Result<TcpStream> {
        match &self.inner {
            Some(inner) => Ok(inner.socket.try_clone()?.into()),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

fn raw_handle(socket: &Socket) -> RawHandle {
    #[cfg(unix)]
    {
        socket.as_raw_fd()
    }
    #[cfg(windows)]
    {
        socket.as_raw_socket()
    }
}

impl fmt::Debug for SocketToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(handle) => f.debug_tuple("SocketToken").field(&handle).finish(),
            None => f.write_str("SocketToken(none)"),
        }
    }
}
