//! Outbound connect path: resolve, tune, connect, hand over to the read
//! regime.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{debug, error, trace, warn};

use crate::bridge::SocketBridge;
use crate::endpoint::Endpoint;
use crate::error::ManifoldError;
use crate::manager::Shared;
use crate::monitor::ManagerEvent;
use crate::state::ReadRegime;
use crate::sys;
use crate::token::SocketToken;

/// Idle time before the first keepalive probe.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Open, tune and connect a socket for `addr`.
fn open_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    sys::enable_fast_loopback(&socket);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
        // The probe cadence is an optimization; a host that rejects it
        // still gets a working connection.
        warn!(%err, "tcp keepalive unavailable");
    }
    socket.set_nodelay(true)?;

    socket.connect(&addr.into())?;
    Ok(socket)
}

/// Drive one connect attempt end to end. Runs on a short-lived
/// `{name}:Connect` thread; every outcome is delivered through the bridge.
pub(crate) fn run_connect(shared: &Arc<Shared>, endpoint: Endpoint, bridge: Arc<dyn SocketBridge>) {
    trace!(
        manager = shared.name(),
        %endpoint,
        bridge = bridge.name(),
        "connect attempt"
    );

    let addr = match endpoint.resolve() {
        Ok(addr) => addr,
        Err(err) => {
            error!(%endpoint, %err, "endpoint resolution failed");
            shared.emit(ManagerEvent::ConnectFailed {
                endpoint,
                reason: err.to_string(),
            });
            bridge.error();
            return;
        }
    };

    let socket = match open_socket(addr) {
        Ok(socket) => socket,
        Err(err) => {
            let err = ManifoldError::from(err);
            if err.is_recoverable() {
                warn!(%endpoint, %err, "connect failed; endpoint may come back");
            } else {
                error!(%endpoint, %err, "connect failed");
            }
            shared.emit(ManagerEvent::ConnectFailed {
                endpoint,
                reason: err.to_string(),
            });
            bridge.error();
            return;
        }
    };

    let token = SocketToken::new(socket);
    if shared.is_disposed() {
        // Disposal raced the connect; the bridge still hears about it.
        token.shutdown();
        bridge.error();
        return;
    }

    let stream = match token.clone_stream() {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%endpoint, %err, "socket clone for bridge failed");
            shared.shutdown_token(&token);
            bridge.error();
            return;
        }
    };

    match bridge.connected(stream, token.clone()) {
        Ok(true) => {}
        Ok(false) => {
            let err = ManifoldError::ConnectionRejected;
            debug!(bridge = bridge.name(), %err, "bridge declined the connection");
            shared.emit(ManagerEvent::ConnectFailed {
                endpoint,
                reason: err.to_string(),
            });
            shared.shutdown_token(&token);
            return;
        }
        Err(err) => {
            warn!(bridge = bridge.name(), %err, "connected callback failed");
            shared.shutdown_token(&token);
            return;
        }
    }

    match shared.regime() {
        ReadRegime::Sync => {
            if shared.add_read(token.clone(), Arc::clone(&bridge)) {
                shared.emit(ManagerEvent::Connected(endpoint));
            } else {
                // Disposal raced the handover.
                shared.shutdown_token(&token);
                bridge.error();
            }
        }
        ReadRegime::Async => match bridge.start_reading() {
            Ok(()) => shared.emit(ManagerEvent::Connected(endpoint)),
            Err(err) => {
                warn!(bridge = bridge.name(), %err, "start_reading failed");
                shared.shutdown_token(&token);
                bridge.error();
            }
        },
        ReadRegime::Abort => {
            shared.shutdown_token(&token);
            bridge.error();
        }
    }
}
