//! # Manifold
//!
//! Connection I/O core for single-server command/reply TCP clients
//! (Redis-style protocols).
//!
//! ## Architecture
//!
//! Manifold multiplexes many logical connections over OS sockets without
//! coupling reply latency to the host process's thread-pool load:
//!
//! - **`SocketManager`** owns one dedicated writer thread for its lifetime,
//!   spawns one-shot helpers under write bursts, and on Unix hosts runs a
//!   single poll-reader thread across every installed socket.
//! - **`SocketBridge`** is the contract a logical connection implements:
//!   the manager drives writes through per-bridge queues with 200 ms
//!   budgets and back-of-the-line fairness, and dispatches reads, errors,
//!   heartbeats and staleness probes from the readiness loop.
//! - The protocol codec, command pipeline and retry policy live **above**
//!   the bridge; manifold never parses protocol bytes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use manifold::{Endpoint, ManagerOptions, SocketManager};
//! # use std::sync::Arc;
//! # fn bridge() -> Arc<dyn manifold::SocketBridge> { unimplemented!() }
//!
//! # fn example() -> manifold::Result<()> {
//! let manager = SocketManager::new(ManagerOptions::new().with_name("cache"))?;
//! let bridge = bridge(); // your SocketBridge implementation
//!
//! manager.begin_connect(Endpoint::parse("cache.internal:6379")?, bridge.clone())?;
//! // ... once connected, queue commands on the bridge, then:
//! manager.request_write(bridge, false);
//! # Ok(())
//! # }
//! ```
//!
//! Or share the process-wide default instance via [`SocketManager::shared`].

#![warn(missing_docs)]

pub use manifold_core::bridge::{SocketBridge, WriteResult};
pub use manifold_core::endpoint::Endpoint;
pub use manifold_core::error::{ManifoldError, Result};
pub use manifold_core::manager::{ManagerOptions, SocketManager};
pub use manifold_core::monitor::{ManagerEvent, ManagerMonitor};
pub use manifold_core::state::{ManagerState, ReadRegime};
pub use manifold_core::token::SocketToken;

pub mod dev_tracing;
