//! Sync-regime poll reader.
//!
//! One thread per manager services every installed socket: it paces
//! heartbeats, culls sockets observed dead, blocks in the readiness call
//! and fans out `read`/`error` callbacks. `ManagerState` narrates each
//! phase so a stuck reader can be diagnosed from outside without taking a
//! lock.
//!
//! Uniqueness is enforced by a compare-and-swap on `reader_count`; this
//! loop releases the count itself on exit, while still holding the lookup
//! lock on the empty-lookup path, so an install that raced the exit starts
//! a fresh reader immediately.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::bridge::SocketBridge;
use crate::manager::Shared;
use crate::state::ManagerState;
use crate::sys;
use crate::token::{RawHandle, SocketToken};

/// Heartbeat pace. The first pass fires immediately.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// How long the reader lingers on an empty lookup before exiting.
const EMPTY_LOOKUP_WAIT: Duration = Duration::from_secs(20);
/// Timeout for one readiness call.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Consecutive readiness failures before the reader gives up. One failure
/// is a socket torn down mid-call; a run of them means the loop itself is
/// broken and spinning.
const MAX_SELECT_FAILURES: u32 = 10;

type ActiveSet = SmallVec<[(RawHandle, SocketToken, Arc<dyn SocketBridge>); 16]>;

/// Reader thread body. Returns when the lookup stays empty past the
/// deadline, the manager is disposed, or the readiness call fails
/// repeatedly (`Faulted`; the next socket install starts a replacement).
pub(crate) fn run(shared: &Arc<Shared>) {
    debug!(manager = shared.name(), "poll reader started");
    let mut last_heartbeat: Option<Instant> = None;
    let mut select_failures: u32 = 0;

    loop {
        if shared.is_disposed() {
            break;
        }
        shared.state.set(ManagerState::Preparing);

        shared.state.set(ManagerState::CheckForHeartbeat);
        if last_heartbeat.map_or(true, |at| at.elapsed() >= HEARTBEAT_INTERVAL) {
            shared.state.set(ManagerState::ExecuteHeartbeat);
            for bridge in shared.bridge_snapshot() {
                bridge.on_heartbeat();
            }
            last_heartbeat = Some(Instant::now());
        }

        shared.state.set(ManagerState::LocateActiveSockets);
        let mut active: ActiveSet = SmallVec::new();
        {
            let mut lookup = shared.lookup.lock();
            if lookup.is_empty() {
                shared.state.set(ManagerState::NoSocketsPause);
                let _ = shared
                    .lookup_signal
                    .wait_for(&mut lookup, EMPTY_LOOKUP_WAIT);
                if shared.is_disposed() {
                    break;
                }
                if lookup.is_empty() {
                    debug!(manager = shared.name(), "no sockets; poll reader exiting");
                    // Released under the lock: an add_read serialized behind
                    // us sees zero and starts its own reader.
                    shared.reader_count.store(0, Ordering::Release);
                    shared.state.set(ManagerState::Inactive);
                    return;
                }
                continue;
            }
            shared.state.set(ManagerState::CullDeadSockets);
            lookup.retain(|&handle, entry| {
                if entry.token.is_connected() {
                    active.push((handle, entry.token.clone(), Arc::clone(&entry.bridge)));
                    true
                } else {
                    trace!(handle, "culling dead socket");
                    false
                }
            });
        }
        if active.is_empty() {
            continue;
        }

        shared.state.set(ManagerState::PrepareActiveSockets);
        let handles: SmallVec<[RawHandle; 16]> = active.iter().map(|(h, ..)| *h).collect();

        shared.state.set(ManagerState::ExecuteSelect);
        let readiness = match sys::await_readiness(&handles, SELECT_TIMEOUT) {
            Ok(readiness) => {
                select_failures = 0;
                readiness
            }
            Err(err) => {
                // Typically a socket torn down mid-call; note it and retry.
                shared.record_last_error();
                select_failures += 1;
                if select_failures >= MAX_SELECT_FAILURES {
                    warn!(
                        %err,
                        failures = select_failures,
                        "readiness call keeps failing; reader faulted"
                    );
                    shared.reader_count.store(0, Ordering::Release);
                    shared.state.set(ManagerState::Faulted);
                    return;
                }
                trace!(%err, "readiness call failed; retrying");
                continue;
            }
        };
        shared.state.set(ManagerState::ExecuteSelectComplete);

        if readiness.is_empty() {
            idle_probe(shared, &active);
            continue;
        }

        let mut dispatched = false;

        shared.state.set(ManagerState::DispatchRead);
        for &handle in &readiness.read {
            if let Some(bridge) = shared.bridge_for(handle) {
                dispatched = true;
                bridge.read();
            }
        }

        shared.state.set(ManagerState::DispatchError);
        for &handle in &readiness.error {
            if let Some(bridge) = shared.bridge_for(handle) {
                dispatched = true;
                warn!(handle, "socket fault reported by readiness call");
                bridge.error();
            }
        }

        if !dispatched {
            // Every ready handle raced out of the lookup; make sure nothing
            // with buffered bytes is left unserviced.
            shared.state.set(ManagerState::DispatchReadFallback);
            for (_, _, bridge) in &active {
                if bridge.is_data_available() {
                    bridge.read();
                }
            }
        }
    }

    shared.reader_count.store(0, Ordering::Release);
    shared.state.set(ManagerState::Terminated);
    debug!(manager = shared.name(), "poll reader exited");
}

/// A full cycle passed with no readiness: sockets claiming buffered data
/// are read anyway, the rest get a staleness probe.
fn idle_probe(shared: &Arc<Shared>, active: &ActiveSet) {
    shared.state.set(ManagerState::CheckForStaleConnections);
    for (_, _, bridge) in active {
        if bridge.is_data_available() {
            shared.state.set(ManagerState::DispatchReadFallback);
            bridge.read();
        } else {
            bridge.check_for_stale_connection(ManagerState::CheckForStaleConnections);
        }
    }
}
