//! The socket manager: thread lifecycle, write scheduling, socket lookup.
//!
//! One manager owns a dedicated writer thread for its whole lifetime,
//! spawns one-shot helper threads when write bursts pile up, and in the
//! sync regime runs a single poll-reader thread across every installed
//! socket. Bridges ask for write service with [`SocketManager::request_write`];
//! the scheduler drains them round-robin under a time budget so one busy
//! connection cannot starve the rest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bridge::{SocketBridge, WriteResult};
use crate::connect;
use crate::endpoint::Endpoint;
use crate::error::{ManifoldError, Result};
use crate::monitor::{self, ManagerEvent, ManagerEventSender, ManagerMonitor};
use crate::state::{ManagerState, ReadRegime, RegimeCell, StateCell};
use crate::token::{RawHandle, SocketToken};

/// Budget handed to a bridge by the dedicated writer. Helpers drain with no
/// budget at all, so the cap only shapes the shared thread.
pub(crate) const WRITE_BUDGET: Duration = Duration::from_millis(200);

/// These are I/O threads, not recursive workers; keep their stacks small.
const SOCKET_THREAD_STACK: usize = 64 * 1024;

/// Never-recorded sentinel for the last-error clock.
const NO_ERROR: u64 = u64::MAX;

/// Configuration for a [`SocketManager`].
///
/// # Examples
///
/// ```
/// use manifold_core::manager::ManagerOptions;
///
/// let opts = ManagerOptions::new()
///     .with_name("orders")
///     .with_high_priority_socket_threads(false);
/// ```
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Prefix for thread names and diagnostics.
    pub name: String,

    /// Run manager-owned threads above normal OS priority.
    ///
    /// - `true` (default): reply reading competes ahead of ordinary work
    /// - `false`: normal priority
    pub use_high_priority_socket_threads: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            name: "manifold".to_string(),
            use_high_priority_socket_threads: true,
        }
    }
}

impl ManagerOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name used as the thread-name prefix.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Choose between above-normal and normal thread priority.
    #[must_use]
    pub fn with_high_priority_socket_threads(mut self, high: bool) -> Self {
        self.use_high_priority_socket_threads = high;
        self
    }
}

pub(crate) struct LookupEntry {
    pub(crate) token: SocketToken,
    pub(crate) bridge: Arc<dyn SocketBridge>,
}

/// State shared between the manager handle and its threads.
pub(crate) struct Shared {
    name: String,
    regime: RegimeCell,
    disposed: AtomicBool,
    high_priority: bool,

    write_queue: Mutex<VecDeque<Arc<dyn SocketBridge>>>,
    write_signal: Condvar,
    helper_count: AtomicUsize,

    pub(crate) lookup: Mutex<HashMap<RawHandle, LookupEntry>>,
    pub(crate) lookup_signal: Condvar,
    pub(crate) reader_count: AtomicUsize,

    pub(crate) state: StateCell,
    started: Instant,
    last_error_millis: AtomicU64,

    events: Mutex<Option<ManagerEventSender>>,
}

/// Multiplexes many logical connections over OS sockets.
///
/// Dropping the manager disposes it; disposal is idempotent and makes every
/// owned thread exit at its next checkpoint. None of the threads keep the
/// process alive.
pub struct SocketManager {
    shared: Arc<Shared>,
}

static SHARED_MANAGER: OnceCell<SocketManager> = OnceCell::new();

impl SocketManager {
    /// Create a manager and start its dedicated writer thread.
    ///
    /// Fails if the writer thread cannot be started; a manager without its
    /// writer would silently never service [`request_write`](Self::request_write).
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let shared = Arc::new(Shared {
            regime: RegimeCell::new(ReadRegime::for_host()),
            disposed: AtomicBool::new(false),
            high_priority: options.use_high_priority_socket_threads,
            write_queue: Mutex::new(VecDeque::new()),
            write_signal: Condvar::new(),
            helper_count: AtomicUsize::new(0),
            lookup: Mutex::new(HashMap::new()),
            lookup_signal: Condvar::new(),
            reader_count: AtomicUsize::new(0),
            state: StateCell::new(ManagerState::Inactive),
            started: Instant::now(),
            last_error_millis: AtomicU64::new(NO_ERROR),
            events: Mutex::new(None),
            name: options.name,
        });
        debug!(
            manager = %shared.name,
            regime = %shared.regime.get(),
            "socket manager created"
        );

        let writer = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{}:Write", shared.name))
            .stack_size(SOCKET_THREAD_STACK)
            .spawn(move || {
                if writer.high_priority {
                    crate::sys::boost_thread_priority();
                }
                writer.write_all_queues();
            })?;

        Ok(Self { shared })
    }

    /// The process-wide default manager, created on first use.
    ///
    /// A failed creation is not cached; the next call tries again.
    pub fn shared() -> Result<&'static SocketManager> {
        SHARED_MANAGER.get_or_try_init(|| SocketManager::new(ManagerOptions::default()))
    }

    /// The name used as the thread-name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current poll-reader phase. Diagnostic only; lock-free.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.shared.state.get()
    }

    /// The regime replies are read under.
    #[must_use]
    pub fn regime(&self) -> ReadRegime {
        self.shared.regime.get()
    }

    /// Number of sockets currently installed for the poll reader.
    /// Diagnostic only.
    #[must_use]
    pub fn installed_sockets(&self) -> usize {
        self.shared.lookup.lock().len()
    }

    /// Time since the readiness loop last recorded a transient error, if it
    /// ever has.
    #[must_use]
    pub fn last_error_age(&self) -> Option<Duration> {
        let millis = self.shared.last_error_millis.load(Ordering::Relaxed);
        if millis == NO_ERROR {
            return None;
        }
        Some(
            self.shared
                .started
                .elapsed()
                .saturating_sub(Duration::from_millis(millis)),
        )
    }

    /// True once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Subscribe to lifecycle events. Events from before the call are not
    /// replayed; calling again replaces the previous subscription.
    pub fn monitor(&self) -> ManagerMonitor {
        let (sender, receiver) = monitor::create_monitor();
        *self.shared.events.lock() = Some(sender);
        receiver
    }

    /// Dispose the manager. Idempotent. Owned threads observe the flag and
    /// exit at their next checkpoint; blocked ones are woken.
    pub fn dispose(&self) {
        if self
            .shared
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.shared.regime.set(ReadRegime::Abort);
        {
            let _queue = self.shared.write_queue.lock();
            self.shared.write_signal.notify_all();
        }
        {
            let _lookup = self.shared.lookup.lock();
            self.shared.lookup_signal.notify_all();
        }
        self.shared.emit(ManagerEvent::Disposed);
        debug!(manager = %self.shared.name, "socket manager disposed");
    }

    /// Ask the scheduler to drain `bridge`.
    ///
    /// Unless `forced`, a bridge already holding its FIFO slot is not
    /// enqueued again. A burst that leaves more than one bridge queued
    /// spawns a one-shot helper thread alongside the dedicated writer.
    pub fn request_write(&self, bridge: Arc<dyn SocketBridge>, forced: bool) {
        self.shared.request_write(bridge, forced);
    }

    /// Start a connect attempt towards `endpoint` on a short-lived thread.
    ///
    /// The outcome is delivered through the bridge: `connected` on success,
    /// `error` on failure or disposal.
    pub fn begin_connect(&self, endpoint: Endpoint, bridge: Arc<dyn SocketBridge>) -> Result<()> {
        if self.shared.is_disposed() {
            return Err(ManifoldError::Disposed);
        }
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("{}:Connect", self.shared.name))
            .stack_size(SOCKET_THREAD_STACK)
            .spawn(move || connect::run_connect(&shared, endpoint, bridge))?;
        Ok(())
    }

    /// Shut down the socket behind `token` and forget its handle. A no-op
    /// for the empty token and for sockets already shut.
    pub fn shutdown(&self, token: &SocketToken) {
        self.shared.shutdown_token(token);
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("name", &self.shared.name)
            .field("regime", &self.shared.regime.get())
            .field("state", &self.shared.state.get())
            .field("disposed", &self.shared.is_disposed())
            .finish()
    }
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn regime(&self) -> ReadRegime {
        self.regime.get()
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        let mut events = self.events.lock();
        let gone = match events.as_ref() {
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if gone {
            // Receiver went away; stop paying for sends.
            *events = None;
        }
    }

    pub(crate) fn record_last_error(&self) {
        let millis = self.started.elapsed().as_millis().min(u128::from(NO_ERROR - 1)) as u64;
        self.last_error_millis.store(millis, Ordering::Relaxed);
    }

    fn request_write(self: &Arc<Self>, bridge: Arc<dyn SocketBridge>, forced: bool) {
        if self.is_disposed() {
            return;
        }
        if bridge
            .write_slot()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
            && !forced
        {
            return;
        }
        let depth = {
            let mut queue = self.write_queue.lock();
            queue.push_back(bridge);
            if queue.len() == 1 {
                self.write_signal.notify_one();
            }
            queue.len()
        };
        if depth >= 2 {
            self.spawn_write_helper();
        }
    }

    /// Put a bridge back at the tail without touching its slot; only the
    /// scheduler calls this, for a bridge it just popped.
    fn requeue(&self, bridge: Arc<dyn SocketBridge>) {
        let mut queue = self.write_queue.lock();
        queue.push_back(bridge);
        if queue.len() == 1 {
            self.write_signal.notify_one();
        }
    }

    /// Dedicated writer loop. Runs for the manager's lifetime.
    fn write_all_queues(self: Arc<Self>) {
        debug!(manager = %self.name, "writer started");
        self.emit(ManagerEvent::WriterStarted);
        loop {
            let bridge = {
                let mut queue = self.write_queue.lock();
                loop {
                    if let Some(bridge) = queue.pop_front() {
                        break Some(bridge);
                    }
                    if self.is_disposed() {
                        break None;
                    }
                    self.write_signal.wait(&mut queue);
                }
            };
            let Some(bridge) = bridge else { break };

            match bridge.write_queue(Some(WRITE_BUDGET)) {
                // Back of the line, so a long backlog cannot starve others.
                WriteResult::MoreWork | WriteResult::QueueEmptyAfterWrite => {
                    self.requeue(bridge);
                }
                WriteResult::NothingToDo => {
                    if !bridge.confirm_remove_from_write_queue() {
                        // Work snuck in between the drain and the confirm.
                        self.requeue(bridge);
                    }
                }
                WriteResult::CompetingWriter => {
                    trace!(bridge = bridge.name(), "competing writer; dropping");
                }
                WriteResult::NoConnection => {
                    bridge.write_slot().store(false, Ordering::Release);
                    trace!(bridge = bridge.name(), "no connection; forgetting bridge");
                }
            }
        }
        debug!(manager = %self.name, "writer exited");
        self.emit(ManagerEvent::WriterExited);
    }

    /// One-shot helper: drain a single bridge with no budget, then exit.
    fn write_one_queue(&self) {
        let Some(bridge) = self.write_queue.lock().pop_front() else {
            return;
        };
        trace!(bridge = bridge.name(), "helper draining");
        loop {
            match bridge.write_queue(None) {
                WriteResult::MoreWork | WriteResult::QueueEmptyAfterWrite => {}
                WriteResult::NothingToDo => {
                    if bridge.confirm_remove_from_write_queue() {
                        break;
                    }
                }
                WriteResult::CompetingWriter => break,
                WriteResult::NoConnection => {
                    bridge.write_slot().store(false, Ordering::Release);
                    break;
                }
            }
        }
    }

    fn spawn_write_helper(self: &Arc<Self>) {
        let cap = num_cpus::get().max(1);
        let mut count = self.helper_count.load(Ordering::Acquire);
        loop {
            if count >= cap {
                return;
            }
            match self.helper_count.compare_exchange(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        let helper = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}:WriteHelper", self.name))
            .stack_size(SOCKET_THREAD_STACK)
            .spawn(move || {
                if helper.high_priority {
                    crate::sys::boost_thread_priority();
                }
                helper.write_one_queue();
                helper.helper_count.fetch_sub(1, Ordering::Release);
            });
        match spawned {
            Ok(_) => self.emit(ManagerEvent::HelperSpawned),
            Err(err) => {
                self.helper_count.fetch_sub(1, Ordering::Release);
                warn!(%err, "could not spawn write helper");
            }
        }
    }

    /// Install a connected socket for the poll reader. Returns false when
    /// disposal raced the handover.
    pub(crate) fn add_read(
        self: &Arc<Self>,
        token: SocketToken,
        bridge: Arc<dyn SocketBridge>,
    ) -> bool {
        let Some(handle) = token.handle() else {
            return false;
        };
        if self.is_disposed() {
            return false;
        }
        let name = bridge.name().to_string();
        {
            let mut lookup = self.lookup.lock();
            lookup.insert(handle, LookupEntry { token, bridge });
            self.lookup_signal.notify_all();
        }
        trace!(manager = %self.name, bridge = %name, handle, "socket installed");
        self.emit(ManagerEvent::SocketInstalled { bridge: name });
        self.start_reader_if_needed();
        true
    }

    #[cfg(unix)]
    fn start_reader_if_needed(self: &Arc<Self>) {
        if self
            .reader_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reader = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}:Read", self.name))
            .stack_size(SOCKET_THREAD_STACK)
            .spawn(move || {
                if reader.high_priority {
                    crate::sys::boost_thread_priority();
                }
                // run() releases reader_count itself so a replacement can
                // start without waiting for this thread to unwind.
                crate::reader::run(&reader);
                reader.emit(ManagerEvent::ReaderExited);
            });
        match spawned {
            Ok(_) => self.emit(ManagerEvent::ReaderStarted),
            Err(err) => {
                self.reader_count.store(0, Ordering::Release);
                warn!(%err, "could not spawn poll reader");
            }
        }
    }

    #[cfg(not(unix))]
    fn start_reader_if_needed(self: &Arc<Self>) {}

    pub(crate) fn shutdown_token(&self, token: &SocketToken) {
        let Some(handle) = token.handle() else {
            return;
        };
        {
            let mut lookup = self.lookup.lock();
            lookup.remove(&handle);
        }
        if token.shutdown() {
            trace!(manager = %self.name, handle, "socket shut down");
            self.emit(ManagerEvent::SocketShutdown);
        }
    }
}

impl Shared {
    /// Snapshot of every installed bridge, for heartbeat fan-out.
    #[cfg(unix)]
    pub(crate) fn bridge_snapshot(
        &self,
    ) -> smallvec::SmallVec<[Arc<dyn SocketBridge>; 16]> {
        self.lookup.lock().values().map(|e| Arc::clone(&e.bridge)).collect()
    }

    /// Bridge for a handle, if it is still installed.
    #[cfg(unix)]
    pub(crate) fn bridge_for(&self, handle: RawHandle) -> Option<Arc<dyn SocketBridge>> {
        self.lookup.lock().get(&handle).map(|e| Arc::clone(&e.bridge))
    }
}
