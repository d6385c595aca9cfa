//! The bridge contract between the socket manager and logical connections.
//!
//! One bridge == one logical server connection.
//!
//! The bridge owns:
//! - its socket stream and the framing above it
//! - its outbound command queue and write mutex
//! - the atomic write slot the scheduler uses to keep it in the write FIFO
//!   at most once
//!
//! The manager owns scheduling and readiness: it drives each bridge through
//! this surface and never parses protocol bytes.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::state::ManagerState;
use crate::token::SocketToken;

/// Outcome of one [`SocketBridge::write_queue`] drain call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteResult {
    /// Bytes were written; more remain, or the budget ran out first.
    MoreWork,

    /// Bytes were written and the internal queue is now empty, but removal
    /// from the write FIFO has not been confirmed yet.
    QueueEmptyAfterWrite,

    /// Nothing was pending on entry.
    NothingToDo,

    /// Another thread holds this bridge's write mutex; skip it.
    CompetingWriter,

    /// The bridge has no live connection; the scheduler must forget it.
    NoConnection,
}

/// Surface the socket manager drives on each logical connection.
pub trait SocketBridge: Send + Sync {
    /// Short name used in traces and monitor events.
    fn name(&self) -> &str;

    /// Called once after the TCP connect completes, with the byte stream
    /// and the manager's token for the socket. Return `Ok(true)` to accept
    /// the connection; `Ok(false)` or `Err` makes the manager shut the
    /// socket down and abandon it.
    fn connected(&self, stream: TcpStream, token: SocketToken) -> io::Result<bool>;

    /// Readiness reported buffered bytes. The bridge must read greedily
    /// while [`is_data_available`](Self::is_data_available) stays true.
    fn read(&self);

    /// Async regime only: arrange the bridge's own read chain, re-arming on
    /// each completion. The manager runs no reading thread in that regime.
    fn start_reading(&self) -> io::Result<()>;

    /// Socket-level failure, or disposal observed mid-connect.
    fn error(&self);

    /// Paced at least every 15 seconds by the poll reader while this bridge
    /// is installed. In the async regime the bridge arranges its own pacing.
    fn on_heartbeat(&self);

    /// Readiness reported no activity and no buffered data for a full
    /// cycle; the bridge may declare the connection stale and tear it down.
    /// `state` is the reader's current diagnostic phase.
    fn check_for_stale_connection(&self, state: ManagerState);

    /// True iff bytes are buffered at the OS or framing layer. Pure query.
    fn is_data_available(&self) -> bool;

    /// Drain queued outbound work onto the wire, writing for at most
    /// `budget` (`None` = unbounded, used by helper threads). Must not
    /// block waiting for new work.
    fn write_queue(&self, budget: Option<Duration>) -> WriteResult;

    /// Confirm the bridge really left the write FIFO: clear the write slot
    /// (release ordering), then re-check the internal queue. If work raced
    /// in, re-set the slot and return `false` so the scheduler re-enqueues.
    fn confirm_remove_from_write_queue(&self) -> bool;

    /// The 0/1 slot the scheduler CASes (acquire on 0 -> 1) so the bridge
    /// occupies at most one FIFO entry unless a forced enqueue is asked for.
    fn write_slot(&self) -> &AtomicBool;
}
