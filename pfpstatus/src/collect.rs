//! The collect loop: single writer between the status channel and the recorder.
//!
//! Producers may be many and concurrent; the loop serializes their statuses
//! into the [`Environ`], taking the recorder lock once per push so readers
//! never observe a half-applied update. Rejected statuses are logged and
//! dropped: there is no caller to report them to.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, ServeError};
use crate::setup::Environ;
use crate::shutdown::Shutdown;
use crate::status::Status;

/// Longest time the loop waits for a status before re-checking cancellation.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters reported by a finished collect loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Statuses accepted by the recorder (coalesced ones included).
    pub accepted: u64,
    /// Statuses rejected by the recorder.
    pub dropped: u64,
}

/// Applies statuses from `updates` to `env` until cancelled or disconnected.
///
/// Cancellation is checked before every receive; statuses still buffered in
/// the channel when it fires are left there.
pub fn collect_loop(env: &Environ, updates: &Receiver<Status>, shutdown: &Shutdown) -> CollectStats {
    tracing::debug!("collect loop started");
    let mut stats = CollectStats::default();

    while !shutdown.is_cancelled() {
        match updates.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(status) => {
                let node = status.node_name.clone();
                match env.push(status) {
                    Ok(()) => stats.accepted += 1,
                    Err(e) => {
                        stats.dropped += 1;
                        tracing::warn!(node = %node, error = %e, "dropping status");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("status channel closed");
                break;
            }
        }
    }

    tracing::debug!(accepted = stats.accepted, dropped = stats.dropped, "collect loop finished");
    stats
}

/// Runs [`collect_loop`] on a dedicated thread.
///
/// # Errors
///
/// Returns [`ServeError::Spawn`] if the thread cannot be created.
pub fn spawn(
    env: Arc<Environ>,
    updates: Receiver<Status>,
    shutdown: Shutdown,
) -> Result<JoinHandle<CollectStats>> {
    let name = "pfpstatus-collect".to_string();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || collect_loop(&env, &updates, &shutdown))
        .map_err(|source| ServeError::Spawn { name, source }.into())
}
