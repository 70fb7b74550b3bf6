//! Single-flight execution of one long-running task on a dedicated thread.
//!
//! The worker owns three pieces of shared state:
//! - a one-slot trigger channel; a full slot means "start requested",
//! - a guard mutex that is held exactly while the task runs, doubling as the
//!   "is running" status,
//! - a monotonic exit flag polled by the loop between waits.
//!
//! Triggers that arrive while a run is in flight are dropped, never queued.
//! Exit requests never interrupt a run; the loop notices them after the guard
//! is released or after the next poll timeout.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::task::LongTask;

const THREAD_NAME: &str = "flow-runner";
const STOP_POLL: Duration = Duration::from_millis(50);

/// Longest accepted idle wait. `recv_timeout` turns into a plain `recv` when
/// the deadline overflows, which would hide exit requests forever.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Bounded wait for a trigger before the exit flag is checked again.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct Shared {
    trigger_tx: Sender<()>,
    guard: Mutex<()>,
    exit_requested: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the background worker. Clones share the same state.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    /// Builds the worker state and starts its loop thread.
    pub fn spawn<T: LongTask>(task: T, options: WorkerOptions) -> Result<Self> {
        if options.poll_interval.is_zero() {
            return Err(anyhow!("worker poll interval must be greater than zero"));
        }
        if options.poll_interval > MAX_POLL_INTERVAL {
            return Err(anyhow!(
                "worker poll interval must not exceed {:?}",
                MAX_POLL_INTERVAL
            ));
        }
        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let shared = Arc::new(Shared {
            trigger_tx,
            guard: Mutex::new(()),
            exit_requested: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn({
                let shared = shared.clone();
                move || run_loop(&shared, trigger_rx, &task, options.poll_interval)
            })
            .context("failed to spawn worker thread")?;
        *shared.handle.lock() = Some(handle);

        Ok(Self { shared })
    }

    /// Asks the worker to run the task unless a run is already in progress.
    ///
    /// The answer is advisory: `true` means the trigger was set, not that a
    /// run has started. A run may also begin between the check and the set.
    pub fn request_start(&self) -> bool {
        if self.is_running() {
            debug!("start requested while a run is in progress; ignoring");
            return false;
        }
        // A full slot is already "set"; a disconnected one means the loop has
        // exited and nobody will ever observe the trigger.
        if let Err(TrySendError::Disconnected(())) = self.shared.trigger_tx.try_send(()) {
            debug!("start requested after the worker exited");
        }
        true
    }

    /// Whether the guard is currently held, i.e. the task is executing.
    pub fn is_running(&self) -> bool {
        self.shared.guard.is_locked()
    }

    /// Asks the loop to stop. Returns immediately and never interrupts a run.
    pub fn request_exit(&self) {
        if !self.shared.exit_requested.swap(true, Ordering::SeqCst) {
            info!("worker exit requested");
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested.load(Ordering::SeqCst)
    }

    /// Whether the loop thread has ended.
    pub fn is_finished(&self) -> bool {
        self.shared
            .handle
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Blocks until the loop thread ends. Only meaningful after `request_exit`.
    ///
    /// The first caller takes the thread handle; later calls return at once.
    pub fn join(&self) -> Result<()> {
        let handle = self.shared.handle.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked")),
            None => Ok(()),
        }
    }

    /// Waits up to `grace` for the loop thread to end, then joins it.
    ///
    /// Returns `Ok(false)` when the thread is still busy at the deadline; the
    /// thread is left detached in that case. Polls instead of blocking so a
    /// stuck task cannot hold an async runtime thread.
    pub async fn wait_stopped(&self, grace: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now().checked_add(grace);
        while !self.is_finished() {
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                return Ok(false);
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        self.join()?;
        Ok(true)
    }
}

fn run_loop(shared: &Shared, trigger_rx: Receiver<()>, task: &dyn LongTask, poll: Duration) {
    info!(poll_interval = ?poll, "worker thread started");
    while !shared.exit_requested.load(Ordering::SeqCst) {
        // Receiving empties the slot, so the trigger is cleared before the
        // guard is attempted. `shared` owns the sender, so the only error
        // here is a timeout.
        if trigger_rx.recv_timeout(poll).is_err() {
            continue;
        }

        let Some(_held) = shared.guard.try_lock() else {
            debug!("guard already held; dropping trigger");
            continue;
        };
        run_once(task);
    }
    info!("worker thread exiting");
}

fn run_once(task: &dyn LongTask) {
    let started = Instant::now();
    info!("task run started");
    match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(()) => info!(elapsed = ?started.elapsed(), "task run finished"),
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            error!(elapsed = ?started.elapsed(), %reason, "task run panicked");
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
