// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for pipeline workers
//!
//! Every path (capture dispatch, preview, picture, recording, auto-focus)
//! runs one OS thread built from the pieces in this module:
//!
//! - [`WorkerController`] owns the thread, its stop signal and a bounded join
//! - [`Gate`] is the start/stop gate a worker blocks on between cycles
//! - [`BusyFlag`] is the one-frame-at-a-time flag a listener holds while it
//!   still reads a dispatched buffer
//!
//! All waits are bounded. A wait that runs out logs and gives up rather than
//! hanging forever, because a hung device call cannot be cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::{CameraError, CameraResult};

/// Lock a mutex, recovering the data if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Action returned by the worker callback to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Set once by the worker thread right before it exits
#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn finish(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.done);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Marks completion even if the loop body panics
struct CompletionGuard(Arc<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Controller for a worker loop running in a separate thread
///
/// # Example
///
/// ```ignore
/// let gate = Arc::new(Gate::new());
/// let worker_gate = Arc::clone(&gate);
/// let controller = WorkerController::start("preview", timeout, move |stop| {
///     if worker_gate.wait() == GateWait::Shutdown || stop.load(Ordering::SeqCst) {
///         return LoopAction::Stop;
///     }
///     process_frame();
///     LoopAction::Continue
/// })?;
///
/// // Later, stop the loop
/// gate.shutdown();
/// controller.stop();
/// ```
pub struct WorkerController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<AtomicBool>,
    /// Set by the thread when it exits
    completion: Arc<Completion>,
    /// How long `stop()` waits before giving up
    join_timeout: Duration,
    /// Name for logging
    name: String,
}

impl WorkerController {
    /// Start a new worker loop in a separate thread
    ///
    /// The provided closure is called repeatedly until it returns
    /// `LoopAction::Stop` or the stop signal it receives is set. The closure
    /// must return promptly once its stop signal is set, which for blocking
    /// loops means pairing the controller with a [`Gate`].
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name, also used in logging
    /// * `join_timeout` - Upper bound for `stop()` to wait on the thread
    /// * `loop_fn` - One iteration of the loop
    pub fn start<F>(name: &str, join_timeout: Duration, mut loop_fn: F) -> CameraResult<Self>
    where
        F: FnMut(&AtomicBool) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let completion = Arc::new(Completion::default());
        let completion_clone = Arc::clone(&completion);
        let name_clone = name.to_string();

        info!(name = %name, "Starting worker thread");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _completion = CompletionGuard(completion_clone);
                debug!(name = %name_clone, "Worker thread started");

                loop {
                    // Check stop signal first
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    match loop_fn(&stop_signal_clone) {
                        LoopAction::Continue => {}
                        LoopAction::Stop => {
                            debug!(name = %name_clone, "Loop requested stop");
                            break;
                        }
                    }
                }

                info!(name = %name_clone, "Worker thread exiting");
            })
            .map_err(|e| CameraError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            completion,
            join_timeout,
            name: name.to_string(),
        })
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting worker stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait, bounded, for the thread to finish
    ///
    /// Returns `false` when the thread did not exit in time. The thread is
    /// then detached and left to finish on its own.
    pub fn stop(&mut self) -> bool {
        self.request_stop();
        self.join()
    }

    /// Wait, bounded, for the thread to finish without sending stop signal
    ///
    /// Useful if the loop stops itself via `LoopAction::Stop`. Called from the
    /// worker thread itself, this only detaches.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        if handle.thread().id() == thread::current().id() {
            debug!(name = %self.name, "Worker stopping itself, detaching");
            return true;
        }

        debug!(name = %self.name, "Waiting for worker thread to finish");
        if !self.completion.wait(self.join_timeout) {
            warn!(
                name = %self.name,
                timeout = ?self.join_timeout,
                "Worker thread is taking too long to end, something is going wrong"
            );
            return false;
        }

        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Worker thread panicked: {:?}", e);
        } else {
            debug!(name = %self.name, "Worker thread finished");
        }
        true
    }
}

impl Drop for WorkerController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "WorkerController dropped, stopping loop");
            self.stop();
        }
    }
}

/// Outcome of waiting on a [`Gate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    /// The gate was released, run one cycle
    Signaled,
    /// The owner is shutting the worker down
    Shutdown,
}

#[derive(Debug, Default)]
struct GateState {
    signaled: bool,
    shutdown: bool,
}

/// Start/stop gate
///
/// A binary semaphore with a shutdown state. It starts closed. `signal()`
/// releases exactly one `wait()`; `shutdown()` releases every current and
/// future waiter until `reset()`.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the worker run its next cycle
    pub fn signal(&self) {
        lock(&self.state).signaled = true;
        self.cond.notify_one();
    }

    /// Withdraw a pending signal
    pub fn close(&self) {
        lock(&self.state).signaled = false;
    }

    /// Release every waiter for good
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cond.notify_all();
    }

    /// Re-arm a gate after shutdown
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.shutdown = false;
        state.signaled = false;
    }

    /// Block until signaled or shut down, consuming the signal
    pub fn wait(&self) -> GateWait {
        let guard = lock(&self.state);
        let mut state = self
            .cond
            .wait_while(guard, |s| !s.signaled && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);

        if state.shutdown {
            GateWait::Shutdown
        } else {
            state.signaled = false;
            GateWait::Signaled
        }
    }
}

/// One-frame-at-a-time flag of a listener
#[derive(Debug, Default)]
pub struct BusyFlag {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        *lock(&self.busy)
    }

    /// Mark busy. Returns `false` if it already was.
    pub fn try_set(&self) -> bool {
        let mut busy = lock(&self.busy);
        if *busy {
            false
        } else {
            *busy = true;
            true
        }
    }

    pub fn clear(&self) {
        *lock(&self.busy) = false;
        self.cond.notify_all();
    }

    /// Wait until clear or `deadline` passes. Returns whether it is clear.
    pub fn wait_clear_until(&self, deadline: Instant) -> bool {
        let mut busy = lock(&self.busy);
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            busy = self
                .cond
                .wait_timeout(busy, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
