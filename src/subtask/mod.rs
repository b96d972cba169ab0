//! Background subtasks.
//!
//! A subtask turns one class of asynchronous source into dispatcher calls or
//! direct hook callbacks. Each live subtask owns one named thread, run through
//! a shared [`Worker`]. Two execution styles coexist:
//!
//! - blocking-wait (resource, companion, error-log): the thread parks on the
//!   collaborator's wait primitive and runs only when it is signalled;
//! - cooperative-poll (memory, surface, timer): the thread scans its hook set,
//!   pauses between passes, and parks on its wake channel while idle.
//!
//! `stop` is cooperative: it raises the stop flag, wakes the thread, and joins
//! it unless called from that very thread. A handler that returns an error or
//! panics is reported to the [`EventSink`] as a fatal subtask failure.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::error::{lock_err, panic_message, EngineError, EngineResult, SubtaskError};
use crate::event::Event;

/// Companion-processor message subtask.
pub mod companion;
/// Error-log subtask.
pub mod error_log;
/// Memory-watch subtask.
pub mod memory;
/// Resource-notification subtask.
pub mod resource;
/// Surface-watch subtask.
pub mod surface;
/// Timer subtask.
pub mod timer;

pub use companion::CompanionSubtask;
pub use error_log::{ErrorLogCallback, ErrorLogHook, ErrorLogSubtask};
pub use memory::{MemoryCallback, MemoryChange, MemoryHook, MemoryWatchSubtask};
pub use resource::{ResourceCallback, ResourceHook, ResourceSubtask};
pub use surface::{SurfaceCallback, SurfaceHook, SurfaceMatch, SurfaceRegion, SurfaceRetarget, SurfaceWatchSubtask};
pub use timer::{TimerCallback, TimerHook, TimerSubtask};

/// The subtask variants.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubtaskKind {
    Resource,
    Companion,
    MemoryWatch,
    SurfaceWatch,
    Timer,
    ErrorLog,
}

impl fmt::Display for SubtaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resource => "resource",
            Self::Companion => "companion",
            Self::MemoryWatch => "memory",
            Self::SurfaceWatch => "surface",
            Self::Timer => "timer",
            Self::ErrorLog => "error_log",
        };
        f.write_str(s)
    }
}

/// What subtasks call back into. Implemented by the event manager.
pub trait EventSink: Send + Sync {
    /// Dispatches an event to the registered triggers.
    ///
    /// # Errors
    ///
    /// Propagates the first action block failure.
    fn handle_event(&self, event: &Event) -> EngineResult<()>;

    /// Reports that a subtask's handler failed. The sink stops every subtask.
    fn subtask_failed(&self, subtask: &str, error: EngineError);
}

/// A background concurrency unit.
pub trait Subtask: Send + Sync {
    /// The variant.
    fn kind(&self) -> SubtaskKind;

    /// Instance label, e.g. `resource:0x00000001/2`.
    fn label(&self) -> String;

    /// Starts the background thread. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the collaborator refuses the subscription or the
    /// thread cannot be spawned.
    fn start(&self) -> EngineResult<()>;

    /// Clears the hook set, signals the thread and joins it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread panicked or the collaborator failed to
    /// unsubscribe.
    fn stop(&self) -> EngineResult<()>;

    /// Returns true while the background thread is alive.
    fn is_running(&self) -> bool;

    /// Number of registered hooks.
    fn hook_count(&self) -> usize;
}

/// A hook callback whose identity is the allocation it points to.
///
/// Cloning shares the allocation, so a clone compares equal to its original
/// and registering both de-duplicates to one hook.
pub struct Callback<F: ?Sized>(pub(crate) Arc<F>);

impl<F: ?Sized> Callback<F> {
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl<F: ?Sized> Clone for Callback<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<F: ?Sized> PartialEq for Callback<F> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<F: ?Sized> Eq for Callback<F> {}

impl<F: ?Sized> Hash for Callback<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<F: ?Sized> fmt::Debug for Callback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:#x})", self.addr())
    }
}

/// Thread-side view of a worker's stop flag and wake channel.
pub(crate) struct Signals {
    stop: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
}

impl Signals {
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn wake_rx(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Parks until woken or stopped.
    pub(crate) fn wait(&self) {
        let _ = self.wake_rx.recv();
    }

    /// Parks until woken, stopped, or `timeout` elapses.
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
    }

    /// Pause between two full scan passes of a poll loop.
    pub(crate) fn pause(&self, interval: Duration) {
        if interval.is_zero() {
            thread::yield_now();
        } else {
            self.wait_timeout(interval);
        }
    }
}

#[derive(Default)]
struct WorkerState {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    wake_tx: Option<Sender<()>>,
}

/// Owns one subtask thread: spawn, wake, stop, join.
pub(crate) struct Worker {
    label: String,
    sink: Weak<dyn EventSink>,
    wake_capacity: usize,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub(crate) fn new(label: String, sink: Weak<dyn EventSink>, wake_capacity: usize) -> Self {
        Self {
            label,
            sink,
            wake_capacity: wake_capacity.max(1),
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn sink(&self) -> Weak<dyn EventSink> {
        self.sink.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|st| st.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Spawns `body` unless a thread is already running.
    pub(crate) fn start<F>(&self, body: F) -> EngineResult<()>
    where
        F: FnOnce(Signals) -> EngineResult<()> + Send + 'static,
    {
        let mut st = self.state.lock().map_err(|_| lock_err("worker.start"))?;
        if st.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = st.handle.take() {
            if finished.join().is_err() {
                warn!(subtask = %self.label, "previous subtask thread panicked");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(self.wake_capacity);
        let signals = Signals {
            stop: Arc::clone(&stop),
            wake_rx,
        };
        let label = self.label.clone();
        let sink = self.sink.clone();
        let handle = thread::Builder::new()
            .name(format!("eventrig-{label}"))
            .spawn(move || {
                debug!(subtask = %label, "subtask thread started");
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(signals))).unwrap_or_else(|payload| {
                    error!(subtask = %label, panic = %panic_message(payload.as_ref()), "subtask thread panicked");
                    Err(SubtaskError::Panicked { subtask: label.clone() }.into())
                });
                match outcome {
                    Ok(()) => debug!(subtask = %label, "subtask thread exited"),
                    Err(err) => match sink.upgrade() {
                        Some(sink) => sink.subtask_failed(&label, err),
                        None => warn!(subtask = %label, error = %err, "subtask failed after engine shutdown"),
                    },
                }
            })
            .map_err(|e| SubtaskError::Spawn {
                subtask: self.label.clone(),
                reason: e.to_string(),
            })?;

        st.handle = Some(handle);
        st.stop = stop;
        st.wake_tx = Some(wake_tx);
        Ok(())
    }

    /// Nudges a parked thread. Dropped if a wake is already pending.
    pub(crate) fn wake(&self) {
        if let Ok(st) = self.state.lock() {
            if let Some(tx) = &st.wake_tx {
                let _ = tx.try_send(());
            }
        }
    }

    pub(crate) fn stop(&self) -> EngineResult<()> {
        let handle = {
            let mut st = self.state.lock().map_err(|_| lock_err("worker.stop"))?;
            st.stop.store(true, Ordering::Release);
            if let Some(tx) = st.wake_tx.take() {
                let _ = tx.try_send(());
            }
            st.handle.take()
        };

        let Some(handle) = handle else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            // Stopping from inside the handler: the loop exits on its own.
            return Ok(());
        }
        handle.join().map_err(|_| {
            EngineError::from(SubtaskError::Panicked {
                subtask: self.label.clone(),
            })
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(subtask = %self.label, error = %err, "subtask did not stop cleanly");
        }
    }
}

/// Locks a hook set, mapping poisoning to an internal error.
pub(crate) fn lock_hooks<'a, T>(hooks: &'a Mutex<T>, context: &'static str) -> EngineResult<std::sync::MutexGuard<'a, T>> {
    hooks.lock().map_err(|_| lock_err(context))
}
