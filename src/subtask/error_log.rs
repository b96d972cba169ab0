//! Error-log subtask.
//!
//! Feeds every entry to the hooks and dispatches it as an event. Once armed by
//! `start_test` it stays alive until the test ends, even with no hooks left.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::select;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineResult, ExecutionError};
use crate::event::Event;
use crate::platform::{ErrorLogEntry, ErrorLogSource};

use super::{lock_hooks, Callback, EventSink, Subtask, SubtaskKind, Worker};

/// Invoked for every entry, with the hook's context bytes.
pub type ErrorLogCallback = Callback<dyn Fn(&ErrorLogEntry, &[u8]) -> EngineResult<()> + Send + Sync>;

impl ErrorLogCallback {
    /// Wraps `f`. Clones of the result are the same hook callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ErrorLogEntry, &[u8]) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

/// A persistent hook on the error log. There is no filter key.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorLogHook {
    pub callback: ErrorLogCallback,
    pub context: Vec<u8>,
}

/// Fans each error-log entry out to every hook, then dispatches it as an
/// `ErrorLogged` event.
///
/// A pinned instance is the test's event source (armed by `start_test`) and
/// survives its hook set becoming empty.
pub struct ErrorLogSubtask {
    source: Arc<dyn ErrorLogSource>,
    hooks: Arc<Mutex<HashSet<ErrorLogHook>>>,
    subscribed: AtomicBool,
    pinned: AtomicBool,
    worker: Worker,
}

impl ErrorLogSubtask {
    pub(crate) fn new(source: Arc<dyn ErrorLogSource>, sink: Weak<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            source,
            hooks: Arc::new(Mutex::new(HashSet::new())),
            subscribed: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            worker: Worker::new("error_log".to_string(), sink, config.wake_queue_capacity),
        }
    }

    pub(crate) fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub(crate) fn add_hook(&self, hook: ErrorLogHook) -> EngineResult<bool> {
        Ok(lock_hooks(&self.hooks, "error_log.hooks")?.insert(hook))
    }

    /// Returns true if the set is now empty.
    pub(crate) fn remove_hook(&self, hook: &ErrorLogHook) -> EngineResult<bool> {
        let mut hooks = lock_hooks(&self.hooks, "error_log.hooks")?;
        hooks.remove(hook);
        Ok(hooks.is_empty())
    }
}

impl Subtask for ErrorLogSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::ErrorLog
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let entries = self.source.subscribe()?;
        self.subscribed.store(true, Ordering::Release);

        let hooks = Arc::clone(&self.hooks);
        let sink = self.worker.sink();
        info!(subtask = "error_log", "starting error-log subtask");
        self.worker.start(move |signals| loop {
            select! {
                recv(entries) -> entry => {
                    let Ok(entry) = entry else {
                        if signals.should_stop() {
                            return Ok(());
                        }
                        return Err(ExecutionError::Disconnected { path: "error_log".to_string() }.into());
                    };
                    let snapshot: Vec<ErrorLogHook> = lock_hooks(&hooks, "error_log.hooks")?.iter().cloned().collect();
                    debug!(code = entry.code, hooks = snapshot.len(), "error-log entry");
                    for hook in &snapshot {
                        (hook.callback.0)(&entry, &hook.context)?;
                    }
                    let Some(sink) = sink.upgrade() else {
                        return Ok(());
                    };
                    sink.handle_event(&Event::error_logged(entry))?;
                }
                recv(signals.wake_rx()) -> _ => {
                    if signals.should_stop() {
                        return Ok(());
                    }
                }
            }
        })
    }

    fn stop(&self) -> EngineResult<()> {
        lock_hooks(&self.hooks, "error_log.hooks")?.clear();
        let stopped = self.worker.stop();
        let unsubscribed = if self.subscribed.swap(false, Ordering::AcqRel) {
            self.source.unsubscribe().map_err(Into::into)
        } else {
            Ok(())
        };
        stopped.and(unsubscribed)
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn hook_count(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }
}
