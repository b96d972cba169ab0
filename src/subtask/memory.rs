//! Memory-watch subtask: one-shot hooks on a word leaving its expected value.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::platform::MemoryBus;

use super::{lock_hooks, Callback, EventSink, Subtask, SubtaskKind, Worker};

/// What a memory hook observed when it fired.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryChange {
    pub address: u64,
    pub expected: u64,
    pub observed: u64,
}

/// Invoked once, with the change and the hook's context bytes.
pub type MemoryCallback = Callback<dyn Fn(&MemoryChange, &[u8]) -> EngineResult<()> + Send + Sync>;

impl MemoryCallback {
    /// Wraps `f`. Clones of the result are the same hook callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&MemoryChange, &[u8]) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

/// A one-shot watch: fires when the word at `address` stops reading `expected`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryHook {
    pub address: u64,
    pub expected: u64,
    pub callback: MemoryCallback,
    pub context: Vec<u8>,
}

/// Cooperative poller over every registered memory hook.
///
/// Each pass reads every hooked word once. A hook whose word differs from
/// its recorded value is removed from the set and then its callback runs,
/// outside the set lock, so the callback may re-register the same identity.
pub struct MemoryWatchSubtask {
    memory: Arc<dyn MemoryBus>,
    hooks: Arc<Mutex<HashSet<MemoryHook>>>,
    passes: Arc<AtomicU64>,
    poll_interval: Duration,
    worker: Worker,
}

impl MemoryWatchSubtask {
    pub(crate) fn new(memory: Arc<dyn MemoryBus>, sink: Weak<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            memory,
            hooks: Arc::new(Mutex::new(HashSet::new())),
            passes: Arc::new(AtomicU64::new(0)),
            poll_interval: config.poll_interval(),
            worker: Worker::new("memory".to_string(), sink, config.wake_queue_capacity),
        }
    }

    pub(crate) fn add_hook(&self, hook: MemoryHook) -> EngineResult<bool> {
        let added = lock_hooks(&self.hooks, "memory.hooks")?.insert(hook);
        if added {
            self.worker.wake();
        }
        Ok(added)
    }

    /// Returns true if the set is now empty.
    pub(crate) fn remove_hook(&self, hook: &MemoryHook) -> EngineResult<bool> {
        let mut hooks = lock_hooks(&self.hooks, "memory.hooks")?;
        hooks.remove(hook);
        Ok(hooks.is_empty())
    }

    /// Completed scan passes since creation.
    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }
}

impl Subtask for MemoryWatchSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::MemoryWatch
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let memory = Arc::clone(&self.memory);
        let hooks = Arc::clone(&self.hooks);
        let passes = Arc::clone(&self.passes);
        let interval = self.poll_interval;
        info!(subtask = "memory", "starting memory watch");
        self.worker.start(move |signals| {
            while !signals.should_stop() {
                let snapshot: Vec<MemoryHook> = lock_hooks(&hooks, "memory.hooks")?.iter().cloned().collect();
                if snapshot.is_empty() {
                    signals.wait();
                    continue;
                }
                for hook in snapshot {
                    if signals.should_stop() {
                        return Ok(());
                    }
                    let observed = memory.read_word(hook.address)?;
                    if observed == hook.expected {
                        continue;
                    }
                    // Stop or unhook may have raced us; only the remover fires.
                    if !lock_hooks(&hooks, "memory.hooks")?.remove(&hook) {
                        continue;
                    }
                    debug!(address = hook.address, expected = hook.expected, observed, "memory hook fired");
                    let change = MemoryChange {
                        address: hook.address,
                        expected: hook.expected,
                        observed,
                    };
                    (hook.callback.0)(&change, &hook.context)?;
                }
                let n = passes.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(pass = n, "memory scan pass");
                signals.pause(interval);
            }
            Ok(())
        })
    }

    fn stop(&self) -> EngineResult<()> {
        lock_hooks(&self.hooks, "memory.hooks")?.clear();
        self.worker.stop()
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn hook_count(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }
}
