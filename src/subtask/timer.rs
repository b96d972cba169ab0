//! Timer subtask: runs hook callbacks in deadline order.
//!
//! Hooks sit in a min-heap keyed by deadline. The thread sleeps until the
//! earliest deadline or until a new hook wakes it.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineResult;

use super::{lock_hooks, Callback, EventSink, Subtask, SubtaskKind, Worker};

/// Invoked once the deadline passes, with the deadline and context bytes.
pub type TimerCallback = Callback<dyn Fn(Instant, &[u8]) -> EngineResult<()> + Send + Sync>;

impl TimerCallback {
    /// Wraps `f`. Clones of the result are the same hook callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Instant, &[u8]) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

/// A one-shot timer. Identity is `(deadline, callback, context)`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHook {
    pub deadline: Instant,
    pub callback: TimerCallback,
    pub context: Vec<u8>,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    hook: TimerHook,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Hook set plus the deadline queue. Equal deadlines fire in insertion order.
#[derive(Default)]
struct TimerState {
    hooks: HashSet<TimerHook>,
    queue: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

enum Step {
    Idle,
    Fire(TimerHook),
    Sleep(Duration),
}

/// Fires timer hooks in deadline order from one thread.
///
/// The thread never sleeps longer than `timer_max_sleep_ms` at a time, and a
/// new hook wakes it so an earlier deadline is picked up at once. Unlike the
/// other poll-style subtasks it stays alive when its set empties and only
/// stops at `end_test`.
pub struct TimerSubtask {
    state: Arc<Mutex<TimerState>>,
    max_sleep: Duration,
    worker: Worker,
}

impl TimerSubtask {
    pub(crate) fn new(sink: Weak<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            max_sleep: config.timer_max_sleep(),
            worker: Worker::new("timer".to_string(), sink, config.wake_queue_capacity),
        }
    }

    pub(crate) fn add_hook(&self, hook: TimerHook) -> EngineResult<bool> {
        let mut state = lock_hooks(&self.state, "timer.state")?;
        if !state.hooks.insert(hook.clone()) {
            return Ok(false);
        }
        state.seq += 1;
        let entry = TimerEntry {
            deadline: hook.deadline,
            seq: state.seq,
            hook,
        };
        state.queue.push(Reverse(entry));
        drop(state);
        self.worker.wake();
        Ok(true)
    }

    /// Returns true if the set is now empty.
    pub(crate) fn remove_hook(&self, hook: &TimerHook) -> EngineResult<bool> {
        let mut state = lock_hooks(&self.state, "timer.state")?;
        if state.hooks.remove(hook) {
            state.queue.retain(|Reverse(e)| &e.hook != hook);
        }
        Ok(state.hooks.is_empty())
    }
}

fn next_step(state: &Mutex<TimerState>) -> EngineResult<Step> {
    let mut state = lock_hooks(state, "timer.state")?;
    let now = Instant::now();
    match state.queue.peek() {
        None => return Ok(Step::Idle),
        Some(Reverse(entry)) if entry.deadline > now => return Ok(Step::Sleep(entry.deadline - now)),
        Some(_) => {}
    }
    let Some(Reverse(entry)) = state.queue.pop() else {
        return Ok(Step::Idle);
    };
    state.hooks.remove(&entry.hook);
    Ok(Step::Fire(entry.hook))
}

impl Subtask for TimerSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::Timer
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        let max_sleep = self.max_sleep;
        info!(subtask = "timer", "starting timer subtask");
        self.worker.start(move |signals| {
            while !signals.should_stop() {
                match next_step(&state)? {
                    Step::Idle => signals.wait(),
                    Step::Sleep(remaining) => signals.wait_timeout(remaining.min(max_sleep)),
                    Step::Fire(hook) => {
                        debug!(late_us = hook.deadline.elapsed().as_micros() as u64, "timer hook fired");
                        (hook.callback.0)(hook.deadline, &hook.context)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn stop(&self) -> EngineResult<()> {
        {
            let mut state = lock_hooks(&self.state, "timer.state")?;
            state.hooks.clear();
            state.queue.clear();
        }
        self.worker.stop()
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn hook_count(&self) -> usize {
        self.state.lock().map(|s| s.hooks.len()).unwrap_or(0)
    }
}
