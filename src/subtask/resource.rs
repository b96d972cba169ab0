//! Resource-notification subtask for privileged-service signals.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::select;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineResult, ExecutionError};
use crate::event::{Event, EventPayload};
use crate::platform::{ResourceHandle, ResourceService};

use super::{lock_hooks, Callback, EventSink, Subtask, SubtaskKind, Worker};

/// Invoked with `(parent, index, context)` each time the notification fires.
pub type ResourceCallback = Callback<dyn Fn(ResourceHandle, u32, &[u8]) -> EngineResult<()> + Send + Sync>;

impl ResourceCallback {
    /// Wraps `f`. Clones of the result are the same hook callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ResourceHandle, u32, &[u8]) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

/// A persistent hook on one privileged-service notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHook {
    pub callback: ResourceCallback,
    pub context: Vec<u8>,
}

/// Waits on the notification keyed by `(parent, index)`.
///
/// Every wake runs all hooks registered under the key, then dispatches a
/// `Resource` event so triggers can react to the same notification.
pub struct ResourceSubtask {
    parent: ResourceHandle,
    index: u32,
    service: Arc<dyn ResourceService>,
    hooks: Arc<Mutex<HashSet<ResourceHook>>>,
    registered: AtomicBool,
    worker: Worker,
}

impl ResourceSubtask {
    pub(crate) fn new(
        parent: ResourceHandle,
        index: u32,
        service: Arc<dyn ResourceService>,
        sink: Weak<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            parent,
            index,
            service,
            hooks: Arc::new(Mutex::new(HashSet::new())),
            registered: AtomicBool::new(false),
            worker: Worker::new(format!("resource:{parent}/{index}"), sink, config.wake_queue_capacity),
        }
    }

    /// Adds a hook. Returns false if an identical hook was already present.
    pub(crate) fn add_hook(&self, hook: ResourceHook) -> EngineResult<bool> {
        Ok(lock_hooks(&self.hooks, "resource.hooks")?.insert(hook))
    }

    /// Removes a hook. Returns true if the set is now empty.
    pub(crate) fn remove_hook(&self, hook: &ResourceHook) -> EngineResult<bool> {
        let mut hooks = lock_hooks(&self.hooks, "resource.hooks")?;
        hooks.remove(hook);
        Ok(hooks.is_empty())
    }
}

impl Subtask for ResourceSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::Resource
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let signal = self.service.register(self.parent, self.index)?;
        self.registered.store(true, Ordering::Release);

        let (parent, index) = (self.parent, self.index);
        let hooks = Arc::clone(&self.hooks);
        let sink = self.worker.sink();
        let label = self.label();
        info!(subtask = %label, "starting resource subtask");
        self.worker.start(move |signals| loop {
            select! {
                recv(signal) -> fired => {
                    if fired.is_err() {
                        if signals.should_stop() {
                            return Ok(());
                        }
                        return Err(ExecutionError::Disconnected { path: label.clone() }.into());
                    }
                    let snapshot: Vec<ResourceHook> = lock_hooks(&hooks, "resource.hooks")?.iter().cloned().collect();
                    debug!(subtask = %label, hooks = snapshot.len(), "resource notification");
                    for hook in &snapshot {
                        (hook.callback.0)(parent, index, &hook.context)?;
                    }
                    let Some(sink) = sink.upgrade() else {
                        return Ok(());
                    };
                    sink.handle_event(&Event::new(EventPayload::Resource { parent, index }))?;
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
        lock_hooks(&self.hooks, "resource.hooks")?.clear();
        let stopped = self.worker.stop();
        let unregistered = if self.registered.swap(false, Ordering::AcqRel) {
            self.service.unregister(self.parent, self.index).map_err(Into::into)
        } else {
            Ok(())
        };
        stopped.and(unregistered)
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn hook_count(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::platform::loopback::LoopbackResources;
    use crate::subtask::testing::{wait_until, RecordingSink};

    #[test]
    fn wake_runs_hooks_and_dispatches_event() {
        let service = Arc::new(LoopbackResources::default());
        let recording = Arc::new(RecordingSink::default());
        let sink: Arc<dyn EventSink> = recording.clone();
        let subtask = ResourceSubtask::new(
            ResourceHandle(1),
            2,
            service.clone(),
            Arc::downgrade(&sink),
            &EngineConfig::default(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback = ResourceCallback::new(move |_, index, ctx| {
            assert_eq!(index, 2);
            assert_eq!(ctx, b"ctx");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let hook = ResourceHook {
            callback,
            context: b"ctx".to_vec(),
        };
        assert!(subtask.add_hook(hook.clone()).unwrap());
        assert!(!subtask.add_hook(hook).unwrap());
        subtask.start().unwrap();
        subtask.start().unwrap();
        assert!(service.is_registered(ResourceHandle(1), 2));

        assert!(service.signal(ResourceHandle(1), 2));
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
        assert!(wait_until(Duration::from_secs(2), || recording.events.lock().unwrap().len() == 1));

        subtask.stop().unwrap();
        subtask.stop().unwrap();
        assert!(!subtask.is_running());
        assert!(!service.is_registered(ResourceHandle(1), 2));
        assert_eq!(subtask.hook_count(), 0);
    }
}
