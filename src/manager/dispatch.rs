//! Event dispatch.

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, trace, warn};

use crate::error::{lock_err, EngineError, EngineResult};
use crate::event::Event;

use super::registry::Registry;
use super::EventManager;

/// Marks the current thread as the dispatching one until dropped.
struct OwnerGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> OwnerGuard<'a> {
    fn claim(owner: &'a Mutex<Option<ThreadId>>) -> EngineResult<Self> {
        *owner.lock().map_err(|_| lock_err("manager.dispatch_owner"))? = Some(thread::current().id());
        Ok(Self(owner))
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut owner) = self.0.lock() {
            *owner = None;
        }
    }
}

impl EventManager {
    /// Dispatches `event` to every matching trigger, in registration order.
    ///
    /// The prefilter runs first without the dispatch lock; an event no
    /// trigger could match is counted as dropped and ignored. After the test
    /// ended or aborted every event is ignored. Otherwise each trigger whose
    /// `could_match` and `do_match` both hold runs its action block on the
    /// calling thread before the next trigger is considered. Triggers added by
    /// those blocks join the list immediately and are evaluated in turn.
    ///
    /// # Errors
    ///
    /// Returns the first action block or registration failure. The remaining
    /// triggers are still evaluated.
    pub fn handle_event(&self, event: &Event) -> EngineResult<()> {
        let interested = self
            .core
            .prefilter
            .read()
            .map_err(|_| lock_err("manager.prefilter"))?
            .iter()
            .any(|t| t.could_match(event));
        if !interested {
            self.core.dropped_events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            trace!(kind = %event.kind(), id = %event.id, "event dropped by prefilter");
            return Ok(());
        }
        if self.core.status().is_finished() {
            return Ok(());
        }
        if self.core.dispatching_here() {
            return Err(EngineError::InvalidState {
                expected: "dispatch outside an action block".to_string(),
                actual: format!("nested dispatch of {}", event.kind()),
            });
        }

        let result = {
            let mut registry = self.core.registry()?;
            let _owner = OwnerGuard::claim(&self.core.dispatch_owner)?;
            self.dispatch_locked(&mut registry, event)
        };
        self.core.stop_retired();
        result
    }

    fn dispatch_locked(&self, registry: &mut Registry, event: &Event) -> EngineResult<()> {
        let mut first_err: Option<EngineError> = None;
        let mut idx = 0;
        // The list may grow while we walk it.
        while idx < registry.triggers.len() {
            let entry = &registry.triggers[idx];
            idx += 1;
            let (trigger, block_id) = (Arc::clone(&entry.trigger), entry.block);
            if !trigger.could_match(event) || !trigger.do_match(event) {
                continue;
            }
            let Some(mut block) = registry.blocks.remove(&block_id) else {
                first_err.get_or_insert_with(|| EngineError::internal(format!("action block {block_id} missing")));
                continue;
            };
            debug!(trigger = trigger.name(), block = %block_id, kind = %event.kind(), "trigger matched");

            let mut pending = Vec::new();
            let result = block.execute(self, &mut pending, trigger.as_ref(), event);
            registry.blocks.insert(block_id, block);

            for p in pending {
                if let Err(err) = self.admit(registry, p.id, p.trigger, p.block) {
                    warn!(error = %err, "trigger added from action was refused");
                    first_err.get_or_insert(err);
                }
            }
            if let Err(err) = result {
                warn!(trigger = trigger.name(), block = %block_id, error = %err, "action block failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
