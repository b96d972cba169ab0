//! Action blocks and the builder that lays out their branches.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{panic_message, EngineResult, ExecutionError};
use crate::event::Event;
use crate::manager::EventManager;
use crate::trigger::Trigger;

use super::branch::{Always, BranchAction, BranchDecision, MutexBusy, Not, OnNth, OnTestId};
use super::mutex::{MutexHolder, NamedMutex};
use super::{Action, ActionContext, NextAction, PendingTrigger};

/// Unique identifier for a registered action block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionBlockId(Uuid);

impl ActionBlockId {
    /// Create a new random block id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ActionBlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An ordered, branchable sequence of actions.
///
/// `execute` runs from index 0 under an explicit program counter. A jump to
/// `len()` leaves the block; a jump past it is `BranchOutOfRange`. Mutexes
/// taken during one `execute` are released before it returns, on every path.
pub struct ActionBlock {
    id: ActionBlockId,
    name: Option<String>,
    actions: Vec<Box<dyn Action>>,
    held: Vec<Arc<NamedMutex>>,
}

impl fmt::Debug for ActionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("actions", &self.actions.iter().map(|a| a.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ActionBlock {
    /// An unnamed, empty block.
    #[must_use]
    pub fn unnamed() -> Self {
        Self {
            id: ActionBlockId::new(),
            name: None,
            actions: Vec::new(),
            held: Vec::new(),
        }
    }

    /// An empty block registered under `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::unnamed()
        }
    }

    /// A block with the given name and actions.
    #[must_use]
    pub fn new(name: Option<String>, actions: Vec<Box<dyn Action>>) -> Self {
        Self {
            id: ActionBlockId::new(),
            name,
            actions,
            held: Vec::new(),
        }
    }

    /// Appends an action.
    pub fn push(&mut self, action: impl Action + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Number of actions, and the jump target that leaves the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True when the block has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The id assigned at construction.
    #[must_use]
    pub const fn id(&self) -> ActionBlockId {
        self.id
    }

    /// The registration name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Checks every action against `trigger`.
    ///
    /// # Errors
    ///
    /// Returns the first action's `Unsupported` error.
    pub fn is_supported(&self, trigger: &dyn Trigger) -> EngineResult<()> {
        self.actions.iter().try_for_each(|a| a.is_supported(trigger))
    }

    pub(crate) fn execute(
        &mut self,
        manager: &EventManager,
        pending: &mut Vec<PendingTrigger>,
        trigger: &dyn Trigger,
        event: &Event,
    ) -> EngineResult<()> {
        let result = self.run(manager, pending, trigger, event);
        self.release_held();
        result
    }

    fn run(
        &mut self,
        manager: &EventManager,
        pending: &mut Vec<PendingTrigger>,
        trigger: &dyn Trigger,
        event: &Event,
    ) -> EngineResult<()> {
        let len = self.actions.len();
        let mut ctx = ActionContext::new(manager, self.id, &mut self.held, pending);
        let mut pc = 0;
        while pc < len {
            let action = &mut self.actions[pc];
            // A panic becomes an error so the caller still releases mutexes and
            // returns the block to the registry.
            match panic::catch_unwind(AssertUnwindSafe(|| action.execute(&mut ctx, trigger, event))) {
                Ok(result) => result?,
                Err(payload) => {
                    return Err(ExecutionError::ActionPanicked {
                        action: action.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    }
                    .into());
                }
            }
            pc = match action.next_action() {
                NextAction::Fallthrough => pc + 1,
                NextAction::Jump(target) if target <= len => target,
                NextAction::Jump(target) => {
                    return Err(ExecutionError::BranchOutOfRange { target, len }.into());
                }
            };
        }
        Ok(())
    }

    fn release_held(&mut self) {
        let holder = MutexHolder::Block(self.id);
        for mutex in self.held.drain(..) {
            if mutex.unlock(holder) {
                debug!(mutex = mutex.name(), block = %self.id, "mutex released");
            }
        }
    }

    /// Test teardown: releases outstanding holders and resets per-test state.
    pub fn end_test(&mut self) {
        if !self.held.is_empty() {
            warn!(block = %self.id, held = self.held.len(), "releasing mutexes at end of test");
        }
        self.release_held();
        for action in &mut self.actions {
            action.end_test();
        }
    }
}

/// Lays out a block, compiling conditional sub-blocks into branch actions.
///
/// Branch targets inside a nested builder are relative to that builder and
/// are rebased when the sub-block is spliced in.
pub struct BlockBuilder {
    name: Option<String>,
    actions: Vec<Box<dyn Action>>,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder {
    /// An empty builder for an unnamed block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            actions: Vec::new(),
        }
    }

    /// An empty builder for a block registered under `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            actions: Vec::new(),
        }
    }

    /// Index the next appended action will get.
    #[must_use]
    pub fn position(&self) -> usize {
        self.actions.len()
    }

    /// Appends an action.
    #[must_use]
    pub fn then(self, action: impl Action + 'static) -> Self {
        self.then_boxed(Box::new(action))
    }

    /// Appends an already boxed action.
    #[must_use]
    pub fn then_boxed(mut self, action: Box<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    /// Unconditional jump to `target` (an index in this builder).
    #[must_use]
    pub fn goto(self, target: usize) -> Self {
        self.then(BranchAction::goto(target))
    }

    fn splice(&mut self, body: Vec<Box<dyn Action>>) {
        let base = self.actions.len();
        for mut action in body {
            action.rebase(base);
            self.actions.push(action);
        }
    }

    /// Runs `body` only when `cond` holds.
    #[must_use]
    pub fn if_then<D, B>(mut self, cond: D, body: B) -> Self
    where
        D: BranchDecision + 'static,
        B: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        let inner = body(BlockBuilder::new()).actions;
        let end = self.actions.len() + 1 + inner.len();
        self.actions.push(Box::new(BranchAction::new(Not(cond), end)));
        self.splice(inner);
        self
    }

    /// Runs `then_body` when `cond` holds, `else_body` otherwise.
    #[must_use]
    pub fn if_else<D, T, E>(mut self, cond: D, then_body: T, else_body: E) -> Self
    where
        D: BranchDecision + 'static,
        T: FnOnce(BlockBuilder) -> BlockBuilder,
        E: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        let then_actions = then_body(BlockBuilder::new()).actions;
        let else_actions = else_body(BlockBuilder::new()).actions;
        let else_start = self.actions.len() + 1 + then_actions.len() + 1;
        let end = else_start + else_actions.len();
        self.actions.push(Box::new(BranchAction::new(Not(cond), else_start)));
        self.splice(then_actions);
        self.actions.push(Box::new(BranchAction::new(Always, end)));
        self.splice(else_actions);
        self
    }

    /// Runs `body` on the listed (1-based) executions of this point in the block.
    #[must_use]
    pub fn on_nth<B>(self, ns: impl IntoIterator<Item = u64>, body: B) -> Self
    where
        B: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        self.if_then(OnNth::new(ns), body)
    }

    /// Runs `body` only when the configured test id is one of `ids`.
    #[must_use]
    pub fn on_test_id<B>(self, ids: impl IntoIterator<Item = u32>, body: B) -> Self
    where
        B: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        self.if_then(OnTestId::new(ids), body)
    }

    /// Runs `body` holding `name` if it is free; skips it if it is busy.
    #[must_use]
    pub fn try_mutex<B>(mut self, name: impl Into<String>, body: B) -> Self
    where
        B: FnOnce(BlockBuilder) -> BlockBuilder,
    {
        let inner = body(BlockBuilder::new()).actions;
        let end = self.actions.len() + 1 + inner.len();
        self.actions.push(Box::new(BranchAction::new(MutexBusy::new(name), end)));
        self.splice(inner);
        self
    }

    /// Finishes the block. Branch targets are final from here on.
    #[must_use]
    pub fn build(self) -> ActionBlock {
        ActionBlock::new(self.name, self.actions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::action::FnAction;
    use crate::config::EngineConfig;
    use crate::platform::Platform;
    use crate::trigger::LifecycleTrigger;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> FnAction {
        let log = Arc::clone(log);
        FnAction::new(tag, move |_, _, _| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    fn run(block: &mut ActionBlock, manager: &EventManager) -> EngineResult<()> {
        let trigger = LifecycleTrigger::on_test_start();
        let mut pending = Vec::new();
        block.execute(manager, &mut pending, &trigger, &Event::test_started())
    }

    fn manager(config: EngineConfig) -> EventManager {
        EventManager::new(config, Platform::new()).unwrap()
    }

    #[test]
    fn if_else_takes_one_arm() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut block = BlockBuilder::new()
            .then(record(&log, "before"))
            .if_else(
                OnTestId::new([7]),
                |b| b.then(record(&log, "seven")),
                |b| b.then(record(&log, "other")).then(record(&log, "other2")),
            )
            .then(record(&log, "after"))
            .build();
        assert_eq!(block.len(), 7);

        run(&mut block, &manager(EngineConfig::default().with_test_id(7))).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before", "seven", "after"]);

        log.lock().unwrap().clear();
        run(&mut block, &manager(EngineConfig::default())).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before", "other", "other2", "after"]);
    }

    #[test]
    fn on_nth_runs_body_on_selected_executions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut block = BlockBuilder::new()
            .on_nth([2, 3], |b| b.then(record(&log, "hit")))
            .build();
        let mgr = manager(EngineConfig::default());
        for _ in 0..4 {
            run(&mut block, &mgr).unwrap();
        }
        assert_eq!(log.lock().unwrap().len(), 2);

        block.end_test();
        run(&mut block, &mgr).unwrap();
        run(&mut block, &mgr).unwrap();
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn nested_goto_is_rebased() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut block = BlockBuilder::new()
            .then(record(&log, "a"))
            .if_then(Always, |b| b.goto(2).then(record(&log, "skipped")).then(record(&log, "b")))
            .build();
        run(&mut block, &manager(EngineConfig::default())).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn jump_past_end_is_an_error_and_jump_to_end_exits() {
        let mgr = manager(EngineConfig::default());
        let mut exits = BlockBuilder::new().goto(1).build();
        run(&mut exits, &mgr).unwrap();

        let mut bad = BlockBuilder::new().goto(5).build();
        let err = run(&mut bad, &mgr).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Execution(ExecutionError::BranchOutOfRange { target: 5, len: 1 })
        ));
    }

    #[test]
    fn mutexes_are_released_on_error() {
        let mgr = manager(EngineConfig::default());
        let mut block = BlockBuilder::new()
            .then(crate::action::AcquireMutex::new("bus"))
            .then(FnAction::new("fail", |ctx, _, _| {
                assert!(ctx.holds_mutex("bus"));
                Err(crate::error::EngineError::action_failed("fail", "boom"))
            }))
            .build();
        assert!(run(&mut block, &mgr).is_err());
        assert_eq!(mgr.mutex("bus").and_then(|m| m.holder()), None);
    }

    #[test]
    fn panicking_action_is_an_error_and_releases_mutexes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = manager(EngineConfig::default());
        let mut block = BlockBuilder::new()
            .then(crate::action::AcquireMutex::new("bus"))
            .then(FnAction::new("explode", |_, _, _| panic!("register out of range")))
            .then(record(&log, "after"))
            .build();

        let err = run(&mut block, &mgr).unwrap_err();
        assert_eq!(
            err,
            crate::error::EngineError::Execution(ExecutionError::ActionPanicked {
                action: "explode".to_string(),
                message: "register out of range".to_string(),
            })
        );
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(mgr.mutex("bus").and_then(|m| m.holder()), None);

        // The block stays usable.
        assert!(run(&mut block, &mgr).is_err());
        assert_eq!(mgr.mutex("bus").and_then(|m| m.holder()), None);
    }

    #[test]
    fn try_mutex_skips_body_when_busy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = manager(EngineConfig::default());
        let mut block = BlockBuilder::new()
            .try_mutex("bus", |b| b.then(record(&log, "locked")))
            .build();

        let guard = mgr.lock_mutex("bus", std::time::Duration::from_millis(10)).unwrap();
        run(&mut block, &mgr).unwrap();
        assert!(log.lock().unwrap().is_empty());
        drop(guard);

        run(&mut block, &mgr).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["locked"]);
        assert_eq!(mgr.mutex("bus").and_then(|m| m.holder()), None);
    }
}
