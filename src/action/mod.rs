//! Actions and action blocks.
//!
//! An [`ActionBlock`] is an ordered sequence of [`Action`]s run by an explicit
//! program counter. Every action reports where execution continues through
//! [`Action::next_action`]; plain actions fall through, branch actions jump.
//! Conditional sub-blocks are laid out by [`BlockBuilder`] as index jumps.

use std::sync::Arc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineResult, ExecutionError};
use crate::event::Event;
use crate::manager::EventManager;
use crate::trigger::{Trigger, TriggerId};

/// General-purpose actions.
pub mod basic;
/// Action blocks and their builder.
pub mod block;
/// Branch actions and decisions.
pub mod branch;
/// Named mutexes.
pub mod mutex;

pub use basic::{FnAction, LogAction};
pub use block::{ActionBlock, ActionBlockId, BlockBuilder};
pub use branch::{Always, BranchAction, BranchDecision, FnDecision, MutexBusy, Not, OnNth, OnTestId};
pub use mutex::{AcquireMutex, MutexHolder, MutexRegistry, NamedMutex, NamedMutexGuard, ReleaseMutex};

/// Where execution continues after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextAction {
    /// The next action in the block.
    #[default]
    Fallthrough,
    /// The action at this index. The block length exits the block.
    Jump(usize),
}

/// One step of an action block.
pub trait Action: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Checks that this action can run for events matched by `trigger`.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Unsupported` if the trigger's events lack
    /// something the action needs.
    fn is_supported(&self, trigger: &dyn Trigger) -> EngineResult<()>;

    /// Performs the action.
    ///
    /// # Errors
    ///
    /// An error aborts the rest of the block.
    fn execute(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<()>;

    /// Where execution continues after the last `execute`.
    fn next_action(&self) -> NextAction {
        NextAction::Fallthrough
    }

    /// Resets per-test state. Called from `ActionBlock::end_test`.
    fn end_test(&mut self) {}

    /// Shifts absolute branch targets by `offset` when the action is spliced
    /// into a larger block.
    fn rebase(&mut self, _offset: usize) {}
}

/// A trigger registered from inside a running action, appended to the
/// trigger list once the current block returns.
pub(crate) struct PendingTrigger {
    pub(crate) id: TriggerId,
    pub(crate) trigger: Arc<dyn Trigger>,
    pub(crate) block: ActionBlockId,
}

/// What an action sees of the engine while it executes.
pub struct ActionContext<'a> {
    manager: &'a EventManager,
    block: ActionBlockId,
    held: &'a mut Vec<Arc<NamedMutex>>,
    pending: &'a mut Vec<PendingTrigger>,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        manager: &'a EventManager,
        block: ActionBlockId,
        held: &'a mut Vec<Arc<NamedMutex>>,
        pending: &'a mut Vec<PendingTrigger>,
    ) -> Self {
        Self {
            manager,
            block,
            held,
            pending,
        }
    }

    /// The engine running this block. Hook APIs are safe to call from here.
    #[must_use]
    pub fn manager(&self) -> &EventManager {
        self.manager
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.manager.config()
    }

    /// Identifier of the running test, if configured.
    #[must_use]
    pub fn test_id(&self) -> Option<u32> {
        self.manager.config().test_id
    }

    /// The block being executed.
    #[must_use]
    pub fn block_id(&self) -> ActionBlockId {
        self.block
    }

    fn holder(&self) -> MutexHolder {
        MutexHolder::Block(self.block)
    }

    fn remember(&mut self, mutex: Arc<NamedMutex>) {
        if !self.held.iter().any(|m| Arc::ptr_eq(m, &mutex)) {
            self.held.push(mutex);
        }
    }

    /// Blocks until this block holds `name`, bounded by `mutex_wait_ms`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::MutexTimeout` if the mutex stayed busy.
    pub fn acquire_mutex(&mut self, name: &str) -> EngineResult<()> {
        let mutex = self.manager.mutexes().get_or_create(name)?;
        let wait = self.manager.config().mutex_wait();
        if !mutex.lock_timeout(self.holder(), wait)? {
            return Err(ExecutionError::MutexTimeout {
                name: name.to_string(),
                duration_ms: self.manager.config().mutex_wait_ms,
            }
            .into());
        }
        debug!(mutex = name, block = %self.block, "mutex acquired");
        self.remember(mutex);
        Ok(())
    }

    /// Takes `name` if it is free. Returns whether this block now holds it.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned.
    pub fn try_acquire_mutex(&mut self, name: &str) -> EngineResult<bool> {
        let mutex = self.manager.mutexes().get_or_create(name)?;
        if mutex.try_lock(self.holder())? {
            self.remember(mutex);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Releases `name` early. Releasing a mutex this block does not hold is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::UnknownMutex` if no mutex of that name exists.
    pub fn release_mutex(&mut self, name: &str) -> EngineResult<()> {
        let Some(mutex) = self.manager.mutexes().get(name) else {
            return Err(ExecutionError::UnknownMutex { name: name.to_string() }.into());
        };
        if let Some(pos) = self.held.iter().position(|m| Arc::ptr_eq(m, &mutex)) {
            self.held.swap_remove(pos);
            mutex.unlock(self.holder());
        }
        Ok(())
    }

    /// Returns true if this block currently holds `name`.
    #[must_use]
    pub fn holds_mutex(&self, name: &str) -> bool {
        self.held.iter().any(|m| m.name() == name)
    }

    /// Registers a trigger from inside a dispatch.
    ///
    /// The trigger joins the end of the live trigger list as soon as the
    /// current block returns, so it is evaluated for the event being
    /// dispatched if it matches.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Unsupported` if the trigger cannot run on
    /// this platform.
    pub fn add_trigger(&mut self, trigger: Arc<dyn Trigger>, block: ActionBlockId) -> EngineResult<TriggerId> {
        trigger.is_supported(&self.manager.caps())?;
        let id = TriggerId::new();
        debug!(trigger = trigger.name(), %id, "trigger queued from action");
        self.pending.push(PendingTrigger { id, trigger, block });
        Ok(id)
    }
}
