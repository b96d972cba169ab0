//! Conditional jumps inside an action block.
//!
//! A [`BranchAction`] asks its [`BranchDecision`] once per execution and jumps
//! to an absolute index when the decision holds.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::EngineResult;
use crate::event::Event;
use crate::trigger::Trigger;

use super::{Action, ActionContext, NextAction};

/// The boolean half of a branch action: should execution jump?
pub trait BranchDecision: Send {
    /// Short description used in the action name.
    fn describe(&self) -> String;

    /// Decides whether to branch for this execution.
    ///
    /// # Errors
    ///
    /// An error aborts the block like any action failure.
    fn decide(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<bool>;

    /// Checks the decision can be made for `trigger`'s events.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Unsupported` if it cannot.
    fn is_supported(&self, _trigger: &dyn Trigger) -> EngineResult<()> {
        Ok(())
    }

    /// Resets per-test state.
    fn reset(&mut self) {}
}

/// Jumps to `target` when its decision says so, otherwise falls through.
pub struct BranchAction {
    name: String,
    decision: Box<dyn BranchDecision>,
    target: usize,
    taken: bool,
}

impl fmt::Debug for BranchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchAction")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("taken", &self.taken)
            .finish()
    }
}

impl BranchAction {
    /// Branch to the absolute index `target` when `decision` holds.
    #[must_use]
    pub fn new(decision: impl BranchDecision + 'static, target: usize) -> Self {
        Self::boxed(Box::new(decision), target)
    }

    /// Jumps to `target` when `decision` holds.
    #[must_use]
    pub fn boxed(decision: Box<dyn BranchDecision>, target: usize) -> Self {
        Self {
            name: format!("branch:{}", decision.describe()),
            decision,
            target,
            taken: false,
        }
    }

    /// Unconditional jump.
    #[must_use]
    pub fn goto(target: usize) -> Self {
        Self::new(Always, target)
    }

    /// Absolute index jumped to when the decision holds.
    #[must_use]
    pub const fn target(&self) -> usize {
        self.target
    }
}

impl Action for BranchAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self, trigger: &dyn Trigger) -> EngineResult<()> {
        self.decision.is_supported(trigger)
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<()> {
        self.taken = false;
        self.taken = self.decision.decide(ctx, trigger, event)?;
        Ok(())
    }

    fn next_action(&self) -> NextAction {
        if self.taken {
            NextAction::Jump(self.target)
        } else {
            NextAction::Fallthrough
        }
    }

    fn end_test(&mut self) {
        self.taken = false;
        self.decision.reset();
    }

    fn rebase(&mut self, offset: usize) {
        self.target += offset;
    }
}

/// Always branches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl BranchDecision for Always {
    fn describe(&self) -> String {
        "always".to_string()
    }

    fn decide(&mut self, _ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<bool> {
        Ok(true)
    }
}

/// Inverts another decision.
#[derive(Debug, Clone)]
pub struct Not<D>(pub D);

impl<D: BranchDecision> BranchDecision for Not<D> {
    fn describe(&self) -> String {
        format!("not({})", self.0.describe())
    }

    fn decide(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<bool> {
        self.0.decide(ctx, trigger, event).map(|b| !b)
    }

    fn is_supported(&self, trigger: &dyn Trigger) -> EngineResult<()> {
        self.0.is_supported(trigger)
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

/// Holds on the listed (1-based) executions of the branch.
#[derive(Debug, Clone)]
pub struct OnNth {
    wanted: BTreeSet<u64>,
    seen: u64,
}

impl OnNth {
    /// Selects the `wanted` executions, counted from 1.
    #[must_use]
    pub fn new(wanted: impl IntoIterator<Item = u64>) -> Self {
        Self {
            wanted: wanted.into_iter().collect(),
            seen: 0,
        }
    }
}

impl BranchDecision for OnNth {
    fn describe(&self) -> String {
        format!("on_nth{:?}", self.wanted)
    }

    fn decide(&mut self, _ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<bool> {
        self.seen += 1;
        Ok(self.wanted.contains(&self.seen))
    }

    fn reset(&mut self) {
        self.seen = 0;
    }
}

/// Holds when the configured test id is one of `ids`.
#[derive(Debug, Clone)]
pub struct OnTestId {
    ids: BTreeSet<u32>,
}

impl OnTestId {
    /// Selects the test ids in `ids`.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl BranchDecision for OnTestId {
    fn describe(&self) -> String {
        format!("on_test_id{:?}", self.ids)
    }

    fn decide(&mut self, ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<bool> {
        Ok(ctx.test_id().is_some_and(|id| self.ids.contains(&id)))
    }
}

/// Tries to take a named mutex; holds when it is busy.
///
/// Used by `BlockBuilder::try_mutex` to skip a sub-block nobody else may run
/// concurrently. A taken mutex is released when the block returns.
#[derive(Debug, Clone)]
pub struct MutexBusy {
    name: String,
}

impl MutexBusy {
    /// Checks the mutex called `name`, taking it when free.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl BranchDecision for MutexBusy {
    fn describe(&self) -> String {
        format!("mutex_busy({})", self.name)
    }

    fn decide(&mut self, ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<bool> {
        ctx.try_acquire_mutex(&self.name).map(|acquired| !acquired)
    }
}

type DecideFn = dyn FnMut(&mut ActionContext<'_>, &dyn Trigger, &Event) -> EngineResult<bool> + Send;

/// A decision backed by a closure.
pub struct FnDecision {
    label: String,
    f: Box<DecideFn>,
}

impl FnDecision {
    /// A decision computed by `f`.
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut ActionContext<'_>, &dyn Trigger, &Event) -> EngineResult<bool> + Send + 'static,
    {
        Self {
            label: label.into(),
            f: Box::new(f),
        }
    }
}

impl BranchDecision for FnDecision {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn decide(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<bool> {
        (self.f)(ctx, trigger, event)
    }
}
