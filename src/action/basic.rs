//! Closure-backed and logging actions.

use std::fmt;

use tracing::Level;

use crate::error::{EngineError, EngineResult};
use crate::event::Event;
use crate::trigger::{Capabilities, Trigger};

use super::{Action, ActionContext};

type ActionFn = dyn FnMut(&mut ActionContext<'_>, &dyn Trigger, &Event) -> EngineResult<()> + Send;

/// An action backed by a closure.
///
/// `requires` lists what the matched events must carry; binding the action to
/// a trigger that cannot guarantee it is refused at `add_trigger`.
pub struct FnAction {
    name: String,
    required: Capabilities,
    f: Box<ActionFn>,
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("name", &self.name)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl FnAction {
    /// An action named `name` that runs `f`.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut ActionContext<'_>, &dyn Trigger, &Event) -> EngineResult<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            required: Capabilities::empty(),
            f: Box::new(f),
        }
    }

    /// Declares the trigger capabilities `f` relies on.
    #[must_use]
    pub fn requires(mut self, required: Capabilities) -> Self {
        self.required = required;
        self
    }
}

impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self, trigger: &dyn Trigger) -> EngineResult<()> {
        if trigger.capabilities().contains(self.required) {
            Ok(())
        } else {
            Err(EngineError::unsupported(
                self.name.clone(),
                format!("trigger '{}' does not provide {:?}", trigger.name(), self.required),
            ))
        }
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<()> {
        (self.f)(ctx, trigger, event)
    }
}

/// Emits a log record for every execution.
#[derive(Debug, Clone)]
pub struct LogAction {
    message: String,
    level: Level,
}

impl LogAction {
    /// Logs `message` at info level.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Level::INFO,
        }
    }

    /// Logs at `level` instead of `INFO`.
    #[must_use]
    pub fn at(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl Action for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    fn is_supported(&self, _trigger: &dyn Trigger) -> EngineResult<()> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ActionContext<'_>, trigger: &dyn Trigger, event: &Event) -> EngineResult<()> {
        let message = self.message.as_str();
        let trigger = trigger.name();
        let kind = event.kind();
        if self.level == Level::ERROR {
            tracing::error!(trigger, %kind, "{message}");
        } else if self.level == Level::WARN {
            tracing::warn!(trigger, %kind, "{message}");
        } else if self.level == Level::INFO {
            tracing::info!(trigger, %kind, "{message}");
        } else if self.level == Level::DEBUG {
            tracing::debug!(trigger, %kind, "{message}");
        } else {
            tracing::trace!(trigger, %kind, "{message}");
        }
        Ok(())
    }
}
