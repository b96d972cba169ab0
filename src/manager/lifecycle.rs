//! Test start, test end and abort.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::event::Event;
use crate::subtask::{CompanionSubtask, ErrorLogSubtask, Subtask};

use super::{EventManager, ManagerCore, TestStatus};

impl ManagerCore {
    /// Stops everything after a fatal subtask error. The sticky error is
    /// already recorded.
    pub(super) fn abort(&self) {
        let drained = match self.subtasks() {
            Ok(mut table) => {
                let _ = self.set_status(TestStatus::Aborted);
                table.drain()
            }
            Err(err) => {
                warn!(error = %err, "cannot drain subtasks during abort");
                return;
            }
        };
        stop_all(self, drained);
    }

    /// Stops subtasks whose last hook was removed during a dispatch.
    pub(super) fn stop_retired(&self) {
        let retired = match self.retired.lock() {
            Ok(mut retired) => std::mem::take(&mut *retired),
            Err(_) => {
                warn!("retired subtask list poisoned");
                return;
            }
        };
        stop_all(self, retired);
    }

    /// Start and end join subtask threads, which may be waiting on the
    /// dispatch lock this thread holds.
    fn refuse_inside_dispatch(&self, operation: &str) -> EngineResult<()> {
        if self.dispatching_here() {
            return Err(EngineError::InvalidState {
                expected: format!("{operation} outside an action block"),
                actual: "called during dispatch".to_string(),
            });
        }
        Ok(())
    }
}

/// Stops each subtask, accumulating failures as sticky errors.
fn stop_all(core: &ManagerCore, subtasks: Vec<Arc<dyn Subtask>>) {
    for subtask in subtasks {
        if let Err(err) = subtask.stop() {
            warn!(subtask = %subtask.label(), error = %err, "subtask failed to stop");
            core.record_sticky(err);
        }
    }
}

impl EventManager {
    /// Starts the test.
    ///
    /// Runs every trigger's `start_test` hook in registration order, arms one
    /// companion subtask per companion channel and, if the platform has one,
    /// the error-log subtask, then dispatches `TestStarted`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the engine is idle or when called from an
    /// action, or the first trigger, subtask or dispatch failure.
    pub fn start_test(&self) -> EngineResult<()> {
        self.core.refuse_inside_dispatch("start_test")?;
        let status = self.core.status();
        if status != TestStatus::Idle {
            return Err(EngineError::InvalidState {
                expected: TestStatus::Idle.to_string(),
                actual: status.to_string(),
            });
        }
        {
            let registry = self.core.registry()?;
            for entry in &registry.triggers {
                entry.trigger.start_test()?;
            }
        }
        self.core.set_status(TestStatus::Running)?;
        info!(test_id = ?self.core.config.test_id, triggers = self.trigger_count(), "test started");

        self.arm_event_sources()?;
        self.handle_event(&Event::test_started())
    }

    fn arm_event_sources(&self) -> EngineResult<()> {
        let core = &self.core;
        let mut table = core.subtasks()?;
        for channel in core.platform.companions() {
            let device = channel.device();
            let subtask = table
                .companions
                .entry(device)
                .or_insert_with(|| Arc::new(CompanionSubtask::new(Arc::clone(channel), core.sink(), &core.config)));
            subtask.start()?;
        }
        if let Some(source) = core.platform.error_log() {
            let subtask = table
                .error_log
                .get_or_insert_with(|| Arc::new(ErrorLogSubtask::new(Arc::clone(source), core.sink(), &core.config)));
            subtask.pin();
            subtask.start()?;
        }
        Ok(())
    }

    /// Ends the test and returns its sticky result.
    ///
    /// Dispatches `TestEnded` if the test is running, stops every live
    /// subtask (timer, memory, surface, error log, resources, companions),
    /// then runs every action block's cleanup hook. Failures along the way
    /// are recorded but never stop the teardown.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded during the test, or `InvalidState`
    /// when called from an action.
    pub fn end_test(&self) -> EngineResult<()> {
        self.core.refuse_inside_dispatch("end_test")?;
        if self.core.status() == TestStatus::Running {
            if let Err(err) = self.handle_event(&Event::test_ended()) {
                self.core.record_sticky(err);
            }
        }

        let drained = {
            let mut table = self.core.subtasks()?;
            if self.core.status() != TestStatus::Aborted {
                self.core.set_status(TestStatus::Ended)?;
            }
            table.drain()
        };
        let stopped = drained.len();
        stop_all(&self.core, drained);
        self.core.stop_retired();

        self.core.registry_for_teardown().end_test();

        let sticky = self.sticky_error();
        info!(subtasks = stopped, failed = sticky.is_some(), status = %self.status(), "test ended");
        sticky.map_or(Ok(()), Err)
    }
}
