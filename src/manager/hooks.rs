//! Hook registration APIs and the subtask table.
//!
//! Every `hook_*` call finds or lazily creates the one subtask instance for
//! its source, adds the hook (identical hooks collapse), and makes sure the
//! subtask runs. `unhook_*` removes by the same identity and stops the
//! subtask once its hook set is empty; the timer only stops at `end_test`,
//! and the error-log subtask stays while it is the test's event source.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{lock_err, EngineError, EngineResult};
use crate::platform::{DeviceId, ResourceHandle};
use crate::subtask::{
    CompanionSubtask, ErrorLogCallback, ErrorLogHook, ErrorLogSubtask, MemoryCallback, MemoryHook,
    MemoryWatchSubtask, ResourceCallback, ResourceHook, ResourceSubtask, Subtask, SubtaskKind, SurfaceCallback,
    SurfaceHook, SurfaceRegion, SurfaceWatchSubtask, TimerCallback, TimerHook, TimerSubtask,
};

use super::{EventManager, ManagerCore};

/// Live subtask instances, at most one per source identity.
#[derive(Default)]
pub(crate) struct SubtaskTable {
    pub(crate) timer: Option<Arc<TimerSubtask>>,
    pub(crate) memory: Option<Arc<MemoryWatchSubtask>>,
    pub(crate) surface: Option<Arc<SurfaceWatchSubtask>>,
    pub(crate) error_log: Option<Arc<ErrorLogSubtask>>,
    pub(crate) resources: BTreeMap<(ResourceHandle, u32), Arc<ResourceSubtask>>,
    pub(crate) companions: BTreeMap<DeviceId, Arc<CompanionSubtask>>,
}

impl SubtaskTable {
    /// Empties the table in teardown order.
    pub(crate) fn drain(&mut self) -> Vec<Arc<dyn Subtask>> {
        let mut out: Vec<Arc<dyn Subtask>> = Vec::new();
        if let Some(t) = self.timer.take() {
            out.push(t);
        }
        if let Some(m) = self.memory.take() {
            out.push(m);
        }
        if let Some(s) = self.surface.take() {
            out.push(s);
        }
        if let Some(e) = self.error_log.take() {
            out.push(e);
        }
        out.extend(std::mem::take(&mut self.resources).into_values().map(|r| r as Arc<dyn Subtask>));
        out.extend(std::mem::take(&mut self.companions).into_values().map(|c| c as Arc<dyn Subtask>));
        out
    }

    fn of_kind(&self, kind: SubtaskKind) -> Vec<&dyn Subtask> {
        match kind {
            SubtaskKind::Timer => self.timer.iter().map(|t| t.as_ref() as &dyn Subtask).collect(),
            SubtaskKind::MemoryWatch => self.memory.iter().map(|m| m.as_ref() as &dyn Subtask).collect(),
            SubtaskKind::SurfaceWatch => self.surface.iter().map(|s| s.as_ref() as &dyn Subtask).collect(),
            SubtaskKind::ErrorLog => self.error_log.iter().map(|e| e.as_ref() as &dyn Subtask).collect(),
            SubtaskKind::Resource => self.resources.values().map(|r| r.as_ref() as &dyn Subtask).collect(),
            SubtaskKind::Companion => self.companions.values().map(|c| c.as_ref() as &dyn Subtask).collect(),
        }
    }

    pub(crate) fn hook_count(&self, kind: SubtaskKind) -> usize {
        self.of_kind(kind).iter().map(|s| s.hook_count()).sum()
    }

    pub(crate) fn count(&self, kind: SubtaskKind) -> usize {
        self.of_kind(kind).len()
    }

    pub(crate) fn scan_passes(&self, kind: SubtaskKind) -> u64 {
        match kind {
            SubtaskKind::MemoryWatch => self.memory.as_ref().map_or(0, |m| m.passes()),
            SubtaskKind::SurfaceWatch => self.surface.as_ref().map_or(0, |s| s.passes()),
            _ => 0,
        }
    }
}

impl ManagerCore {
    /// Hooks are refused once the test is over.
    fn accepting_hooks(&self) -> EngineResult<()> {
        let status = self.status();
        if status.is_finished() {
            return Err(EngineError::InvalidState {
                expected: "idle or running".to_string(),
                actual: status.to_string(),
            });
        }
        Ok(())
    }
}

impl EventManager {
    /// Stops a subtask whose last hook went away. Inside a dispatch the stop
    /// waits until the dispatch returns: the subtask may be blocked on the
    /// dispatch lock this thread holds.
    fn retire(&self, idle: Arc<dyn Subtask>) -> EngineResult<()> {
        if self.core.dispatching_here() {
            debug!(subtask = %idle.label(), "stop deferred until dispatch returns");
            self.core
                .retired
                .lock()
                .map_err(|_| lock_err("manager.retired"))?
                .push(idle);
            return Ok(());
        }
        idle.stop()
    }
}

fn missing(what: &str, collaborator: &str) -> EngineError {
    EngineError::unsupported(what.to_string(), format!("platform has no {collaborator}"))
}

impl EventManager {
    /// Runs `callback` every time the privileged service signals `(parent, index)`.
    ///
    /// # Errors
    ///
    /// `Unsupported` without a privileged service, `InvalidState` after the
    /// test ended, or the service's registration failure.
    pub fn hook_resource_event(
        &self,
        parent: ResourceHandle,
        index: u32,
        callback: ResourceCallback,
        context: impl Into<Vec<u8>>,
    ) -> EngineResult<()> {
        let core = &self.core;
        let service = core
            .platform
            .resources()
            .ok_or_else(|| missing("resource hooks", "privileged service"))?;
        let mut table = core.subtasks()?;
        core.accepting_hooks()?;
        let subtask = table.resources.entry((parent, index)).or_insert_with(|| {
            Arc::new(ResourceSubtask::new(parent, index, Arc::clone(service), core.sink(), &core.config))
        });
        let added = subtask.add_hook(ResourceHook {
            callback,
            context: context.into(),
        })?;
        debug!(%parent, index, added, "resource hook");
        subtask.start()
    }

    /// Removes a resource hook; stops the subtask when its last hook goes.
    ///
    /// # Errors
    ///
    /// Returns the subtask's stop failure.
    pub fn unhook_resource_event(
        &self,
        parent: ResourceHandle,
        index: u32,
        callback: &ResourceCallback,
        context: &[u8],
    ) -> EngineResult<()> {
        let hook = ResourceHook {
            callback: callback.clone(),
            context: context.to_vec(),
        };
        let idle = {
            let mut table = self.core.subtasks()?;
            let Some(subtask) = table.resources.get(&(parent, index)) else {
                return Ok(());
            };
            if !subtask.remove_hook(&hook)? {
                return Ok(());
            }
            table.resources.remove(&(parent, index))
        };
        idle.map_or(Ok(()), |s| self.retire(s))
    }

    /// Calls `callback` once, when the word at `address` no longer reads `expected`.
    ///
    /// # Errors
    ///
    /// `Unsupported` without a memory bus, `InvalidState` after the test ended.
    pub fn hook_memory_event(
        &self,
        address: u64,
        expected: u64,
        callback: MemoryCallback,
        context: impl Into<Vec<u8>>,
    ) -> EngineResult<()> {
        let core = &self.core;
        let memory = core.platform.memory().ok_or_else(|| missing("memory hooks", "memory bus"))?;
        let mut table = core.subtasks()?;
        core.accepting_hooks()?;
        let subtask = table
            .memory
            .get_or_insert_with(|| Arc::new(MemoryWatchSubtask::new(Arc::clone(memory), core.sink(), &core.config)));
        let added = subtask.add_hook(MemoryHook {
            address,
            expected,
            callback,
            context: context.into(),
        })?;
        debug!(address, expected, added, "memory hook");
        subtask.start()
    }

    /// Removes a memory hook that has not fired yet.
    ///
    /// # Errors
    ///
    /// Returns the subtask's stop failure.
    pub fn unhook_memory_event(
        &self,
        address: u64,
        expected: u64,
        callback: &MemoryCallback,
        context: &[u8],
    ) -> EngineResult<()> {
        let hook = MemoryHook {
            address,
            expected,
            callback: callback.clone(),
            context: context.to_vec(),
        };
        let idle = {
            let mut table = self.core.subtasks()?;
            let Some(subtask) = table.memory.as_ref() else {
                return Ok(());
            };
            if !subtask.remove_hook(&hook)? {
                return Ok(());
            }
            table.memory.take()
        };
        idle.map_or(Ok(()), |s| self.retire(s))
    }

    /// Calls `callback` each time `expected` appears in a range of `region`.
    ///
    /// # Errors
    ///
    /// `Unsupported` without a surface bus, `InvalidState` after the test ended.
    pub fn hook_surface_event(
        &self,
        region: SurfaceRegion,
        expected: impl Into<Vec<u8>>,
        callback: SurfaceCallback,
        context: impl Into<Vec<u8>>,
    ) -> EngineResult<()> {
        let core = &self.core;
        let surfaces = core.platform.surfaces().ok_or_else(|| missing("surface hooks", "surface bus"))?;
        let mut table = core.subtasks()?;
        core.accepting_hooks()?;
        let subtask = table
            .surface
            .get_or_insert_with(|| Arc::new(SurfaceWatchSubtask::new(Arc::clone(surfaces), core.sink(), &core.config)));
        let added = subtask.add_hook(SurfaceHook {
            region,
            expected: expected.into(),
            callback,
            context: context.into(),
        })?;
        debug!(added, "surface hook");
        subtask.start()
    }

    /// Removes a surface hook. A retargeted hook is removed by its new identity.
    ///
    /// # Errors
    ///
    /// Returns the subtask's stop failure.
    pub fn unhook_surface_event(
        &self,
        region: &SurfaceRegion,
        expected: &[u8],
        callback: &SurfaceCallback,
        context: &[u8],
    ) -> EngineResult<()> {
        let hook = SurfaceHook {
            region: region.clone(),
            expected: expected.to_vec(),
            callback: callback.clone(),
            context: context.to_vec(),
        };
        let idle = {
            let mut table = self.core.subtasks()?;
            let Some(subtask) = table.surface.as_ref() else {
                return Ok(());
            };
            if !subtask.remove_hook(&hook)? {
                return Ok(());
            }
            table.surface.take()
        };
        idle.map_or(Ok(()), |s| self.retire(s))
    }

    /// Calls `callback` once `deadline` has passed.
    ///
    /// # Errors
    ///
    /// `InvalidState` after the test ended, or a thread spawn failure.
    pub fn hook_timer_event(
        &self,
        deadline: Instant,
        callback: TimerCallback,
        context: impl Into<Vec<u8>>,
    ) -> EngineResult<()> {
        let core = &self.core;
        let mut table = core.subtasks()?;
        core.accepting_hooks()?;
        let subtask = table
            .timer
            .get_or_insert_with(|| Arc::new(TimerSubtask::new(core.sink(), &core.config)));
        let added = subtask.add_hook(TimerHook {
            deadline,
            callback,
            context: context.into(),
        })?;
        debug!(in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64, added, "timer hook");
        subtask.start()
    }

    /// Removes a pending timer. The timer subtask keeps running.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the timer state is poisoned.
    pub fn unhook_timer_event(&self, deadline: Instant, callback: &TimerCallback, context: &[u8]) -> EngineResult<()> {
        let hook = TimerHook {
            deadline,
            callback: callback.clone(),
            context: context.to_vec(),
        };
        let table = self.core.subtasks()?;
        if let Some(timer) = table.timer.as_ref() {
            timer.remove_hook(&hook)?;
        }
        Ok(())
    }

    /// Calls `callback` for every error-log entry.
    ///
    /// # Errors
    ///
    /// `Unsupported` without an error log, `InvalidState` after the test
    /// ended, or the log's subscription failure.
    pub fn hook_error_log_event(&self, callback: ErrorLogCallback, context: impl Into<Vec<u8>>) -> EngineResult<()> {
        let core = &self.core;
        let source = core.platform.error_log().ok_or_else(|| missing("error-log hooks", "error log"))?;
        let mut table = core.subtasks()?;
        core.accepting_hooks()?;
        let subtask = table
            .error_log
            .get_or_insert_with(|| Arc::new(ErrorLogSubtask::new(Arc::clone(source), core.sink(), &core.config)));
        let added = subtask.add_hook(ErrorLogHook {
            callback,
            context: context.into(),
        })?;
        debug!(added, "error-log hook");
        subtask.start()
    }

    /// Removes an error-log hook.
    ///
    /// # Errors
    ///
    /// Returns the subtask's stop failure.
    pub fn unhook_error_log_event(&self, callback: &ErrorLogCallback, context: &[u8]) -> EngineResult<()> {
        let hook = ErrorLogHook {
            callback: callback.clone(),
            context: context.to_vec(),
        };
        let idle = {
            let mut table = self.core.subtasks()?;
            let Some(subtask) = table.error_log.as_ref() else {
                return Ok(());
            };
            if !subtask.remove_hook(&hook)? || subtask.is_pinned() {
                return Ok(());
            }
            table.error_log.take()
        };
        idle.map_or(Ok(()), |s| self.retire(s))
    }
}
