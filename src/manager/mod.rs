//! The event manager.
//!
//! [`EventManager`] owns every registry and subtask of one test. It is a
//! cheap handle around shared state: clones refer to the same engine, and
//! subtask threads reach it through a weak [`EventSink`] reference so that
//! dropping the last handle stops them.
//!
//! Locks, in the order they may nest:
//!
//! - `status` and `sticky` are leaf locks;
//! - `registry` is the dispatch lock; it may take `prefilter` for writing;
//! - `subtasks` may take `status`, and is never held while a subtask is joined;
//! - `retired` is a leaf lock.
//!
//! Hook sets are owned by their subtasks behind their own locks, so hook APIs
//! never need the dispatch lock and may be called from inside actions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::action::{ActionBlock, ActionBlockId, MutexRegistry, NamedMutex, NamedMutexGuard};
use crate::config::EngineConfig;
use crate::descriptor::{Descriptor, DescriptorId};
use crate::error::{lock_err, EngineError, EngineResult, RegistrationError, SubtaskError};
use crate::event::Event;
use crate::platform::{Platform, PlatformCaps};
use crate::subtask::{EventSink, Subtask, SubtaskKind};
use crate::trigger::{Trigger, TriggerId};

mod dispatch;
mod hooks;
mod lifecycle;
mod registry;

use hooks::SubtaskTable;
use registry::{DescriptorTable, Registry};

/// Where the engine is in its one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    /// Registration phase; `start_test` not called yet.
    Idle,
    /// Between `start_test` and `end_test`.
    Running,
    /// `end_test` ran.
    Ended,
    /// A subtask failed and every subtask was stopped.
    Aborted,
}

impl TestStatus {
    /// Ended or aborted: events are ignored and hooks refused.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Ended | Self::Aborted)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Ended => "ended",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

pub(crate) struct ManagerCore {
    config: EngineConfig,
    platform: Platform,
    self_ref: Weak<ManagerCore>,
    prefilter: RwLock<Vec<Arc<dyn Trigger>>>,
    registry: Mutex<Registry>,
    block_names: RwLock<HashMap<String, ActionBlockId>>,
    descriptors: RwLock<DescriptorTable>,
    dispatch_owner: Mutex<Option<ThreadId>>,
    subtasks: Mutex<SubtaskTable>,
    /// Subtasks unhooked from inside a dispatch, stopped once it returns.
    retired: Mutex<Vec<Arc<dyn Subtask>>>,
    status: Mutex<TestStatus>,
    sticky: Mutex<Option<EngineError>>,
    mutexes: MutexRegistry,
    dropped_events: AtomicU64,
}

impl ManagerCore {
    fn registry(&self) -> EngineResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| lock_err("manager.registry"))
    }

    /// The dispatch lock for teardown. A panic that poisoned it during a
    /// dispatch must not keep blocks from releasing their mutexes.
    fn registry_for_teardown(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            warn!("dispatch lock poisoned by a panic; recovering for teardown");
            self.registry.clear_poison();
            poisoned.into_inner()
        })
    }

    fn subtasks(&self) -> EngineResult<MutexGuard<'_, SubtaskTable>> {
        self.subtasks.lock().map_err(|_| lock_err("manager.subtasks"))
    }

    fn sink(&self) -> Weak<dyn EventSink> {
        self.self_ref.clone()
    }

    fn status(&self) -> TestStatus {
        self.status.lock().map(|s| *s).unwrap_or(TestStatus::Aborted)
    }

    fn set_status(&self, next: TestStatus) -> EngineResult<()> {
        *self.status.lock().map_err(|_| lock_err("manager.status"))? = next;
        Ok(())
    }

    /// Keeps the first error of the test.
    fn record_sticky(&self, err: EngineError) {
        if let Ok(mut sticky) = self.sticky.lock() {
            if sticky.is_none() {
                *sticky = Some(err);
            }
        }
    }

    /// True when the calling thread is the one running a dispatch.
    fn dispatching_here(&self) -> bool {
        self.dispatch_owner
            .lock()
            .map(|owner| *owner == Some(thread::current().id()))
            .unwrap_or(false)
    }
}

impl EventSink for ManagerCore {
    fn handle_event(&self, event: &Event) -> EngineResult<()> {
        match self.self_ref.upgrade() {
            Some(core) => EventManager { core }.handle_event(event),
            None => Ok(()),
        }
    }

    fn subtask_failed(&self, subtask: &str, err: EngineError) {
        error!(subtask, error = %err, "subtask failed; stopping all subtasks");
        let fatal = EngineError::from(SubtaskError::Fatal {
            subtask: subtask.to_string(),
            source: Box::new(err),
        });
        self.record_sticky(fatal);
        self.abort();
    }
}

impl Drop for ManagerCore {
    fn drop(&mut self) {
        let drained = match self.subtasks.get_mut() {
            Ok(table) => table.drain(),
            Err(poisoned) => poisoned.into_inner().drain(),
        };
        for subtask in drained {
            if let Err(err) = subtask.stop() {
                error!(subtask = %subtask.label(), error = %err, "subtask did not stop on drop");
            }
        }
    }
}

/// Handle to one engine instance.
#[derive(Clone)]
pub struct EventManager {
    core: Arc<ManagerCore>,
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("status", &self.status())
            .field("triggers", &self.trigger_count())
            .field("platform", &self.core.platform)
            .finish_non_exhaustive()
    }
}

impl EventManager {
    /// Creates an engine for one test.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if `config` fails validation.
    pub fn new(config: EngineConfig, platform: Platform) -> EngineResult<Self> {
        config.validate()?;
        let core = Arc::new_cyclic(|self_ref| ManagerCore {
            config,
            platform,
            self_ref: self_ref.clone(),
            prefilter: RwLock::new(Vec::new()),
            registry: Mutex::new(Registry::default()),
            block_names: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(DescriptorTable::default()),
            dispatch_owner: Mutex::new(None),
            subtasks: Mutex::new(SubtaskTable::default()),
            retired: Mutex::new(Vec::new()),
            status: Mutex::new(TestStatus::Idle),
            sticky: Mutex::new(None),
            mutexes: MutexRegistry::new(),
            dropped_events: AtomicU64::new(0),
        });
        Ok(Self { core })
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Which collaborators this engine was built with.
    #[must_use]
    pub fn caps(&self) -> PlatformCaps {
        self.core.platform.caps()
    }

    pub(crate) fn mutexes(&self) -> &MutexRegistry {
        &self.core.mutexes
    }

    fn refuse_reentrant(&self) -> EngineResult<()> {
        if self.core.dispatching_here() {
            return Err(RegistrationError::ReentrantRegistration.into());
        }
        Ok(())
    }

    /// Registers a descriptor, optionally under a unique name.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::DuplicateDescriptor` if the name is taken.
    pub fn add_descriptor(&self, name: Option<&str>, descriptor: Arc<dyn Descriptor>) -> EngineResult<DescriptorId> {
        let mut table = self
            .core
            .descriptors
            .write()
            .map_err(|_| lock_err("manager.descriptors"))?;
        let id = table.add(name, descriptor)?;
        debug!(descriptor = ?name, %id, "descriptor registered");
        Ok(id)
    }

    /// Looks up a named descriptor.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<Arc<dyn Descriptor>> {
        self.core.descriptors.read().ok().and_then(|t| t.by_name(name))
    }

    /// Looks up a descriptor by id.
    #[must_use]
    pub fn descriptor_by_id(&self, id: DescriptorId) -> Option<Arc<dyn Descriptor>> {
        self.core.descriptors.read().ok().and_then(|t| t.by_id(id))
    }

    /// Registers an action block. Named blocks must have unique names.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::DuplicateActionBlock` for a taken name and
    /// `ReentrantRegistration` when called from inside an action.
    pub fn add_action_block(&self, block: ActionBlock) -> EngineResult<ActionBlockId> {
        self.refuse_reentrant()?;
        let mut registry = self.core.registry()?;
        let mut names = self
            .core
            .block_names
            .write()
            .map_err(|_| lock_err("manager.block_names"))?;
        if let Some(name) = block.name() {
            if names.contains_key(name) {
                return Err(RegistrationError::DuplicateActionBlock { name: name.to_string() }.into());
            }
        }
        let name = block.name().map(str::to_string);
        let id = registry.add_block(block);
        if let Some(name) = name {
            names.insert(name, id);
        }
        debug!(block = %id, actions = registry.blocks.get(&id).map_or(0, ActionBlock::len), "action block registered");
        Ok(id)
    }

    /// Id of the block registered under `name`.
    #[must_use]
    pub fn action_block_id(&self, name: &str) -> Option<ActionBlockId> {
        self.core.block_names.read().ok().and_then(|n| n.get(name).copied())
    }

    /// Binds `trigger` to a registered block at the end of the dispatch order.
    ///
    /// # Errors
    ///
    /// Fails with a registration error if the trigger object is already
    /// registered, the block is unknown, the trigger or one of the block's
    /// actions is unsupported, or the call comes from inside an action (use
    /// `ActionContext::add_trigger` there).
    pub fn add_trigger(&self, trigger: Arc<dyn Trigger>, block: ActionBlockId) -> EngineResult<TriggerId> {
        self.refuse_reentrant()?;
        trigger.is_supported(&self.caps())?;
        let mut registry = self.core.registry()?;
        let id = TriggerId::new();
        self.admit(&mut registry, id, trigger, block)?;
        Ok(id)
    }

    /// Appends to both the dispatch list and the prefilter list.
    fn admit(
        &self,
        registry: &mut Registry,
        id: TriggerId,
        trigger: Arc<dyn Trigger>,
        block: ActionBlockId,
    ) -> EngineResult<()> {
        registry.admit(id, Arc::clone(&trigger), block)?;
        debug!(trigger = trigger.name(), %id, %block, "trigger registered");
        self.core
            .prefilter
            .write()
            .map_err(|_| lock_err("manager.prefilter"))?
            .push(trigger);
        Ok(())
    }

    /// Number of registered triggers.
    #[must_use]
    pub fn trigger_count(&self) -> usize {
        self.core.prefilter.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Current test status.
    #[must_use]
    pub fn status(&self) -> TestStatus {
        self.core.status()
    }

    /// The first error recorded during the test, if any.
    #[must_use]
    pub fn sticky_error(&self) -> Option<EngineError> {
        self.core.sticky.lock().ok().and_then(|s| s.clone())
    }

    /// Events no trigger could match.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.core.dropped_events.load(Ordering::Relaxed)
    }

    /// The named mutex, if any block or guard ever used it.
    #[must_use]
    pub fn mutex(&self, name: &str) -> Option<Arc<NamedMutex>> {
        self.core.mutexes.get(name)
    }

    /// Holds a named mutex from outside the engine until the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::MutexTimeout` if it stayed busy for `timeout`.
    pub fn lock_mutex(&self, name: &str, timeout: Duration) -> EngineResult<NamedMutexGuard> {
        self.core.mutexes.lock_external(name, timeout)
    }

    /// Hooks registered across every live subtask of `kind`.
    #[must_use]
    pub fn hook_count(&self, kind: SubtaskKind) -> usize {
        self.core.subtasks().map(|t| t.hook_count(kind)).unwrap_or(0)
    }

    /// Live subtask instances of `kind`.
    #[must_use]
    pub fn subtask_count(&self, kind: SubtaskKind) -> usize {
        self.core.subtasks().map(|t| t.count(kind)).unwrap_or(0)
    }

    /// Completed scan passes of the memory or surface watch, for pacing checks.
    #[must_use]
    pub fn scan_passes(&self, kind: SubtaskKind) -> u64 {
        self.core.subtasks().map(|t| t.scan_passes(kind)).unwrap_or(0)
    }
}
