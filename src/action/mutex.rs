//! Named logical mutexes shared between action blocks and test code.
//!
//! A [`NamedMutex`] is not a memory guard: it records which holder owns a
//! name and lets others wait for it. Action blocks acquire them through their
//! [`ActionContext`](super::ActionContext) and release them when `execute`
//! returns; external code holds them through a [`NamedMutexGuard`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{lock_err, EngineResult, ExecutionError};
use crate::event::Event;
use crate::trigger::Trigger;

use super::block::ActionBlockId;
use super::{Action, ActionContext};

/// Who currently owns a named mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexHolder {
    /// An action block, for the duration of one `execute` call.
    Block(ActionBlockId),
    /// Code outside the engine holding a [`NamedMutexGuard`].
    External(u64),
}

/// A holder-tracked mutex identified by name.
pub struct NamedMutex {
    name: String,
    holder: Mutex<Option<MutexHolder>>,
    released: Condvar,
}

impl fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMutex")
            .field("name", &self.name)
            .field("holder", &self.holder())
            .finish()
    }
}

impl NamedMutex {
    /// A free mutex called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// The mutex name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<MutexHolder> {
        self.holder.lock().ok().and_then(|h| *h)
    }

    /// Takes the mutex if it is free. Re-acquiring by the current holder succeeds.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the holder lock is poisoned.
    pub fn try_lock(&self, holder: MutexHolder) -> EngineResult<bool> {
        let mut current = self.holder.lock().map_err(|_| lock_err("named_mutex.holder"))?;
        match *current {
            None => {
                *current = Some(holder);
                Ok(true)
            }
            Some(h) => Ok(h == holder),
        }
    }

    /// Waits up to `timeout` for the mutex to become free, then takes it.
    ///
    /// A timeout too large to express as a deadline (such as `Duration::MAX`)
    /// waits until the mutex is released.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the holder lock is poisoned.
    pub fn lock_timeout(&self, holder: MutexHolder, timeout: Duration) -> EngineResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut current = self.holder.lock().map_err(|_| lock_err("named_mutex.holder"))?;
        loop {
            match *current {
                None => {
                    *current = Some(holder);
                    return Ok(true);
                }
                Some(h) if h == holder => return Ok(true),
                Some(_) => {}
            }
            current = match deadline {
                None => self.released.wait(current).map_err(|_| lock_err("named_mutex.holder"))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.released
                        .wait_timeout(current, deadline - now)
                        .map_err(|_| lock_err("named_mutex.holder"))?
                        .0
                }
            };
        }
    }

    /// Releases the mutex if `holder` owns it. Returns whether it did.
    pub fn unlock(&self, holder: MutexHolder) -> bool {
        let Ok(mut current) = self.holder.lock() else {
            return false;
        };
        if *current != Some(holder) {
            return false;
        }
        *current = None;
        drop(current);
        self.released.notify_all();
        true
    }
}

/// Holds a named mutex on behalf of code outside the engine; unlocks on drop.
#[derive(Debug)]
pub struct NamedMutexGuard {
    mutex: Arc<NamedMutex>,
    holder: MutexHolder,
}

impl NamedMutexGuard {
    /// Name of the held mutex.
    #[must_use]
    pub fn name(&self) -> &str {
        self.mutex.name()
    }
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        self.mutex.unlock(self.holder);
    }
}

/// All named mutexes of one engine. Mutexes are created on first use.
#[derive(Debug, Default)]
pub struct MutexRegistry {
    mutexes: Mutex<HashMap<String, Arc<NamedMutex>>>,
    next_external: AtomicU64,
}

impl MutexRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex called `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the registry lock is poisoned.
    pub fn get_or_create(&self, name: &str) -> EngineResult<Arc<NamedMutex>> {
        let mut mutexes = self.mutexes.lock().map_err(|_| lock_err("mutex_registry"))?;
        Ok(Arc::clone(
            mutexes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(NamedMutex::new(name))),
        ))
    }

    /// Returns the mutex called `name` if it was ever used.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NamedMutex>> {
        self.mutexes.lock().ok().and_then(|m| m.get(name).cloned())
    }

    /// Acquires `name` for external code, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::MutexTimeout` if the mutex stayed busy.
    pub fn lock_external(&self, name: &str, timeout: Duration) -> EngineResult<NamedMutexGuard> {
        let mutex = self.get_or_create(name)?;
        let holder = MutexHolder::External(self.next_external.fetch_add(1, Ordering::Relaxed));
        if mutex.lock_timeout(holder, timeout)? {
            Ok(NamedMutexGuard { mutex, holder })
        } else {
            Err(ExecutionError::MutexTimeout {
                name: name.to_string(),
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into())
        }
    }
}

/// Blocks, within the configured bound, until the block holds `name`.
#[derive(Debug, Clone)]
pub struct AcquireMutex {
    name: String,
    label: String,
}

impl AcquireMutex {
    /// Acquires `name`, waiting at most the configured mutex wait.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = format!("acquire_mutex:{name}");
        Self { name, label }
    }
}

impl Action for AcquireMutex {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_supported(&self, _trigger: &dyn Trigger) -> EngineResult<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<()> {
        ctx.acquire_mutex(&self.name)
    }
}

/// Releases `name` before the block ends.
#[derive(Debug, Clone)]
pub struct ReleaseMutex {
    name: String,
    label: String,
}

impl ReleaseMutex {
    /// Releases `name` if this block holds it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = format!("release_mutex:{name}");
        Self { name, label }
    }
}

impl Action for ReleaseMutex {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_supported(&self, _trigger: &dyn Trigger) -> EngineResult<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>, _trigger: &dyn Trigger, _event: &Event) -> EngineResult<()> {
        ctx.release_mutex(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn try_lock_is_exclusive_and_reentrant_for_holder() {
        let m = NamedMutex::new("bus");
        let a = MutexHolder::External(1);
        let b = MutexHolder::External(2);
        assert!(m.try_lock(a).unwrap());
        assert!(m.try_lock(a).unwrap());
        assert!(!m.try_lock(b).unwrap());
        assert!(!m.unlock(b));
        assert!(m.unlock(a));
        assert!(m.try_lock(b).unwrap());
    }

    #[test]
    fn lock_timeout_waits_for_release() {
        let registry = Arc::new(MutexRegistry::new());
        let guard = registry.lock_external("bus", Duration::from_millis(10)).unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.lock_external("bus", Duration::from_secs(5)).map(|g| g.name().to_string()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert_eq!(waiter.join().unwrap().unwrap(), "bus");
    }

    #[test]
    fn unbounded_timeout_waits_for_release() {
        let registry = Arc::new(MutexRegistry::new());
        let free = registry.lock_external("bus", Duration::MAX).unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.lock_external("bus", Duration::MAX).map(|g| g.name().to_string()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(free);
        assert_eq!(waiter.join().unwrap().unwrap(), "bus");
    }

    #[test]
    fn lock_external_times_out_when_busy() {
        let registry = MutexRegistry::new();
        let _held = registry.lock_external("bus", Duration::from_millis(10)).unwrap();
        let err = registry.lock_external("bus", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Execution(ExecutionError::MutexTimeout { .. })
        ));
    }

    #[test]
    fn get_only_returns_used_mutexes() {
        let registry = MutexRegistry::new();
        assert!(registry.get("bus").is_none());
        registry.get_or_create("bus").unwrap();
        assert!(registry.get("bus").is_some());
    }
}
