//! Surface watch with edge-triggered latches.
//!
//! Each hook keeps the set of ranges it has already seen matching. A range
//! fires when it goes from "not in the latch" to "matching"; it is removed
//! from the latch the first time it is seen not matching, which re-arms it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::platform::{MemRange, SurfaceBus};

use super::{lock_hooks, Callback, EventSink, Subtask, SubtaskKind, Worker};

/// The memory ranges one surface hook watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceRegion {
    /// Ranges scanned in order on every pass.
    pub ranges: Vec<MemRange>,
}

impl SurfaceRegion {
    /// A region made of `ranges`, compared in order.
    #[must_use]
    pub fn new(ranges: impl IntoIterator<Item = MemRange>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    /// A region of one range.
    #[must_use]
    pub fn single(range: MemRange) -> Self {
        Self { ranges: vec![range] }
    }
}

/// What a surface hook observed when it fired.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceMatch {
    pub range: MemRange,
    pub bytes: Vec<u8>,
}

/// New watch target returned by a surface callback.
///
/// `None` fields keep the current value. The replacement starts with an
/// empty latch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceRetarget {
    /// Ranges to watch from now on.
    pub region: Option<SurfaceRegion>,
    /// Bytes whose appearance fires the hook.
    pub expected: Option<Vec<u8>>,
}

/// Invoked on each rising edge; may move the watch elsewhere.
pub type SurfaceCallback =
    Callback<dyn Fn(&SurfaceMatch, &[u8]) -> EngineResult<Option<SurfaceRetarget>> + Send + Sync>;

impl SurfaceCallback {
    /// Wraps `f`. Clones of the result are the same hook callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SurfaceMatch, &[u8]) -> EngineResult<Option<SurfaceRetarget>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

/// A persistent watch for `expected` appearing in any range of `region`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceHook {
    pub region: SurfaceRegion,
    pub expected: Vec<u8>,
    pub callback: SurfaceCallback,
    pub context: Vec<u8>,
}

type Latches = HashMap<SurfaceHook, HashSet<MemRange>>;

/// Cooperative poller over every registered surface hook.
pub struct SurfaceWatchSubtask {
    surfaces: Arc<dyn SurfaceBus>,
    hooks: Arc<Mutex<Latches>>,
    passes: Arc<AtomicU64>,
    poll_interval: Duration,
    worker: Worker,
}

impl SurfaceWatchSubtask {
    pub(crate) fn new(surfaces: Arc<dyn SurfaceBus>, sink: Weak<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            surfaces,
            hooks: Arc::new(Mutex::new(HashMap::new())),
            passes: Arc::new(AtomicU64::new(0)),
            poll_interval: config.poll_interval(),
            worker: Worker::new("surface".to_string(), sink, config.wake_queue_capacity),
        }
    }

    pub(crate) fn add_hook(&self, hook: SurfaceHook) -> EngineResult<bool> {
        let mut hooks = lock_hooks(&self.hooks, "surface.hooks")?;
        if hooks.contains_key(&hook) {
            return Ok(false);
        }
        hooks.insert(hook, HashSet::new());
        drop(hooks);
        self.worker.wake();
        Ok(true)
    }

    /// Returns true if the set is now empty.
    pub(crate) fn remove_hook(&self, hook: &SurfaceHook) -> EngineResult<bool> {
        let mut hooks = lock_hooks(&self.hooks, "surface.hooks")?;
        hooks.remove(hook);
        Ok(hooks.is_empty())
    }

    /// Completed scan passes since creation.
    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }
}

/// Scans one hook. Returns an error from the bus or the callback.
fn scan_hook(surfaces: &dyn SurfaceBus, hooks: &Mutex<Latches>, hook: &SurfaceHook) -> EngineResult<()> {
    for range in &hook.region.ranges {
        let bytes = surfaces.read_range(range)?;
        let matched = bytes == hook.expected;
        let rising = {
            let mut latches = lock_hooks(hooks, "surface.hooks")?;
            let Some(latch) = latches.get_mut(hook) else {
                // Removed or retargeted while we were reading.
                return Ok(());
            };
            if matched {
                latch.insert(*range)
            } else {
                latch.remove(range);
                false
            }
        };
        if !rising {
            continue;
        }

        debug!(range = %range, "surface hook fired");
        let found = SurfaceMatch { range: *range, bytes };
        let Some(retarget) = (hook.callback.0)(&found, &hook.context)? else {
            continue;
        };
        let mut latches = lock_hooks(hooks, "surface.hooks")?;
        if latches.remove(hook).is_some() {
            let moved = SurfaceHook {
                region: retarget.region.unwrap_or_else(|| hook.region.clone()),
                expected: retarget.expected.unwrap_or_else(|| hook.expected.clone()),
                callback: hook.callback.clone(),
                context: hook.context.clone(),
            };
            debug!(ranges = moved.region.ranges.len(), "surface hook retargeted");
            latches.insert(moved, HashSet::new());
        }
        return Ok(());
    }
    Ok(())
}

impl Subtask for SurfaceWatchSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::SurfaceWatch
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let surfaces = Arc::clone(&self.surfaces);
        let hooks = Arc::clone(&self.hooks);
        let passes = Arc::clone(&self.passes);
        let interval = self.poll_interval;
        info!(subtask = "surface", "starting surface watch");
        self.worker.start(move |signals| {
            while !signals.should_stop() {
                let snapshot: Vec<SurfaceHook> = lock_hooks(&hooks, "surface.hooks")?.keys().cloned().collect();
                if snapshot.is_empty() {
                    signals.wait();
                    continue;
                }
                for hook in &snapshot {
                    if signals.should_stop() {
                        return Ok(());
                    }
                    scan_hook(surfaces.as_ref(), &hooks, hook)?;
                }
                let n = passes.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(pass = n, "surface scan pass");
                signals.pause(interval);
            }
            Ok(())
        })
    }

    fn stop(&self) -> EngineResult<()> {
        lock_hooks(&self.hooks, "surface.hooks")?.clear();
        self.worker.stop()
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

    use super::*;
    use crate::platform::loopback::LoopbackSurface;
    use crate::subtask::testing::{wait_until, RecordingSink};

    fn settle(subtask: &SurfaceWatchSubtask) {
        let now = subtask.passes();
        assert!(wait_until(Duration::from_secs(2), || subtask.passes() >= now + 3));
    }

    #[test]
    fn fires_on_rising_edge_only() {
        let surface = Arc::new(LoopbackSurface::default());
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        let subtask = SurfaceWatchSubtask::new(surface.clone(), Arc::downgrade(&sink), &EngineConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        subtask
            .add_hook(SurfaceHook {
                region: SurfaceRegion::single(MemRange::new(0x40, 2)),
                expected: vec![0xAB, 0xCD],
                callback: SurfaceCallback::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }),
                context: vec![],
            })
            .unwrap();
        subtask.start().unwrap();

        settle(&subtask);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        surface.write(0x40, &[0xAB, 0xCD]);
        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
        settle(&subtask);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        surface.write(0x40, &[0, 0]);
        settle(&subtask);
        surface.write(0x40, &[0xAB, 0xCD]);
        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 2));
        settle(&subtask);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        subtask.stop().unwrap();
    }

    #[test]
    fn retarget_follows_the_new_range() {
        let surface = Arc::new(LoopbackSurface::default());
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        let subtask = SurfaceWatchSubtask::new(surface.clone(), Arc::downgrade(&sink), &EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        subtask
            .add_hook(SurfaceHook {
                region: SurfaceRegion::single(MemRange::new(0x0, 1)),
                expected: vec![1],
                callback: SurfaceCallback::new(move |m, _| {
                    log.lock().unwrap().push(m.range.base);
                    Ok(Some(SurfaceRetarget {
                        region: Some(SurfaceRegion::single(MemRange::new(m.range.base + 1, 1))),
                        expected: None,
                    }))
                }),
                context: vec![],
            })
            .unwrap();
        subtask.start().unwrap();

        surface.write(0x0, &[1]);
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 1));
        surface.write(0x1, &[1]);
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 2));
        assert_eq!(*seen.lock().unwrap(), vec![0x0, 0x1]);
        assert_eq!(subtask.hook_count(), 1);
        subtask.stop().unwrap();
    }
}
