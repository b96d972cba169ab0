use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eventrig::action::{AcquireMutex, FnDecision, ReleaseMutex};
use eventrig::platform::PlatformCaps;
use eventrig::{
    BlockBuilder, Capabilities, EngineConfig, EngineError, EngineResult, Event, EventKind, EventManager,
    EventTrigger, ExecutionError, FnAction, LifecycleTrigger, NameDescriptor, Platform, RegistrationError,
    SourceDescriptor, SourceId, TestStatus, Trigger,
};

type Log = Arc<Mutex<Vec<String>>>;

fn manager() -> EventManager {
    EventManager::new(EngineConfig::default(), Platform::new()).unwrap()
}

fn append(log: &Log, entry: &'static str) -> FnAction {
    let log = Arc::clone(log);
    FnAction::new(entry, move |_, _, _| {
        log.lock().unwrap().push(entry.to_string());
        Ok(())
    })
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Matches named events called "X" and counts how often `do_match` ran.
struct SpyTrigger {
    do_match_calls: AtomicUsize,
}

impl Trigger for SpyTrigger {
    fn name(&self) -> &str {
        "spy"
    }

    fn is_supported(&self, _caps: &PlatformCaps) -> EngineResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NAME
    }

    fn could_match(&self, event: &Event) -> bool {
        event.name() == Some("X")
    }

    fn do_match(&self, event: &Event) -> bool {
        self.do_match_calls.fetch_add(1, Ordering::SeqCst);
        self.could_match(event)
    }
}

#[test]
fn matching_event_runs_bound_block() {
    let mgr = manager();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(BlockBuilder::new().then(append(&log, "hit")).build())
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();

    mgr.handle_event(&Event::named("Y")).unwrap();
    assert!(entries(&log).is_empty());

    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(entries(&log), vec!["hit"]);
}

#[test]
fn do_match_only_runs_after_could_match() {
    let mgr = manager();
    let spy = Arc::new(SpyTrigger {
        do_match_calls: AtomicUsize::new(0),
    });
    let block = mgr.add_action_block(BlockBuilder::new().build()).unwrap();
    mgr.add_trigger(spy.clone(), block).unwrap();

    for _ in 0..10 {
        mgr.handle_event(&Event::named("Y")).unwrap();
    }
    assert_eq!(spy.do_match_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mgr.dropped_events(), 10);

    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(spy.do_match_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn triggers_fire_in_registration_order() {
    let mgr = manager();
    let log: Log = Arc::default();
    for tag in ["first", "second", "third"] {
        let block = mgr.add_action_block(BlockBuilder::new().then(append(&log, tag)).build()).unwrap();
        mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();
    }
    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(entries(&log), vec!["first", "second", "third"]);
}

#[test]
fn registration_errors_are_synchronous() {
    let mgr = manager();
    let block = mgr.add_action_block(BlockBuilder::named("main").build()).unwrap();
    assert_eq!(mgr.action_block_id("main"), Some(block));

    let dup_name = mgr.add_action_block(BlockBuilder::named("main").build()).unwrap_err();
    assert!(dup_name.is_registration());

    let trigger: Arc<dyn Trigger> = Arc::new(EventTrigger::named("X"));
    mgr.add_trigger(Arc::clone(&trigger), block).unwrap();
    let dup = mgr.add_trigger(trigger, block).unwrap_err();
    assert!(matches!(
        dup,
        EngineError::Registration(RegistrationError::DuplicateTrigger { .. })
    ));

    let unknown = mgr
        .add_trigger(Arc::new(EventTrigger::named("X")), eventrig::ActionBlockId::new())
        .unwrap_err();
    assert!(matches!(
        unknown,
        EngineError::Registration(RegistrationError::UnknownActionBlock { .. })
    ));

    // No memory bus on an empty platform.
    let unsupported = mgr
        .add_trigger(Arc::new(EventTrigger::on(EventKind::MemoryChanged)), block)
        .unwrap_err();
    assert!(matches!(
        unsupported,
        EngineError::Registration(RegistrationError::Unsupported { .. })
    ));
    assert_eq!(mgr.trigger_count(), 1);
}

#[test]
fn action_support_is_checked_against_the_trigger() {
    let mgr = manager();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .then(FnAction::new("dump_payload", |_, _, _| Ok(())).requires(Capabilities::PAYLOAD))
                .build(),
        )
        .unwrap();
    let err = mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap_err();
    assert!(err.is_registration());
}

#[test]
fn descriptors_scope_triggers() {
    let mgr = manager();
    let log: Log = Arc::default();
    let id = mgr
        .add_descriptor(Some("cpu0"), Arc::new(SourceDescriptor::new([SourceId(0)])))
        .unwrap();
    mgr.add_descriptor(None, Arc::new(NameDescriptor::exact("reset").unwrap()))
        .unwrap();
    assert!(mgr.descriptor_by_id(id).is_some());

    let descriptor = mgr.descriptor("cpu0").unwrap();
    let block = mgr.add_action_block(BlockBuilder::new().then(append(&log, "cpu0")).build()).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("reset").with_descriptor(descriptor)), block)
        .unwrap();

    mgr.handle_event(&Event::named_from("reset", SourceId(1))).unwrap();
    mgr.handle_event(&Event::named("reset")).unwrap();
    assert!(entries(&log).is_empty());
    mgr.handle_event(&Event::named_from("reset", SourceId(0))).unwrap();
    assert_eq!(entries(&log), vec!["cpu0"]);
}

#[test]
fn if_else_takes_one_branch() {
    let mgr = manager();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .then(append(&log, "before"))
                .if_else(
                    FnDecision::new("is_left", |_, _, event| Ok(event.name() == Some("left"))),
                    |b| b.then(append(&log, "then")),
                    |b| b.then(append(&log, "else")),
                )
                .then(append(&log, "after"))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("left")), block).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("right")), block).unwrap();

    mgr.handle_event(&Event::named("left")).unwrap();
    mgr.handle_event(&Event::named("right")).unwrap();
    assert_eq!(
        entries(&log),
        vec!["before", "then", "after", "before", "else", "after"]
    );
}

#[test]
fn on_nth_runs_on_listed_executions_only() {
    let mgr = manager();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .on_nth([2, 4], |b| b.then(append(&log, "nth")))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();
    for _ in 0..5 {
        mgr.handle_event(&Event::named("X")).unwrap();
    }
    assert_eq!(entries(&log).len(), 2);
}

#[test]
fn on_test_id_follows_config() {
    let config = EngineConfig::default().with_test_id(7);
    let mgr = EventManager::new(config, Platform::new()).unwrap();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .on_test_id([3], |b| b.then(append(&log, "three")))
                .on_test_id([7, 8], |b| b.then(append(&log, "seven")))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();
    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(entries(&log), vec!["seven"]);
}

#[test]
fn mutexes_are_released_when_the_block_returns() {
    let mgr = manager();
    let block = mgr
        .add_action_block(BlockBuilder::new().then(AcquireMutex::new("bus")).build())
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();

    mgr.handle_event(&Event::named("X")).unwrap();
    let bus = mgr.mutex("bus").unwrap();
    assert!(bus.holder().is_none());

    // A second run can take it again.
    mgr.handle_event(&Event::named("X")).unwrap();
    assert!(bus.holder().is_none());
}

#[test]
fn try_mutex_skips_body_while_busy() {
    let mgr = manager();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .try_mutex("bus", |b| b.then(append(&log, "locked")).then(ReleaseMutex::new("bus")))
                .then(append(&log, "done"))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();

    let guard = mgr.lock_mutex("bus", Duration::from_millis(100)).unwrap();
    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(entries(&log), vec!["done"]);

    drop(guard);
    mgr.handle_event(&Event::named("X")).unwrap();
    assert_eq!(entries(&log), vec!["done", "locked", "done"]);
}

#[test]
fn mutex_wait_times_out() {
    let config = EngineConfig {
        mutex_wait_ms: 20,
        ..EngineConfig::default()
    };
    let mgr = EventManager::new(config, Platform::new()).unwrap();
    let block = mgr
        .add_action_block(BlockBuilder::new().then(AcquireMutex::new("bus")).build())
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();

    let _guard = mgr.lock_mutex("bus", Duration::from_millis(100)).unwrap();
    let err = mgr.handle_event(&Event::named("X")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Execution(ExecutionError::MutexTimeout { .. })
    ));
}

#[test]
fn lock_mutex_without_deadline_waits_for_release() {
    let mgr = manager();
    let guard = mgr.lock_mutex("bus", Duration::MAX).unwrap();
    let waiter = {
        let mgr = mgr.clone();
        thread::spawn(move || mgr.lock_mutex("bus", Duration::MAX).map(|g| g.name().to_string()))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());
    drop(guard);
    assert_eq!(waiter.join().unwrap().unwrap(), "bus");
    assert!(mgr.mutex("bus").unwrap().holder().is_none());
}

#[test]
fn panicking_action_releases_its_mutex_and_engine_keeps_dispatching() {
    let mgr = manager();
    let log: Log = Arc::default();
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .then(AcquireMutex::new("bus"))
                .then(FnAction::new("explode", |_, _, event| {
                    if event.name() == Some("X") {
                        panic!("peripheral model crashed");
                    }
                    Ok(())
                }))
                .then(append(&log, "survived"))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("Y")), block).unwrap();

    let err = mgr.handle_event(&Event::named("X")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Execution(ExecutionError::ActionPanicked { ref action, .. }) if action == "explode"
    ));
    assert!(mgr.mutex("bus").unwrap().holder().is_none());

    // The block is still registered and the dispatch lock is usable.
    mgr.handle_event(&Event::named("Y")).unwrap();
    assert_eq!(entries(&log), vec!["survived"]);
    mgr.end_test().unwrap();
    assert!(mgr.mutex("bus").unwrap().holder().is_none());
}

#[test]
fn blocks_never_run_concurrently() {
    const THREADS: usize = 8;
    const EVENTS_PER_THREAD: usize = 50;

    let mgr = manager();
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let block = {
        let (inside, overlaps, runs) = (Arc::clone(&inside), Arc::clone(&overlaps), Arc::clone(&runs));
        mgr.add_action_block(
            BlockBuilder::new()
                .then(FnAction::new("exclusive", move |_, _, _| {
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(50));
                    runs.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    Ok(())
                }))
                .build(),
        )
        .unwrap()
    };
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), block).unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let mgr = mgr.clone();
            thread::spawn(move || {
                for _ in 0..EVENTS_PER_THREAD {
                    mgr.handle_event(&Event::named("X")).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(runs.load(Ordering::SeqCst), THREADS * EVENTS_PER_THREAD);
}

#[test]
fn action_failure_does_not_stop_later_triggers() {
    let mgr = manager();
    let log: Log = Arc::default();
    let failing = mgr
        .add_action_block(
            BlockBuilder::new()
                .then(FnAction::new("fail", |_, _, _| Err(EngineError::action_failed("fail", "boom"))))
                .then(append(&log, "unreached"))
                .build(),
        )
        .unwrap();
    let ok = mgr.add_action_block(BlockBuilder::new().then(append(&log, "later")).build()).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), failing).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), ok).unwrap();

    let err = mgr.handle_event(&Event::named("X")).unwrap_err();
    assert!(err.is_execution());
    assert_eq!(entries(&log), vec!["later"]);
}

#[test]
fn full_test_lifecycle() {
    let mgr = manager();
    let log: Log = Arc::default();
    let start = mgr.add_action_block(BlockBuilder::new().then(append(&log, "start")).build()).unwrap();
    let end = mgr.add_action_block(BlockBuilder::new().then(append(&log, "end")).build()).unwrap();
    let named = mgr.add_action_block(BlockBuilder::new().then(append(&log, "X")).build()).unwrap();
    mgr.add_trigger(Arc::new(LifecycleTrigger::on_test_start()), start).unwrap();
    mgr.add_trigger(Arc::new(LifecycleTrigger::on_test_end()), end).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::named("X")), named).unwrap();

    assert_eq!(mgr.status(), TestStatus::Idle);
    mgr.start_test().unwrap();
    mgr.handle_event(&Event::named("X")).unwrap();
    mgr.end_test().unwrap();
    assert_eq!(mgr.status(), TestStatus::Ended);
    assert_eq!(entries(&log), vec!["start", "X", "end"]);
}
