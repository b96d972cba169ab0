use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventrig::platform::loopback::{
    LoopbackCompanion, LoopbackErrorLog, LoopbackMemory, LoopbackResources, LoopbackSurface,
};
use eventrig::platform::{CompanionMessage, DeviceId, MemRange, ResourceHandle};
use eventrig::{
    BlockBuilder, EngineConfig, EngineError, ErrorLogCallback, Event, EventKind, EventManager, EventTrigger,
    FnAction, MemoryCallback, Platform, ResourceCallback, SubtaskError, SubtaskKind, SurfaceCallback, SurfaceRegion,
    TestStatus, TimerCallback,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn counting_block(mgr: &EventManager, kind: EventKind) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let block = mgr
        .add_action_block(
            BlockBuilder::new()
                .then(FnAction::new("count", move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .build(),
        )
        .unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::on(kind)), block).unwrap();
    hits
}

#[test]
fn timers_fire_in_deadline_order() {
    init_tracing();
    let mgr = EventManager::new(EngineConfig::default(), Platform::new()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    let callback = TimerCallback::new(move |_, ctx| {
        sink.lock().unwrap().push(ctx[0]);
        Ok(())
    });

    let base = Instant::now();
    for ms in [200u8, 50, 100] {
        mgr.hook_timer_event(base + Duration::from_millis(u64::from(ms)), callback.clone(), vec![ms])
            .unwrap();
    }
    assert_eq!(mgr.hook_count(SubtaskKind::Timer), 3);

    assert!(wait_until(WAIT, || order.lock().unwrap().len() == 3));
    assert_eq!(*order.lock().unwrap(), vec![50, 100, 200]);
    assert!(base.elapsed() >= Duration::from_millis(200));
    assert_eq!(mgr.hook_count(SubtaskKind::Timer), 0);
    // The timer stays up until the test ends.
    assert_eq!(mgr.subtask_count(SubtaskKind::Timer), 1);
    mgr.end_test().unwrap();
    assert_eq!(mgr.subtask_count(SubtaskKind::Timer), 0);
}

#[test]
fn identical_timer_hooks_collapse() {
    init_tracing();
    let mgr = EventManager::new(EngineConfig::default(), Platform::new()).unwrap();
    let callback = TimerCallback::new(|_, _| Ok(()));
    let deadline = Instant::now() + Duration::from_secs(60);

    mgr.hook_timer_event(deadline, callback.clone(), b"ctx".to_vec()).unwrap();
    mgr.hook_timer_event(deadline, callback.clone(), b"ctx".to_vec()).unwrap();
    assert_eq!(mgr.hook_count(SubtaskKind::Timer), 1);

    mgr.unhook_timer_event(deadline, &callback, b"ctx").unwrap();
    assert_eq!(mgr.hook_count(SubtaskKind::Timer), 0);
    mgr.unhook_timer_event(deadline, &callback, b"ctx").unwrap();
}

#[test]
fn memory_hook_fires_once_on_change() {
    init_tracing();
    let memory = Arc::new(LoopbackMemory::default());
    memory.write_word(0x100, 5);
    let platform = Platform::new().with_memory(memory.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = MemoryCallback::new(move |change, _| {
        sink.lock().unwrap().push(change.observed);
        Ok(())
    });
    mgr.hook_memory_event(0x100, 5, callback.clone(), Vec::new()).unwrap();
    // Unwritten words read as zero, so this one never fires and keeps the scan going.
    mgr.hook_memory_event(0x200, 0, callback.clone(), Vec::new()).unwrap();

    let passes = mgr.scan_passes(SubtaskKind::MemoryWatch);
    assert!(wait_until(WAIT, || mgr.scan_passes(SubtaskKind::MemoryWatch) >= passes + 5));
    assert!(seen.lock().unwrap().is_empty());

    memory.write_word(0x100, 9);
    assert!(wait_until(WAIT, || seen.lock().unwrap().len() == 1));
    assert_eq!(mgr.hook_count(SubtaskKind::MemoryWatch), 1);

    let passes = mgr.scan_passes(SubtaskKind::MemoryWatch);
    assert!(wait_until(WAIT, || mgr.scan_passes(SubtaskKind::MemoryWatch) >= passes + 3));
    assert_eq!(*seen.lock().unwrap(), vec![9]);

    // The same identity may be hooked again after it fired.
    mgr.hook_memory_event(0x100, 5, callback, Vec::new()).unwrap();
    assert_eq!(mgr.hook_count(SubtaskKind::MemoryWatch), 2);
    mgr.end_test().unwrap();
}

#[test]
fn surface_hook_rearms_after_mismatch() {
    init_tracing();
    let surface = Arc::new(LoopbackSurface::default());
    let platform = Platform::new().with_surfaces(surface.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let callback = SurfaceCallback::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    });
    let region = SurfaceRegion::single(MemRange::new(0x2000, 4));
    let expected = [0xde, 0xad, 0xbe, 0xef];
    mgr.hook_surface_event(region.clone(), expected.to_vec(), callback.clone(), Vec::new())
        .unwrap();

    let settle = |n: u64| {
        let passes = mgr.scan_passes(SubtaskKind::SurfaceWatch);
        assert!(wait_until(WAIT, || mgr.scan_passes(SubtaskKind::SurfaceWatch) >= passes + n));
    };

    settle(3);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    surface.write(0x2000, &expected);
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 1));
    settle(5);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    surface.write(0x2000, &[0, 0, 0, 0]);
    settle(2);
    surface.write(0x2000, &expected);
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 2));
    settle(3);
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    mgr.unhook_surface_event(&region, &expected, &callback, b"").unwrap();
    assert_eq!(mgr.subtask_count(SubtaskKind::SurfaceWatch), 0);
}

#[test]
fn resource_signal_runs_hooks_and_dispatches() {
    init_tracing();
    let resources = Arc::new(LoopbackResources::default());
    let platform = Platform::new().with_resources(resources.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();
    let dispatched = counting_block(&mgr, EventKind::Resource);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let callback = ResourceCallback::new(move |parent, index, ctx| {
        assert_eq!((parent, index, ctx), (ResourceHandle(7), 2, &b"nic"[..]));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    mgr.hook_resource_event(ResourceHandle(7), 2, callback.clone(), b"nic".to_vec())
        .unwrap();
    assert!(wait_until(WAIT, || resources.is_registered(ResourceHandle(7), 2)));

    assert!(resources.signal(ResourceHandle(7), 2));
    assert!(wait_until(WAIT, || dispatched.load(Ordering::SeqCst) == 1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    mgr.unhook_resource_event(ResourceHandle(7), 2, &callback, b"nic").unwrap();
    assert_eq!(mgr.subtask_count(SubtaskKind::Resource), 0);
    assert!(!resources.is_registered(ResourceHandle(7), 2));
    mgr.unhook_resource_event(ResourceHandle(7), 2, &callback, b"nic").unwrap();
}

#[test]
fn companion_messages_become_events() {
    init_tracing();
    let companion = Arc::new(LoopbackCompanion::new(DeviceId(1)));
    let platform = Platform::new().with_companion(companion.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();
    let dispatched = counting_block(&mgr, EventKind::Companion);

    mgr.start_test().unwrap();
    assert!(wait_until(WAIT, || companion.is_open()));
    assert_eq!(mgr.subtask_count(SubtaskKind::Companion), 1);

    for code in 0..3 {
        assert!(companion.post(CompanionMessage {
            code,
            payload: vec![1, 2, 3],
        }));
    }
    assert!(wait_until(WAIT, || dispatched.load(Ordering::SeqCst) == 3));

    mgr.end_test().unwrap();
    assert!(!companion.is_open());
}

#[test]
fn error_log_entries_reach_hooks_and_triggers() {
    init_tracing();
    let log = Arc::new(LoopbackErrorLog::default());
    let platform = Platform::new().with_error_log(log.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();
    let dispatched = counting_block(&mgr, EventKind::ErrorLogged);

    mgr.start_test().unwrap();
    assert!(wait_until(WAIT, || log.is_subscribed()));

    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&codes);
    let callback = ErrorLogCallback::new(move |entry, _| {
        sink.lock().unwrap().push(entry.code);
        Ok(())
    });
    mgr.hook_error_log_event(callback.clone(), Vec::new()).unwrap();

    assert!(log.log(0x41, "ecc corrected"));
    assert!(wait_until(WAIT, || dispatched.load(Ordering::SeqCst) == 1));
    assert_eq!(*codes.lock().unwrap(), vec![0x41]);

    // The log keeps feeding triggers after the last hook goes.
    mgr.unhook_error_log_event(&callback, b"").unwrap();
    assert!(log.is_subscribed());
    assert!(log.log(0x42, "link retrain"));
    assert!(wait_until(WAIT, || dispatched.load(Ordering::SeqCst) == 2));
    assert_eq!(codes.lock().unwrap().len(), 1);

    mgr.end_test().unwrap();
    assert!(!log.is_subscribed());
}

#[test]
fn failing_callback_aborts_the_test() {
    init_tracing();
    let mgr = EventManager::new(EngineConfig::default(), Platform::new()).unwrap();
    mgr.start_test().unwrap();
    let callback = TimerCallback::new(|_, _| Err(EngineError::action_failed("watchdog", "deadline missed")));
    mgr.hook_timer_event(Instant::now(), callback, Vec::new()).unwrap();

    assert!(wait_until(WAIT, || mgr.status() == TestStatus::Aborted));
    assert!(wait_until(WAIT, || mgr.subtask_count(SubtaskKind::Timer) == 0));
    let sticky = mgr.sticky_error().unwrap();
    assert!(matches!(sticky, EngineError::Subtask(SubtaskError::Fatal { .. })));

    // Nothing more is accepted or dispatched.
    assert!(mgr
        .hook_timer_event(Instant::now(), TimerCallback::new(|_, _| Ok(())), Vec::new())
        .is_err());
    mgr.handle_event(&Event::test_started()).unwrap();

    let result = mgr.end_test().unwrap_err();
    assert!(result.is_subtask());
    assert_eq!(mgr.status(), TestStatus::Aborted);
}

#[test]
fn panicking_callback_aborts_the_test() {
    init_tracing();
    let mgr = EventManager::new(EngineConfig::default(), Platform::new()).unwrap();
    mgr.start_test().unwrap();
    let callback = TimerCallback::new(|_, _| panic!("watchdog state corrupted"));
    mgr.hook_timer_event(Instant::now(), callback, Vec::new()).unwrap();

    assert!(wait_until(WAIT, || mgr.status() == TestStatus::Aborted));
    assert!(wait_until(WAIT, || mgr.subtask_count(SubtaskKind::Timer) == 0));
    let sticky = mgr.sticky_error().unwrap();
    assert!(matches!(
        sticky.root_cause(),
        EngineError::Subtask(SubtaskError::Panicked { .. })
    ));

    let result = mgr.end_test().unwrap_err();
    assert!(result.is_subtask());
}

#[test]
fn blocks_run_one_at_a_time_across_subtask_threads() {
    const PER_SOURCE: u32 = 25;

    init_tracing();
    let companion = Arc::new(LoopbackCompanion::new(DeviceId(3)));
    let log = Arc::new(LoopbackErrorLog::default());
    let platform = Platform::new().with_companion(companion.clone()).with_error_log(log.clone());
    let mgr = EventManager::new(EngineConfig::default(), platform).unwrap();

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
                    thread::sleep(Duration::from_micros(200));
                    runs.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    Ok(())
                }))
                .build(),
        )
        .unwrap()
    };
    mgr.add_trigger(Arc::new(EventTrigger::on(EventKind::Companion)), block).unwrap();
    mgr.add_trigger(Arc::new(EventTrigger::on(EventKind::ErrorLogged)), block).unwrap();

    mgr.start_test().unwrap();
    assert!(wait_until(WAIT, || companion.is_open() && log.is_subscribed()));

    let posters = [
        {
            let companion = Arc::clone(&companion);
            thread::spawn(move || {
                (0..PER_SOURCE).all(|code| {
                    companion.post(CompanionMessage {
                        code,
                        payload: Vec::new(),
                    })
                })
            })
        },
        {
            let log = Arc::clone(&log);
            thread::spawn(move || (0..PER_SOURCE).all(|code| log.log(code, "corrected")))
        },
    ];
    for poster in posters {
        assert!(poster.join().unwrap());
    }

    let expected = 2 * PER_SOURCE as usize;
    assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) == expected));
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    mgr.end_test().unwrap();
}
