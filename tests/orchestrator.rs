//! End-to-end tests that fork real worker processes.
//!
//! Every test uses its own token directory, so each orchestrator gets its
//! own segment and only waits on its own workers.

use forkfut::{
    ErrorCode, ForkFutError, MemorySize, Orchestrator, OrchestratorConfig, Promise, Resolution,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);

fn setup() -> (Orchestrator, TempDir) {
    setup_with(|config| config)
}

fn setup_with(
    customize: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig,
) -> (Orchestrator, TempDir) {
    let dir = tempdir().unwrap();
    let config = OrchestratorConfig::new()
        .with_segment_size(MemorySize::from_kib(256))
        .with_slot_capacity(16)
        .with_token_dir(dir.path())
        .with_poll_interval(Duration::from_micros(500));
    let orchestrator = Orchestrator::new(customize(config)).unwrap();
    (orchestrator, dir)
}

fn resolved<T: serde::de::DeserializeOwned>(promise: &mut Promise<T>) -> &Resolution<T> {
    assert!(
        promise.resolve_timeout(RESOLVE_TIMEOUT),
        "promise {} did not resolve",
        promise.key()
    );
    promise.resolution()
}

#[test]
fn test_value_task() {
    let (mut orchestrator, _dir) = setup();

    let mut answer = orchestrator.run(|| Ok::<_, String>(42)).unwrap();
    assert_eq!(resolved(&mut answer), &Resolution::Value(42));
    assert_eq!(answer.value(), Some(&42));
    assert!(!answer.is_void());
    assert!(!answer.is_error());

    drop(answer);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_results_arrive_in_completion_order() {
    let (mut orchestrator, _dir) = setup();

    let mut pending: Vec<(u64, Promise<u64>)> = (0..5u64)
        .map(|index| {
            let nap = Duration::from_millis((5 - index) * 150);
            let promise = orchestrator
                .run(move || {
                    std::thread::sleep(nap);
                    Ok::<_, String>(index)
                })
                .unwrap();
            (index, promise)
        })
        .collect();

    let deadline = Instant::now() + RESOLVE_TIMEOUT;
    let mut order = Vec::new();
    while !pending.is_empty() {
        assert!(Instant::now() < deadline, "tasks did not finish");
        let mut i = 0;
        while i < pending.len() {
            if pending[i].1.is_resolved() {
                let (index, promise) = pending.swap_remove(i);
                assert_eq!(promise.value(), Some(&index));
                order.push(index);
            } else {
                i += 1;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(order, vec![4, 3, 2, 1, 0]);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_failing_task() {
    let (mut orchestrator, _dir) = setup();

    let mut failed = orchestrator
        .run(|| Err::<i32, _>("input rejected"))
        .unwrap();
    assert_eq!(
        resolved(&mut failed),
        &Resolution::Error(ErrorCode::TaskFailed)
    );
    assert!(failed.is_error());
    assert_eq!(failed.value(), None);

    drop(failed);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_panicking_task() {
    let (mut orchestrator, _dir) = setup();

    let mut panicked = orchestrator
        .run(|| -> Result<i32, String> { panic!("worker gave up") })
        .unwrap();
    assert_eq!(
        resolved(&mut panicked),
        &Resolution::Error(ErrorCode::TaskPanicked)
    );

    drop(panicked);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_void_task() {
    let (mut orchestrator, _dir) = setup();

    let mut unit = orchestrator.run(|| Ok::<_, String>(())).unwrap();
    let mut none = orchestrator.run(|| Ok::<Option<i32>, String>(None)).unwrap();

    assert_eq!(resolved(&mut unit), &Resolution::Void);
    assert!(unit.is_void());
    assert_eq!(resolved(&mut none), &Resolution::Void);
    assert!(!none.is_error());

    drop((unit, none));
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_child_count_and_reap() {
    let (mut orchestrator, _dir) = setup();

    let promises: Vec<Promise<u32>> = (0..3)
        .map(|index| {
            orchestrator
                .run(move || {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok::<_, String>(index)
                })
                .unwrap()
        })
        .collect();

    orchestrator.reap();
    assert_eq!(orchestrator.child_count(), 3);

    let deadline = Instant::now() + RESOLVE_TIMEOUT;
    while orchestrator.child_count() > 0 {
        assert!(Instant::now() < deadline, "workers were never reaped");
        orchestrator.reap();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(orchestrator.child_count(), 0);

    for (index, mut promise) in promises.into_iter().enumerate() {
        assert_eq!(resolved(&mut promise), &Resolution::Value(index as u32));
    }
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_structured_value() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        name: String,
        samples: Vec<f64>,
        passed: bool,
    }

    let expected = Report {
        name: "throughput".to_string(),
        samples: vec![1.5, 2.25, 3.0],
        passed: true,
    };
    let (mut orchestrator, _dir) = setup();

    let sent = expected.clone();
    let mut report = orchestrator.run(move || Ok::<_, String>(sent)).unwrap();
    assert!(report.resolve_timeout(RESOLVE_TIMEOUT));
    assert_eq!(report.into_value(), Some(expected));

    orchestrator.shutdown().unwrap();
}

#[test]
fn test_dead_worker_resolves_after_reap() {
    let (mut orchestrator, _dir) = setup();

    let mut lost = orchestrator
        .run(|| -> Result<i32, String> { std::process::abort() })
        .unwrap();

    orchestrator.wait_for_children();
    assert_eq!(orchestrator.child_count(), 0);
    assert_eq!(
        resolved(&mut lost),
        &Resolution::Error(ErrorCode::WorkerDied)
    );

    drop(lost);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_oversized_value_is_segment_full() {
    let (mut orchestrator, _dir) = setup_with(|config| {
        config
            .with_segment_size(MemorySize::from_kib(64))
            .with_slot_capacity(8)
    });

    let mut big = orchestrator
        .run(|| Ok::<_, String>(vec![7u32; 100_000]))
        .unwrap();
    assert_eq!(
        resolved(&mut big),
        &Resolution::Error(ErrorCode::SegmentFull)
    );

    // The segment stays usable for smaller results.
    let mut small = orchestrator.run(|| Ok::<_, String>(vec![7u32; 10])).unwrap();
    assert_eq!(resolved(&mut small), &Resolution::Value(vec![7u32; 10]));

    drop((big, small));
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_exhausted_slots() {
    let (mut orchestrator, _dir) = setup_with(|config| config.with_slot_capacity(2));

    let first = orchestrator.run(|| Ok::<_, String>(1)).unwrap();
    let mut second = orchestrator.run(|| Ok::<_, String>(2)).unwrap();

    let err = orchestrator.run(|| Ok::<_, String>(3)).unwrap_err();
    assert!(matches!(
        err,
        ForkFutError::ResultSlotsExhausted { capacity: 2 }
    ));
    assert_eq!(orchestrator.child_count(), 2);

    // Releasing a promise frees its slot for the next task.
    drop(first);
    let mut third = orchestrator.run(|| Ok::<_, String>(3)).unwrap();
    assert_eq!(resolved(&mut second), &Resolution::Value(2));
    assert_eq!(resolved(&mut third), &Resolution::Value(3));

    drop((second, third));
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_keys_are_distinct() {
    let (mut orchestrator, _dir) = setup();

    let promises: Vec<Promise<i32>> = (0..8)
        .map(|_| orchestrator.run(|| Ok::<_, String>(0)).unwrap())
        .collect();
    let keys: HashSet<_> = promises.iter().map(Promise::key).collect();
    assert_eq!(keys.len(), promises.len());

    drop(promises);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_keys_reused_only_after_release() {
    let (mut orchestrator, _dir) = setup_with(|config| config.with_slot_capacity(3).with_key_bound(3));

    let mut held: Vec<Promise<i32>> = (0..3)
        .map(|_| orchestrator.run(|| Ok::<_, String>(0)).unwrap())
        .collect();
    let released = held.remove(1);
    let released_key = released.key();
    drop(released);

    let reused = orchestrator.run(|| Ok::<_, String>(0)).unwrap();
    assert_eq!(reused.key(), released_key);

    drop((held, reused));
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_segment_too_small() {
    let (mut orchestrator, _dir) = setup_with(|config| {
        config
            .with_segment_size(MemorySize::from_bytes(1024))
            .with_slot_capacity(16)
    });

    let err = orchestrator.run(|| Ok::<_, String>(1)).unwrap_err();
    assert!(matches!(err, ForkFutError::SegmentTooSmall { .. }));
    assert_eq!(orchestrator.child_count(), 0);
    assert!(orchestrator.segment_stats().is_none());
}

#[test]
fn test_remove_segment_waits_for_children() {
    let (mut orchestrator, dir) = setup();

    let _slow = orchestrator
        .run(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<_, String>(1)
        })
        .unwrap();

    let err = orchestrator.remove_segment().unwrap_err();
    assert!(matches!(err, ForkFutError::ChildrenStillRunning(1)));

    orchestrator.wait_for_children();
    orchestrator.remove_segment().unwrap();

    // The transient token file goes with the segment.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_orphaned_promise_after_removal() {
    let (mut orchestrator, _dir) = setup();

    let mut orphan = orchestrator.run(|| Ok::<_, String>(5)).unwrap();
    orchestrator.wait_for_children();
    orchestrator.remove_segment().unwrap();

    assert_eq!(
        resolved(&mut orphan),
        &Resolution::Error(ErrorCode::SegmentRemoved)
    );

    let err = orchestrator.run(|| Ok::<_, String>(6)).unwrap_err();
    assert!(matches!(err, ForkFutError::SegmentRemoved));
}

#[test]
fn test_segment_stats() {
    let (mut orchestrator, _dir) = setup();
    assert!(orchestrator.segment_stats().is_none());

    let mut promises: Vec<Promise<Vec<u8>>> = (0..4)
        .map(|_| orchestrator.run(|| Ok::<_, String>(vec![1u8; 512])).unwrap())
        .collect();
    for promise in &mut promises {
        assert!(promise.resolve_timeout(RESOLVE_TIMEOUT));
    }

    let busy = orchestrator.segment_stats().unwrap();
    assert_eq!(busy.slot_capacity, 16);
    assert_eq!(busy.live_slots, 4);
    assert!(busy.free_bytes < busy.arena_bytes);

    drop(promises);
    let idle = orchestrator.segment_stats().unwrap();
    assert_eq!(idle.live_slots, 0);
    assert_eq!(idle.free_bytes, idle.arena_bytes);

    orchestrator.shutdown().unwrap();
}

#[test]
fn test_drop_cleans_up() {
    let dir = tempdir().unwrap();
    {
        let config = OrchestratorConfig::new()
            .with_segment_size(MemorySize::from_kib(128))
            .with_slot_capacity(4)
            .with_token_dir(dir.path());
        let mut orchestrator = Orchestrator::new(config).unwrap();
        let _pending = orchestrator
            .run(|| {
                std::thread::sleep(Duration::from_millis(100));
                Ok::<_, String>(1)
            })
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_worker_dies_on_sigterm_with_drain_enabled() {
    let (mut orchestrator, _dir) = setup_with(|config| config.with_drain_on_interrupt(true));
    let scratch = tempdir().unwrap();
    let pid_file = scratch.path().join("worker.pid");

    let written = pid_file.clone();
    let mut sleeper = orchestrator
        .run(move || {
            std::fs::write(&written, std::process::id().to_string()).map_err(|e| e.to_string())?;
            std::thread::sleep(Duration::from_secs(30));
            Ok::<_, String>(0)
        })
        .unwrap();

    let started = Instant::now();
    let pid = loop {
        if let Some(pid) = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|text| text.parse::<i32>().ok())
        {
            break pid;
        }
        assert!(started.elapsed() < RESOLVE_TIMEOUT, "worker never started");
        std::thread::sleep(Duration::from_millis(5));
    };

    kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
    let killed_at = Instant::now();
    orchestrator.wait_for_children();

    assert!(killed_at.elapsed() < Duration::from_secs(10));
    assert_eq!(
        resolved(&mut sleeper),
        &Resolution::Error(ErrorCode::WorkerDied)
    );

    drop(sleeper);
    orchestrator.shutdown().unwrap();
}

#[test]
fn test_shared_stable_token_is_exclusive() {
    let dir = tempdir().unwrap();
    let token = dir.path().join("shared.token");
    let config = || {
        OrchestratorConfig::new()
            .with_segment_size(MemorySize::from_kib(128))
            .with_slot_capacity(4)
            .with_token_path(&token)
            .with_poll_interval(Duration::from_micros(500))
    };

    let mut first = Orchestrator::new(config()).unwrap();
    let mut second = Orchestrator::new(config()).unwrap();

    let mut owned = first.run(|| Ok::<_, String>("first".to_string())).unwrap();
    assert!(matches!(
        second.run(|| Ok::<_, String>("second".to_string())),
        Err(ForkFutError::SegmentInUse { .. })
    ));
    assert_eq!(
        resolved(&mut owned),
        &Resolution::Value("first".to_string())
    );

    drop(owned);
    first.shutdown().unwrap();

    let mut later = second.run(|| Ok::<_, String>("second".to_string())).unwrap();
    assert_eq!(
        resolved(&mut later),
        &Resolution::Value("second".to_string())
    );

    drop(later);
    second.shutdown().unwrap();
    assert!(token.exists());
}
