//! `simulate` / `check_results` / `fetch_results` handshake on a real worker pool.

use std::thread;
use std::time::{Duration, Instant};

use engine_scene::{FetchStatus, TickPhase};
use engine_shared::physics::StepErrorFlags;
use engine_tests::{init_tracing, pooled_scheduler, substeps, synthetic, GatedPhysics};

#[test]
fn fetch_never_returns_before_the_graph_finished() -> anyhow::Result<()> {
    init_tracing();
    let (scheduler, world) = pooled_scheduler(synthetic(1), 3)?;

    let mut expected = 0;
    for i in 0..20u32 {
        let n = i % 4 + 1;
        scheduler.simulate(substeps(n), true)?;
        let status = scheduler.fetch_results(true);
        assert_eq!(
            status,
            FetchStatus::Retired {
                errors: StepErrorFlags::empty()
            }
        );
        expected += u64::from(n);
        assert_eq!(world.read().steps_taken(), expected, "tick {i}");
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }
    assert_eq!(scheduler.tick_count(), 20);
    Ok(())
}

#[test]
fn check_results_does_not_disturb_a_running_tick() -> anyhow::Result<()> {
    init_tracing();
    let (backend, gate) = GatedPhysics::new(synthetic(1));
    let (scheduler, world) = pooled_scheduler(backend, 2)?;

    scheduler.simulate(substeps(3), true)?;
    for _ in 0..50 {
        assert!(!scheduler.check_results(false));
        assert_eq!(scheduler.fetch_results(false), FetchStatus::NotReady);
    }
    assert!(scheduler.get_stats().is_none());
    assert_ne!(scheduler.phase(), TickPhase::Idle);

    gate.set();
    assert!(scheduler.check_results(true));
    for _ in 0..10 {
        assert!(scheduler.check_results(false));
    }
    assert_eq!(scheduler.phase(), TickPhase::FetchReady);
    assert!(scheduler.get_stats().is_none());

    assert!(scheduler.fetch_results(true).success());
    assert_eq!(world.read().steps_taken(), 3);
    assert!(scheduler.check_results(false));
    assert!(scheduler.get_stats().is_some());
    Ok(())
}

#[test]
fn non_blocking_fetch_returns_while_another_caller_blocks() -> anyhow::Result<()> {
    init_tracing();
    let (backend, gate) = GatedPhysics::new(synthetic(1));
    let (scheduler, world) = pooled_scheduler(backend, 2)?;
    scheduler.simulate(substeps(2), true)?;

    let (polled, waited, retired) = thread::scope(|s| {
        let blocking = s.spawn(|| scheduler.fetch_results(true));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let polled: Vec<FetchStatus> = (0..20).map(|_| scheduler.fetch_results(false)).collect();
        let waited = started.elapsed();

        thread::sleep(Duration::from_millis(300));
        gate.set();
        (polled, waited, blocking.join().expect("blocking fetch thread"))
    });

    assert!(polled.iter().all(|s| *s == FetchStatus::NotReady), "{polled:?}");
    assert!(waited < Duration::from_millis(200), "non-blocking fetch waited {waited:?}");
    assert_eq!(
        retired,
        FetchStatus::Retired {
            errors: StepErrorFlags::empty()
        }
    );
    assert_eq!(world.read().steps_taken(), 2);
    assert_eq!(scheduler.fetch_results(false), FetchStatus::NoTick);
    Ok(())
}

#[test]
fn fetch_with_nothing_in_flight_is_a_no_op() -> anyhow::Result<()> {
    let (scheduler, _world) = pooled_scheduler(synthetic(1), 1)?;
    assert_eq!(scheduler.fetch_results(true), FetchStatus::NoTick);
    assert!(scheduler.fetch_results(false).success());
    assert!(scheduler.get_stats().is_none());
    Ok(())
}

#[test]
fn caller_queries_share_the_world_lock() -> anyhow::Result<()> {
    let (scheduler, world) = pooled_scheduler(synthetic(1), 2)?;
    scheduler.simulate(substeps(2), true)?;

    // Recursive reads on one thread are fine while workers contend for the write lock.
    {
        let outer = world.read();
        let inner = world.read();
        assert_eq!(outer.steps_taken(), inner.steps_taken());
    }
    scheduler.fetch_results(true);

    let handle = scheduler.world().expect("world attached");
    assert_eq!(handle.read().steps_taken(), 2);
    Ok(())
}
