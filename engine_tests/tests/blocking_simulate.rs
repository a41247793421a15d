//! A second `simulate` before the first tick retired blocks until it has.

use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_scene::FetchStatus;
use engine_tests::{init_tracing, pooled_scheduler, substeps, synthetic};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_simulate_waits_for_retire() -> anyhow::Result<()> {
    init_tracing();
    let (scheduler, world) = pooled_scheduler(synthetic(1), 2)?;
    let dt = substeps(2);
    scheduler.simulate(dt, true)?;

    let fetcher = Arc::clone(&scheduler);
    let retire = tokio::task::spawn_blocking(move || {
        std::thread::sleep(Duration::from_millis(150));
        let fetch_started = Instant::now();
        (fetch_started, fetcher.fetch_results(true))
    });

    let second = Arc::clone(&scheduler);
    let started = Instant::now();
    let returned_at = tokio::task::spawn_blocking(move || -> anyhow::Result<Instant> {
        second.simulate(dt, true)?;
        Ok(Instant::now())
    })
    .await??;

    let (fetch_started, status) = retire.await?;
    assert!(matches!(status, FetchStatus::Retired { .. }));
    assert!(returned_at >= fetch_started);
    assert!(returned_at.duration_since(started) >= Duration::from_millis(100));

    assert!(scheduler.fetch_results(true).success());
    assert_eq!(scheduler.tick_count(), 2);
    assert_eq!(world.read().steps_taken(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_hosts_serialize_whole_ticks() -> anyhow::Result<()> {
    init_tracing();
    let (scheduler, world) = pooled_scheduler(synthetic(1), 2)?;

    let mut hosts = Vec::new();
    for _ in 0..4 {
        let scheduler = Arc::clone(&scheduler);
        hosts.push(tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for _ in 0..10 {
                scheduler.simulate(1.0 / 60.0, true)?;
                scheduler.fetch_results(true);
            }
            Ok(())
        }));
    }
    for host in hosts {
        host.await??;
    }

    // A host may retire a tick another host started and then see `NoTick` itself.
    scheduler.fetch_results(true);
    assert_eq!(scheduler.tick_count(), 40);
    assert_eq!(world.read().steps_taken(), 40);
    Ok(())
}
