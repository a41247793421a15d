//! Module scene hooks, LOD budget and stat contributions.

use std::sync::Arc;

use engine_shared::stats::{StatId, StatValue};
use engine_tests::{inline_scheduler, substeps, synthetic, HookLog, TraceModule};

#[test]
fn hooks_run_in_registration_order_with_reverse_unlock() -> anyhow::Result<()> {
    let (scheduler, _world) = inline_scheduler(synthetic(1))?;
    let log = HookLog::default();
    scheduler.register_module(Arc::new(TraceModule::new("a", &log)))?;
    scheduler.register_module(Arc::new(TraceModule::new("b", &log)))?;
    assert_eq!(scheduler.module_names(), vec!["a", "b"]);

    scheduler.simulate(substeps(3), true)?;
    scheduler.fetch_results(true);

    let expected = [
        "a:simulate",
        "b:simulate",
        "a:allocate",
        "b:allocate",
        "a:interstep1",
        "b:interstep1",
        "a:interstep2",
        "b:interstep2",
        "a:pre_render_lock",
        "b:pre_render_lock",
        "a:lock",
        "b:lock",
        "a:fetch",
        "b:fetch",
        "b:unlock",
        "a:unlock",
        "a:post_render_unlock",
        "b:post_render_unlock",
    ];
    assert_eq!(*log.lock(), expected);
    Ok(())
}

#[test]
fn unregistered_modules_stop_receiving_hooks() -> anyhow::Result<()> {
    let (scheduler, _world) = inline_scheduler(synthetic(1))?;
    let log = HookLog::default();
    scheduler.register_module(Arc::new(TraceModule::new("a", &log)))?;
    scheduler.register_module(Arc::new(TraceModule::new("b", &log)))?;
    scheduler.unregister_module("a")?;
    assert!(scheduler.unregister_module("a").is_err());

    scheduler.simulate(substeps(1), true)?;
    scheduler.fetch_results(true);
    assert!(log.lock().iter().all(|entry| entry.starts_with("b:")));
    Ok(())
}

#[test]
fn budget_is_shared_by_benefit() -> anyhow::Result<()> {
    let (scheduler, _world) = inline_scheduler(synthetic(1))?;
    let log = HookLog::default();
    scheduler.register_module(Arc::new(TraceModule::new("a", &log).with_benefit(1.0)))?;
    scheduler.register_module(Arc::new(TraceModule::new("b", &log).with_benefit(3.0)))?;
    scheduler.set_resource_budget(40.0);

    scheduler.simulate(substeps(1), true)?;
    scheduler.fetch_results(true);

    // Each module consumes half of what it was given.
    assert!((scheduler.consumed_resource() - 20.0).abs() < 1.0e-4);
    assert!((scheduler.last_benefit_sum() - 4.0).abs() < 1.0e-6);
    let stats = scheduler.get_stats().expect("stats after fetch");
    assert!((stats.float(StatId::ResourceConsumed) - 20.0).abs() < 1.0e-4);
    Ok(())
}

#[test]
fn module_stats_are_summed_into_the_snapshot() -> anyhow::Result<()> {
    let (scheduler, _world) = inline_scheduler(synthetic(1))?;
    let log = HookLog::default();
    scheduler.register_module(Arc::new(
        TraceModule::new("cloth", &log).with_stat(StatId::ShapeCount, StatValue::Int(5)),
    ))?;
    scheduler.register_module(Arc::new(
        TraceModule::new("fluid", &log)
            .with_stat(StatId::ShapeCount, StatValue::Int(2))
            .with_stat(StatId::ShapePairCount, StatValue::Int(4)),
    ))?;

    scheduler.simulate(substeps(1), true)?;
    scheduler.fetch_results(true);

    let stats = scheduler.get_stats().expect("stats after fetch");
    // The synthetic backend has no bodies and one pair per step.
    assert_eq!(stats.int(StatId::ShapeCount), 7);
    assert_eq!(stats.int(StatId::ShapePairCount), 5);
    assert_eq!(stats.int(StatId::SubstepCount), 1);
    Ok(())
}
