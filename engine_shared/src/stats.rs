//! Per-tick scene statistics.
//!
//! Each retired tick produces a complete [`StatsSnapshot`]; the previous one is replaced
//! wholesale, never patched in place.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::physics::BackendCounts;

/// Fixed set of stats a scene reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatId {
    ActorCount,
    ShapeCount,
    AwakeShapeCount,
    ShapePairCount,
    SubstepCount,
    /// Tick start until the task graph signalled ready, in ms.
    SimulateTime,
    /// Graph ready until the caller entered `fetch_results`, in ms.
    UserDelayedFetchTime,
    /// `fetch_results` entry until backend results were pulled, in ms.
    FetchResultTime,
    /// Backend results pulled until retire finished, in ms.
    PostTickTime,
    /// Mpairs per second over the simulate phase; zero when no substep ran.
    Throughput,
    ResourceConsumed,
    TotalElapsedMs,
}

impl StatId {
    pub const ALL: [StatId; 12] = [
        StatId::ActorCount,
        StatId::ShapeCount,
        StatId::AwakeShapeCount,
        StatId::ShapePairCount,
        StatId::SubstepCount,
        StatId::SimulateTime,
        StatId::UserDelayedFetchTime,
        StatId::FetchResultTime,
        StatId::PostTickTime,
        StatId::Throughput,
        StatId::ResourceConsumed,
        StatId::TotalElapsedMs,
    ];

    /// Whether the stat carries an integer or a float.
    pub fn is_int(self) -> bool {
        matches!(
            self,
            StatId::ActorCount
                | StatId::ShapeCount
                | StatId::AwakeShapeCount
                | StatId::ShapePairCount
                | StatId::SubstepCount
                | StatId::TotalElapsedMs
        )
    }

    fn zero(self) -> StatValue {
        if self.is_int() {
            StatValue::Int(0)
        } else {
            StatValue::Float(0.0)
        }
    }
}

/// A stat value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StatValue {
    Int(i64),
    Float(f32),
}

impl StatValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(v) => Some(*v),
            StatValue::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            StatValue::Float(v) => Some(*v),
            StatValue::Int(_) => None,
        }
    }
}

/// Stats of one retired tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tick: u64,
    pub captured_at: DateTime<Utc>,
    /// False when the tick ran no backend step.
    pub step_was_valid: bool,
    pub values: BTreeMap<StatId, StatValue>,
}

impl StatsSnapshot {
    pub fn get(&self, id: StatId) -> StatValue {
        self.values.get(&id).copied().unwrap_or_else(|| id.zero())
    }

    pub fn int(&self, id: StatId) -> i64 {
        self.get(id).as_int().unwrap_or(0)
    }

    pub fn float(&self, id: StatId) -> f32 {
        self.get(id).as_float().unwrap_or(0.0)
    }
}

/// Clock samples of one tick, taken by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct TickTimings {
    pub tick_start: Instant,
    /// When the terminal graph node ran. `None` if it never did.
    pub ready_at: Option<Instant>,
    pub fetch_entered: Instant,
    pub results_pulled: Instant,
    pub retired: Instant,
}

/// Everything the aggregator needs to build a snapshot.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub counts: BackendCounts,
    pub substeps: u32,
    pub step_was_valid: bool,
    pub timings: TickTimings,
    pub resource_consumed: f32,
    pub total_elapsed_ms: u64,
    /// Contributions from module scenes, summed into matching stats.
    pub module_stats: Vec<(StatId, StatValue)>,
}

fn millis(from: Instant, to: Instant) -> f32 {
    to.saturating_duration_since(from).as_secs_f32() * 1000.0
}

/// Builds and holds the latest [`StatsSnapshot`].
#[derive(Debug, Default)]
pub struct StatsAggregator {
    latest: Option<StatsSnapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last published snapshot, if any tick has retired yet.
    pub fn latest(&self) -> Option<&StatsSnapshot> {
        self.latest.as_ref()
    }

    /// Builds a snapshot from one tick and replaces the previous one.
    pub fn publish(&mut self, report: &TickReport) -> &StatsSnapshot {
        let t = &report.timings;
        let ready = t.ready_at.unwrap_or(t.fetch_entered);
        let simulate_ms = millis(t.tick_start, ready);

        let mut values = BTreeMap::new();
        let mut put = |id: StatId, v: StatValue| {
            values.insert(id, v);
        };
        put(StatId::ActorCount, StatValue::Int(i64::from(report.counts.actors)));
        put(StatId::ShapeCount, StatValue::Int(i64::from(report.counts.shapes)));
        put(
            StatId::AwakeShapeCount,
            StatValue::Int(i64::from(report.counts.awake_shapes)),
        );
        put(
            StatId::ShapePairCount,
            StatValue::Int(i64::from(report.counts.shape_pairs)),
        );
        put(StatId::SubstepCount, StatValue::Int(i64::from(report.substeps)));
        put(StatId::SimulateTime, StatValue::Float(simulate_ms));
        put(
            StatId::UserDelayedFetchTime,
            StatValue::Float(t.ready_at.map_or(0.0, |r| millis(r, t.fetch_entered))),
        );
        put(
            StatId::FetchResultTime,
            StatValue::Float(millis(t.fetch_entered, t.results_pulled)),
        );
        put(
            StatId::PostTickTime,
            StatValue::Float(millis(t.results_pulled, t.retired)),
        );
        put(
            StatId::Throughput,
            StatValue::Float(throughput(report.counts.shape_pairs, report.substeps, simulate_ms)),
        );
        put(
            StatId::ResourceConsumed,
            StatValue::Float(report.resource_consumed),
        );
        put(
            StatId::TotalElapsedMs,
            StatValue::Int(i64::try_from(report.total_elapsed_ms).unwrap_or(i64::MAX)),
        );

        for (id, contribution) in &report.module_stats {
            let Some(current) = values.get_mut(id) else {
                continue;
            };
            match (current, contribution) {
                (StatValue::Int(a), StatValue::Int(b)) => *a = a.saturating_add(*b),
                (StatValue::Float(a), StatValue::Float(b)) => *a += *b,
                _ => {
                    debug_assert!(false, "module stat {id:?} has the wrong value type");
                    warn!(stat = ?id, "Ignoring module stat with mismatched type");
                }
            }
        }

        self.latest.insert(StatsSnapshot {
            tick: report.tick,
            captured_at: Utc::now(),
            step_was_valid: report.step_was_valid,
            values,
        })
    }
}

fn throughput(pairs: u32, substeps: u32, simulate_ms: f32) -> f32 {
    if substeps == 0 || simulate_ms <= 0.0 {
        return 0.0;
    }
    pairs as f32 / (simulate_ms / 1000.0) / 1_000_000.0
}
