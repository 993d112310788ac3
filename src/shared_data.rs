// src/shared_data.rs

use crate::models::intersection::{IntersectionId, SignalState};
use crate::models::vehicle::VehicleId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Simulated time, counted in decision-cycle ticks.
pub type Tick = u64;

/// Maps wall-clock time onto simulated ticks.
///
/// Every agent gets its own copy; the epoch is fixed at startup so all agents
/// agree on the current tick without sharing mutable state.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    epoch: Instant,
    tick_duration: Duration,
}

impl SimClock {
    pub fn start(tick_duration: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            tick_duration,
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Current tick since the epoch.
    pub fn now(&self) -> Tick {
        let elapsed = self.epoch.elapsed().as_micros();
        let per_tick = self.tick_duration.as_micros().max(1);
        (elapsed / per_tick) as Tick
    }

    /// Wall-clock span of `ticks` ticks.
    pub fn span(&self, ticks: Tick) -> Duration {
        self.tick_duration * ticks.min(u32::MAX as u64) as u32
    }
}

/// Unix timestamp in seconds, used for external records.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Waiting demand on one phase of an intersection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseLoad {
    pub phase: String,
    pub waiting: usize,
    pub max_wait: Tick,
}

/// Point-in-time view of one intersection, reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionSnapshot {
    pub intersection_id: IntersectionId,
    pub tick: Tick,
    pub signal: SignalState,
    /// Name of the phase currently holding green, if any.
    pub green_phase: Option<String>,
    pub loads: Vec<PhaseLoad>,
    pub disruption_severity: f64,
    pub preempted: bool,
}

impl IntersectionSnapshot {
    pub fn load_for(&self, phase: &str) -> Option<&PhaseLoad> {
        self.loads.iter().find(|l| l.phase == phase)
    }

    pub fn total_waiting(&self) -> usize {
        self.loads.iter().map(|l| l.waiting).sum()
    }
}

/// Who produced a metric report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    Vehicle { vehicle_id: VehicleId },
    Controller { snapshot: IntersectionSnapshot },
}

/// `METRIC_REPORT` payload. Vehicles send one per departure, controllers one
/// per reporting period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub intersection_id: IntersectionId,
    /// Vehicle: its own wait. Controller: mean wait of departures in the period.
    pub waiting_time: f64,
    pub throughput_count: u64,
    pub source: MetricSource,
}

impl MetricReport {
    pub fn snapshot(&self) -> Option<&IntersectionSnapshot> {
        match &self.source {
            MetricSource::Controller { snapshot } => Some(snapshot),
            MetricSource::Vehicle { .. } => None,
        }
    }
}
