//! Disruption predictors. The rest of the crate only sees
//! [`DisruptionPredictor::predict`]; how a predictor arrives at its events is
//! its own business.

use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::error::FeedError;
use crate::models::disruption::{DisruptionEvent, DisruptionKind};
use crate::models::intersection::IntersectionId;
use crate::shared_data::{MetricReport, Tick};

pub trait DisruptionPredictor: Send {
    /// Events the predictor currently stands behind. Repeating an event
    /// across calls is fine; consumers apply them idempotently.
    fn predict(&mut self, now: Tick) -> Result<Vec<DisruptionEvent>, FeedError>;

    /// Feeds a metric report to predictors that learn from traffic.
    fn observe(&mut self, _report: &MetricReport) {}
}

/// Replays a fixed list of events, with optional outage windows.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPredictor {
    events: Vec<DisruptionEvent>,
    outages: Vec<(Tick, Tick)>,
}

impl ScriptedPredictor {
    pub fn new(events: Vec<DisruptionEvent>) -> Self {
        Self {
            events,
            outages: Vec::new(),
        }
    }

    /// Feed is unreachable during `[from, to)`.
    pub fn with_outage(mut self, from: Tick, to: Tick) -> Self {
        self.outages.push((from, to));
        self
    }
}

impl DisruptionPredictor for ScriptedPredictor {
    fn predict(&mut self, now: Tick) -> Result<Vec<DisruptionEvent>, FeedError> {
        if self.outages.iter().any(|(from, to)| (*from..*to).contains(&now)) {
            return Err(FeedError::Unavailable(format!("scripted outage at tick {now}")));
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.valid_from <= now && now < e.valid_to)
            .cloned()
            .collect())
    }
}

/// Logistic congestion model over the queue state in controller snapshots.
#[derive(Debug, Clone)]
pub struct CongestionPredictor {
    pub intercept: f64,
    pub waiting_coef: f64,
    pub max_wait_coef: f64,
    /// Probability at or above which an event is emitted.
    pub threshold: f64,
    /// Length of each prediction window in ticks.
    pub horizon: Tick,
    latest: HashMap<IntersectionId, (usize, Tick)>,
}

impl Default for CongestionPredictor {
    fn default() -> Self {
        Self {
            intercept: -4.0,
            waiting_coef: 0.35,
            max_wait_coef: 0.05,
            threshold: 0.5,
            horizon: 20,
            latest: HashMap::new(),
        }
    }
}

impl CongestionPredictor {
    pub fn probability(&self, waiting: usize, max_wait: Tick) -> f64 {
        let z = self.intercept
            + self.waiting_coef * waiting as f64
            + self.max_wait_coef * max_wait as f64;
        1.0 / (1.0 + (-z).exp())
    }
}

impl DisruptionPredictor for CongestionPredictor {
    fn predict(&mut self, now: Tick) -> Result<Vec<DisruptionEvent>, FeedError> {
        let horizon = self.horizon.max(1);
        let window_start = now - now % horizon;
        let mut events: Vec<DisruptionEvent> = self
            .latest
            .iter()
            .filter_map(|(id, (waiting, max_wait))| {
                let p = self.probability(*waiting, *max_wait);
                (p >= self.threshold).then(|| DisruptionEvent {
                    kind: DisruptionKind::Congestion,
                    area: vec![id.clone()],
                    severity: p,
                    valid_from: window_start,
                    valid_to: window_start + horizon,
                })
            })
            .collect();
        events.sort_by(|a, b| a.area.cmp(&b.area));
        Ok(events)
    }

    fn observe(&mut self, report: &MetricReport) {
        if let Some(snapshot) = report.snapshot() {
            let max_wait = snapshot.loads.iter().map(|l| l.max_wait).max().unwrap_or(0);
            self.latest.insert(
                snapshot.intersection_id.clone(),
                (snapshot.total_waiting(), max_wait),
            );
        }
    }
}

/// Random lane closures: now and then one intersection gets an incident for
/// `closure_ticks`, followed by a quiet spell of `cooldown_ticks`.
#[derive(Debug, Clone)]
pub struct RandomIncidentPredictor {
    rng: SmallRng,
    intersections: Vec<IntersectionId>,
    probability: f64,
    closure_ticks: Tick,
    cooldown_ticks: Tick,
    next_allowed: Tick,
    current: Option<DisruptionEvent>,
}

impl RandomIncidentPredictor {
    pub fn new(seed: u64, intersections: Vec<IntersectionId>, probability: f64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            intersections,
            probability: probability.clamp(0.0, 1.0),
            closure_ticks: 60,
            cooldown_ticks: 30,
            next_allowed: 0,
            current: None,
        }
    }

    pub fn with_timing(mut self, closure_ticks: Tick, cooldown_ticks: Tick) -> Self {
        self.closure_ticks = closure_ticks.max(1);
        self.cooldown_ticks = cooldown_ticks;
        self
    }
}

impl DisruptionPredictor for RandomIncidentPredictor {
    fn predict(&mut self, now: Tick) -> Result<Vec<DisruptionEvent>, FeedError> {
        if let Some(event) = &self.current {
            if event.is_valid_at(now) {
                return Ok(vec![event.clone()]);
            }
            self.current = None;
        }
        if self.intersections.is_empty()
            || now < self.next_allowed
            || !self.rng.random_bool(self.probability)
        {
            return Ok(Vec::new());
        }
        let target = self.intersections[self.rng.random_range(0..self.intersections.len())].clone();
        let event = DisruptionEvent {
            kind: DisruptionKind::Incident,
            area: vec![target],
            severity: self.rng.random_range(0.3..=1.0),
            valid_from: now,
            valid_to: now + self.closure_ticks,
        };
        self.next_allowed = event.valid_to + self.cooldown_ticks;
        self.current = Some(event.clone());
        Ok(vec![event])
    }
}

/// Runs several predictors as one feed. Fails only when every part fails.
#[derive(Default)]
pub struct CompositePredictor {
    parts: Vec<Box<dyn DisruptionPredictor>>,
}

impl CompositePredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, part: impl DisruptionPredictor + 'static) -> Self {
        self.parts.push(Box::new(part));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl DisruptionPredictor for CompositePredictor {
    fn predict(&mut self, now: Tick) -> Result<Vec<DisruptionEvent>, FeedError> {
        let mut events = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0;
        for part in &mut self.parts {
            match part.predict(now) {
                Ok(mut e) => {
                    succeeded += 1;
                    events.append(&mut e);
                }
                Err(e) => {
                    warn!("Predictor failed at tick {}: {}", now, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(events),
        }
    }

    fn observe(&mut self, report: &MetricReport) {
        for part in &mut self.parts {
            part.observe(report);
        }
    }
}
