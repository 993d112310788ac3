//! Phase scoring and the switch/hold decision for one intersection.
//!
//! Score of a phase = `count_weight * waiting + wait_weight * max_wait
//! + disruption_weight * bias + hint_bonus * hint_strength`.
//! The decision then applies, in order: minimum green, starvation override,
//! maximum green, the adaptive green target, and a hysteresis threshold on
//! score.

use serde::{Deserialize, Serialize};

use crate::models::intersection::PhaseId;
use crate::shared_data::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub count_weight: f64,
    pub wait_weight: f64,
    pub disruption_weight: f64,
    pub hint_bonus: f64,
    /// A challenger must beat the current phase's score by this factor.
    pub switch_threshold: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            count_weight: 1.0,
            wait_weight: 0.2,
            disruption_weight: 4.0,
            hint_bonus: 0.5,
            switch_threshold: 1.25,
        }
    }
}

/// Green target that stretches while queues are long and shrinks when quiet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveGreen {
    pub extend_ticks: Tick,
    pub shrink_ticks: Tick,
    /// More waiting vehicles than this extends the target.
    pub busy_queue: usize,
    /// Fewer waiting vehicles than this shrinks it.
    pub quiet_queue: usize,
}

impl Default for AdaptiveGreen {
    fn default() -> Self {
        Self {
            extend_ticks: 2,
            shrink_ticks: 1,
            busy_queue: 10,
            quiet_queue: 3,
        }
    }
}

impl AdaptiveGreen {
    /// Next target given the vehicles queued at the intersection, kept
    /// within `[min_green, max_green]`.
    pub fn adjust(&self, target: Tick, queued: usize, min_green: Tick, max_green: Tick) -> Tick {
        let next = if queued > self.busy_queue {
            target.saturating_add(self.extend_ticks)
        } else if queued < self.quiet_queue {
            target.saturating_sub(self.shrink_ticks)
        } else {
            target
        };
        next.clamp(min_green, max_green.max(min_green))
    }
}

/// Pending demand on one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseDemand {
    pub waiting: usize,
    pub max_wait: Tick,
    /// Longest wait counted from when the phase was last green.
    pub unserved_wait: Tick,
}

impl PhaseDemand {
    pub fn is_pending(&self) -> bool {
        self.waiting > 0
    }
}

/// Scores every phase. `bias[p]` is the disruption severity favouring `p`,
/// `hint` the advised phase and its strength.
pub fn score_phases(
    weights: &ScoringWeights,
    demand: &[PhaseDemand],
    bias: &[f64],
    hint: Option<(PhaseId, f64)>,
) -> Vec<f64> {
    demand
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let mut score = weights.count_weight * d.waiting as f64
                + weights.wait_weight * d.max_wait as f64
                + weights.disruption_weight * bias.get(i).copied().unwrap_or(0.0);
            if let Some((phase, strength)) = hint {
                if phase.0 == i {
                    score += weights.hint_bonus * strength.clamp(0.0, 1.0);
                }
            }
            score
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// A waiting phase reached the starvation limit.
    Starvation,
    /// The current phase reached its maximum green.
    MaxGreen,
    /// The current phase reached the adaptive green target.
    TargetReached,
    /// A phase out-scored the current one by the switch threshold.
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Switch { to: PhaseId, reason: SwitchReason },
}

/// Everything the decision needs about the current green phase.
#[derive(Debug, Clone, Copy)]
pub struct GreenStatus {
    pub current: PhaseId,
    pub elapsed: Tick,
    pub min_green: Tick,
    pub max_green: Tick,
    /// Adaptive target; ends the phase early when another phase waits.
    pub target: Tick,
}

#[derive(Debug)]
pub struct PhaseScheduler<'a> {
    pub scores: &'a [f64],
    pub demand: &'a [PhaseDemand],
    /// Last tick each phase held green.
    pub last_served: &'a [Tick],
    pub starvation_limit: Tick,
    pub switch_threshold: f64,
}

impl PhaseScheduler<'_> {
    pub fn decide(&self, status: GreenStatus) -> Decision {
        let n = self.scores.len();
        if n < 2 || status.elapsed < status.min_green {
            return Decision::Hold;
        }
        let others = || (0..n).map(PhaseId).filter(move |p| *p != status.current);

        let starving = others()
            .filter(|p| {
                let d = self.demand[p.0];
                d.is_pending() && d.unserved_wait >= self.starvation_limit
            })
            .max_by(|a, b| {
                self.demand[a.0]
                    .unserved_wait
                    .cmp(&self.demand[b.0].unserved_wait)
                    .then_with(|| self.older_first(*a, *b))
            });
        if let Some(to) = starving {
            return Decision::Switch {
                to,
                reason: SwitchReason::Starvation,
            };
        }

        let waiting = others()
            .filter(|p| self.demand[p.0].is_pending())
            .max_by(|a, b| {
                self.older_first(*a, *b)
                    .then_with(|| self.scores[a.0].total_cmp(&self.scores[b.0]))
            });
        if status.elapsed >= status.max_green {
            return Decision::Switch {
                to: waiting.unwrap_or(PhaseId((status.current.0 + 1) % n)),
                reason: SwitchReason::MaxGreen,
            };
        }
        if let Some(to) = waiting.filter(|_| status.elapsed >= status.target) {
            return Decision::Switch {
                to,
                reason: SwitchReason::TargetReached,
            };
        }

        let best = others().max_by(|a, b| {
            self.scores[a.0]
                .total_cmp(&self.scores[b.0])
                .then_with(|| self.older_first(*a, *b))
        });
        match best {
            Some(to)
                if self.scores[to.0] > 0.0
                    && self.scores[to.0] > self.scores[status.current.0] * self.switch_threshold =>
            {
                Decision::Switch {
                    to,
                    reason: SwitchReason::Score,
                }
            }
            _ => Decision::Hold,
        }
    }

    /// Orders so that the less recently served phase compares greater; on a
    /// tie the lower index wins.
    fn older_first(&self, a: PhaseId, b: PhaseId) -> std::cmp::Ordering {
        self.last_served[b.0]
            .cmp(&self.last_served[a.0])
            .then_with(|| b.0.cmp(&a.0))
    }
}
