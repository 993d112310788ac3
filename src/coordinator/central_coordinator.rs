//! Corridor-level coordination. Reads controller snapshots on a slow cadence
//! and hands out advisory hints; it never touches a signal directly.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::channel::{Address, Mailbox, MessageBus};
use crate::communication::messages::{CorridorHint, DisruptionUpdate, Envelope, Payload};
use crate::error::CoordinationError;
use crate::global_variables::ADDR_COORDINATOR;
use crate::models::disruption::DisruptionLedger;
use crate::models::intersection::IntersectionId;
use crate::shared_data::{IntersectionSnapshot, SimClock, Tick};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorridorMember {
    pub intersection: IntersectionId,
    /// Phase that carries corridor traffic at this intersection.
    pub phase: String,
}

/// Ordered chain of intersections sharing one through movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corridor {
    pub name: String,
    pub members: Vec<CorridorMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub period_ticks: Tick,
    pub hint_ttl_ticks: Tick,
    /// Snapshots older than this make the corridor's state stale.
    pub max_snapshot_age: Tick,
    /// Corridor demand must exceed cross demand by this factor.
    pub dominance_ratio: f64,
    /// Severity at which a member stops receiving hints.
    pub disruption_threshold: f64,
    /// Strength added to neighbours of a disrupted member.
    pub neighbour_boost: f64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            period_ticks: 10,
            hint_ttl_ticks: 10,
            max_snapshot_age: 20,
            dominance_ratio: 1.5,
            disruption_threshold: 0.5,
            neighbour_boost: 0.25,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Aggregation {
    pub hints: Vec<CorridorHint>,
    /// Corridors left out this window, with the reason.
    pub skipped: Vec<CoordinationError>,
}

/// Computes this window's hints from the latest snapshots. Deterministic for
/// a given input; when corridors disagree on an intersection the stronger
/// hint wins, then the corridor listed first.
pub fn aggregate(
    snapshots: &HashMap<IntersectionId, IntersectionSnapshot>,
    corridors: &[Corridor],
    disruptions: &DisruptionLedger,
    settings: &CoordinatorSettings,
    now: Tick,
) -> Aggregation {
    let mut aggregation = Aggregation::default();
    let mut chosen: Vec<CorridorHint> = Vec::new();

    'corridors: for corridor in corridors {
        let mut members = Vec::with_capacity(corridor.members.len());
        for member in &corridor.members {
            match snapshots.get(&member.intersection) {
                Some(s) if now.saturating_sub(s.tick) <= settings.max_snapshot_age => {
                    members.push((member, s))
                }
                other => {
                    aggregation.skipped.push(CoordinationError::StaleState {
                        corridor: corridor.name.clone(),
                        intersection: member.intersection.clone(),
                        snapshot_tick: other.map(|s| s.tick).unwrap_or(0),
                        now,
                    });
                    continue 'corridors;
                }
            }
        }

        let along: usize = members
            .iter()
            .map(|(m, s)| s.load_for(&m.phase).map(|l| l.waiting).unwrap_or(0))
            .sum();
        let across: usize = members.iter().map(|(_, s)| s.total_waiting()).sum::<usize>() - along;
        if along == 0 || (along as f64) <= settings.dominance_ratio * across as f64 {
            debug!(
                "Corridor {}: no dominant flow ({} along, {} across)",
                corridor.name, along, across
            );
            continue;
        }
        let base = along as f64 / (along + across) as f64;

        let disrupted: Vec<bool> = members
            .iter()
            .map(|(m, s)| {
                s.disruption_severity
                    .max(disruptions.max_severity(&m.intersection, now))
                    >= settings.disruption_threshold
            })
            .collect();

        for (i, (member, snapshot)) in members.iter().enumerate() {
            if disrupted[i] || snapshot.preempted {
                continue;
            }
            let next_to_disruption = (i > 0 && disrupted[i - 1])
                || disrupted.get(i + 1).copied().unwrap_or(false);
            let strength = if next_to_disruption {
                (base + settings.neighbour_boost).min(1.0)
            } else {
                base
            };
            let hint = CorridorHint {
                corridor: corridor.name.clone(),
                intersection_id: member.intersection.clone(),
                favor_phase: member.phase.clone(),
                strength,
                issued_at: now,
                valid_until: now + settings.hint_ttl_ticks,
            };
            match chosen
                .iter_mut()
                .find(|h| h.intersection_id == hint.intersection_id)
            {
                Some(existing) if hint.strength > existing.strength => *existing = hint,
                Some(_) => {}
                None => chosen.push(hint),
            }
        }
    }

    aggregation.hints = chosen;
    aggregation
}

/// Latest inputs the coordinator aggregates over.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    pub snapshots: HashMap<IntersectionId, IntersectionSnapshot>,
    pub disruptions: DisruptionLedger,
}

impl CoordinatorState {
    pub fn absorb(&mut self, payload: Payload) {
        match payload {
            Payload::MetricReport(report) => {
                if let Some(snapshot) = report.snapshot() {
                    let newer = self
                        .snapshots
                        .get(&snapshot.intersection_id)
                        .map(|s| s.tick <= snapshot.tick)
                        .unwrap_or(true);
                    if newer {
                        self.snapshots
                            .insert(snapshot.intersection_id.clone(), snapshot.clone());
                    }
                }
            }
            Payload::DisruptionEvent(DisruptionUpdate::Event { event }) => {
                if let Err(e) = self.disruptions.apply(event) {
                    warn!("Coordinator rejected disruption: {}", e);
                }
            }
            Payload::DisruptionEvent(DisruptionUpdate::FeedUnavailable { .. }) => {
                self.disruptions.clear();
            }
            other => warn!("Coordinator ignored {}", other.message_type()),
        }
    }
}

/// Checks that the previous aggregation ran within two periods.
pub fn check_window(last: Option<Tick>, now: Tick, period: Tick) -> Result<(), CoordinationError> {
    match last {
        Some(last) if now.saturating_sub(last) > period.max(1) * 2 => {
            Err(CoordinationError::MissedWindow { last, now })
        }
        _ => Ok(()),
    }
}

/// Runs the coordinator as an agent. Snapshots and disruption updates come in
/// on `mailbox`; hints go out to controllers directly.
pub async fn run_coordinator(
    corridors: Vec<Corridor>,
    settings: CoordinatorSettings,
    mut mailbox: Mailbox,
    bus: MessageBus,
    clock: SimClock,
) {
    let me = Address::new(ADDR_COORDINATOR);
    let mut state = CoordinatorState::default();
    let mut ticker = interval(clock.span(settings.period_ticks.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_run: Option<Tick> = None;

    loop {
        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                state.absorb(envelope.payload);
            }
            _ = ticker.tick() => {
                let now = clock.now();
                let window = check_window(last_run, now, settings.period_ticks);
                last_run = Some(now);
                if let Err(e) = window {
                    warn!("{}; skipping hints this cycle", e);
                    continue;
                }
                state.disruptions.prune(now);
                let aggregation =
                    aggregate(&state.snapshots, &corridors, &state.disruptions, &settings, now);
                for e in &aggregation.skipped {
                    warn!("{}", e);
                }
                for hint in aggregation.hints {
                    info!(
                        "Corridor {}: hint {} to favor {} (strength {:.2})",
                        hint.corridor, hint.intersection_id, hint.favor_phase, hint.strength
                    );
                    let to = Address::controller(&hint.intersection_id);
                    if let Err(e) = bus.send(Envelope::direct(me.clone(), to, now, Payload::CorridorHint(hint))) {
                        warn!("Corridor hint not delivered: {}", e);
                    }
                }
            }
        }
    }
    info!("Coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::disruption::{DisruptionEvent, DisruptionKind};
    use crate::models::intersection::{PhaseId, SignalState};
    use crate::shared_data::PhaseLoad;

    fn snapshot(id: &str, tick: Tick, ns: usize, ew: usize) -> IntersectionSnapshot {
        IntersectionSnapshot {
            intersection_id: id.into(),
            tick,
            signal: SignalState::Green {
                phase: PhaseId(1),
                since: 0,
            },
            green_phase: Some("EW_GREEN".into()),
            loads: vec![
                PhaseLoad {
                    phase: "NS_GREEN".into(),
                    waiting: ns,
                    max_wait: 0,
                },
                PhaseLoad {
                    phase: "EW_GREEN".into(),
                    waiting: ew,
                    max_wait: 0,
                },
            ],
            disruption_severity: 0.0,
            preempted: false,
        }
    }

    fn corridor(name: &str, phase: &str, ids: &[&str]) -> Corridor {
        Corridor {
            name: name.into(),
            members: ids
                .iter()
                .map(|id| CorridorMember {
                    intersection: (*id).into(),
                    phase: phase.into(),
                })
                .collect(),
        }
    }

    fn snapshots(list: Vec<IntersectionSnapshot>) -> HashMap<IntersectionId, IntersectionSnapshot> {
        list.into_iter().map(|s| (s.intersection_id.clone(), s)).collect()
    }

    #[test]
    fn dominant_corridor_flow_gets_hints() {
        let snaps = snapshots(vec![snapshot("I1", 10, 6, 1), snapshot("I2", 10, 4, 1)]);
        let agg = aggregate(
            &snaps,
            &[corridor("ns", "NS_GREEN", &["I1", "I2"])],
            &DisruptionLedger::new(),
            &CoordinatorSettings::default(),
            10,
        );
        assert!(agg.skipped.is_empty());
        assert_eq!(agg.hints.len(), 2);
        assert!(agg.hints.iter().all(|h| h.favor_phase == "NS_GREEN"));
        assert!((agg.hints[0].strength - 10.0 / 12.0).abs() < 1e-9);
        assert_eq!(agg.hints[0].valid_until, 20);
    }

    #[test]
    fn balanced_demand_yields_no_hint() {
        let snaps = snapshots(vec![snapshot("I1", 10, 3, 3)]);
        let agg = aggregate(
            &snaps,
            &[corridor("ns", "NS_GREEN", &["I1"])],
            &DisruptionLedger::new(),
            &CoordinatorSettings::default(),
            10,
        );
        assert!(agg.hints.is_empty());
    }

    #[test]
    fn stale_member_skips_whole_corridor() {
        let snaps = snapshots(vec![snapshot("I1", 40, 6, 0), snapshot("I2", 5, 6, 0)]);
        let agg = aggregate(
            &snaps,
            &[corridor("ns", "NS_GREEN", &["I1", "I2"])],
            &DisruptionLedger::new(),
            &CoordinatorSettings::default(),
            40,
        );
        assert!(agg.hints.is_empty());
        assert!(matches!(
            &agg.skipped[..],
            [CoordinationError::StaleState { snapshot_tick: 5, .. }]
        ));
    }

    #[test]
    fn disrupted_member_is_skipped_and_neighbours_boosted() {
        let snaps = snapshots(vec![
            snapshot("I1", 10, 6, 0),
            snapshot("I2", 10, 6, 0),
            snapshot("I3", 10, 6, 2),
        ]);
        let mut ledger = DisruptionLedger::new();
        ledger
            .apply(DisruptionEvent {
                kind: DisruptionKind::Construction,
                area: vec!["I2".into()],
                severity: 0.8,
                valid_from: 0,
                valid_to: 50,
            })
            .unwrap();
        let agg = aggregate(
            &snaps,
            &[corridor("ns", "NS_GREEN", &["I1", "I2", "I3"])],
            &ledger,
            &CoordinatorSettings::default(),
            10,
        );
        let ids: Vec<String> = agg.hints.iter().map(|h| h.intersection_id.to_string()).collect();
        assert_eq!(ids, vec!["I1", "I3"]);
        // base = 18/20, boosted and capped at 1.0
        assert!(agg.hints.iter().all(|h| (h.strength - 1.0).abs() < 1e-9));
    }

    #[test]
    fn crossing_corridors_keep_the_stronger_hint() {
        let snaps = snapshots(vec![snapshot("I1", 10, 8, 1), snapshot("I2", 10, 0, 20)]);
        let agg = aggregate(
            &snaps,
            &[
                corridor("ns", "NS_GREEN", &["I1"]),
                corridor("ew", "EW_GREEN", &["I2", "I1"]),
            ],
            &DisruptionLedger::new(),
            &CoordinatorSettings::default(),
            10,
        );
        let i1 = agg
            .hints
            .iter()
            .find(|h| h.intersection_id == IntersectionId::from("I1"))
            .unwrap();
        assert_eq!(i1.corridor, "ns");
        let i2 = agg
            .hints
            .iter()
            .find(|h| h.intersection_id == IntersectionId::from("I2"))
            .unwrap();
        assert_eq!(i2.corridor, "ew");
    }

    #[test]
    fn missed_window_is_reported() {
        assert!(check_window(None, 50, 10).is_ok());
        assert!(check_window(Some(40), 60, 10).is_ok());
        assert_eq!(
            check_window(Some(10), 31, 10),
            Err(CoordinationError::MissedWindow { last: 10, now: 31 })
        );
    }

    #[test]
    fn older_snapshots_do_not_replace_newer() {
        let mut state = CoordinatorState::default();
        let report = |s: IntersectionSnapshot| {
            Payload::MetricReport(crate::shared_data::MetricReport {
                intersection_id: s.intersection_id.clone(),
                waiting_time: 0.0,
                throughput_count: 0,
                source: crate::shared_data::MetricSource::Controller { snapshot: s },
            })
        };
        state.absorb(report(snapshot("I1", 20, 1, 1)));
        state.absorb(report(snapshot("I1", 10, 9, 9)));
        assert_eq!(state.snapshots[&IntersectionId::from("I1")].tick, 20);
    }
}
