use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::channel::{phase_topic, Address, Mailbox, MessageBus};
use crate::communication::messages::{
    ClaimRelease, CorridorHint, DisruptionUpdate, Envelope, Payload, PhaseBroadcast, PhaseRequest,
};
use crate::control_system::phase_scheduler::{
    score_phases, AdaptiveGreen, Decision, GreenStatus, PhaseDemand, PhaseScheduler,
    ScoringWeights,
};
use crate::emergency::preemption_channel::EmergencyClaim;
use crate::error::ProtocolError;
use crate::global_variables::TOPIC_METRICS;
use crate::models::disruption::DisruptionLedger;
use crate::models::intersection::{Intersection, IntersectionId, LaneId, PhaseId, SignalState};
use crate::models::vehicle::{PriorityClass, VehicleId, VehicleRecord};
use crate::shared_data::{
    IntersectionSnapshot, MetricReport, MetricSource, PhaseLoad, SimClock, Tick,
};

/// Tunables shared by all signal controllers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub clearance_ticks: Tick,
    pub record_timeout_ticks: Tick,
    pub weights: ScoringWeights,
    pub adaptive: AdaptiveGreen,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            clearance_ticks: 2,
            record_timeout_ticks: 120,
            weights: ScoringWeights::default(),
            adaptive: AdaptiveGreen::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveHint {
    phase: PhaseId,
    strength: f64,
    valid_until: Tick,
}

/// Owns one intersection's phase state machine.
///
/// All inputs are queued by the `submit_*`/`announce_*`/`apply_*` methods and
/// take effect in [`SignalController::decision_cycle`], which is the only
/// place the signal state changes.
pub struct SignalController {
    intersection: Intersection,
    settings: ControllerSettings,
    records: HashMap<VehicleId, VehicleRecord>,
    pending_requests: Vec<PhaseRequest>,
    emergency: Option<EmergencyClaim>,
    disruptions: DisruptionLedger,
    feed_available: bool,
    hint: Option<ActiveHint>,
    last_served: Vec<Tick>,
    green_target: Tick,
    period_departures: u64,
    period_wait_total: Tick,
}

impl SignalController {
    pub fn new(intersection: Intersection, settings: ControllerSettings) -> Self {
        let last_served = vec![0; intersection.num_phases()];
        let first = intersection.phase(intersection.default_phase);
        let green_target = (first.min_green + first.max_green) / 2;
        Self {
            intersection,
            settings,
            records: HashMap::new(),
            pending_requests: Vec::new(),
            emergency: None,
            disruptions: DisruptionLedger::new(),
            feed_available: true,
            hint: None,
            last_served,
            green_target,
            period_departures: 0,
            period_wait_total: 0,
        }
    }

    pub fn id(&self) -> &IntersectionId {
        &self.intersection.id
    }

    pub fn intersection(&self) -> &Intersection {
        &self.intersection
    }

    pub fn state(&self) -> &SignalState {
        &self.intersection.state
    }

    pub fn waiting_vehicles(&self) -> usize {
        self.records.len()
    }

    pub fn active_claim(&self) -> Option<&EmergencyClaim> {
        self.emergency.as_ref()
    }

    /// Current adaptive green target in ticks.
    pub fn green_target(&self) -> Tick {
        self.green_target
    }

    fn check_lane(&self, lane: &LaneId) -> Result<(), ProtocolError> {
        if self.intersection.has_lane(lane) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownLane {
                intersection: self.intersection.id.clone(),
                lane: lane.clone(),
            })
        }
    }

    fn check_intersection(&self, id: &IntersectionId) -> Result<(), ProtocolError> {
        if *id == self.intersection.id {
            Ok(())
        } else {
            Err(ProtocolError::UnknownIntersection(id.clone()))
        }
    }

    /// Queues a request for the next decision cycle.
    pub fn submit_phase_request(&mut self, request: PhaseRequest) -> Result<(), ProtocolError> {
        self.check_intersection(&request.intersection_id)?;
        self.check_lane(&request.lane)?;
        self.pending_requests.push(request);
        Ok(())
    }

    pub fn announce_arrival(
        &mut self,
        vehicle_id: VehicleId,
        lane: &LaneId,
        priority: PriorityClass,
        estimated_clearance: Tick,
        now: Tick,
    ) -> Result<(), ProtocolError> {
        self.check_lane(lane)?;
        self.records.entry(vehicle_id).or_insert_with(|| VehicleRecord {
            vehicle_id,
            lane: lane.clone(),
            arrived_at: now,
            priority,
            estimated_clearance,
        });
        Ok(())
    }

    /// Removes the vehicle's record and returns how long it waited.
    pub fn announce_departure(
        &mut self,
        vehicle_id: VehicleId,
        lane: &LaneId,
        now: Tick,
    ) -> Result<Option<Tick>, ProtocolError> {
        self.check_lane(lane)?;
        Ok(self.records.remove(&vehicle_id).map(|record| {
            let waited = record.waited(now);
            self.period_departures += 1;
            self.period_wait_total += waited;
            waited
        }))
    }

    pub fn apply_claim_grant(&mut self, claim: EmergencyClaim) -> Result<(), ProtocolError> {
        self.check_intersection(&claim.intersection_id)?;
        self.check_lane(&claim.lane)?;
        info!(
            "Intersection {} preempted by claim {} on lane {}",
            self.intersection.id, claim.claim_id, claim.lane
        );
        self.emergency = Some(claim);
        Ok(())
    }

    pub fn apply_claim_release(&mut self, release: &ClaimRelease) {
        if release.claim_id.is_some()
            && self.emergency.as_ref().map(|c| c.claim_id) == release.claim_id
        {
            info!(
                "Intersection {} released from claim ({:?})",
                self.intersection.id, release.reason
            );
            self.emergency = None;
        }
    }

    pub fn apply_disruption(&mut self, update: DisruptionUpdate) {
        match update {
            DisruptionUpdate::Event { event } => {
                if !event.covers(&self.intersection.id) {
                    return;
                }
                match self.disruptions.apply(event) {
                    Ok(change) => {
                        debug!("Intersection {} disruption ledger: {:?}", self.intersection.id, change);
                        self.feed_available = true;
                    }
                    Err(e) => warn!("Intersection {} rejected disruption: {}", self.intersection.id, e),
                }
            }
            DisruptionUpdate::FeedUnavailable { reason } => {
                if self.feed_available {
                    warn!(
                        "Intersection {} lost disruption feed ({}); using undisrupted weighting",
                        self.intersection.id, reason
                    );
                }
                self.feed_available = false;
                self.disruptions.clear();
            }
        }
    }

    pub fn apply_hint(&mut self, hint: &CorridorHint) -> Result<(), ProtocolError> {
        self.check_intersection(&hint.intersection_id)?;
        let phase = self
            .intersection
            .phase_by_name(&hint.favor_phase)
            .ok_or_else(|| ProtocolError::MalformedPayload {
                kind: "CORRIDOR_HINT".to_string(),
                reason: format!("unknown phase {}", hint.favor_phase),
            })?;
        self.hint = Some(ActiveHint {
            phase,
            strength: hint.strength,
            valid_until: hint.valid_until,
        });
        Ok(())
    }

    /// Routes one envelope to the matching input method.
    pub fn handle(&mut self, envelope: Envelope, now: Tick) -> Result<(), ProtocolError> {
        match envelope.payload {
            Payload::Arrival(a) => {
                self.check_intersection(&a.intersection_id)?;
                self.announce_arrival(
                    a.vehicle_id,
                    &a.lane,
                    a.priority,
                    a.vehicle_type.clearance_ticks(),
                    now,
                )
            }
            Payload::Departure(d) => {
                self.check_intersection(&d.intersection_id)?;
                self.announce_departure(d.vehicle_id, &d.lane, now).map(|_| ())
            }
            Payload::PhaseRequest(r) => self.submit_phase_request(r),
            Payload::ClaimGrant(g) => self.apply_claim_grant(g.claim),
            Payload::ClaimRelease(r) => {
                self.apply_claim_release(&r);
                Ok(())
            }
            Payload::DisruptionEvent(update) => {
                self.apply_disruption(update);
                Ok(())
            }
            Payload::CorridorHint(h) => self.apply_hint(&h),
            other => Err(ProtocolError::MisroutedMessage {
                kind: other.message_type().to_string(),
                receiver: Address::controller(&self.intersection.id).to_string(),
            }),
        }
    }

    /// Waiting vehicles and pending requests per phase. The unserved wait
    /// of a phase counts from its last green, not from arrival.
    pub fn phase_demand(&self, now: Tick) -> Vec<PhaseDemand> {
        let mut demand = vec![PhaseDemand::default(); self.intersection.num_phases()];
        let last_served = &self.last_served;
        let mut add = |lane: &LaneId, since: Tick| {
            for phase in self.intersection.phases_for_lane(lane) {
                let d = &mut demand[phase.0];
                d.waiting += 1;
                d.max_wait = d.max_wait.max(now.saturating_sub(since));
                let unserved = now.saturating_sub(since.max(last_served[phase.0]));
                d.unserved_wait = d.unserved_wait.max(unserved);
            }
        };
        for record in self.records.values() {
            add(&record.lane, record.arrived_at);
        }
        for request in &self.pending_requests {
            let known = request
                .vehicle_id
                .map(|v| self.records.contains_key(&v))
                .unwrap_or(false);
            if !known {
                add(&request.lane, request.requested_at);
            }
        }
        demand
    }

    /// Disruption severity favouring each phase; all zero without a feed.
    pub fn disruption_bias(&self, now: Tick) -> Vec<f64> {
        let mut bias = vec![0.0; self.intersection.num_phases()];
        if !self.feed_available {
            return bias;
        }
        for (kind, severity) in self.disruptions.severity_by_kind(&self.intersection.id, now) {
            if let Some(phase) = self.intersection.resilience.get(&kind) {
                bias[phase.0] = f64::max(bias[phase.0], severity);
            }
        }
        bias
    }

    pub fn scores(&self, now: Tick) -> Vec<f64> {
        let hint = self
            .hint
            .as_ref()
            .filter(|h| now < h.valid_until)
            .map(|h| (h.phase, h.strength));
        score_phases(
            &self.settings.weights,
            &self.phase_demand(now),
            &self.disruption_bias(now),
            hint,
        )
    }

    fn expire_inputs(&mut self, now: Tick) {
        let timeout = self.settings.record_timeout_ticks;
        let id = &self.intersection.id;
        self.records.retain(|vehicle, record| {
            let keep = record.waited(now) < timeout;
            if !keep {
                warn!("Intersection {}: dropping stale record for vehicle {}", id, vehicle);
            }
            keep
        });
        self.disruptions.prune(now);
        if self.hint.as_ref().map(|h| now >= h.valid_until).unwrap_or(false) {
            self.hint = None;
        }
        if let Some(claim) = &self.emergency {
            if !claim.is_active(now) {
                info!(
                    "Intersection {}: claim {} expired locally",
                    self.intersection.id, claim.claim_id
                );
                self.emergency = None;
            }
        }
    }

    fn enter(&mut self, state: SignalState) {
        if state != self.intersection.state {
            info!(
                "Intersection {}: {} -> {}",
                self.intersection.id,
                describe(&self.intersection, &self.intersection.state),
                describe(&self.intersection, &state)
            );
        }
        self.intersection.state = state;
    }

    /// Moves toward `to`, through clearance when it conflicts with `from`.
    fn transition(&mut self, from: PhaseId, to: PhaseId, now: Tick, claim: Option<uuid::Uuid>) {
        let next = if self.intersection.conflicts.conflicts(from, to) {
            SignalState::Clearance { from, to, since: now }
        } else {
            match claim {
                Some(claim) => SignalState::Preempted {
                    phase: to,
                    since: now,
                    claim,
                },
                None => SignalState::Green { phase: to, since: now },
            }
        };
        self.enter(next);
    }

    fn preempt(&mut self, claim: &EmergencyClaim, now: Tick) {
        let Some(target) = self.intersection.phase_for_lane(&claim.lane) else {
            return;
        };
        let claim_id = claim.claim_id;
        match self.intersection.state.clone() {
            SignalState::Green { phase, since } if phase == target => {
                self.enter(SignalState::Preempted {
                    phase,
                    since,
                    claim: claim_id,
                });
            }
            SignalState::Preempted { phase, since, .. } if phase == target => {
                self.enter(SignalState::Preempted {
                    phase,
                    since,
                    claim: claim_id,
                });
            }
            SignalState::Green { phase, .. } | SignalState::Preempted { phase, .. } => {
                // Minimum green of the superseded phase does not apply.
                self.transition(phase, target, now, Some(claim_id));
            }
            SignalState::Clearance { from, to, since } => {
                if to != target {
                    self.enter(SignalState::Clearance {
                        from,
                        to: target,
                        since,
                    });
                }
                if now.saturating_sub(since) >= self.settings.clearance_ticks {
                    self.enter(SignalState::Preempted {
                        phase: target,
                        since: now,
                        claim: claim_id,
                    });
                }
            }
        }
    }

    fn schedule(&mut self, now: Tick) {
        match self.intersection.state.clone() {
            SignalState::Clearance { to, since, .. } => {
                if now.saturating_sub(since) >= self.settings.clearance_ticks {
                    self.enter(SignalState::Green { phase: to, since: now });
                }
            }
            SignalState::Preempted { phase, since, .. } => {
                // Claim gone: resume normal scheduling, keeping the green age
                // so the maximum green still forces rotation.
                self.enter(SignalState::Green { phase, since });
                self.schedule(now);
            }
            SignalState::Green { phase, since } => {
                let (min_green, max_green) = {
                    let def = self.intersection.phase(phase);
                    (def.min_green, def.max_green)
                };
                self.green_target = self.settings.adaptive.adjust(
                    self.green_target,
                    self.records.len(),
                    min_green,
                    max_green,
                );
                let status = GreenStatus {
                    current: phase,
                    elapsed: now.saturating_sub(since),
                    min_green,
                    max_green,
                    target: self.green_target,
                };
                let demand = self.phase_demand(now);
                let scores = self.scores(now);
                let starvation_limit = self
                    .intersection
                    .phases
                    .iter()
                    .map(|p| p.max_green)
                    .max()
                    .unwrap_or(0)
                    * (self.intersection.num_phases() as Tick - 1);
                let decision = PhaseScheduler {
                    scores: &scores,
                    demand: &demand,
                    last_served: &self.last_served,
                    starvation_limit,
                    switch_threshold: self.settings.weights.switch_threshold,
                }
                .decide(status);
                debug!(
                    "Intersection {} tick {}: scores {:?} -> {:?}",
                    self.intersection.id, now, scores, decision
                );
                if let Decision::Switch { to, reason } = decision {
                    info!(
                        "Intersection {}: switching {} -> {} ({:?})",
                        self.intersection.id,
                        self.intersection.phase(phase).name,
                        self.intersection.phase(to).name,
                        reason
                    );
                    self.transition(phase, to, now, None);
                }
            }
        }
    }

    /// One scheduling tick. Emergency claims first, then clearance timing,
    /// then score-based scheduling under min/max green.
    pub fn decision_cycle(&mut self, now: Tick) -> PhaseBroadcast {
        self.expire_inputs(now);

        match self.emergency.clone() {
            Some(claim) => self.preempt(&claim, now),
            None => self.schedule(now),
        }
        self.pending_requests.clear();

        if let Some(phase) = self.intersection.state.green_phase() {
            self.last_served[phase.0] = now;
        }
        let green_lanes = self.intersection.green_lanes();
        debug_assert!(!self.intersection.has_conflicting_greens(&green_lanes));

        PhaseBroadcast {
            intersection_id: self.intersection.id.clone(),
            tick: now,
            signal: self.intersection.state.clone(),
            phase_name: self
                .intersection
                .state
                .green_phase()
                .map(|p| self.intersection.phase(p).name.clone()),
            green_lanes,
        }
    }

    pub fn snapshot(&self, now: Tick) -> IntersectionSnapshot {
        let loads = self
            .phase_demand(now)
            .into_iter()
            .zip(&self.intersection.phases)
            .map(|(d, p)| PhaseLoad {
                phase: p.name.clone(),
                waiting: d.waiting,
                max_wait: d.max_wait,
            })
            .collect();
        IntersectionSnapshot {
            intersection_id: self.intersection.id.clone(),
            tick: now,
            signal: self.intersection.state.clone(),
            green_phase: self
                .intersection
                .state
                .green_phase()
                .map(|p| self.intersection.phase(p).name.clone()),
            loads,
            disruption_severity: if self.feed_available {
                self.disruptions.max_severity(&self.intersection.id, now)
            } else {
                0.0
            },
            preempted: matches!(self.intersection.state, SignalState::Preempted { .. }),
        }
    }

    /// Metric report for the period since the previous call.
    pub fn take_metric_report(&mut self, now: Tick) -> MetricReport {
        let throughput = std::mem::take(&mut self.period_departures);
        let wait_total = std::mem::take(&mut self.period_wait_total);
        MetricReport {
            intersection_id: self.intersection.id.clone(),
            waiting_time: if throughput == 0 {
                0.0
            } else {
                wait_total as f64 / throughput as f64
            },
            throughput_count: throughput,
            source: MetricSource::Controller {
                snapshot: self.snapshot(now),
            },
        }
    }
}

fn describe(intersection: &Intersection, state: &SignalState) -> String {
    match state {
        SignalState::Green { phase, .. } => intersection.phase(*phase).name.clone(),
        SignalState::Preempted { phase, .. } => {
            format!("{} (emergency)", intersection.phase(*phase).name)
        }
        SignalState::Clearance { to, .. } => {
            format!("CLEARANCE to {}", intersection.phase(*to).name)
        }
    }
}

/// Runs a controller as an agent: drains its mailbox once per tick, runs a
/// decision cycle and broadcasts the result. Never waits on other agents.
pub async fn run_signal_controller(
    mut controller: SignalController,
    mut mailbox: Mailbox,
    bus: MessageBus,
    clock: SimClock,
    metrics_period: Tick,
) {
    let me = Address::controller(controller.id());
    let topic = phase_topic(controller.id());
    let mut ticker = interval(clock.tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_report: Tick = 0;

    loop {
        ticker.tick().await;
        let now = clock.now();
        let Some(envelopes) = mailbox.drain() else { break };
        for envelope in envelopes {
            let from = envelope.from.clone();
            if let Err(e) = controller.handle(envelope, now) {
                warn!("Controller {} rejected message from {}: {}", me, from, e);
            }
        }

        let broadcast = controller.decision_cycle(now);
        if let Err(e) = bus.send(Envelope::topic(
            me.clone(),
            topic.clone(),
            now,
            Payload::PhaseBroadcast(broadcast),
        )) {
            warn!("Controller {} broadcast failed: {}", me, e);
        }

        if now.saturating_sub(last_report) >= metrics_period.max(1) {
            last_report = now;
            let report = controller.take_metric_report(now);
            if let Err(e) = bus.send(Envelope::topic(
                me.clone(),
                TOPIC_METRICS,
                now,
                Payload::MetricReport(report),
            )) {
                warn!("Controller {} metric report failed: {}", me, e);
            }
        }
    }
    info!("Controller {} stopped", me);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::messages::ReleaseReason;
    use crate::models::disruption::{DisruptionEvent, DisruptionKind};
    use crate::models::intersection::tests::two_phase;

    fn controller() -> SignalController {
        SignalController::new(two_phase("I1", 5, 20), ControllerSettings::default())
    }

    fn request(lane: &str, at: Tick) -> PhaseRequest {
        PhaseRequest {
            vehicle_id: None,
            intersection_id: "I1".into(),
            lane: lane.into(),
            priority: PriorityClass::Normal,
            requested_at: at,
        }
    }

    fn claim(lane: &str, now: Tick, expires_at: Tick) -> EmergencyClaim {
        EmergencyClaim {
            claim_id: uuid::Uuid::new_v4(),
            vehicle_id: VehicleId(99),
            intersection_id: "I1".into(),
            lane: lane.into(),
            issued_at: now,
            expires_at,
        }
    }

    #[test]
    fn unknown_lane_is_rejected_without_side_effects() {
        let mut c = controller();
        let err = c.submit_phase_request(request("Q", 0)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownLane { .. }));
        assert!(c
            .announce_arrival(VehicleId(1), &"Q".into(), PriorityClass::Normal, 1, 0)
            .is_err());
        assert_eq!(c.waiting_vehicles(), 0);
        c.decision_cycle(0);
        assert_eq!(c.state().green_phase(), Some(PhaseId(0)));
    }

    #[test]
    fn conflicting_switch_goes_through_clearance() {
        let mut c = controller();
        for v in 0..4 {
            c.announce_arrival(VehicleId(v), &"E".into(), PriorityClass::Normal, 1, 0)
                .unwrap();
        }
        for t in 0..5 {
            c.decision_cycle(t);
            assert_eq!(c.state().green_phase(), Some(PhaseId(0)));
        }
        c.decision_cycle(5);
        assert_eq!(
            *c.state(),
            SignalState::Clearance {
                from: PhaseId(0),
                to: PhaseId(1),
                since: 5
            }
        );
        c.decision_cycle(6);
        assert!(c.state().is_clearance());
        let b = c.decision_cycle(7);
        assert_eq!(b.phase_name.as_deref(), Some("EW_GREEN"));
        assert_eq!(b.green_lanes, vec![LaneId::from("E"), LaneId::from("W")]);
    }

    #[test]
    fn non_conflicting_switch_is_direct() {
        let mut i = two_phase("I1", 1, 10);
        i.conflicts = crate::models::intersection::ConflictMatrix::new(2);
        let mut c = SignalController::new(i, ControllerSettings::default());
        c.submit_phase_request(request("E", 0)).unwrap();
        c.decision_cycle(1);
        assert_eq!(c.state().green_phase(), Some(PhaseId(1)));
    }

    #[test]
    fn departure_reports_wait_and_clears_record() {
        let mut c = controller();
        c.announce_arrival(VehicleId(3), &"N".into(), PriorityClass::Normal, 1, 2)
            .unwrap();
        assert_eq!(c.announce_departure(VehicleId(3), &"N".into(), 9).unwrap(), Some(7));
        assert_eq!(c.waiting_vehicles(), 0);
        let report = c.take_metric_report(9);
        assert_eq!(report.throughput_count, 1);
        assert_eq!(report.waiting_time, 7.0);
        assert_eq!(c.take_metric_report(10).throughput_count, 0);
    }

    #[test]
    fn stale_records_time_out() {
        let mut c = controller();
        c.announce_arrival(VehicleId(3), &"E".into(), PriorityClass::Normal, 1, 0)
            .unwrap();
        c.decision_cycle(119);
        assert_eq!(c.waiting_vehicles(), 1);
        c.decision_cycle(120);
        assert_eq!(c.waiting_vehicles(), 0);
    }

    #[test]
    fn claim_during_clearance_retargets_without_restart() {
        let mut i = two_phase("I1", 1, 10);
        i.phases.push(crate::models::intersection::PhaseDef {
            name: "LEFT".to_string(),
            lanes: vec![],
            min_green: 1,
            max_green: 10,
        });
        i.conflicts = crate::models::intersection::ConflictMatrix::all_conflicting(3);
        let mut c = SignalController::new(i, ControllerSettings::default());
        c.intersection.state = SignalState::Clearance {
            from: PhaseId(0),
            to: PhaseId(2),
            since: 4,
        };
        c.apply_claim_grant(claim("E", 5, 30)).unwrap();
        c.decision_cycle(5);
        assert_eq!(
            *c.state(),
            SignalState::Clearance {
                from: PhaseId(0),
                to: PhaseId(1),
                since: 4
            }
        );
        c.decision_cycle(6);
        assert!(matches!(c.state(), SignalState::Preempted { phase: PhaseId(1), .. }));
    }

    #[test]
    fn release_resumes_normal_scheduling() {
        let mut c = controller();
        let grant = claim("N", 0, 50);
        let claim_id = grant.claim_id;
        c.apply_claim_grant(grant).unwrap();
        c.decision_cycle(0);
        assert!(matches!(c.state(), SignalState::Preempted { phase: PhaseId(0), .. }));
        c.apply_claim_release(&ClaimRelease {
            claim_id: Some(claim_id),
            vehicle_id: VehicleId(99),
            intersection_id: "I1".into(),
            reason: ReleaseReason::Departed,
        });
        c.decision_cycle(1);
        assert!(matches!(c.state(), SignalState::Green { phase: PhaseId(0), .. }));
    }

    #[test]
    fn locally_expired_claim_is_dropped() {
        let mut c = controller();
        c.apply_claim_grant(claim("E", 0, 4)).unwrap();
        c.decision_cycle(3);
        assert!(c.active_claim().is_some());
        c.decision_cycle(4);
        assert!(c.active_claim().is_none());
    }

    #[test]
    fn feed_loss_drops_disruption_bias() {
        let mut i = two_phase("I1", 5, 20);
        i.resilience.insert(DisruptionKind::Weather, PhaseId(1));
        let mut c = SignalController::new(i, ControllerSettings::default());
        c.apply_disruption(DisruptionUpdate::Event {
            event: DisruptionEvent {
                kind: DisruptionKind::Weather,
                area: vec!["I1".into()],
                severity: 0.5,
                valid_from: 0,
                valid_to: 100,
            },
        });
        assert_eq!(c.disruption_bias(1), vec![0.0, 0.5]);
        c.apply_disruption(DisruptionUpdate::FeedUnavailable {
            reason: "timeout".into(),
        });
        assert_eq!(c.disruption_bias(1), vec![0.0, 0.0]);
        assert_eq!(c.snapshot(1).disruption_severity, 0.0);
    }

    #[test]
    fn hint_adds_bonus_until_expiry() {
        let mut c = controller();
        let mut hint = CorridorHint {
            corridor: "main".into(),
            intersection_id: "I1".into(),
            favor_phase: "EW_GREEN".into(),
            strength: 1.0,
            issued_at: 0,
            valid_until: 10,
        };
        c.apply_hint(&hint).unwrap();
        assert_eq!(c.scores(5), vec![0.0, 0.5]);
        assert_eq!(c.scores(10), vec![0.0, 0.0]);

        hint.favor_phase = "NOPE".into();
        assert!(c.apply_hint(&hint).is_err());
    }

    fn hint(phase: &str, strength: f64, valid_until: Tick) -> CorridorHint {
        CorridorHint {
            corridor: "main".into(),
            intersection_id: "I1".into(),
            favor_phase: phase.into(),
            strength,
            issued_at: 0,
            valid_until,
        }
    }

    fn arrive(c: &mut SignalController, first: u64, count: u64, lane: &str, now: Tick) {
        for v in first..first + count {
            c.announce_arrival(VehicleId(v), &lane.into(), PriorityClass::Normal, 1, now)
                .unwrap();
        }
    }

    #[test]
    fn full_hint_on_losing_phase_waits_for_min_green() {
        let mut c = controller();
        arrive(&mut c, 0, 4, "E", 0);
        c.apply_hint(&hint("EW_GREEN", 1.0, 50)).unwrap();
        for t in 0..5 {
            c.decision_cycle(t);
            assert_eq!(c.state().green_phase(), Some(PhaseId(0)), "tick {t}");
        }
        c.decision_cycle(5);
        assert!(c.state().is_clearance());
    }

    #[test]
    fn hint_cannot_pull_green_away_from_a_claim() {
        let mut c = controller();
        arrive(&mut c, 0, 6, "N", 0);
        c.apply_hint(&hint("NS_GREEN", 1.0, 50)).unwrap();
        c.apply_claim_grant(claim("E", 0, 30)).unwrap();
        c.decision_cycle(0);
        c.decision_cycle(1);
        for t in 2..30 {
            c.decision_cycle(t);
            assert!(
                matches!(c.state(), SignalState::Preempted { phase: PhaseId(1), .. }),
                "tick {t}: {:?}",
                c.state()
            );
        }
    }

    #[test]
    fn max_green_rotates_even_when_hint_backs_current_phase() {
        let mut c = controller();
        arrive(&mut c, 0, 11, "N", 0);
        c.apply_hint(&hint("NS_GREEN", 1.0, 50)).unwrap();
        for t in 0..20 {
            if t == 5 {
                arrive(&mut c, 100, 1, "E", 5);
            }
            c.decision_cycle(t);
            assert_eq!(c.state().green_phase(), Some(PhaseId(0)), "tick {t}");
        }
        assert_eq!(c.green_target(), 20);
        c.decision_cycle(20);
        assert_eq!(
            *c.state(),
            SignalState::Clearance {
                from: PhaseId(0),
                to: PhaseId(1),
                since: 20
            }
        );
    }

    #[test]
    fn steady_queue_ends_green_at_target() {
        let mut c = controller();
        assert_eq!(c.green_target(), 12);
        arrive(&mut c, 0, 2, "N", 0);
        arrive(&mut c, 10, 1, "E", 0);
        for t in 0..12 {
            c.decision_cycle(t);
            assert_eq!(c.state().green_phase(), Some(PhaseId(0)), "tick {t}");
        }
        c.decision_cycle(12);
        assert_eq!(c.green_target(), 12);
        assert_eq!(
            *c.state(),
            SignalState::Clearance {
                from: PhaseId(0),
                to: PhaseId(1),
                since: 12
            }
        );
    }

    #[test]
    fn quiet_intersection_shortens_green() {
        let mut c = controller();
        arrive(&mut c, 0, 1, "N", 0);
        arrive(&mut c, 10, 1, "E", 0);
        for t in 0..6 {
            c.decision_cycle(t);
            assert_eq!(c.state().green_phase(), Some(PhaseId(0)), "tick {t}");
        }
        assert_eq!(c.green_target(), 6);
        c.decision_cycle(6);
        assert_eq!(c.green_target(), 5);
        assert!(c.state().is_clearance());
    }

    #[test]
    fn recently_served_phase_is_not_starving() {
        let settings = ControllerSettings {
            adaptive: AdaptiveGreen {
                extend_ticks: 0,
                shrink_ticks: 0,
                ..AdaptiveGreen::default()
            },
            ..ControllerSettings::default()
        };
        let mut c = SignalController::new(two_phase("I1", 5, 20), settings);
        // This vehicle never departs, so its wait keeps growing.
        arrive(&mut c, 0, 1, "E", 0);
        for t in 0..=20 {
            if t == 7 {
                arrive(&mut c, 10, 4, "N", 7);
            }
            let b = c.decision_cycle(t);
            match t {
                7 => assert_eq!(b.phase_name.as_deref(), Some("EW_GREEN")),
                14 => assert_eq!(b.phase_name.as_deref(), Some("NS_GREEN")),
                _ => {}
            }
        }
        let demand = c.phase_demand(20);
        assert_eq!(demand[1].max_wait, 20);
        assert_eq!(demand[1].unserved_wait, 9);
        assert_eq!(c.state().green_phase(), Some(PhaseId(0)));
    }

    #[test]
    fn misrouted_messages_are_rejected() {
        let mut c = controller();
        let envelope = Envelope::direct(
            Address::new("x"),
            Address::controller(&"I1".into()),
            0,
            Payload::ClaimRequest(crate::communication::messages::ClaimRequest {
                vehicle_id: VehicleId(1),
                intersection_id: "I1".into(),
                lane: "N".into(),
                eta: 3,
            }),
        );
        assert!(matches!(
            c.handle(envelope, 0),
            Err(ProtocolError::MisroutedMessage { .. })
        ));
    }
}
