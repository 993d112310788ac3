use log::{debug, info, warn};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::communication::channel::{phase_topic, Address, Mailbox, MessageBus};
use crate::communication::messages::{
    Arrival, ClaimRelease, ClaimRequest, Departure, Envelope, Payload, PhaseRequest, ReleaseReason,
};
use crate::error::ProtocolError;
use crate::global_variables::{ADDR_PREEMPTION, TOPIC_METRICS};
use crate::models::intersection::{IntersectionId, LaneId};
use crate::models::vehicle::{PriorityClass, VehicleId, VehicleType};
use crate::shared_data::{MetricReport, MetricSource, SimClock, Tick};

/// Behaviour knobs shared by all vehicle agents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSettings {
    /// Ticks to wait on red before re-submitting a phase request.
    pub patience_ticks: Tick,
    /// Ticks from seeing green to clearing the intersection.
    pub crossing_ticks: Tick,
    /// How far ahead of the stop line an emergency vehicle claims its lane.
    pub claim_eta_ticks: Tick,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            patience_ticks: 15,
            crossing_ticks: 2,
            claim_eta_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleState {
    Approaching,
    Waiting { arrived: Tick, last_request: Tick },
    Crossing { started: Tick, waited: Tick },
    Departed { waited: Tick },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleEvent {
    Approach { now: Tick },
    /// A phase broadcast for this vehicle's intersection.
    PhaseObserved { now: Tick, green: bool },
    /// Timer tick with no broadcast.
    Tick { now: Tick },
    ClaimGranted { claim_id: Uuid },
    ClaimReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleAction {
    AnnounceArrival,
    SubmitPhaseRequest { requested_at: Tick },
    RequestClaim { eta: Tick },
    AnnounceDeparture { waited: Tick },
    ReleaseClaim { claim_id: Option<Uuid> },
    ReportMetric { waited: Tick },
}

/// One vehicle approaching one intersection.
#[derive(Debug, Clone)]
pub struct VehicleAgent {
    pub id: VehicleId,
    pub vehicle_type: VehicleType,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    settings: AgentSettings,
    state: VehicleState,
    claim: Option<Uuid>,
}

impl VehicleAgent {
    pub fn new(
        id: VehicleId,
        vehicle_type: VehicleType,
        intersection_id: IntersectionId,
        lane: LaneId,
        settings: AgentSettings,
    ) -> Self {
        Self {
            id,
            vehicle_type,
            intersection_id,
            lane,
            settings,
            state: VehicleState::Approaching,
            claim: None,
        }
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn is_emergency(&self) -> bool {
        self.vehicle_type.priority() == PriorityClass::Emergency
    }

    pub fn claim(&self) -> Option<Uuid> {
        self.claim
    }

    /// Transition table. Returns the actions the runner must carry out.
    pub fn on_event(&mut self, event: VehicleEvent) -> Vec<VehicleAction> {
        use VehicleAction as A;
        use VehicleEvent as E;
        use VehicleState as S;

        match (self.state, event) {
            (S::Approaching, E::Approach { now }) => {
                self.state = S::Waiting {
                    arrived: now,
                    last_request: now,
                };
                let mut actions = vec![A::AnnounceArrival, A::SubmitPhaseRequest { requested_at: now }];
                if self.is_emergency() {
                    actions.push(A::RequestClaim {
                        eta: now + self.settings.claim_eta_ticks,
                    });
                }
                actions
            }
            (S::Waiting { arrived, .. }, E::PhaseObserved { now, green: true }) => {
                self.state = S::Crossing {
                    started: now,
                    waited: now.saturating_sub(arrived),
                };
                Vec::new()
            }
            (S::Waiting { arrived, last_request }, E::PhaseObserved { now, green: false })
            | (S::Waiting { arrived, last_request }, E::Tick { now }) => {
                if now.saturating_sub(last_request) >= self.settings.patience_ticks {
                    self.state = S::Waiting {
                        arrived,
                        last_request: now,
                    };
                    vec![A::SubmitPhaseRequest { requested_at: arrived }]
                } else {
                    Vec::new()
                }
            }
            (S::Crossing { started, waited }, E::PhaseObserved { now, .. })
            | (S::Crossing { started, waited }, E::Tick { now }) => {
                if now.saturating_sub(started) < self.settings.crossing_ticks {
                    return Vec::new();
                }
                self.state = S::Departed { waited };
                let mut actions = vec![A::AnnounceDeparture { waited }];
                if self.is_emergency() {
                    actions.push(A::ReleaseClaim {
                        claim_id: self.claim.take(),
                    });
                }
                actions.push(A::ReportMetric { waited });
                actions
            }
            (S::Waiting { .. } | S::Crossing { .. }, E::ClaimGranted { claim_id }) => {
                self.claim = Some(claim_id);
                Vec::new()
            }
            (_, E::ClaimReleased) => {
                self.claim = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn envelope_for(&self, action: VehicleAction, now: Tick) -> Envelope {
        let me = Address::vehicle(self.id);
        let controller = Address::controller(&self.intersection_id);
        match action {
            VehicleAction::AnnounceArrival => Envelope::direct(
                me,
                controller,
                now,
                Payload::Arrival(Arrival {
                    vehicle_id: self.id,
                    intersection_id: self.intersection_id.clone(),
                    lane: self.lane.clone(),
                    priority: self.vehicle_type.priority(),
                    vehicle_type: self.vehicle_type,
                }),
            ),
            VehicleAction::SubmitPhaseRequest { requested_at } => Envelope::direct(
                me,
                controller,
                now,
                Payload::PhaseRequest(PhaseRequest {
                    vehicle_id: Some(self.id),
                    intersection_id: self.intersection_id.clone(),
                    lane: self.lane.clone(),
                    priority: self.vehicle_type.priority(),
                    requested_at,
                }),
            ),
            VehicleAction::RequestClaim { eta } => Envelope::direct(
                me,
                Address::new(ADDR_PREEMPTION),
                now,
                Payload::ClaimRequest(ClaimRequest {
                    vehicle_id: self.id,
                    intersection_id: self.intersection_id.clone(),
                    lane: self.lane.clone(),
                    eta,
                }),
            ),
            VehicleAction::AnnounceDeparture { waited } => Envelope::direct(
                me,
                controller,
                now,
                Payload::Departure(Departure {
                    vehicle_id: self.id,
                    intersection_id: self.intersection_id.clone(),
                    lane: self.lane.clone(),
                    waiting_time: waited,
                }),
            ),
            VehicleAction::ReleaseClaim { claim_id } => Envelope::direct(
                me,
                Address::new(ADDR_PREEMPTION),
                now,
                Payload::ClaimRelease(ClaimRelease {
                    claim_id,
                    vehicle_id: self.id,
                    intersection_id: self.intersection_id.clone(),
                    reason: if claim_id.is_some() {
                        ReleaseReason::Departed
                    } else {
                        ReleaseReason::Withdrawn
                    },
                }),
            ),
            VehicleAction::ReportMetric { waited } => Envelope::topic(
                me,
                TOPIC_METRICS,
                now,
                Payload::MetricReport(MetricReport {
                    intersection_id: self.intersection_id.clone(),
                    waiting_time: waited as f64,
                    throughput_count: 1,
                    source: MetricSource::Vehicle { vehicle_id: self.id },
                }),
            ),
        }
    }

    fn event_for(&self, envelope: Envelope) -> Result<VehicleEvent, ProtocolError> {
        match envelope.payload {
            Payload::PhaseBroadcast(b) if b.intersection_id == self.intersection_id => {
                Ok(VehicleEvent::PhaseObserved {
                    now: b.tick,
                    green: b.is_green(&self.lane),
                })
            }
            Payload::PhaseBroadcast(b) => Err(ProtocolError::UnknownIntersection(b.intersection_id)),
            Payload::ClaimGrant(g) => Ok(VehicleEvent::ClaimGranted {
                claim_id: g.claim.claim_id,
            }),
            Payload::ClaimRelease(_) => Ok(VehicleEvent::ClaimReleased),
            other => Err(ProtocolError::MisroutedMessage {
                kind: other.message_type().to_string(),
                receiver: Address::vehicle(self.id).to_string(),
            }),
        }
    }
}

/// Runs a vehicle agent until it departs. Returns its wait in ticks, or
/// `None` if the bus shut down first.
pub async fn run_vehicle_agent(
    mut agent: VehicleAgent,
    mut mailbox: Mailbox,
    bus: MessageBus,
    clock: SimClock,
) -> Option<Tick> {
    let me = mailbox.address().clone();
    bus.subscribe(&me, &phase_topic(&agent.intersection_id));
    let mut ticker = interval(clock.tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = agent.on_event(VehicleEvent::Approach { now: clock.now() });
    debug!(
        "Vehicle {} ({}) approaching {} on lane {}",
        agent.id, agent.vehicle_type, agent.intersection_id, agent.lane
    );

    loop {
        for action in pending.drain(..) {
            let envelope = agent.envelope_for(action, clock.now());
            if let Err(e) = bus.send(envelope) {
                warn!("Vehicle {} could not send {:?}: {}", agent.id, action, e);
            }
        }
        if let VehicleState::Departed { waited } = agent.state() {
            info!(
                "Vehicle {} departed {} after waiting {} ticks",
                agent.id, agent.intersection_id, waited
            );
            bus.deregister(&me);
            return Some(waited);
        }

        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { return None };
                match agent.event_for(envelope) {
                    Ok(event) => pending = agent.on_event(event),
                    Err(e) => warn!("Vehicle {} ignored message: {}", agent.id, e),
                }
            }
            _ = ticker.tick() => {
                pending = agent.on_event(VehicleEvent::Tick { now: clock.now() });
            }
        }
    }
}
