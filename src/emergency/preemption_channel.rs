//! Emergency preemption: at most one active claim per intersection, later
//! requests wait in arrival order.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::communication::channel::{Address, Mailbox, MessageBus};
use crate::communication::messages::{
    ClaimGrant, ClaimRelease, ClaimRequest, Envelope, Payload, ReleaseReason,
};
use crate::error::{ClaimConflict, PreemptionError, ProtocolError};
use crate::global_variables::ADDR_PREEMPTION;
use crate::models::intersection::{IntersectionId, LaneId};
use crate::models::vehicle::VehicleId;
use crate::shared_data::{SimClock, Tick};

/// Standing right-of-way override held by one emergency vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyClaim {
    pub claim_id: Uuid,
    pub vehicle_id: VehicleId,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    pub issued_at: Tick,
    pub expires_at: Tick,
}

impl EmergencyClaim {
    pub fn is_active(&self, now: Tick) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
struct PendingClaim {
    claim_id: Uuid,
    vehicle_id: VehicleId,
    lane: LaneId,
    eta: Tick,
}

#[derive(Debug, Default)]
struct IntersectionClaims {
    active: Option<EmergencyClaim>,
    queue: VecDeque<PendingClaim>,
}

/// State change produced by the preemption channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEvent {
    Granted(EmergencyClaim),
    Released {
        claim: EmergencyClaim,
        reason: ReleaseReason,
    },
    Withdrawn {
        claim_id: Uuid,
        vehicle_id: VehicleId,
        intersection_id: IntersectionId,
    },
}

/// Owner of every emergency claim. The only place claims are created or ended.
pub struct PreemptionChannel {
    grace: Tick,
    lanes: HashMap<IntersectionId, HashSet<LaneId>>,
    claims: HashMap<IntersectionId, IntersectionClaims>,
}

impl PreemptionChannel {
    pub fn new(
        topology: impl IntoIterator<Item = (IntersectionId, Vec<LaneId>)>,
        grace: Tick,
    ) -> Self {
        let lanes: HashMap<IntersectionId, HashSet<LaneId>> = topology
            .into_iter()
            .map(|(id, lanes)| (id, lanes.into_iter().collect()))
            .collect();
        let claims = lanes
            .keys()
            .map(|id| (id.clone(), IntersectionClaims::default()))
            .collect();
        Self {
            grace: grace.max(1),
            lanes,
            claims,
        }
    }

    fn slot(&mut self, intersection: &IntersectionId) -> Result<&mut IntersectionClaims, ProtocolError> {
        self.claims
            .get_mut(intersection)
            .ok_or_else(|| ProtocolError::UnknownIntersection(intersection.clone()))
    }

    /// Grants immediately if the intersection is free, otherwise queues the
    /// request behind the active claim and returns [`ClaimConflict`].
    /// Repeating a request is idempotent.
    pub fn request_claim(
        &mut self,
        vehicle_id: VehicleId,
        intersection_id: &IntersectionId,
        lane: &LaneId,
        eta: Tick,
        now: Tick,
    ) -> Result<EmergencyClaim, PreemptionError> {
        let known_lane = self
            .lanes
            .get(intersection_id)
            .ok_or_else(|| ProtocolError::UnknownIntersection(intersection_id.clone()))?
            .contains(lane);
        if !known_lane {
            return Err(ProtocolError::UnknownLane {
                intersection: intersection_id.clone(),
                lane: lane.clone(),
            }
            .into());
        }
        let grace = self.grace;
        let slot = self.slot(intersection_id)?;

        if let Some(active) = &slot.active {
            if active.vehicle_id == vehicle_id {
                return Ok(active.clone());
            }
            let active_claim = active.claim_id;
            let (queued_claim, position) =
                match slot.queue.iter().position(|p| p.vehicle_id == vehicle_id) {
                    Some(i) => (slot.queue[i].claim_id, i + 1),
                    None => {
                        let claim_id = Uuid::new_v4();
                        slot.queue.push_back(PendingClaim {
                            claim_id,
                            vehicle_id,
                            lane: lane.clone(),
                            eta,
                        });
                        (claim_id, slot.queue.len())
                    }
                };
            return Err(ClaimConflict {
                intersection: intersection_id.clone(),
                active_claim,
                queued_claim,
                position,
            }
            .into());
        }

        let claim = EmergencyClaim {
            claim_id: Uuid::new_v4(),
            vehicle_id,
            intersection_id: intersection_id.clone(),
            lane: lane.clone(),
            issued_at: now,
            expires_at: eta.max(now).saturating_add(grace),
        };
        slot.active = Some(claim.clone());
        Ok(claim)
    }

    /// Ends an active claim (promoting the next queued one) or withdraws a
    /// queued request.
    pub fn release_claim(&mut self, claim_id: Uuid, now: Tick) -> Result<Vec<ClaimEvent>, ProtocolError> {
        let grace = self.grace;
        for (intersection, slot) in self.claims.iter_mut() {
            if slot.active.as_ref().map(|c| c.claim_id) == Some(claim_id) {
                let mut events = Vec::new();
                if let Some(claim) = slot.active.take() {
                    events.push(ClaimEvent::Released {
                        claim,
                        reason: ReleaseReason::Departed,
                    });
                }
                events.extend(promote(intersection, slot, now, grace));
                return Ok(events);
            }
            if let Some(i) = slot.queue.iter().position(|p| p.claim_id == claim_id) {
                if let Some(pending) = slot.queue.remove(i) {
                    return Ok(vec![ClaimEvent::Withdrawn {
                        claim_id,
                        vehicle_id: pending.vehicle_id,
                        intersection_id: intersection.clone(),
                    }]);
                }
            }
        }
        Err(ProtocolError::UnknownClaim(claim_id))
    }

    /// Releases whatever `vehicle_id` holds or waits for at `intersection_id`.
    pub fn release_vehicle(
        &mut self,
        vehicle_id: VehicleId,
        intersection_id: &IntersectionId,
        now: Tick,
    ) -> Result<Vec<ClaimEvent>, ProtocolError> {
        let slot = self.slot(intersection_id)?;
        let claim_id = slot
            .active
            .iter()
            .map(|c| (c.vehicle_id, c.claim_id))
            .chain(slot.queue.iter().map(|p| (p.vehicle_id, p.claim_id)))
            .find(|(v, _)| *v == vehicle_id)
            .map(|(_, id)| id);
        match claim_id {
            Some(id) => self.release_claim(id, now),
            None => Ok(Vec::new()),
        }
    }

    /// Ends claims whose expiry has passed.
    pub fn expire(&mut self, now: Tick) -> Vec<ClaimEvent> {
        let grace = self.grace;
        let mut events = Vec::new();
        for (intersection, slot) in self.claims.iter_mut() {
            while let Some(claim) = slot.active.take() {
                if claim.is_active(now) {
                    slot.active = Some(claim);
                    break;
                }
                info!(
                    "Emergency claim {} at {} expired without release",
                    claim.claim_id, intersection
                );
                events.push(ClaimEvent::Released {
                    claim,
                    reason: ReleaseReason::Expired,
                });
                events.extend(promote(intersection, slot, now, grace));
            }
        }
        events
    }

    pub fn active_claim(&self, intersection: &IntersectionId) -> Option<&EmergencyClaim> {
        self.claims.get(intersection).and_then(|s| s.active.as_ref())
    }

    pub fn queue_len(&self, intersection: &IntersectionId) -> usize {
        self.claims.get(intersection).map(|s| s.queue.len()).unwrap_or(0)
    }
}

fn promote(
    intersection: &IntersectionId,
    slot: &mut IntersectionClaims,
    now: Tick,
    grace: Tick,
) -> Option<ClaimEvent> {
    let next = slot.queue.pop_front()?;
    let claim = EmergencyClaim {
        claim_id: next.claim_id,
        vehicle_id: next.vehicle_id,
        intersection_id: intersection.clone(),
        lane: next.lane,
        issued_at: now,
        expires_at: next.eta.max(now).saturating_add(grace),
    };
    slot.active = Some(claim.clone());
    Some(ClaimEvent::Granted(claim))
}

/// Runs the preemption channel as an agent: claim requests and releases come
/// in on `mailbox`, grants and releases go out to vehicles and controllers.
pub async fn run_preemption_channel(
    mut channel: PreemptionChannel,
    mut mailbox: Mailbox,
    bus: MessageBus,
    clock: SimClock,
) {
    let me = Address::new(ADDR_PREEMPTION);
    let mut ticker = interval(clock.tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                let now = clock.now();
                let events = handle_envelope(&mut channel, envelope, now);
                publish_events(&bus, &me, events, now);
            }
            _ = ticker.tick() => {
                let now = clock.now();
                let events = channel.expire(now);
                publish_events(&bus, &me, events, now);
            }
        }
    }
    info!("Preemption channel stopped");
}

fn handle_envelope(channel: &mut PreemptionChannel, envelope: Envelope, now: Tick) -> Vec<ClaimEvent> {
    match envelope.payload {
        Payload::ClaimRequest(ClaimRequest {
            vehicle_id,
            intersection_id,
            lane,
            eta,
        }) => match channel.request_claim(vehicle_id, &intersection_id, &lane, eta, now) {
            Ok(claim) => vec![ClaimEvent::Granted(claim)],
            Err(PreemptionError::Queued(conflict)) => {
                info!("Vehicle {} waits for preemption: {}", vehicle_id, conflict);
                Vec::new()
            }
            Err(PreemptionError::Protocol(e)) => {
                warn!("Rejected claim request from {}: {}", envelope.from, e);
                Vec::new()
            }
        },
        Payload::ClaimRelease(release) => {
            let result = match release.claim_id {
                Some(id) => channel.release_claim(id, now),
                None => channel.release_vehicle(release.vehicle_id, &release.intersection_id, now),
            };
            result.unwrap_or_else(|e| {
                warn!("Rejected claim release from {}: {}", envelope.from, e);
                Vec::new()
            })
        }
        other => {
            warn!(
                "{}",
                ProtocolError::MisroutedMessage {
                    kind: other.message_type().to_string(),
                    receiver: ADDR_PREEMPTION.to_string(),
                }
            );
            Vec::new()
        }
    }
}

fn publish_events(bus: &MessageBus, me: &Address, events: Vec<ClaimEvent>, now: Tick) {
    for event in events {
        let (intersection, vehicle, payload) = match event {
            ClaimEvent::Granted(claim) => {
                info!(
                    "Granted emergency claim {} to vehicle {} on {} lane {} until tick {}",
                    claim.claim_id, claim.vehicle_id, claim.intersection_id, claim.lane, claim.expires_at
                );
                (
                    claim.intersection_id.clone(),
                    claim.vehicle_id,
                    Payload::ClaimGrant(ClaimGrant { claim }),
                )
            }
            ClaimEvent::Released { claim, reason } => {
                info!("Released emergency claim {} ({:?})", claim.claim_id, reason);
                (
                    claim.intersection_id.clone(),
                    claim.vehicle_id,
                    Payload::ClaimRelease(ClaimRelease {
                        claim_id: Some(claim.claim_id),
                        vehicle_id: claim.vehicle_id,
                        intersection_id: claim.intersection_id,
                        reason,
                    }),
                )
            }
            ClaimEvent::Withdrawn { .. } => continue,
        };
        for to in [Address::controller(&intersection), Address::vehicle(vehicle)] {
            // Departed vehicles have already left the bus.
            if let Err(e) = bus.send(Envelope::direct(me.clone(), to, now, payload.clone())) {
                log::debug!("Claim notification not delivered: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> PreemptionChannel {
        PreemptionChannel::new(
            vec![(
                IntersectionId::from("I1"),
                vec![LaneId::from("N"), LaneId::from("E")],
            )],
            5,
        )
    }

    #[test]
    fn first_request_is_granted_with_expiry_after_eta() {
        let mut ch = channel();
        let claim = ch
            .request_claim(VehicleId(1), &"I1".into(), &"E".into(), 8, 2)
            .unwrap();
        assert_eq!(claim.issued_at, 2);
        assert_eq!(claim.expires_at, 13);
        assert_eq!(ch.active_claim(&"I1".into()), Some(&claim));
    }

    #[test]
    fn second_request_queues_in_arrival_order() {
        let mut ch = channel();
        let first = ch
            .request_claim(VehicleId(1), &"I1".into(), &"E".into(), 3, 0)
            .unwrap();
        let err = ch
            .request_claim(VehicleId(2), &"I1".into(), &"N".into(), 4, 1)
            .unwrap_err();
        let PreemptionError::Queued(conflict) = err else {
            panic!("expected queueing");
        };
        assert_eq!(conflict.active_claim, first.claim_id);
        assert_eq!(conflict.position, 1);
        let third = ch
            .request_claim(VehicleId(3), &"I1".into(), &"N".into(), 4, 1)
            .unwrap_err();
        assert!(matches!(third, PreemptionError::Queued(ClaimConflict { position: 2, .. })));
        assert_eq!(ch.active_claim(&"I1".into()).unwrap().vehicle_id, VehicleId(1));

        let events = ch.release_claim(first.claim_id, 6).unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            ClaimEvent::Granted(claim) => {
                assert_eq!(claim.vehicle_id, VehicleId(2));
                assert_eq!(claim.claim_id, conflict.queued_claim);
                assert_eq!(claim.expires_at, 11);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let mut ch = channel();
        let a = ch
            .request_claim(VehicleId(1), &"I1".into(), &"E".into(), 3, 0)
            .unwrap();
        let b = ch
            .request_claim(VehicleId(1), &"I1".into(), &"E".into(), 3, 1)
            .unwrap();
        assert_eq!(a, b);
        ch.request_claim(VehicleId(2), &"I1".into(), &"E".into(), 3, 1)
            .unwrap_err();
        ch.request_claim(VehicleId(2), &"I1".into(), &"E".into(), 3, 2)
            .unwrap_err();
        assert_eq!(ch.queue_len(&"I1".into()), 1);
    }

    #[test]
    fn unreleased_claim_expires_and_promotes_next() {
        let mut ch = channel();
        ch.request_claim(VehicleId(1), &"I1".into(), &"E".into(), 2, 0)
            .unwrap();
        ch.request_claim(VehicleId(2), &"I1".into(), &"N".into(), 2, 1)
            .unwrap_err();
        assert!(ch.expire(6).is_empty());
        let events = ch.expire(7);
        assert!(matches!(
            events[0],
            ClaimEvent::Released {
                reason: ReleaseReason::Expired,
                ..
            }
        ));
        let active = ch.active_claim(&"I1".into()).unwrap();
        assert_eq!(active.vehicle_id, VehicleId(2));
        assert_eq!(active.expires_at, 12);
    }

    #[test]
    fn far_future_eta_saturates_expiry() {
        let mut ch = channel();
        let claim = ch
            .request_claim(VehicleId(1), &"I1".into(), &"E".into(), u64::MAX, 0)
            .unwrap();
        assert_eq!(claim.expires_at, u64::MAX);
        ch.request_claim(VehicleId(2), &"I1".into(), &"N".into(), u64::MAX, 1)
            .unwrap_err();
        let events = ch.release_claim(claim.claim_id, 2).unwrap();
        let ClaimEvent::Granted(next) = &events[1] else {
            panic!("expected promotion, got {:?}", events[1]);
        };
        assert_eq!(next.expires_at, u64::MAX);
        assert!(ch.expire(1_000).is_empty());
    }

    #[test]
    fn queued_vehicle_can_withdraw() {
        let mut ch = channel();
        ch.request_claim(VehicleId(1), &"I1".into(), &"E".into(), 2, 0)
            .unwrap();
        ch.request_claim(VehicleId(2), &"I1".into(), &"N".into(), 2, 0)
            .unwrap_err();
        let events = ch.release_vehicle(VehicleId(2), &"I1".into(), 1).unwrap();
        assert!(matches!(events[0], ClaimEvent::Withdrawn { .. }));
        assert_eq!(ch.queue_len(&"I1".into()), 0);
        assert_eq!(ch.active_claim(&"I1".into()).unwrap().vehicle_id, VehicleId(1));
    }

    #[test]
    fn rejects_unknown_lane_and_claim() {
        let mut ch = channel();
        assert!(matches!(
            ch.request_claim(VehicleId(1), &"I1".into(), &"Z".into(), 2, 0),
            Err(PreemptionError::Protocol(ProtocolError::UnknownLane { .. }))
        ));
        assert!(matches!(
            ch.request_claim(VehicleId(1), &"I7".into(), &"N".into(), 2, 0),
            Err(PreemptionError::Protocol(ProtocolError::UnknownIntersection(_)))
        ));
        assert!(ch.release_claim(Uuid::new_v4(), 0).is_err());
    }
}
