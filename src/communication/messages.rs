use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::communication::channel::Address;
use crate::emergency::preemption_channel::EmergencyClaim;
use crate::error::ProtocolError;
use crate::models::disruption::DisruptionEvent;
use crate::models::intersection::{IntersectionId, LaneId, SignalState};
use crate::models::vehicle::{PriorityClass, VehicleId, VehicleType};
use crate::shared_data::{MetricReport, Tick};

/// Wire name of every message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Arrival,
    Departure,
    PhaseRequest,
    PhaseBroadcast,
    ClaimRequest,
    ClaimGrant,
    ClaimRelease,
    DisruptionEvent,
    CorridorHint,
    MetricReport,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Arrival,
        MessageType::Departure,
        MessageType::PhaseRequest,
        MessageType::PhaseBroadcast,
        MessageType::ClaimRequest,
        MessageType::ClaimGrant,
        MessageType::ClaimRelease,
        MessageType::DisruptionEvent,
        MessageType::CorridorHint,
        MessageType::MetricReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Arrival => "ARRIVAL",
            MessageType::Departure => "DEPARTURE",
            MessageType::PhaseRequest => "PHASE_REQUEST",
            MessageType::PhaseBroadcast => "PHASE_BROADCAST",
            MessageType::ClaimRequest => "CLAIM_REQUEST",
            MessageType::ClaimGrant => "CLAIM_GRANT",
            MessageType::ClaimRelease => "CLAIM_RELEASE",
            MessageType::DisruptionEvent => "DISRUPTION_EVENT",
            MessageType::CorridorHint => "CORRIDOR_HINT",
            MessageType::MetricReport => "METRIC_REPORT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMessageType(s.to_string()))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub vehicle_id: VehicleId,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    pub priority: PriorityClass,
    pub vehicle_type: VehicleType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Departure {
    pub vehicle_id: VehicleId,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    pub waiting_time: Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRequest {
    /// `None` for requests aggregated from detectors rather than a vehicle.
    pub vehicle_id: Option<VehicleId>,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    pub priority: PriorityClass,
    pub requested_at: Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseBroadcast {
    pub intersection_id: IntersectionId,
    pub tick: Tick,
    pub signal: SignalState,
    pub phase_name: Option<String>,
    pub green_lanes: Vec<LaneId>,
}

impl PhaseBroadcast {
    pub fn is_green(&self, lane: &LaneId) -> bool {
        self.green_lanes.contains(lane)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub vehicle_id: VehicleId,
    pub intersection_id: IntersectionId,
    pub lane: LaneId,
    /// Estimated arrival tick at the stop line.
    pub eta: Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGrant {
    pub claim: EmergencyClaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Departed,
    Expired,
    /// Queued request abandoned before it was granted.
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRelease {
    /// `None` when the vehicle never learned its claim id (still queued).
    pub claim_id: Option<Uuid>,
    pub vehicle_id: VehicleId,
    pub intersection_id: IntersectionId,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DisruptionUpdate {
    Event { event: DisruptionEvent },
    /// The predictor cannot be reached; consumers drop disruption weighting.
    FeedUnavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorridorHint {
    pub corridor: String,
    pub intersection_id: IntersectionId,
    pub favor_phase: String,
    /// Scales the controller's hint bonus, in [0,1].
    pub strength: f64,
    pub issued_at: Tick,
    pub valid_until: Tick,
}

/// Closed set of payloads, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Arrival(Arrival),
    Departure(Departure),
    PhaseRequest(PhaseRequest),
    PhaseBroadcast(PhaseBroadcast),
    ClaimRequest(ClaimRequest),
    ClaimGrant(ClaimGrant),
    ClaimRelease(ClaimRelease),
    DisruptionEvent(DisruptionUpdate),
    CorridorHint(CorridorHint),
    MetricReport(MetricReport),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Arrival(_) => MessageType::Arrival,
            Payload::Departure(_) => MessageType::Departure,
            Payload::PhaseRequest(_) => MessageType::PhaseRequest,
            Payload::PhaseBroadcast(_) => MessageType::PhaseBroadcast,
            Payload::ClaimRequest(_) => MessageType::ClaimRequest,
            Payload::ClaimGrant(_) => MessageType::ClaimGrant,
            Payload::ClaimRelease(_) => MessageType::ClaimRelease,
            Payload::DisruptionEvent(_) => MessageType::DisruptionEvent,
            Payload::CorridorHint(_) => MessageType::CorridorHint,
            Payload::MetricReport(_) => MessageType::MetricReport,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Payload::Arrival(p) => serde_json::to_value(p),
            Payload::Departure(p) => serde_json::to_value(p),
            Payload::PhaseRequest(p) => serde_json::to_value(p),
            Payload::PhaseBroadcast(p) => serde_json::to_value(p),
            Payload::ClaimRequest(p) => serde_json::to_value(p),
            Payload::ClaimGrant(p) => serde_json::to_value(p),
            Payload::ClaimRelease(p) => serde_json::to_value(p),
            Payload::DisruptionEvent(p) => serde_json::to_value(p),
            Payload::CorridorHint(p) => serde_json::to_value(p),
            Payload::MetricReport(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: MessageType, value: serde_json::Value) -> Result<Self, ProtocolError> {
        fn typed<T: DeserializeOwned>(
            kind: MessageType,
            value: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }
        Ok(match kind {
            MessageType::Arrival => Payload::Arrival(typed(kind, value)?),
            MessageType::Departure => Payload::Departure(typed(kind, value)?),
            MessageType::PhaseRequest => Payload::PhaseRequest(typed(kind, value)?),
            MessageType::PhaseBroadcast => Payload::PhaseBroadcast(typed(kind, value)?),
            MessageType::ClaimRequest => Payload::ClaimRequest(typed(kind, value)?),
            MessageType::ClaimGrant => Payload::ClaimGrant(typed(kind, value)?),
            MessageType::ClaimRelease => Payload::ClaimRelease(typed(kind, value)?),
            MessageType::DisruptionEvent => Payload::DisruptionEvent(typed(kind, value)?),
            MessageType::CorridorHint => Payload::CorridorHint(typed(kind, value)?),
            MessageType::MetricReport => Payload::MetricReport(typed(kind, value)?),
        })
    }
}

/// Where an envelope goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Direct(Address),
    Topic(String),
}

/// Message envelope exchanged between agents.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: Address,
    pub to: Destination,
    pub timestamp: Tick,
    pub payload: Payload,
}

/// Flat JSON form: `{from, to|topic, type, payload, timestamp}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
    timestamp: Tick,
}

impl Envelope {
    pub fn direct(from: Address, to: Address, timestamp: Tick, payload: Payload) -> Self {
        Self {
            from,
            to: Destination::Direct(to),
            timestamp,
            payload,
        }
    }

    pub fn topic(from: Address, topic: impl Into<String>, timestamp: Tick, payload: Payload) -> Self {
        Self {
            from,
            to: Destination::Topic(topic.into()),
            timestamp,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let malformed = |e: serde_json::Error| ProtocolError::MalformedPayload {
            kind: self.message_type().to_string(),
            reason: e.to_string(),
        };
        let (to, topic) = match &self.to {
            Destination::Direct(addr) => (Some(addr.to_string()), None),
            Destination::Topic(t) => (None, Some(t.clone())),
        };
        let wire = WireEnvelope {
            from: self.from.to_string(),
            to,
            topic,
            kind: self.message_type().as_str().to_string(),
            payload: self.payload.to_value().map_err(malformed)?,
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&wire).map_err(malformed)
    }

    /// Decodes an envelope at the channel boundary. Unknown types and payloads
    /// that do not match their declared type are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload {
                kind: "envelope".to_string(),
                reason: e.to_string(),
            })?;
        let kind = MessageType::parse(&wire.kind)?;
        let to = match (wire.to, wire.topic) {
            (Some(addr), None) => Destination::Direct(Address::new(addr)),
            (None, Some(topic)) => Destination::Topic(topic),
            _ => {
                return Err(ProtocolError::MalformedPayload {
                    kind: "envelope".to_string(),
                    reason: "exactly one of `to` or `topic` is required".to_string(),
                })
            }
        };
        Ok(Self {
            from: Address::new(wire.from),
            to,
            timestamp: wire.timestamp,
            payload: Payload::from_value(kind, wire.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival_envelope() -> Envelope {
        Envelope::direct(
            Address::new("vehicle/7"),
            Address::new("controller/I1"),
            12,
            Payload::Arrival(Arrival {
                vehicle_id: VehicleId(7),
                intersection_id: "I1".into(),
                lane: "N".into(),
                priority: PriorityClass::Normal,
                vehicle_type: VehicleType::Car,
            }),
        )
    }

    #[test]
    fn encodes_flat_envelope() {
        let bytes = arrival_envelope().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "ARRIVAL");
        assert_eq!(json["to"], "controller/I1");
        assert_eq!(json["payload"]["lane"], "N");
        assert!(json.get("topic").is_none());
        assert_eq!(Envelope::decode(&bytes).unwrap(), arrival_envelope());
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = br#"{"from":"x","to":"y","type":"TELEPORT","payload":{},"timestamp":1}"#;
        assert_eq!(
            Envelope::decode(raw).unwrap_err(),
            ProtocolError::UnknownMessageType("TELEPORT".to_string())
        );
    }

    #[test]
    fn rejects_payload_that_does_not_match_type() {
        let raw = br#"{"from":"x","to":"y","type":"DEPARTURE","payload":{"lane":"N"},"timestamp":1}"#;
        match Envelope::decode(raw).unwrap_err() {
            ProtocolError::MalformedPayload { kind, .. } => assert_eq!(kind, "DEPARTURE"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn requires_exactly_one_destination() {
        let raw = br#"{"from":"x","type":"CORRIDOR_HINT","payload":{},"timestamp":1}"#;
        assert!(matches!(
            Envelope::decode(raw),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn disruption_updates_carry_status_tag() {
        let env = Envelope::topic(
            Address::new("disruption_feed"),
            "disruptions",
            3,
            Payload::DisruptionEvent(DisruptionUpdate::FeedUnavailable {
                reason: "predictor offline".to_string(),
            }),
        );
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "DISRUPTION_EVENT");
        assert_eq!(json["payload"]["status"], "feed_unavailable");
        assert_eq!(json["topic"], "disruptions");
    }

    #[test]
    fn every_type_name_parses_back() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()).unwrap(), t);
        }
    }
}
