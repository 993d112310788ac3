use thiserror::Error;

use crate::models::intersection::{IntersectionId, LaneId};
use crate::shared_data::Tick;

/// Rejected messages. Logged by the receiving component, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },

    #[error("lane {lane} does not belong to intersection {intersection}")]
    UnknownLane {
        intersection: IntersectionId,
        lane: LaneId,
    },

    #[error("unknown intersection: {0}")]
    UnknownIntersection(IntersectionId),

    #[error("no agent registered at address {0}")]
    UnknownRecipient(String),

    #[error("unknown emergency claim {0}")]
    UnknownClaim(uuid::Uuid),

    #[error("{kind} message is not handled by {receiver}")]
    MisroutedMessage { kind: String, receiver: String },
}

/// A second claim for an intersection that already has an active one.
/// The request is queued, not refused.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("intersection {intersection} already preempted by claim {active_claim}; request {queued_claim} queued at position {position}")]
pub struct ClaimConflict {
    pub intersection: IntersectionId,
    pub active_claim: uuid::Uuid,
    pub queued_claim: uuid::Uuid,
    /// 1-based place in the waiting line.
    pub position: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreemptionError {
    #[error(transparent)]
    Queued(#[from] ClaimConflict),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures of the disruption predictor. Consumers fail open.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("disruption feed unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    #[error("stale state for corridor {corridor}: snapshot of {intersection} from tick {snapshot_tick}, aggregating at {now}")]
    StaleState {
        corridor: String,
        intersection: IntersectionId,
        snapshot_tick: Tick,
        now: Tick,
    },

    #[error("aggregation window missed: last ran at tick {last}, now {now}")]
    MissedWindow { last: Tick, now: Tick },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("csv sink error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("amqp sink error: {0}")]
    Amqp(#[from] amiquip::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sink {0} is closed")]
    Closed(String),
}
