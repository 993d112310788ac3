use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::ProtocolError;
use crate::models::intersection::IntersectionId;
use crate::shared_data::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionKind {
    Weather,
    Construction,
    Incident,
    /// Produced by the congestion predictor.
    Congestion,
}

/// A predicted disruption. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionEvent {
    pub kind: DisruptionKind,
    pub area: Vec<IntersectionId>,
    pub severity: f64,
    pub valid_from: Tick,
    pub valid_to: Tick,
}

impl DisruptionEvent {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let malformed = |reason: String| ProtocolError::MalformedPayload {
            kind: "DISRUPTION_EVENT".to_string(),
            reason,
        };
        if !(0.0..=1.0).contains(&self.severity) || self.severity.is_nan() {
            return Err(malformed(format!("severity {} outside [0,1]", self.severity)));
        }
        if self.valid_to <= self.valid_from {
            return Err(malformed(format!(
                "empty validity window {}..{}",
                self.valid_from, self.valid_to
            )));
        }
        if self.area.is_empty() {
            return Err(malformed("empty area".to_string()));
        }
        Ok(())
    }

    pub fn is_valid_at(&self, now: Tick) -> bool {
        self.valid_from <= now && now < self.valid_to
    }

    pub fn covers(&self, intersection: &IntersectionId) -> bool {
        self.area.contains(intersection)
    }

    fn area_key(&self) -> BTreeSet<IntersectionId> {
        self.area.iter().cloned().collect()
    }
}

/// Outcome of applying an event to a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerChange {
    Inserted,
    /// Replaced an older event for the same kind and area.
    Superseded,
    /// Same kind, area and validity window as the stored event.
    Duplicate,
    /// Older than the stored event for the same kind and area.
    Outdated,
}

/// Disruption events known to one consumer, keyed by (kind, area).
///
/// Redelivery of an identical event is a no-op, so weights derived from the
/// ledger are independent of how many times an event arrived.
#[derive(Debug, Clone, Default)]
pub struct DisruptionLedger {
    events: HashMap<(DisruptionKind, BTreeSet<IntersectionId>), DisruptionEvent>,
}

impl DisruptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: DisruptionEvent) -> Result<LedgerChange, ProtocolError> {
        event.validate()?;
        let key = (event.kind, event.area_key());
        let change = match self.events.get(&key) {
            None => LedgerChange::Inserted,
            Some(stored)
                if stored.valid_from == event.valid_from && stored.valid_to == event.valid_to =>
            {
                return Ok(LedgerChange::Duplicate);
            }
            Some(stored) if event.valid_from < stored.valid_from => {
                return Ok(LedgerChange::Outdated);
            }
            Some(_) => LedgerChange::Superseded,
        };
        self.events.insert(key, event);
        Ok(change)
    }

    /// Events in force at `intersection` at `now`.
    pub fn active_for<'a>(
        &'a self,
        intersection: &'a IntersectionId,
        now: Tick,
    ) -> impl Iterator<Item = &'a DisruptionEvent> + 'a {
        self.events
            .values()
            .filter(move |e| e.is_valid_at(now) && e.covers(intersection))
    }

    /// Highest active severity per kind at `intersection`.
    pub fn severity_by_kind(
        &self,
        intersection: &IntersectionId,
        now: Tick,
    ) -> HashMap<DisruptionKind, f64> {
        let mut out: HashMap<DisruptionKind, f64> = HashMap::new();
        for event in self.active_for(intersection, now) {
            let entry = out.entry(event.kind).or_insert(0.0);
            *entry = entry.max(event.severity);
        }
        out
    }

    /// Highest active severity of any kind at `intersection`; 0 when none.
    pub fn max_severity(&self, intersection: &IntersectionId, now: Tick) -> f64 {
        self.active_for(intersection, now)
            .map(|e| e.severity)
            .fold(0.0, f64::max)
    }

    /// Drops events whose window has closed.
    pub fn prune(&mut self, now: Tick) {
        self.events.retain(|_, e| e.valid_to > now);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
