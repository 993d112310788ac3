use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::ConfigError;
use crate::models::disruption::DisruptionKind;
use crate::shared_data::Tick;

/// Stable name of an intersection, e.g. `"I1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntersectionId(pub String);

impl fmt::Display for IntersectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IntersectionId {
    fn from(s: &str) -> Self {
        IntersectionId(s.to_string())
    }
}

/// Approach lane name, unique within its intersection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneId(pub String);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LaneId {
    fn from(s: &str) -> Self {
        LaneId(s.to_string())
    }
}

/// Index of a phase within its intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(pub usize);

/// A lane group that receives green together.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDef {
    /// Display name, e.g. `NS_GREEN`.
    pub name: String,
    pub lanes: Vec<LaneId>,
    pub min_green: Tick,
    pub max_green: Tick,
}

impl PhaseDef {
    pub fn serves(&self, lane: &LaneId) -> bool {
        self.lanes.contains(lane)
    }
}

/// Symmetric table of phase pairs that may never be green together.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictMatrix {
    size: usize,
    cells: Vec<bool>,
}

impl ConflictMatrix {
    /// No conflicts at all.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cells: vec![false; size * size],
        }
    }

    /// Every distinct pair conflicts.
    pub fn all_conflicting(size: usize) -> Self {
        let mut matrix = Self::new(size);
        for a in 0..size {
            for b in 0..size {
                if a != b {
                    matrix.cells[a * size + b] = true;
                }
            }
        }
        matrix
    }

    pub fn set_conflict(&mut self, a: PhaseId, b: PhaseId) {
        if a == b || a.0 >= self.size || b.0 >= self.size {
            return;
        }
        self.cells[a.0 * self.size + b.0] = true;
        self.cells[b.0 * self.size + a.0] = true;
    }

    pub fn conflicts(&self, a: PhaseId, b: PhaseId) -> bool {
        if a.0 >= self.size || b.0 >= self.size {
            return false;
        }
        self.cells[a.0 * self.size + b.0]
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Signal state of one intersection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalState {
    /// Normal operation: `phase` holds green since `since`.
    Green { phase: PhaseId, since: Tick },
    /// All-red interval between two conflicting phases.
    Clearance {
        from: PhaseId,
        to: PhaseId,
        since: Tick,
    },
    /// Green forced by an emergency claim.
    Preempted {
        phase: PhaseId,
        since: Tick,
        claim: uuid::Uuid,
    },
}

impl SignalState {
    /// Phase currently showing green, if any.
    pub fn green_phase(&self) -> Option<PhaseId> {
        match self {
            SignalState::Green { phase, .. } | SignalState::Preempted { phase, .. } => Some(*phase),
            SignalState::Clearance { .. } => None,
        }
    }

    pub fn since(&self) -> Tick {
        match self {
            SignalState::Green { since, .. }
            | SignalState::Clearance { since, .. }
            | SignalState::Preempted { since, .. } => *since,
        }
    }

    pub fn is_clearance(&self) -> bool {
        matches!(self, SignalState::Clearance { .. })
    }
}

/// One intersection's static topology plus its current signal state.
/// Owned and mutated by exactly one signal controller.
#[derive(Debug, Clone)]
pub struct Intersection {
    pub id: IntersectionId,
    pub lanes: Vec<LaneId>,
    pub phases: Vec<PhaseDef>,
    pub conflicts: ConflictMatrix,
    pub state: SignalState,
    pub default_phase: PhaseId,
    /// Phase preferred while a disruption of a given kind is active.
    pub resilience: HashMap<DisruptionKind, PhaseId>,
}

impl Intersection {
    /// Builds and validates an intersection, starting green on `default_phase`.
    pub fn new(
        id: IntersectionId,
        lanes: Vec<LaneId>,
        phases: Vec<PhaseDef>,
        conflicts: ConflictMatrix,
        default_phase: PhaseId,
        resilience: HashMap<DisruptionKind, PhaseId>,
    ) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::Invalid(format!("intersection {id} has no phases")));
        }
        if conflicts.size() != phases.len() {
            return Err(ConfigError::Invalid(format!(
                "intersection {id}: conflict matrix is {}x{} but there are {} phases",
                conflicts.size(),
                conflicts.size(),
                phases.len()
            )));
        }
        if default_phase.0 >= phases.len() {
            return Err(ConfigError::Invalid(format!(
                "intersection {id}: default phase {} out of range",
                default_phase.0
            )));
        }
        let known: HashSet<&LaneId> = lanes.iter().collect();
        for phase in &phases {
            if phase.min_green > phase.max_green {
                return Err(ConfigError::Invalid(format!(
                    "intersection {id}: phase {} has min_green {} above max_green {}",
                    phase.name, phase.min_green, phase.max_green
                )));
            }
            if let Some(lane) = phase.lanes.iter().find(|l| !known.contains(l)) {
                return Err(ConfigError::Invalid(format!(
                    "intersection {id}: phase {} references unknown lane {lane}",
                    phase.name
                )));
            }
        }
        if let Some(lane) = lanes.iter().find(|l| !phases.iter().any(|p| p.serves(l))) {
            return Err(ConfigError::Invalid(format!(
                "intersection {id}: lane {lane} is not served by any phase"
            )));
        }
        // A lane shared by two conflicting phases would turn green under both.
        for a in 0..phases.len() {
            for b in (a + 1)..phases.len() {
                if conflicts.conflicts(PhaseId(a), PhaseId(b))
                    && phases[a].lanes.iter().any(|l| phases[b].serves(l))
                {
                    return Err(ConfigError::Invalid(format!(
                        "intersection {id}: conflicting phases {} and {} share a lane",
                        phases[a].name, phases[b].name
                    )));
                }
            }
        }
        if let Some(phase) = resilience.values().find(|p| p.0 >= phases.len()) {
            return Err(ConfigError::Invalid(format!(
                "intersection {id}: resilience phase {} out of range",
                phase.0
            )));
        }

        Ok(Self {
            id,
            lanes,
            phases,
            conflicts,
            state: SignalState::Green {
                phase: default_phase,
                since: 0,
            },
            default_phase,
            resilience,
        })
    }

    pub fn has_lane(&self, lane: &LaneId) -> bool {
        self.lanes.contains(lane)
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn phase(&self, id: PhaseId) -> &PhaseDef {
        &self.phases[id.0]
    }

    pub fn phase_by_name(&self, name: &str) -> Option<PhaseId> {
        self.phases.iter().position(|p| p.name == name).map(PhaseId)
    }

    /// First phase that gives `lane` green.
    pub fn phase_for_lane(&self, lane: &LaneId) -> Option<PhaseId> {
        self.phases.iter().position(|p| p.serves(lane)).map(PhaseId)
    }

    /// Phases serving `lane`.
    pub fn phases_for_lane<'a>(&'a self, lane: &'a LaneId) -> impl Iterator<Item = PhaseId> + 'a {
        self.phases
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.serves(lane))
            .map(|(i, _)| PhaseId(i))
    }

    /// Lanes currently showing green.
    pub fn green_lanes(&self) -> Vec<LaneId> {
        match self.state.green_phase() {
            Some(phase) => self.phase(phase).lanes.clone(),
            None => Vec::new(),
        }
    }

    pub fn is_lane_green(&self, lane: &LaneId) -> bool {
        self.state
            .green_phase()
            .map(|p| self.phase(p).serves(lane))
            .unwrap_or(false)
    }

    /// Phases with at least one lane in `green`.
    pub fn phases_touched_by(&self, green: &[LaneId]) -> Vec<PhaseId> {
        self.phases
            .iter()
            .enumerate()
            .filter(|(_, p)| p.lanes.iter().any(|l| green.contains(l)))
            .map(|(i, _)| PhaseId(i))
            .collect()
    }

    /// True when `green` holds lanes of two phases marked as conflicting.
    pub fn has_conflicting_greens(&self, green: &[LaneId]) -> bool {
        let touched = self.phases_touched_by(green);
        touched.iter().enumerate().any(|(i, a)| {
            touched[i + 1..]
                .iter()
                .any(|b| self.conflicts.conflicts(*a, *b))
        })
    }

    /// Ticks spent in the current state.
    pub fn elapsed(&self, now: Tick) -> Tick {
        now.saturating_sub(self.state.since())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn two_phase(id: &str, min_green: Tick, max_green: Tick) -> Intersection {
        let lanes: Vec<LaneId> = ["N", "S", "E", "W"].iter().map(|l| LaneId::from(*l)).collect();
        let phases = vec![
            PhaseDef {
                name: "NS_GREEN".to_string(),
                lanes: vec![LaneId::from("N"), LaneId::from("S")],
                min_green,
                max_green,
            },
            PhaseDef {
                name: "EW_GREEN".to_string(),
                lanes: vec![LaneId::from("E"), LaneId::from("W")],
                min_green,
                max_green,
            },
        ];
        Intersection::new(
            IntersectionId::from(id),
            lanes,
            phases,
            ConflictMatrix::all_conflicting(2),
            PhaseId(0),
            HashMap::new(),
        )
        .expect("valid two-phase intersection")
    }

    #[test]
    fn conflict_matrix_is_symmetric() {
        let mut m = ConflictMatrix::new(3);
        m.set_conflict(PhaseId(0), PhaseId(2));
        assert!(m.conflicts(PhaseId(2), PhaseId(0)));
        assert!(!m.conflicts(PhaseId(0), PhaseId(1)));
        assert!(!m.conflicts(PhaseId(1), PhaseId(1)));
    }

    #[test]
    fn starts_green_on_default_phase() {
        let i = two_phase("I1", 5, 20);
        assert_eq!(i.state.green_phase(), Some(PhaseId(0)));
        assert!(i.is_lane_green(&LaneId::from("N")));
        assert!(!i.is_lane_green(&LaneId::from("E")));
        assert_eq!(i.phase_for_lane(&LaneId::from("W")), Some(PhaseId(1)));
        assert_eq!(i.phase_by_name("EW_GREEN"), Some(PhaseId(1)));
    }

    #[test]
    fn rejects_conflicting_phases_sharing_a_lane() {
        let lanes = vec![LaneId::from("N"), LaneId::from("E")];
        let phases = vec![
            PhaseDef {
                name: "A".into(),
                lanes: vec![LaneId::from("N"), LaneId::from("E")],
                min_green: 1,
                max_green: 5,
            },
            PhaseDef {
                name: "B".into(),
                lanes: vec![LaneId::from("E")],
                min_green: 1,
                max_green: 5,
            },
        ];
        let err = Intersection::new(
            "I9".into(),
            lanes,
            phases,
            ConflictMatrix::all_conflicting(2),
            PhaseId(0),
            HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("share a lane"));
    }

    #[test]
    fn rejects_unserved_lane() {
        let lanes = vec![LaneId::from("N"), LaneId::from("X")];
        let phases = vec![PhaseDef {
            name: "A".into(),
            lanes: vec![LaneId::from("N")],
            min_green: 1,
            max_green: 5,
        }];
        assert!(Intersection::new(
            "I9".into(),
            lanes,
            phases,
            ConflictMatrix::new(1),
            PhaseId(0),
            HashMap::new(),
        )
        .is_err());
    }

    #[test]
    fn clearance_shows_no_green() {
        let mut i = two_phase("I1", 5, 20);
        i.state = SignalState::Clearance {
            from: PhaseId(0),
            to: PhaseId(1),
            since: 3,
        };
        assert!(i.green_lanes().is_empty());
        assert!(!i.has_conflicting_greens(&i.green_lanes()));
        assert_eq!(i.elapsed(5), 2);
    }

    #[test]
    fn conflicting_lane_sets_are_detected() {
        let i = two_phase("I1", 5, 20);
        assert!(!i.has_conflicting_greens(&i.green_lanes()));
        let ns_and_east = vec![LaneId::from("N"), LaneId::from("S"), LaneId::from("E")];
        assert!(i.has_conflicting_greens(&ns_and_east));
        assert_eq!(i.phases_touched_by(&ns_and_east), vec![PhaseId(0), PhaseId(1)]);

        let mut open = two_phase("I1", 5, 20);
        open.conflicts = ConflictMatrix::new(2);
        assert!(!open.has_conflicting_greens(&ns_and_east));
    }
}
