//! Run configuration: topology, timing and weights. Loaded from TOML, every
//! section optional with documented defaults.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::control_system::phase_scheduler::{AdaptiveGreen, ScoringWeights};
use crate::control_system::traffic_light_controller::ControllerSettings;
use crate::coordinator::central_coordinator::{CoordinatorSettings, Corridor, CorridorMember};
use crate::error::ConfigError;
use crate::global_variables::{AMQP_URL, QUEUE_DISRUPTION_EVENTS, QUEUE_METRIC_REPORTS};
use crate::models::disruption::{DisruptionEvent, DisruptionKind};
use crate::models::intersection::{
    ConflictMatrix, Intersection, IntersectionId, LaneId, PhaseDef, PhaseId,
};
use crate::shared_data::Tick;
use crate::simulation_engine::vehicles::AgentSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wall-clock length of one tick.
    pub tick_millis: u64,
    pub clearance_ticks: Tick,
    pub default_min_green: Tick,
    pub default_max_green: Tick,
    pub record_timeout_ticks: Tick,
    pub metrics_period_ticks: Tick,
    /// Added to the green target per cycle while more than
    /// `busy_queue_len` vehicles wait.
    pub green_extend_ticks: Tick,
    /// Taken off the green target per cycle while fewer than
    /// `quiet_queue_len` vehicles wait.
    pub green_shrink_ticks: Tick,
    pub busy_queue_len: usize,
    pub quiet_queue_len: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            clearance_ticks: 2,
            default_min_green: 5,
            default_max_green: 20,
            record_timeout_ticks: 120,
            metrics_period_ticks: 10,
            green_extend_ticks: 2,
            green_shrink_ticks: 1,
            busy_queue_len: 10,
            quiet_queue_len: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Ticks a claim outlives its ETA.
    pub grace_ticks: Tick,
    /// How far ahead an emergency vehicle announces its ETA.
    pub claim_range_ticks: Tick,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            grace_ticks: 5,
            claim_range_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub patience_ticks: Tick,
    pub crossing_ticks: Tick,
    /// Chance per tick and intersection that a vehicle arrives.
    pub spawn_probability: f64,
    /// Cumulative type split: cars below `car_share`, then trucks, buses,
    /// and the remainder emergency vans.
    pub car_share: f64,
    pub truck_share: f64,
    pub bus_share: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            patience_ticks: 15,
            crossing_ticks: 2,
            spawn_probability: 0.3,
            car_share: 0.50,
            truck_share: 0.31,
            bus_share: 0.18,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisruptionConfig {
    pub poll_ticks: Tick,
    /// Enables the logistic congestion predictor.
    pub congestion: bool,
    /// Chance per poll of a random incident; 0 disables it.
    pub incident_probability: f64,
    /// Fixed events replayed by the feed.
    pub scripted: Vec<DisruptionEvent>,
}

impl Default for DisruptionConfig {
    fn default() -> Self {
        Self {
            poll_ticks: 5,
            congestion: true,
            incident_probability: 0.02,
            scripted: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub lanes: Vec<String>,
    pub min_green: Option<Tick>,
    pub max_green: Option<Tick>,
}

/// Phase to favour while a disruption of `kind` is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceRule {
    pub kind: DisruptionKind,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionConfig {
    pub id: String,
    pub lanes: Vec<String>,
    pub phases: Vec<PhaseConfig>,
    /// Conflicting phase-name pairs. Omitted: every distinct pair conflicts.
    #[serde(default)]
    pub conflicts: Option<Vec<[String; 2]>>,
    /// Phase name to start in. Omitted: the first phase.
    #[serde(default)]
    pub default_phase: Option<String>,
    #[serde(default)]
    pub resilience: Vec<ResilienceRule>,
}

impl IntersectionConfig {
    pub fn build(&self, timing: &TimingConfig) -> Result<Intersection, ConfigError> {
        let id = IntersectionId(self.id.clone());
        let phase_index = |name: &str| -> Result<PhaseId, ConfigError> {
            self.phases
                .iter()
                .position(|p| p.name == name)
                .map(PhaseId)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!("intersection {}: unknown phase {}", self.id, name))
                })
        };

        let phases: Vec<PhaseDef> = self
            .phases
            .iter()
            .map(|p| PhaseDef {
                name: p.name.clone(),
                lanes: p.lanes.iter().map(|l| LaneId(l.clone())).collect(),
                min_green: p.min_green.unwrap_or(timing.default_min_green),
                max_green: p.max_green.unwrap_or(timing.default_max_green),
            })
            .collect();

        let conflicts = match &self.conflicts {
            None => ConflictMatrix::all_conflicting(phases.len()),
            Some(pairs) => {
                let mut matrix = ConflictMatrix::new(phases.len());
                for [a, b] in pairs {
                    matrix.set_conflict(phase_index(a.as_str())?, phase_index(b.as_str())?);
                }
                matrix
            }
        };

        let default_phase = match &self.default_phase {
            Some(name) => phase_index(name.as_str())?,
            None => PhaseId(0),
        };

        let resilience = self
            .resilience
            .iter()
            .map(|rule| Ok((rule.kind, phase_index(rule.phase.as_str())?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Intersection::new(
            id,
            self.lanes.iter().map(|l| LaneId(l.clone())).collect(),
            phases,
            conflicts,
            default_phase,
            resilience,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub url: String,
    pub metrics_queue: String,
    pub disruption_queue: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: AMQP_URL.to_string(),
            metrics_queue: QUEUE_METRIC_REPORTS.to_string(),
            disruption_queue: QUEUE_DISRUPTION_EVENTS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seed for the vehicle spawner and the random incident predictor.
    pub seed: u64,
    /// CSV file for metric records; none disables the CSV sink.
    pub metrics_csv: Option<String>,
    pub timing: TimingConfig,
    pub scoring: ScoringWeights,
    pub emergency: EmergencyConfig,
    pub vehicles: VehicleConfig,
    pub disruptions: DisruptionConfig,
    pub coordinator: CoordinatorSettings,
    pub intersections: Vec<IntersectionConfig>,
    pub corridors: Vec<Corridor>,
    pub amqp: Option<AmqpConfig>,
}

fn four_way(id: &str) -> IntersectionConfig {
    let phase = |name: &str, lanes: [&str; 2]| PhaseConfig {
        name: name.to_string(),
        lanes: lanes.iter().map(|l| l.to_string()).collect(),
        min_green: None,
        max_green: None,
    };
    IntersectionConfig {
        id: id.to_string(),
        lanes: ["N", "S", "E", "W"].iter().map(|l| l.to_string()).collect(),
        phases: vec![phase("NS_GREEN", ["N", "S"]), phase("EW_GREEN", ["E", "W"])],
        conflicts: None,
        default_phase: None,
        resilience: [
            (DisruptionKind::Weather, "NS_GREEN"),
            (DisruptionKind::Construction, "EW_GREEN"),
            (DisruptionKind::Incident, "EW_GREEN"),
            (DisruptionKind::Congestion, "EW_GREEN"),
        ]
        .into_iter()
        .map(|(kind, phase)| ResilienceRule {
            kind,
            phase: phase.to_string(),
        })
        .collect(),
    }
}

impl Default for Config {
    /// Two four-way intersections joined by an east-west corridor.
    fn default() -> Self {
        Self {
            seed: 42,
            metrics_csv: Some("metric_reports.csv".to_string()),
            timing: TimingConfig::default(),
            scoring: ScoringWeights::default(),
            emergency: EmergencyConfig::default(),
            vehicles: VehicleConfig::default(),
            disruptions: DisruptionConfig::default(),
            coordinator: CoordinatorSettings::default(),
            intersections: vec![four_way("I1"), four_way("I2")],
            corridors: vec![Corridor {
                name: "main_ew".to_string(),
                members: ["I1", "I2"]
                    .iter()
                    .map(|id| CorridorMember {
                        intersection: IntersectionId::from(*id),
                        phase: "EW_GREEN".to_string(),
                    })
                    .collect(),
            }],
            amqp: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn build_intersections(&self) -> Result<Vec<Intersection>, ConfigError> {
        self.intersections
            .iter()
            .map(|i| i.build(&self.timing))
            .collect()
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            clearance_ticks: self.timing.clearance_ticks,
            record_timeout_ticks: self.timing.record_timeout_ticks,
            weights: self.scoring,
            adaptive: AdaptiveGreen {
                extend_ticks: self.timing.green_extend_ticks,
                shrink_ticks: self.timing.green_shrink_ticks,
                busy_queue: self.timing.busy_queue_len,
                quiet_queue: self.timing.quiet_queue_len,
            },
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            patience_ticks: self.vehicles.patience_ticks,
            crossing_ticks: self.vehicles.crossing_ticks,
            claim_eta_ticks: self.emergency.claim_range_ticks,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.timing.tick_millis == 0 {
            return invalid("timing.tick_millis must be positive".into());
        }
        if self.timing.quiet_queue_len > self.timing.busy_queue_len {
            return invalid(format!(
                "timing.quiet_queue_len {} above busy_queue_len {}",
                self.timing.quiet_queue_len, self.timing.busy_queue_len
            ));
        }
        let s = &self.scoring;
        if [s.count_weight, s.wait_weight, s.disruption_weight, s.hint_bonus]
            .iter()
            .any(|w| *w < 0.0 || w.is_nan())
        {
            return invalid("scoring weights must be non-negative".into());
        }
        if s.switch_threshold < 1.0 {
            return invalid(format!(
                "scoring.switch_threshold {} must be at least 1.0",
                s.switch_threshold
            ));
        }
        for (name, p) in [
            ("vehicles.spawn_probability", self.vehicles.spawn_probability),
            ("disruptions.incident_probability", self.disruptions.incident_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("{name} {p} outside [0,1]"));
            }
        }
        let v = &self.vehicles;
        if v.car_share < 0.0 || v.truck_share < 0.0 || v.bus_share < 0.0
            || v.car_share + v.truck_share + v.bus_share > 1.0 + 1e-9
        {
            return invalid("vehicle shares must be non-negative and sum to at most 1".into());
        }
        if self.intersections.is_empty() {
            return invalid("at least one intersection is required".into());
        }

        let mut phases_by_id: HashMap<IntersectionId, HashSet<String>> = HashMap::new();
        for intersection in self.build_intersections()? {
            let names = intersection.phases.iter().map(|p| p.name.clone()).collect();
            if phases_by_id.insert(intersection.id.clone(), names).is_some() {
                return invalid(format!("duplicate intersection id {}", intersection.id));
            }
        }
        for corridor in &self.corridors {
            for CorridorMember { intersection, phase } in &corridor.members {
                match phases_by_id.get(intersection) {
                    None => {
                        return invalid(format!(
                            "corridor {} references unknown intersection {}",
                            corridor.name, intersection
                        ))
                    }
                    Some(names) if !names.contains(phase) => {
                        return invalid(format!(
                            "corridor {}: intersection {} has no phase {}",
                            corridor.name, intersection, phase
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        for event in &self.disruptions.scripted {
            event
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("scripted disruption: {e}")))?;
        }
        Ok(())
    }
}
