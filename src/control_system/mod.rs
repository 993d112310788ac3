pub mod phase_scheduler;
pub mod traffic_light_controller;

pub use phase_scheduler::{Decision, PhaseDemand, ScoringWeights, SwitchReason};
pub use traffic_light_controller::{run_signal_controller, ControllerSettings, SignalController};
