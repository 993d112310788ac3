pub mod disruption_feed;
pub mod predictive_model;

pub use disruption_feed::{run_disruption_feed, DisruptionFeed};
pub use predictive_model::{
    CompositePredictor, CongestionPredictor, DisruptionPredictor, RandomIncidentPredictor,
    ScriptedPredictor,
};
