//! Multi-agent traffic signal coordination: per-intersection controllers,
//! emergency preemption, disruption-aware weighting and corridor hints, all
//! talking over an in-process message bus.

pub mod communication;
pub mod config;
pub mod control_system;
pub mod coordinator;
pub mod emergency;
pub mod error;
pub mod flow_analyzer;
pub mod global_variables;
pub mod models;
pub mod monitoring;
pub mod shared_data;
pub mod simulation_engine;
