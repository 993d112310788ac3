// simulation_engine/mod.rs
pub mod simulation;
pub mod vehicles;

pub use simulation::{run_simulation, SimulationReport};
pub use vehicles::{run_vehicle_agent, AgentSettings, VehicleAgent, VehicleState};
