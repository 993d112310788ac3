pub mod central_coordinator;

pub use central_coordinator::{
    aggregate, run_coordinator, Aggregation, CoordinatorSettings, Corridor, CorridorMember,
};
