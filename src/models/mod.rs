pub mod disruption;
pub mod intersection;
pub mod vehicle;
