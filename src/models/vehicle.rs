use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::intersection::LaneId;
use crate::shared_data::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub u64);

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityClass {
    Normal,
    Emergency,
}

/// Different types of vehicles in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Car,
    Bus,
    Truck,
    EmergencyVan,
}

impl VehicleType {
    /// Vehicle length in meters.
    pub fn length(&self) -> f64 {
        match self {
            VehicleType::Car => 4.5,
            VehicleType::Bus => 12.0,
            VehicleType::Truck => 16.0,
            VehicleType::EmergencyVan => 5.5,
        }
    }

    pub fn priority(&self) -> PriorityClass {
        match self {
            VehicleType::EmergencyVan => PriorityClass::Emergency,
            _ => PriorityClass::Normal,
        }
    }

    /// Ticks needed to clear the stop line once released.
    pub fn clearance_ticks(&self) -> Tick {
        (self.length() / 6.0).ceil() as Tick
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VehicleType::Car => write!(f, "Car"),
            VehicleType::Bus => write!(f, "Bus"),
            VehicleType::Truck => write!(f, "Truck"),
            VehicleType::EmergencyVan => write!(f, "EmergencyVan"),
        }
    }
}

/// A vehicle waiting at an intersection, as seen by its signal controller.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleRecord {
    pub vehicle_id: VehicleId,
    pub lane: LaneId,
    pub arrived_at: Tick,
    pub priority: PriorityClass,
    pub estimated_clearance: Tick,
}

impl VehicleRecord {
    pub fn waited(&self, now: Tick) -> Tick {
        now.saturating_sub(self.arrived_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearance_grows_with_length() {
        assert_eq!(VehicleType::Car.clearance_ticks(), 1);
        assert_eq!(VehicleType::Bus.clearance_ticks(), 2);
        assert_eq!(VehicleType::Truck.clearance_ticks(), 3);
        assert_eq!(VehicleType::EmergencyVan.priority(), PriorityClass::Emergency);
    }
}
