//! Serialisable records of cars, departures and collisions.

use crate::geometry::{Coordinates, Intention};
use crate::role::RoleKind;
use crate::CarName;
use serde::{Deserialize, Serialize};

/// A snapshot of a car suitable for logging and rendering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarRecord {
    pub name: CarName,
    /// The car being followed.
    pub following: Option<CarName>,
    pub lane: u8,
    pub speed: f64,
    pub creation_time: u64,
    pub departure_time: Option<u64>,
    pub intention: Intention,
    pub actual_coordinates: Coordinates,
    pub origin_coordinates: Coordinates,
    pub caravan_depth: u32,
    pub role: RoleKind,
}

/// Two cars that came too close to each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    pub tick: u64,
    pub cars: [CarRecord; 2],
}
