//! Simulation parameters.

use crate::util::Interval;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An invalid simulation configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("time step must be positive, got {0}")]
    TimeStep(f64),

    #[error("{what} limits are empty: {min} > {max}")]
    EmptyLimits {
        what: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{0} must be at least one tick")]
    ZeroCounter(&'static str),

    #[error("{what} must be non-negative, got {value}")]
    Negative { what: &'static str, value: f64 },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Shorthand result type for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The parameters of a simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// The duration of one tick in s.
    pub dt: f64,
    /// Physical limits shared by all vehicles.
    pub car: CarAttributes,
    /// Parameters of the car following law.
    pub follower: FollowerParams,
    /// Staleness counters of the coordination protocol.
    pub counters: CounterParams,
    /// The stochastic arrival process.
    pub arrivals: ArrivalParams,
    /// A new vehicle is not admitted while another is this close to its entry point, in px.
    pub entry_clearance: f64,
    /// Two vehicles whose centres are closer than this have collided, in px.
    pub collision_distance: f64,
    /// Whether a stationary infrastructure agent permanently supervises the intersection.
    pub centralized: bool,
}

/// The physical limits of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarAttributes {
    /// Allowed speeds in px/s.
    pub speed: Interval<f64>,
    /// Allowed accelerations in px/s<sup>2</sup>.
    pub acceleration: Interval<f64>,
    /// The speed at which vehicles enter, in px/s.
    pub initial_speed: f64,
}

/// Parameters of the car following law.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerParams {
    /// The gap to keep to the leader when stopped, in px.
    pub standstill_distance: f64,
    /// The additional gap to keep per unit of speed, in s.
    pub time_headway: f64,
    /// Gain on the gap error, in s<sup>-2</sup>.
    pub gap_gain: f64,
    /// Gain on the speed difference to the leader, in s<sup>-1</sup>.
    pub speed_gain: f64,
}

/// Staleness counters, all measured in ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterParams {
    /// Ticks without news from a registry member before it is forgotten.
    pub member_counter: u32,
    /// Ticks without news from the supervisor before its backup takes over.
    pub supervisor_counter: u32,
    /// Ticks without news from a leader before a follower stops following.
    pub following_counter: u32,
    /// Ticks an open dispute waits for missing votes.
    pub dispute_timeout: u32,
}

/// Parameters of the per-lane arrival process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrivalParams {
    /// Mean arrivals per lane per second; zero disables automatic arrivals.
    pub rate: f64,
    /// Seed of the arrival random number generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt: 0.05,
            car: CarAttributes::default(),
            follower: FollowerParams::default(),
            counters: CounterParams::default(),
            arrivals: ArrivalParams::default(),
            entry_clearance: 45.0,
            collision_distance: 20.0,
            centralized: false,
        }
    }
}

impl Default for CarAttributes {
    fn default() -> Self {
        Self {
            speed: Interval::new(0.0, 100.0),
            acceleration: Interval::new(-60.0, 30.0),
            initial_speed: 40.0,
        }
    }
}

impl Default for FollowerParams {
    fn default() -> Self {
        Self {
            standstill_distance: 140.0,
            time_headway: 0.5,
            gap_gain: 0.6,
            speed_gain: 1.2,
        }
    }
}

impl Default for CounterParams {
    fn default() -> Self {
        Self {
            member_counter: 8,
            supervisor_counter: 8,
            following_counter: 8,
            dispute_timeout: 12,
        }
    }
}

impl Default for ArrivalParams {
    fn default() -> Self {
        Self { rate: 0.0, seed: 0 }
    }
}

impl SimConfig {
    /// Parses and validates a configuration from JSON. Missing fields take their default values.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration describes a simulation that can run.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.dt > 0.0) {
            return Err(ConfigError::TimeStep(self.dt));
        }
        for (what, limits) in [
            ("speed", self.car.speed),
            ("acceleration", self.car.acceleration),
        ] {
            if !limits.is_valid() {
                return Err(ConfigError::EmptyLimits {
                    what,
                    min: limits.min,
                    max: limits.max,
                });
            }
        }
        for (what, value) in [
            ("counters.member_counter", self.counters.member_counter),
            ("counters.supervisor_counter", self.counters.supervisor_counter),
            ("counters.following_counter", self.counters.following_counter),
            ("counters.dispute_timeout", self.counters.dispute_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCounter(what));
            }
        }
        for (what, value) in [
            ("arrivals.rate", self.arrivals.rate),
            ("entry_clearance", self.entry_clearance),
            ("collision_distance", self.collision_distance),
            ("follower.standstill_distance", self.follower.standstill_distance),
            ("follower.time_headway", self.follower.time_headway),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::Negative { what, value });
            }
        }
        Ok(())
    }
}
