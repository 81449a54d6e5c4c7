pub use car::{Car, FaultInjection};
pub use cgmath;
pub use config::{
    ArrivalParams, CarAttributes, ConfigError, ConfigResult, CounterParams, FollowerParams,
    SimConfig,
};
pub use coordination::{assign_leader, misassign_leader};
pub use dispute::{tally, Dispute, DisputeOutcome};
pub use geometry::{cross_path, Coordinates, Intention, PathPosition};
pub use message::{Handoff, Message, MessageBody, Recipients, Snapshot};
pub use record::{CarRecord, Collision};
pub use role::{Member, Registry, RoleKind};
pub use simulation::Simulation;
use slotmap::{new_key_type, SlotMap};
pub use slotmap::{Key, KeyData};
pub use util::Interval;

mod arrival;
mod car;
mod config;
mod coordination;
mod dispute;
pub mod geometry;
pub mod math;
mod message;
mod record;
mod role;
mod simulation;
mod util;

/// The name of a car: unique, and assigned in order of arrival.
pub type CarName = i64;

/// The name reserved for the stationary infrastructure agent.
pub const INFRASTRUCTURE_NAME: CarName = -1;

new_key_type! {
    /// Unique ID of a [Car].
    pub struct CarId;
}

type CarSet = SlotMap<CarId, Car>;
