//! The messages exchanged between cars. Every message carries a snapshot of its
//! transmitter, a variant-specific payload, and knows how to apply itself to a
//! receiving [Car].

use crate::car::Car;
use crate::config::SimConfig;
use crate::dispute::Dispute;
use crate::geometry::{Coordinates, Intention, PathPosition};
use crate::role::{Registry, RoleKind};
use crate::CarName;
use serde::{Deserialize, Serialize};

/// The state of a car at the moment it produced a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: CarName,
    pub lane: u8,
    pub intention: Intention,
    pub origin: Coordinates,
    pub actual: Coordinates,
    /// Speed in px/s.
    pub speed: f64,
    /// Acceleration in px/s<sup>2</sup>.
    pub acceleration: f64,
    /// The tick at which the car entered the simulation.
    pub creation_time: u64,
    /// Whether the car is still waiting to be coordinated.
    pub is_new: bool,
    pub caravan_depth: u32,
    pub role: RoleKind,
}

impl PathPosition for Snapshot {
    fn origin_coordinates(&self) -> Coordinates {
        self.origin
    }

    fn actual_coordinates(&self) -> Coordinates {
        self.actual
    }

    fn intention(&self) -> Intention {
        self.intention
    }
}

/// The state a coordinator passes on when it hands over or shares its role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// The coordinator's replica of the cars at the intersection.
    pub registry: Registry,
    /// The car that is to take up the role.
    pub successor: Option<CarName>,
}

/// The payload of a [Message].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Routine state refresh.
    Info,
    /// A car announces its arrival.
    NewCar,
    /// A car announces its departure.
    LeftIntersection,
    /// The supervisor leaves and names its successor.
    SupervisorLeftIntersection(Handoff),
    /// The leader assigned to a new arrival.
    FollowingCar {
        follower: CarName,
        /// The leader's state as known to the coordinator, or `None` to lead a new caravan.
        leader: Option<Snapshot>,
        coordinator: CarName,
    },
    /// The supervisor appoints a backup.
    SecondAtCharge(Handoff),
    /// A former backup has promoted itself to supervisor.
    NewSupervisor,
    /// The backup disagrees with the supervisor over an assignment.
    FaultyCoordination(Dispute),
    /// A vote on a disputed assignment.
    CorrectedCoordination {
        disputed: CarName,
        leader: Option<CarName>,
    },
}

/// The cars a message is delivered to. The transmitter never receives its own messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipients {
    Broadcast,
    Car(CarName),
}

impl Recipients {
    /// Whether a car with the given name receives the message.
    pub fn includes(&self, name: CarName) -> bool {
        match self {
            Recipients::Broadcast => true,
            Recipients::Car(recipient) => *recipient == name,
        }
    }
}

/// A message produced by a car during one tick and delivered during the next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub snapshot: Snapshot,
    pub body: MessageBody,
}

impl Message {
    /// Creates a new message.
    pub fn new(snapshot: Snapshot, body: MessageBody) -> Self {
        Self { snapshot, body }
    }

    /// The name of the car that produced the message.
    pub fn transmitter(&self) -> CarName {
        self.snapshot.name
    }

    /// Delivery priority within a tick; higher values are delivered first so that
    /// role changes are visible before routine updates.
    pub fn priority(&self) -> u8 {
        match self.body {
            MessageBody::SupervisorLeftIntersection(_)
            | MessageBody::SecondAtCharge(_)
            | MessageBody::NewSupervisor => 3,
            MessageBody::LeftIntersection => 2,
            MessageBody::NewCar | MessageBody::FaultyCoordination(_) => 1,
            MessageBody::Info
            | MessageBody::FollowingCar { .. }
            | MessageBody::CorrectedCoordination { .. } => 0,
        }
    }

    /// The cars that should receive this message.
    pub fn transmit(&self) -> Recipients {
        match &self.body {
            MessageBody::SecondAtCharge(Handoff {
                successor: Some(name),
                ..
            }) => Recipients::Car(*name),
            _ => Recipients::Broadcast,
        }
    }

    /// Whether the message announces a departure.
    pub fn is_departure(&self) -> bool {
        matches!(
            self.body,
            MessageBody::LeftIntersection | MessageBody::SupervisorLeftIntersection(_)
        )
    }

    /// Applies the message to a receiving car.
    pub fn process(&self, car: &mut Car, config: &SimConfig) {
        let sender = &self.snapshot;
        car.observe(sender, self.is_departure());
        match &self.body {
            MessageBody::Info => car.on_info(sender, config),
            MessageBody::NewCar => car.on_new_car(sender, config),
            MessageBody::LeftIntersection => car.on_left_intersection(sender),
            MessageBody::SupervisorLeftIntersection(handoff) => {
                car.on_supervisor_left(sender, handoff, config)
            }
            MessageBody::FollowingCar {
                follower,
                leader,
                coordinator,
            } => car.on_following_car(*follower, leader.as_ref(), *coordinator, config),
            MessageBody::SecondAtCharge(handoff) => car.on_second_at_charge(sender, handoff, config),
            MessageBody::NewSupervisor => car.on_new_supervisor(sender, config),
            MessageBody::FaultyCoordination(dispute) => car.on_faulty_coordination(dispute, config),
            MessageBody::CorrectedCoordination { disputed, leader } => {
                car.on_corrected_coordination(sender.name, *disputed, *leader)
            }
        }
    }
}
