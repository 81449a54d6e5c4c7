use self::acceleration::{AccelerationModel, LeaderState};
use self::kinematics::{accelerate, advance, turn};
use crate::config::SimConfig;
use crate::coordination::coordinate;
use crate::dispute::{Dispute, DisputeLedger, DisputeOutcome};
use crate::geometry::{
    exit_distance, Coordinates, Intention, PathPosition, INITIAL_STRAIGHT_SECTION,
};
use crate::message::{Handoff, Message, MessageBody, Snapshot};
use crate::record::CarRecord;
use crate::role::{Backup, Coordinator, Registry, Role, RoleKind};
use crate::{CarId, CarName, INFRASTRUCTURE_NAME};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

mod acceleration;
mod kinematics;

/// Number of deliveries a new car listens to before it may elect itself supervisor.
const ELECTION_DELIVERIES: u32 = 2;

/// Faults that can be injected into a car to exercise failure handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInjection {
    /// Never answer coordination requests.
    pub attack_supervisory: bool,
    /// Deliberately assign wrong leaders, including when voting on disputes.
    pub supervisor_lies: bool,
}

/// What a new car has heard while deciding whether to elect itself.
#[derive(Clone, Debug, Default)]
struct Election {
    deliveries: u32,
    /// Coordinated or role-holding cars heard recently, with ticks left before they are forgotten.
    established: BTreeMap<CarName, u32>,
    /// Other new cars, waiting to be coordinated.
    concurrent: BTreeMap<CarName, Snapshot>,
}

/// A simulated car, taking part in the coordination protocol.
#[derive(Clone, Debug)]
pub struct Car {
    /// The car's ID
    pub(crate) id: CarId,
    name: CarName,
    lane: u8,
    intention: Intention,
    /// Where the car entered the simulation.
    origin: Coordinates,
    /// Where the car is now.
    actual: Coordinates,
    /// The speed in px/s.
    speed: f64,
    /// The acceleration in px/s<sup>2</sup>.
    acceleration: f64,
    /// Heading change accumulated while turning, in degrees.
    heading_change: f64,
    /// The acceleration model
    acc: AccelerationModel,
    creation_time: u64,
    departure_time: Option<u64>,
    role: Role,
    /// The last known state of the car being followed.
    leader: Option<Snapshot>,
    /// Ticks left before a silent leader is abandoned.
    following_counter: u32,
    caravan_depth: u32,
    /// Whether the car has yet to be coordinated.
    is_new: bool,
    /// Whether the car has announced its arrival.
    announced: bool,
    election: Option<Election>,
    disputes: DisputeLedger,
    outcomes: Vec<DisputeOutcome>,
    /// Coordinators found faulty by a vote.
    faulty: BTreeSet<CarName>,
    faults: FaultInjection,
    /// Messages produced while processing the current delivery.
    outbox: Vec<Message>,
}

impl Car {
    /// Creates a new car at the entry point of `lane`.
    pub(crate) fn new(
        id: CarId,
        name: CarName,
        lane: u8,
        intention: Intention,
        now: u64,
        config: &SimConfig,
    ) -> Self {
        let entry = Coordinates::entry(lane);
        Self {
            id,
            name,
            lane,
            intention,
            origin: entry,
            actual: entry,
            speed: config.car.initial_speed,
            acceleration: 0.0,
            heading_change: 0.0,
            acc: AccelerationModel::new(config.car.acceleration, config.follower),
            creation_time: now,
            departure_time: None,
            role: Role::Ordinary,
            leader: None,
            following_counter: 0,
            caravan_depth: 0,
            is_new: true,
            announced: false,
            election: Some(Election::default()),
            disputes: DisputeLedger::default(),
            outcomes: vec![],
            faulty: BTreeSet::new(),
            faults: FaultInjection::default(),
            outbox: vec![],
        }
    }

    /// Creates the stationary agent that permanently supervises the intersection.
    pub(crate) fn infrastructure(id: CarId, now: u64, config: &SimConfig) -> Self {
        let centre = Coordinates::new(384.0, 384.0, 0.0);
        let mut car = Self::new(id, INFRASTRUCTURE_NAME, 0, Intention::Straight, now, config);
        car.origin = centre;
        car.actual = centre;
        car.speed = 0.0;
        car.is_new = false;
        car.announced = true;
        car.election = None;
        let mut registry = Registry::default();
        registry.admit(car.snapshot(), config.counters.member_counter);
        car.role = Role::Infrastructure(Coordinator::new(registry));
        car
    }

    /// Gets the car's ID.
    pub fn id(&self) -> CarId {
        self.id
    }

    pub fn name(&self) -> CarName {
        self.name
    }

    pub fn lane(&self) -> u8 {
        self.lane
    }

    /// Where the car entered the simulation.
    pub fn origin(&self) -> Coordinates {
        self.origin
    }

    /// Where the car is now.
    pub fn coordinates(&self) -> Coordinates {
        self.actual
    }

    /// The heading in degrees.
    pub fn direction(&self) -> f64 {
        self.actual.direction
    }

    /// The speed in px/s.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// The acceleration in px/s<sup>2</sup>.
    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn departure_time(&self) -> Option<u64> {
        self.departure_time
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    /// The car's replica of the cars at the intersection, if its role keeps one.
    pub fn registry(&self) -> Option<&Registry> {
        self.role.registry()
    }

    /// The appointed backup, if the car coordinates the intersection.
    pub fn backup(&self) -> Option<CarName> {
        match &self.role {
            Role::Supervisor(c) | Role::Infrastructure(c) => c.backup(),
            _ => None,
        }
    }

    /// Whether the car, as backup, currently answers coordination requests.
    pub fn is_acting(&self) -> bool {
        matches!(&self.role, Role::SecondAtCharge(b) if b.is_acting())
    }

    pub fn caravan_depth(&self) -> u32 {
        self.caravan_depth
    }

    /// Whether the car has yet to be coordinated.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// The name of the car being followed.
    pub fn leader(&self) -> Option<CarName> {
        self.leader.as_ref().map(|leader| leader.name)
    }

    /// The last known state of the car being followed.
    pub fn leader_snapshot(&self) -> Option<&Snapshot> {
        self.leader.as_ref()
    }

    /// The coordinators this car has seen voted faulty.
    pub fn faulty(&self) -> &BTreeSet<CarName> {
        &self.faulty
    }

    /// The disputes this car has seen settled.
    pub fn dispute_outcomes(&self) -> &[DisputeOutcome] {
        &self.outcomes
    }

    pub fn faults(&self) -> FaultInjection {
        self.faults
    }

    pub fn set_faults(&mut self, faults: FaultInjection) {
        self.faults = faults;
    }

    /// The car's current state as carried by its messages.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            name: self.name,
            lane: self.lane,
            intention: self.intention,
            origin: self.origin,
            actual: self.actual,
            speed: self.speed,
            acceleration: self.acceleration,
            creation_time: self.creation_time,
            is_new: self.is_new,
            caravan_depth: self.caravan_depth,
            role: self.role.kind(),
        }
    }

    /// A serialisable record of the car.
    pub fn record(&self) -> CarRecord {
        CarRecord {
            name: self.name,
            following: self.leader(),
            lane: self.lane,
            speed: self.speed,
            creation_time: self.creation_time,
            departure_time: self.departure_time,
            intention: self.intention,
            actual_coordinates: self.actual,
            origin_coordinates: self.origin,
            caravan_depth: self.caravan_depth,
            role: self.role.kind(),
        }
    }

    /// The car's record as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.record()).unwrap_or_default()
    }

    /// Applies a delivered message.
    pub fn receive(&mut self, message: &Message, config: &SimConfig) {
        message.process(self, config);
    }

    /// Advances the car by one tick: counters, role logic, control and kinematics.
    /// Returns the messages produced during this tick.
    pub(crate) fn update(&mut self, config: &SimConfig) -> Vec<Message> {
        self.tick_following();
        self.tick_registry();
        self.tick_backup(config);
        self.tick_election(config);
        self.tick_disputes(config);
        self.drive(config);
        self.refresh_own_entry(config);

        let body = if self.announced {
            MessageBody::Info
        } else {
            self.announced = true;
            MessageBody::NewCar
        };
        let snapshot = self.snapshot();
        self.outbox.push(Message::new(snapshot, body));
        std::mem::take(&mut self.outbox)
    }

    /// Takes the car out of the simulation and announces its departure.
    /// `leaving` holds every car departing in the same tick; none of them can succeed a supervisor.
    pub(crate) fn depart(
        &mut self,
        now: u64,
        leaving: &BTreeSet<CarName>,
    ) -> SmallVec<[Message; 2]> {
        self.departure_time = Some(now);
        let snapshot = self.snapshot();
        let mut messages = SmallVec::new();
        if let Role::Supervisor(coordinator) = &self.role {
            let mut registry = coordinator.registry.clone();
            registry.remove(self.name);
            let excluded = self.faulty.union(leaving).copied().collect::<BTreeSet<_>>();
            let successor = coordinator
                .backup
                .filter(|backup| !excluded.contains(backup) && registry.contains(*backup))
                .or_else(|| registry.latest(self.name, &excluded));
            info!("Supervisor {} left, handing over to {:?}", self.name, successor);
            messages.push(Message::new(
                snapshot.clone(),
                MessageBody::SupervisorLeftIntersection(Handoff {
                    registry,
                    successor,
                }),
            ));
        }
        info!("Car {} left the intersection", self.name);
        messages.push(Message::new(snapshot, MessageBody::LeftIntersection));
        messages
    }

    // Message handlers

    /// Notes the sender of any message for the purposes of the election.
    pub(crate) fn observe(&mut self, sender: &Snapshot, is_departure: bool) {
        let Some(election) = self.election.as_mut() else {
            return;
        };
        if is_departure {
            election.established.remove(&sender.name);
            election.concurrent.remove(&sender.name);
        } else if !sender.is_new || sender.role != RoleKind::Ordinary {
            election
                .established
                .insert(sender.name, ELECTION_DELIVERIES + 1);
            election.concurrent.remove(&sender.name);
        } else {
            election.concurrent.insert(sender.name, sender.clone());
        }
    }

    pub(crate) fn on_info(&mut self, sender: &Snapshot, config: &SimConfig) {
        if self.leader() == Some(sender.name) {
            self.start_following(Some(sender), config);
        }
        let counter = config.counters.member_counter;
        let rival = sender.role == RoleKind::Supervisor
            && sender.name < self.name
            && !self.faulty.contains(&sender.name);
        match &mut self.role {
            Role::Ordinary => {}
            Role::Supervisor(_) if rival => {
                warn!("Supervisor {} yields to supervisor {}", self.name, sender.name);
                self.role = Role::Ordinary;
            }
            Role::Supervisor(c) | Role::Infrastructure(c) => {
                admit_established(&mut c.registry, sender, counter);
            }
            Role::SecondAtCharge(b)
                if sender.name == b.supervisor && sender.role != RoleKind::Supervisor =>
            {
                info!("Backup {} stands down, {} no longer supervises", self.name, sender.name);
                self.role = Role::Ordinary;
            }
            Role::SecondAtCharge(b) => {
                if sender.name == b.supervisor {
                    b.supervisor_counter = config.counters.supervisor_counter;
                }
                admit_established(&mut b.registry, sender, counter);
            }
        }
    }

    pub(crate) fn on_new_car(&mut self, arrival: &Snapshot, config: &SimConfig) {
        if self.role.kind().is_coordinator() || self.is_acting() {
            self.coordinate_arrival(arrival, config);
            return;
        }
        let lies = self.faults.supervisor_lies;
        if let Role::SecondAtCharge(b) = &mut self.role {
            b.registry
                .admit(arrival.clone(), config.counters.member_counter);
            let decision = coordinate(b.registry.snapshots(), arrival, lies);
            debug!(
                "Backup {} shadows car {} -> {:?}",
                self.name, arrival.name, decision
            );
            b.registry.record_assignment(arrival.name, decision);
            b.shadow.insert(arrival.name, decision);
            b.backlog
                .insert(arrival.name, config.counters.supervisor_counter);
        }
    }

    pub(crate) fn on_left_intersection(&mut self, sender: &Snapshot) {
        let name = sender.name;
        if self.leader() == Some(name) {
            debug!("Car {} lost its leader {}", self.name, name);
            self.stop_following();
        }
        self.disputes.withdraw(name);
        match &mut self.role {
            Role::Ordinary => {}
            Role::Supervisor(c) | Role::Infrastructure(c) => {
                if c.registry.remove(name).is_none() {
                    debug!("Car {} ignores departure of unknown car {}", self.name, name);
                }
                if c.backup == Some(name) {
                    c.backup = None;
                }
            }
            Role::SecondAtCharge(b) => {
                b.registry.remove(name);
                b.shadow.remove(&name);
                b.backlog.remove(&name);
            }
        }
    }

    pub(crate) fn on_supervisor_left(
        &mut self,
        sender: &Snapshot,
        handoff: &Handoff,
        config: &SimConfig,
    ) {
        if handoff.successor == Some(self.name) && self.role.kind() != RoleKind::Infrastructure {
            let mut registry = handoff.registry.clone();
            registry.remove(sender.name);
            let backlog = match &self.role {
                Role::SecondAtCharge(b) => b.backlog.keys().copied().collect(),
                _ => vec![],
            };
            info!("Car {} takes over from supervisor {}", self.name, sender.name);
            self.become_supervisor(registry, config);
            self.drain_backlog(backlog, config);
        } else if let Role::SecondAtCharge(b) = &self.role {
            if b.supervisor == sender.name {
                info!("Backup {} stands down", self.name);
                self.role = Role::Ordinary;
            }
        }
    }

    pub(crate) fn on_following_car(
        &mut self,
        follower: CarName,
        leader: Option<&Snapshot>,
        coordinator: CarName,
        config: &SimConfig,
    ) {
        if self.faulty.contains(&coordinator) {
            debug!(
                "Car {} ignores assignment from faulty coordinator {}",
                self.name, coordinator
            );
            return;
        }
        if follower == self.name {
            debug!(
                "Car {} follows {:?}",
                self.name,
                leader.map(|leader| leader.name)
            );
            self.is_new = false;
            self.election = None;
            self.start_following(leader, config);
        }

        let leader_name = leader.map(|leader| leader.name);
        let lies = self.faults.supervisor_lies;
        let name = self.name;
        let mut raised = None;
        match &mut self.role {
            Role::Ordinary => {}
            Role::Supervisor(c) | Role::Infrastructure(c) => {
                c.registry.record_assignment(follower, leader_name);
            }
            Role::SecondAtCharge(b) => {
                if coordinator == b.supervisor {
                    b.backlog.remove(&follower);
                    if let Some(shadow) = b.shadow.remove(&follower) {
                        if shadow != leader_name && !self.faulty.contains(&coordinator) {
                            if let Some(arrival) = b.registry.get(follower) {
                                let mut arrival = arrival.snapshot.clone();
                                arrival.caravan_depth = 0;
                                raised = Some(Dispute {
                                    arrival,
                                    members: b.registry.snapshots_except(follower),
                                    supervisor: coordinator,
                                    supervisor_claim: leader_name,
                                    backup: name,
                                    backup_claim: shadow,
                                });
                            }
                        }
                    }
                }
                b.registry.record_assignment(follower, leader_name);
            }
        }

        if let Some(dispute) = raised {
            warn!(
                "Backup {} disputes assignment of car {}: {:?} vs {:?}",
                name, follower, dispute.supervisor_claim, dispute.backup_claim
            );
            let snapshot = self.snapshot();
            self.outbox.push(Message::new(
                snapshot,
                MessageBody::FaultyCoordination(dispute.clone()),
            ));
            self.join_dispute(dispute, lies, config);
        }
    }

    pub(crate) fn on_second_at_charge(
        &mut self,
        sender: &Snapshot,
        handoff: &Handoff,
        config: &SimConfig,
    ) {
        if handoff.successor != Some(self.name) || !matches!(self.role, Role::Ordinary) {
            return;
        }
        info!("Car {} appointed backup of {}", self.name, sender.name);
        let mut registry = handoff.registry.clone();
        registry.admit(self.snapshot(), config.counters.member_counter);
        self.role = Role::SecondAtCharge(Backup::new(
            registry,
            sender.name,
            config.counters.supervisor_counter,
        ));
    }

    pub(crate) fn on_new_supervisor(&mut self, sender: &Snapshot, config: &SimConfig) {
        info!("Car {} learns of new supervisor {}", self.name, sender.name);
        let counter = config.counters.member_counter;
        match &mut self.role {
            Role::Supervisor(_) => {
                warn!(
                    "Supervisor {} yields to newly promoted {}",
                    self.name, sender.name
                );
                self.role = Role::Ordinary;
            }
            Role::SecondAtCharge(b) => {
                if b.supervisor != sender.name {
                    info!("Backup {} stands down", self.name);
                    self.role = Role::Ordinary;
                }
            }
            Role::Infrastructure(c) => {
                admit_established(&mut c.registry, sender, counter);
            }
            Role::Ordinary => {}
        }
    }

    pub(crate) fn on_faulty_coordination(&mut self, dispute: &Dispute, config: &SimConfig) {
        let lies = self.faults.supervisor_lies;
        self.join_dispute(dispute.clone(), lies, config);
    }

    pub(crate) fn on_corrected_coordination(
        &mut self,
        voter: CarName,
        disputed: CarName,
        leader: Option<CarName>,
    ) {
        if self.disputes.vote(disputed, voter, leader) {
            debug!(
                "Car {} counts vote of {} on car {}: {:?}",
                self.name, voter, disputed, leader
            );
        } else {
            debug!(
                "Car {} ignores vote of {} on car {}",
                self.name, voter, disputed
            );
        }
    }

    // Role logic

    /// Opens a dispute, recomputes the assignment and casts a vote.
    fn join_dispute(&mut self, dispute: Dispute, lies: bool, config: &SimConfig) {
        let disputed = dispute.disputed();
        let verdict = dispute.replay(lies);
        let voter = dispute.voters().contains(&self.name);
        if !self.disputes.open(dispute, config.counters.dispute_timeout) {
            return;
        }
        if voter {
            debug!("Car {} votes {:?} for car {}", self.name, verdict, disputed);
            self.disputes.vote(disputed, self.name, verdict);
            let snapshot = self.snapshot();
            self.outbox.push(Message::new(
                snapshot,
                MessageBody::CorrectedCoordination {
                    disputed,
                    leader: verdict,
                },
            ));
        }
    }

    /// Assigns a leader to an arrival and announces it.
    fn coordinate_arrival(&mut self, arrival: &Snapshot, config: &SimConfig) {
        let lies = self.faults.supervisor_lies;
        let snapshot = self.snapshot();
        let name = self.name;
        if let Role::SecondAtCharge(b) = &mut self.role {
            b.backlog.remove(&arrival.name);
            b.shadow.remove(&arrival.name);
        }
        let Some(registry) = self.role.registry_mut() else {
            return;
        };
        registry.admit(arrival.clone(), config.counters.member_counter);
        if self.faults.attack_supervisory {
            debug!("Car {} withholds coordination of car {}", name, arrival.name);
            return;
        }

        let leader = coordinate(registry.snapshots(), arrival, lies);
        registry.record_assignment(arrival.name, leader);
        let leader = leader
            .and_then(|l| registry.get(l))
            .map(|l| l.snapshot.clone());
        debug!(
            "Car {} assigns car {} to follow {:?}",
            name,
            arrival.name,
            leader.as_ref().map(|l| l.name)
        );
        self.outbox.push(Message::new(
            snapshot.clone(),
            MessageBody::FollowingCar {
                follower: arrival.name,
                leader,
                coordinator: name,
            },
        ));

        // Only a supervisor keeps a backup
        let eligible = !self.faulty.contains(&arrival.name);
        if let Role::Supervisor(c) = &mut self.role {
            let depth = c
                .registry
                .get(arrival.name)
                .map_or(0, |member| member.snapshot.caravan_depth);
            if eligible && c.should_appoint(depth) {
                info!("Supervisor {} appoints car {} as backup", name, arrival.name);
                c.backup = Some(arrival.name);
                self.outbox.push(Message::new(
                    snapshot,
                    MessageBody::SecondAtCharge(Handoff {
                        registry: c.registry.clone(),
                        successor: Some(arrival.name),
                    }),
                ));
            }
        }
    }

    /// Coordinates arrivals that have been waiting for an answer.
    fn drain_backlog(&mut self, backlog: Vec<CarName>, config: &SimConfig) {
        for name in backlog {
            let arrival = self
                .role
                .registry()
                .and_then(|registry| registry.get(name))
                .map(|member| member.snapshot.clone());
            match arrival {
                Some(arrival) => self.coordinate_arrival(&arrival, config),
                None => debug!("Car {} drops departed arrival {}", self.name, name),
            }
        }
    }

    fn become_supervisor(&mut self, mut registry: Registry, config: &SimConfig) {
        self.is_new = false;
        self.election = None;
        self.role = Role::Supervisor(Coordinator::new(Registry::default()));
        registry.admit(self.snapshot(), config.counters.member_counter);
        self.role = Role::Supervisor(Coordinator::new(registry));
    }

    /// Promotes a backup to supervisor and announces it.
    fn promote(&mut self, config: &SimConfig) {
        let Role::SecondAtCharge(backup) = std::mem::replace(&mut self.role, Role::Ordinary) else {
            return;
        };
        info!(
            "Backup {} promotes itself to supervisor, replacing {}",
            self.name, backup.supervisor
        );
        let backlog = backup.backlog.keys().copied().collect();
        let mut registry = backup.registry;
        registry.remove(backup.supervisor);
        self.become_supervisor(registry, config);
        let snapshot = self.snapshot();
        self.outbox
            .push(Message::new(snapshot, MessageBody::NewSupervisor));
        self.drain_backlog(backlog, config);
    }

    /// Takes over a post both of whose holders lost a dispute, starting from the
    /// cars recorded in it.
    fn inherit(&mut self, dispute: &Dispute, leader: Option<CarName>, config: &SimConfig) {
        info!(
            "Car {} replaces supervisor {} and backup {}",
            self.name, dispute.supervisor, dispute.backup
        );
        let counter = config.counters.member_counter;
        let mut registry = Registry::default();
        for member in dispute.members.iter().chain([&dispute.arrival]) {
            if member.role != RoleKind::Infrastructure {
                registry.admit(member.clone(), counter);
            }
        }
        registry.record_assignment(dispute.disputed(), leader);
        self.become_supervisor(registry, config);
        let snapshot = self.snapshot();
        self.outbox
            .push(Message::new(snapshot, MessageBody::NewSupervisor));
    }

    fn start_following(&mut self, leader: Option<&Snapshot>, config: &SimConfig) {
        match leader {
            Some(leader) => {
                self.leader = Some(leader.clone());
                self.caravan_depth = leader.caravan_depth + 1;
                self.following_counter = config.counters.following_counter;
            }
            None => self.stop_following(),
        }
    }

    fn stop_following(&mut self) {
        self.leader = None;
        self.caravan_depth = 0;
        self.following_counter = 0;
    }

    /// Applies the settlement of a dispute.
    fn settle(&mut self, dispute: &Dispute, outcome: &DisputeOutcome, config: &SimConfig) {
        let (disputed, leader, faulty) = match outcome {
            DisputeOutcome::Resolved {
                disputed,
                leader,
                faulty,
            } => (*disputed, *leader, faulty),
            DisputeOutcome::Unresolved { disputed } => {
                warn!(
                    "Car {} could not settle the dispute over car {}",
                    self.name, disputed
                );
                return;
            }
        };
        for name in faulty {
            if self.faulty.insert(*name) {
                warn!("Car {} marks coordinator {} as faulty", self.name, name);
            }
        }

        if disputed == self.name {
            match leader.and_then(|l| dispute.member(l)) {
                Some(leader) => self.start_following(Some(leader), config),
                None => self.stop_following(),
            }
        }
        if let Some(registry) = self.role.registry_mut() {
            registry.record_assignment(disputed, leader);
        }

        let demoted = faulty.contains(&self.name)
            && matches!(self.role.kind(), RoleKind::Supervisor | RoleKind::SecondAtCharge);
        let supervisor_faulty =
            matches!(&self.role, Role::SecondAtCharge(b) if faulty.contains(&b.supervisor));
        // With both coordinators outvoted, the earliest honest voter takes the post
        let heir = if faulty.contains(&dispute.supervisor) && faulty.contains(&dispute.backup) {
            dispute
                .voters()
                .into_iter()
                .find(|voter| !faulty.contains(voter))
        } else {
            None
        };
        if demoted {
            warn!("Car {} steps down after losing a vote", self.name);
            self.role = Role::Ordinary;
        } else if heir == Some(self.name) {
            self.inherit(dispute, leader, config);
        } else if supervisor_faulty {
            self.promote(config);
        } else if let Role::Supervisor(c) = &mut self.role {
            if c.backup.map_or(false, |b| faulty.contains(&b)) {
                c.backup = None;
            }
        }
    }

    // Per-tick logic

    fn tick_following(&mut self) {
        if self.leader.is_none() {
            return;
        }
        self.following_counter = self.following_counter.saturating_sub(1);
        if self.following_counter == 0 {
            debug!("Car {} has not heard from its leader, stops following", self.name);
            self.stop_following();
        }
    }

    fn tick_registry(&mut self) {
        let name = self.name;
        let expired = match self.role.registry_mut() {
            Some(registry) => registry.decay(name),
            None => return,
        };
        for gone in expired {
            debug!("Car {} forgets silent car {}", name, gone);
            match &mut self.role {
                Role::Supervisor(c) | Role::Infrastructure(c) if c.backup == Some(gone) => {
                    c.backup = None;
                }
                Role::SecondAtCharge(b) => {
                    b.shadow.remove(&gone);
                    b.backlog.remove(&gone);
                }
                _ => {}
            }
        }
    }

    fn tick_backup(&mut self, config: &SimConfig) {
        let Role::SecondAtCharge(b) = &mut self.role else {
            return;
        };
        let mut overdue = false;
        for ticks_left in b.backlog.values_mut() {
            *ticks_left = ticks_left.saturating_sub(1);
            overdue |= *ticks_left == 0;
        }
        b.supervisor_counter = b.supervisor_counter.saturating_sub(1);
        let expired = b.supervisor_counter == 0;

        if expired && b.acting {
            self.promote(config);
        } else if expired || (overdue && !b.acting) {
            info!(
                "Backup {} answers coordination requests for supervisor {}",
                self.name, b.supervisor
            );
            b.acting = true;
            if expired {
                b.supervisor_counter = config.counters.supervisor_counter;
            }
            let backlog = b.backlog.keys().copied().collect();
            self.drain_backlog(backlog, config);
        }
    }

    fn tick_election(&mut self, config: &SimConfig) {
        let Some(election) = self.election.as_mut() else {
            return;
        };
        election.deliveries += 1;
        election.established.retain(|_, ticks_left| {
            *ticks_left -= 1;
            *ticks_left > 0
        });
        let smallest = election.concurrent.keys().all(|name| *name > self.name);
        if election.deliveries < ELECTION_DELIVERIES
            || !election.established.is_empty()
            || !smallest
        {
            return;
        }

        let concurrent = std::mem::take(&mut election.concurrent);
        info!("Car {} elects itself supervisor", self.name);
        self.become_supervisor(Registry::default(), config);
        for arrival in concurrent.values() {
            self.coordinate_arrival(arrival, config);
        }
    }

    fn tick_disputes(&mut self, config: &SimConfig) {
        for (dispute, outcome) in self.disputes.tick() {
            self.settle(&dispute, &outcome, config);
            self.outcomes.push(outcome);
        }
    }

    /// Applies the control law and integrates the car's motion.
    fn drive(&mut self, config: &SimConfig) {
        if self.role.kind() == RoleKind::Infrastructure {
            return;
        }
        let dt = config.dt;
        self.acceleration = match &self.leader {
            Some(leader) => self.acc.follow(
                self.speed,
                LeaderState {
                    gap: leader.virtual_distance() - self.virtual_distance(),
                    speed: leader.speed,
                    acceleration: leader.acceleration,
                },
            ),
            None => self.acc.free(),
        };
        self.speed = accelerate(self.speed, self.acceleration, dt, config.car.speed);

        if let Some(radius) = self.intention.turn_radius() {
            if self.virtual_x() >= INITIAL_STRAIGHT_SECTION && self.heading_change < 90.0 {
                let (direction, change) = turn(
                    self.actual.direction,
                    self.heading_change,
                    self.speed,
                    dt,
                    radius,
                    self.intention.turn_sign(),
                );
                self.actual.direction = direction;
                self.heading_change = change;
            }
        }
        self.actual = advance(self.actual, self.speed, dt);

        if self.leader.is_some() && self.virtual_distance() > exit_distance() {
            debug!("Car {} has cleared the intersection, stops following", self.name);
            self.stop_following();
        }
    }

    /// Keeps the car's own entry in its registry current.
    fn refresh_own_entry(&mut self, config: &SimConfig) {
        let snapshot = self.snapshot();
        if let Some(registry) = self.role.registry_mut() {
            registry.admit(snapshot, config.counters.member_counter);
        }
    }
}

impl PathPosition for Car {
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

/// Adds a coordinated car to a registry, or refreshes it.
fn admit_established(registry: &mut Registry, sender: &Snapshot, counter: u32) {
    if !registry.refresh(sender.clone(), counter) && !sender.is_new {
        registry.admit(sender.clone(), counter);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::test::snapshot;

    fn car(name: CarName, lane: u8) -> Car {
        Car::new(
            CarId::default(),
            name,
            lane,
            Intention::Straight,
            0,
            &SimConfig::default(),
        )
    }

    fn supervisor(name: CarName) -> Car {
        let config = SimConfig::default();
        let mut car = car(name, 0);
        car.update(&config);
        car.update(&config);
        assert_eq!(car.role(), RoleKind::Supervisor);
        car
    }

    fn arrival(name: CarName, lane: u8) -> Snapshot {
        let mut s = snapshot(name, lane, Intention::Straight);
        s.is_new = true;
        s
    }

    #[test]
    fn lone_car_elects_itself() {
        let config = SimConfig::default();
        let mut car = car(4, 0);
        let out = car.update(&config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, MessageBody::NewCar);
        assert_eq!(car.role(), RoleKind::Ordinary);
        let out = car.update(&config);
        assert_eq!(out[0].body, MessageBody::Info);
        assert_eq!(car.role(), RoleKind::Supervisor);
        assert!(!car.is_new());
        assert_eq!(car.registry().map(Registry::len), Some(1));
    }

    #[test]
    fn earlier_arrival_wins_the_election() {
        let config = SimConfig::default();
        let mut car = car(5, 0);
        car.receive(&Message::new(arrival(3, 1), MessageBody::NewCar), &config);
        for _ in 0..5 {
            car.update(&config);
        }
        assert_eq!(car.role(), RoleKind::Ordinary);
        assert!(car.is_new());
    }

    #[test]
    fn established_cars_suppress_the_election_while_heard() {
        let config = SimConfig::default();
        let mut car = car(5, 0);
        let info = Message::new(snapshot(1, 1, Intention::Left), MessageBody::Info);
        car.receive(&info, &config);
        car.update(&config);
        car.update(&config);
        assert_eq!(car.role(), RoleKind::Ordinary);
        car.update(&config);
        assert_eq!(car.role(), RoleKind::Supervisor);
    }

    #[test]
    fn supervisor_assigns_and_appoints_backup() {
        let config = SimConfig::default();
        let mut sup = supervisor(1);
        sup.receive(&Message::new(arrival(2, 1), MessageBody::NewCar), &config);
        let out = sup.update(&config);
        let assignment = out.iter().find_map(|m| match &m.body {
            MessageBody::FollowingCar {
                follower, leader, ..
            } => Some((*follower, leader.as_ref().map(|l| l.name))),
            _ => None,
        });
        assert_eq!(assignment, Some((2, Some(1))));
        assert!(out
            .iter()
            .any(|m| m.transmit() == crate::message::Recipients::Car(2)));
        assert_eq!(sup.backup(), Some(2));
        let registry = sup.registry().unwrap();
        assert_eq!(registry.get(2).unwrap().snapshot.caravan_depth, 1);
    }

    #[test]
    fn disabled_coordination_stays_silent() {
        let config = SimConfig::default();
        let mut sup = supervisor(1);
        sup.set_faults(FaultInjection {
            attack_supervisory: true,
            ..Default::default()
        });
        sup.receive(&Message::new(arrival(2, 1), MessageBody::NewCar), &config);
        let out = sup.update(&config);
        assert_eq!(out.len(), 1);
        assert!(sup.registry().unwrap().contains(2));
    }

    #[test]
    fn leader_is_abandoned_when_silent() {
        let config = SimConfig::default();
        let mut car = car(3, 0);
        let mut leader = snapshot(2, 0, Intention::Straight);
        leader.caravan_depth = 1;
        let body = MessageBody::FollowingCar {
            follower: 3,
            leader: Some(leader.clone()),
            coordinator: 1,
        };
        car.receive(&Message::new(snapshot(1, 1, Intention::Right), body), &config);
        assert_eq!(car.leader(), Some(2));
        assert_eq!(car.caravan_depth(), 2);
        assert!(!car.is_new());

        // Refreshes reset the counter and carry the leader's depth
        leader.caravan_depth = 0;
        for _ in 0..20 {
            car.receive(&Message::new(leader.clone(), MessageBody::Info), &config);
            car.update(&config);
        }
        assert_eq!(car.leader(), Some(2));
        assert_eq!(car.caravan_depth(), 1);

        for _ in 0..config.counters.following_counter {
            car.update(&config);
        }
        assert_eq!(car.leader(), None);
        assert_eq!(car.caravan_depth(), 0);
    }

    #[test]
    fn stale_references_are_ignored() {
        let config = SimConfig::default();
        let mut sup = supervisor(1);
        let before = sup.registry().unwrap().clone();

        // Departure and refresh of cars that are not known
        let departed = Message::new(snapshot(42, 2, Intention::Left), MessageBody::LeftIntersection);
        sup.receive(&departed, &config);
        assert_eq!(sup.registry().unwrap(), &before);

        // An assignment naming a car that has already left
        let body = MessageBody::FollowingCar {
            follower: 42,
            leader: Some(snapshot(41, 0, Intention::Straight)),
            coordinator: 7,
        };
        sup.receive(&Message::new(snapshot(7, 3, Intention::Straight), body), &config);
        assert_eq!(sup.registry().unwrap(), &before);
        assert_eq!(sup.leader(), None);

        // A vote on a dispute nobody raised
        let body = MessageBody::CorrectedCoordination {
            disputed: 42,
            leader: Some(41),
        };
        sup.receive(&Message::new(snapshot(7, 3, Intention::Straight), body), &config);
        sup.update(&config);
        assert!(sup.dispute_outcomes().is_empty());
        assert_eq!(sup.role(), RoleKind::Supervisor);
    }

    #[test]
    fn departure_hands_over_to_backup() {
        let config = SimConfig::default();
        let mut sup = supervisor(1);
        sup.receive(&Message::new(arrival(2, 1), MessageBody::NewCar), &config);
        sup.receive(&Message::new(arrival(3, 2), MessageBody::NewCar), &config);
        sup.update(&config);
        let out = sup.depart(9, &BTreeSet::from([1]));
        assert_eq!(out.len(), 2);
        match &out[0].body {
            MessageBody::SupervisorLeftIntersection(handoff) => {
                assert_eq!(handoff.successor, Some(2));
                assert!(!handoff.registry.contains(1));
                assert_eq!(handoff.registry.len(), 2);
            }
            body => panic!("unexpected {:?}", body),
        }
        assert_eq!(out[1].body, MessageBody::LeftIntersection);
        assert_eq!(sup.departure_time(), Some(9));
    }

    #[test]
    fn departing_backup_cannot_succeed() {
        let config = SimConfig::default();
        let mut sup = supervisor(1);
        sup.receive(&Message::new(arrival(2, 1), MessageBody::NewCar), &config);
        sup.receive(&Message::new(arrival(3, 2), MessageBody::NewCar), &config);
        sup.update(&config);
        assert_eq!(sup.backup(), Some(2));

        // The backup leaves in the same tick
        let out = sup.depart(9, &BTreeSet::from([1, 2]));
        match &out[0].body {
            MessageBody::SupervisorLeftIntersection(handoff) => {
                assert_eq!(handoff.successor, Some(3));
            }
            body => panic!("unexpected {:?}", body),
        }
    }

    /// Car 4 arrives in lane 2 and should follow car 3, but the supervisor
    /// and its backup both claim otherwise.
    fn contested_dispute() -> Dispute {
        let mut backup = snapshot(2, 1, Intention::Straight);
        backup.caravan_depth = 1;
        backup.role = RoleKind::SecondAtCharge;
        let mut third = snapshot(3, 3, Intention::Straight);
        third.caravan_depth = 2;
        let mut sup = snapshot(1, 0, Intention::Straight);
        sup.role = RoleKind::Supervisor;
        Dispute {
            arrival: arrival(4, 2),
            members: vec![sup, backup, third],
            supervisor: 1,
            supervisor_claim: Some(2),
            backup: 2,
            backup_claim: Some(1),
        }
    }

    fn settle_contested(car: &mut Car) -> Vec<Message> {
        let config = SimConfig::default();
        let dispute = contested_dispute();
        assert_eq!(dispute.replay(false), Some(3));
        let raised = Message::new(
            snapshot(2, 1, Intention::Straight),
            MessageBody::FaultyCoordination(dispute.clone()),
        );
        car.receive(&raised, &config);
        for (voter, leader) in [(1, Some(2)), (2, Some(3)), (3, Some(3)), (4, Some(3))] {
            if voter == car.name() {
                continue;
            }
            let lane = dispute.member(voter).map_or(2, |m| m.lane);
            let body = MessageBody::CorrectedCoordination {
                disputed: 4,
                leader,
            };
            car.receive(&Message::new(snapshot(voter, lane, Intention::Straight), body), &config);
        }
        car.update(&config)
    }

    #[test]
    fn earliest_honest_voter_replaces_both_coordinators() {
        let mut car = car(3, 3);
        let out = settle_contested(&mut car);
        assert!(matches!(
            car.dispute_outcomes(),
            [DisputeOutcome::Resolved { leader: Some(3), faulty, .. }] if faulty.as_slice() == [1, 2]
        ));
        assert_eq!(car.role(), RoleKind::Supervisor);
        assert!(out.iter().any(|m| m.body == MessageBody::NewSupervisor));

        let registry = car.registry().unwrap();
        assert!([1, 2, 3, 4].iter().all(|name| registry.contains(*name)));
        assert_eq!(registry.get(4).unwrap().leader, Some(3));
        assert!(!registry.get(4).unwrap().snapshot.is_new);
    }

    #[test]
    fn other_voters_follow_the_majority_and_stay_ordinary() {
        let mut disputed = Car::new(
            CarId::default(),
            4,
            2,
            Intention::Straight,
            0,
            &SimConfig::default(),
        );
        settle_contested(&mut disputed);
        assert_eq!(disputed.role(), RoleKind::Ordinary);
        assert_eq!(disputed.leader(), Some(3));
        assert_eq!(disputed.caravan_depth(), 3);
        assert!(disputed.faulty().contains(&1) && disputed.faulty().contains(&2));
    }

    #[test]
    fn record_serialises() {
        let car = car(7, 3);
        let json = car.to_json();
        assert_eq!(json["name"], 7);
        assert_eq!(json["lane"], 3);
        assert_eq!(json["following"], serde_json::Value::Null);
        assert_eq!(json["caravan_depth"], 0);
    }
}
