//! The roles a car can hold and the state that comes with them.

use crate::message::Snapshot;
use crate::{CarName, INFRASTRUCTURE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The kind of role a car holds, without its role-local state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    Ordinary,
    Supervisor,
    SecondAtCharge,
    Infrastructure,
}

impl RoleKind {
    /// Whether the role carries authority over new arrivals.
    pub fn is_coordinator(self) -> bool {
        matches!(self, RoleKind::Supervisor | RoleKind::Infrastructure)
    }
}

/// The role of a car, together with its role-local state.
#[derive(Clone, Debug)]
pub enum Role {
    Ordinary,
    Supervisor(Coordinator),
    SecondAtCharge(Backup),
    /// A stationary agent that permanently supervises the intersection.
    Infrastructure(Coordinator),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Ordinary => RoleKind::Ordinary,
            Role::Supervisor(_) => RoleKind::Supervisor,
            Role::SecondAtCharge(_) => RoleKind::SecondAtCharge,
            Role::Infrastructure(_) => RoleKind::Infrastructure,
        }
    }

    /// The local replica of the cars at the intersection, if the role keeps one.
    pub fn registry(&self) -> Option<&Registry> {
        match self {
            Role::Ordinary => None,
            Role::Supervisor(c) | Role::Infrastructure(c) => Some(&c.registry),
            Role::SecondAtCharge(b) => Some(&b.registry),
        }
    }

    pub fn registry_mut(&mut self) -> Option<&mut Registry> {
        match self {
            Role::Ordinary => None,
            Role::Supervisor(c) | Role::Infrastructure(c) => Some(&mut c.registry),
            Role::SecondAtCharge(b) => Some(&mut b.registry),
        }
    }
}

/// State of a car that assigns leaders to new arrivals.
#[derive(Clone, Debug, Default)]
pub struct Coordinator {
    pub(crate) registry: Registry,
    /// The appointed backup, if any.
    pub(crate) backup: Option<CarName>,
}

impl Coordinator {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            backup: None,
        }
    }

    /// The appointed backup, if any.
    pub fn backup(&self) -> Option<CarName> {
        self.backup
    }

    /// Whether a freshly coordinated arrival should be appointed backup.
    /// An arrival qualifies while the post is vacant and it sits deeper in its
    /// caravan than the current candidate.
    pub(crate) fn should_appoint(&self, depth: u32) -> bool {
        let candidate_depth = self
            .backup
            .and_then(|name| self.registry.get(name))
            .map(|member| i64::from(member.snapshot.caravan_depth))
            .unwrap_or(-1);
        self.backup.is_none() && i64::from(depth) > candidate_depth
    }
}

/// State of the backup coordinator.
#[derive(Clone, Debug)]
pub struct Backup {
    pub(crate) registry: Registry,
    /// The supervisor being shadowed.
    pub(crate) supervisor: CarName,
    /// Ticks left before the supervisor is presumed gone.
    pub(crate) supervisor_counter: u32,
    /// Whether the backup answers coordination requests itself.
    pub(crate) acting: bool,
    /// Shadow decisions awaiting the supervisor's verdict, by arrival.
    pub(crate) shadow: BTreeMap<CarName, Option<CarName>>,
    /// Arrivals not yet coordinated, with the ticks left before the backup steps in.
    pub(crate) backlog: BTreeMap<CarName, u32>,
}

impl Backup {
    pub fn new(registry: Registry, supervisor: CarName, supervisor_counter: u32) -> Self {
        Self {
            registry,
            supervisor,
            supervisor_counter,
            acting: false,
            shadow: BTreeMap::new(),
            backlog: BTreeMap::new(),
        }
    }

    /// The supervisor being shadowed.
    pub fn supervisor(&self) -> CarName {
        self.supervisor
    }

    /// Whether the backup currently answers coordination requests.
    pub fn is_acting(&self) -> bool {
        self.acting
    }
}

/// A car known to a coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The last known state of the car. Its depth is re-derived from the
    /// registry's follow graph whenever the car has a known leader.
    pub snapshot: Snapshot,
    /// The leader assigned to the car.
    pub leader: Option<CarName>,
    /// Ticks left before the car is presumed gone.
    counter: u32,
}

/// A coordinator's local, possibly stale, replica of the cars at the intersection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    members: BTreeMap<CarName, Member>,
    /// Routing map from each leader to its followers.
    routes: BTreeMap<CarName, BTreeSet<CarName>>,
}

impl Registry {
    /// Number of known cars.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: CarName) -> bool {
        self.members.contains_key(&name)
    }

    pub fn get(&self, name: CarName) -> Option<&Member> {
        self.members.get(&name)
    }

    /// The last known state of every car, in ascending name order.
    pub fn snapshots(&self) -> impl DoubleEndedIterator<Item = &Snapshot> {
        self.members.values().map(|member| &member.snapshot)
    }

    /// Every known car except `name`.
    pub fn snapshots_except(&self, name: CarName) -> Vec<Snapshot> {
        self.snapshots()
            .filter(|snapshot| snapshot.name != name)
            .cloned()
            .collect()
    }

    /// The followers assigned to a leader.
    pub fn followers(&self, leader: CarName) -> impl Iterator<Item = CarName> + '_ {
        self.routes.get(&leader).into_iter().flatten().copied()
    }

    /// The most recent coordinated arrival other than `except` that is not in `excluded`.
    pub fn latest(&self, except: CarName, excluded: &BTreeSet<CarName>) -> Option<CarName> {
        self.snapshots()
            .rev()
            .filter(|s| !s.is_new && s.name != except && s.name != INFRASTRUCTURE_NAME)
            .map(|s| s.name)
            .find(|name| !excluded.contains(name))
    }

    /// Adds a car, or refreshes it if it is already known.
    pub fn admit(&mut self, snapshot: Snapshot, counter: u32) {
        if !self.refresh(snapshot.clone(), counter) {
            let name = snapshot.name;
            self.members.insert(
                name,
                Member {
                    snapshot,
                    leader: None,
                    counter,
                },
            );
        }
    }

    /// Updates the state of a known car and resets its counter.
    /// Returns `false` if the car is unknown.
    pub fn refresh(&mut self, snapshot: Snapshot, counter: u32) -> bool {
        let name = snapshot.name;
        match self.members.get_mut(&name) {
            Some(member) => {
                let depth = member.snapshot.caravan_depth;
                member.snapshot = snapshot;
                member.counter = counter;
                if member.leader.is_some() {
                    member.snapshot.caravan_depth = depth;
                }
                self.propagate_depth(name);
                true
            }
            None => false,
        }
    }

    /// Removes a car. Its followers become caravan leaders and the depths of
    /// their caravans are re-derived.
    pub fn remove(&mut self, name: CarName) -> Option<Member> {
        let member = self.members.remove(&name)?;
        if let Some(leader) = member.leader {
            self.detach(leader, name);
        }
        for follower in self.routes.remove(&name).unwrap_or_default() {
            if let Some(f) = self.members.get_mut(&follower) {
                f.leader = None;
                f.snapshot.caravan_depth = 0;
            }
            self.propagate_depth(follower);
        }
        Some(member)
    }

    /// Records the leader assigned to a car. Unknown cars are ignored, and a
    /// leader that is no longer known leaves the car leading its own caravan.
    /// Returns `false` if the follower is unknown.
    pub fn record_assignment(&mut self, follower: CarName, leader: Option<CarName>) -> bool {
        let previous = match self.members.get(&follower) {
            Some(member) => member.leader,
            None => return false,
        };
        if let Some(previous) = previous {
            self.detach(previous, follower);
        }
        let leader = leader.filter(|l| *l != follower && self.members.contains_key(l));
        debug_assert!(
            leader.map_or(true, |l| l < follower),
            "car {} assigned to later arrival {:?}",
            follower,
            leader
        );
        let depth = leader
            .and_then(|l| self.members.get(&l))
            .map_or(0, |l| l.snapshot.caravan_depth + 1);
        if let Some(l) = leader {
            self.routes.entry(l).or_default().insert(follower);
        }
        if let Some(member) = self.members.get_mut(&follower) {
            member.leader = leader;
            member.snapshot.caravan_depth = depth;
            member.snapshot.is_new = false;
        }
        self.propagate_depth(follower);
        true
    }

    /// Counts down the counter of every car except `keep`, removing and
    /// returning the cars whose counter expired.
    pub fn decay(&mut self, keep: CarName) -> Vec<CarName> {
        let mut expired = vec![];
        for (name, member) in self.members.iter_mut() {
            if *name == keep {
                continue;
            }
            member.counter = member.counter.saturating_sub(1);
            if member.counter == 0 {
                expired.push(*name);
            }
        }
        for name in &expired {
            self.remove(*name);
        }
        expired
    }

    fn detach(&mut self, leader: CarName, follower: CarName) {
        if let Some(followers) = self.routes.get_mut(&leader) {
            followers.remove(&follower);
            if followers.is_empty() {
                self.routes.remove(&leader);
            }
        }
    }

    /// Re-derives the depths of every car downstream of `name`.
    fn propagate_depth(&mut self, name: CarName) {
        let mut stack = vec![name];
        let mut visited = BTreeSet::new();
        while let Some(leader) = stack.pop() {
            if !visited.insert(leader) {
                continue;
            }
            let depth = match self.members.get(&leader) {
                Some(member) => member.snapshot.caravan_depth,
                None => continue,
            };
            for follower in self.routes.get(&leader).into_iter().flatten() {
                if let Some(member) = self.members.get_mut(follower) {
                    member.snapshot.caravan_depth = depth + 1;
                }
                stack.push(*follower);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Intention;
    use crate::message::test::snapshot;

    fn registry(names: &[CarName]) -> Registry {
        let mut registry = Registry::default();
        for name in names {
            registry.admit(snapshot(*name, 0, Intention::Straight), 8);
        }
        registry
    }

    fn depth(registry: &Registry, name: CarName) -> u32 {
        registry.get(name).unwrap().snapshot.caravan_depth
    }

    #[test]
    fn assignments_derive_depth() {
        let mut registry = registry(&[1, 2, 3]);
        assert!(registry.record_assignment(2, Some(1)));
        assert!(registry.record_assignment(3, Some(2)));
        assert_eq!(depth(&registry, 1), 0);
        assert_eq!(depth(&registry, 2), 1);
        assert_eq!(depth(&registry, 3), 2);
        assert_eq!(registry.followers(1).collect::<Vec<_>>(), vec![2]);

        // Reassigning moves the whole subtree
        registry.record_assignment(2, None);
        assert_eq!(depth(&registry, 2), 0);
        assert_eq!(depth(&registry, 3), 1);
        assert_eq!(registry.followers(1).count(), 0);
    }

    #[test]
    fn removing_a_leader_promotes_its_followers() {
        let mut registry = registry(&[1, 2, 3, 4]);
        registry.record_assignment(2, Some(1));
        registry.record_assignment(3, Some(2));
        registry.record_assignment(4, Some(3));
        assert!(registry.remove(2).is_some());
        assert_eq!(depth(&registry, 3), 0);
        assert_eq!(depth(&registry, 4), 1);
        assert_eq!(registry.get(3).unwrap().leader, None);
        assert!(registry.remove(2).is_none());
    }

    #[test]
    fn refresh_keeps_derived_depth() {
        let mut registry = registry(&[1, 2]);
        registry.record_assignment(2, Some(1));
        // The follower has not heard of its assignment yet
        assert!(registry.refresh(snapshot(2, 0, Intention::Straight), 8));
        assert_eq!(depth(&registry, 2), 1);
        assert!(!registry.refresh(snapshot(9, 0, Intention::Straight), 8));
    }

    #[test]
    fn stale_assignments_are_ignored() {
        let mut registry = registry(&[1, 2]);
        assert!(!registry.record_assignment(5, Some(1)));
        assert!(registry.record_assignment(2, Some(5)));
        assert_eq!(registry.get(2).unwrap().leader, None);
        assert_eq!(depth(&registry, 2), 0);
    }

    #[test]
    fn silent_members_are_pruned() {
        let mut registry = Registry::default();
        registry.admit(snapshot(1, 0, Intention::Straight), 2);
        registry.admit(snapshot(2, 1, Intention::Straight), 2);
        registry.admit(snapshot(3, 2, Intention::Straight), 3);
        registry.record_assignment(3, Some(2));
        assert!(registry.decay(1).is_empty());
        assert_eq!(registry.decay(1), vec![2]);
        assert!(registry.contains(1));
        assert_eq!(depth(&registry, 3), 0);
        assert_eq!(registry.decay(1), vec![3]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn latest_skips_uncoordinated_and_excluded() {
        let mut registry = registry(&[1, 2, 3]);
        let mut arrival = snapshot(4, 1, Intention::Left);
        arrival.is_new = true;
        registry.admit(arrival, 8);
        assert_eq!(registry.latest(1, &BTreeSet::new()), Some(3));
        assert_eq!(registry.latest(3, &BTreeSet::new()), Some(2));
        assert_eq!(registry.latest(1, &BTreeSet::from([2, 3])), None);
    }

    #[test]
    fn appointment_needs_vacant_post() {
        let mut coordinator = Coordinator::new(registry(&[1, 2]));
        assert!(coordinator.should_appoint(0));
        coordinator.backup = Some(2);
        assert!(!coordinator.should_appoint(3));
    }
}
