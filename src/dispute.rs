//! Disputed assignments and the majority vote that settles them.

use crate::coordination::coordinate;
use crate::message::Snapshot;
use crate::role::RoleKind;
use crate::CarName;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// Two competing assignments of a leader to the same arrival.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    /// The arrival whose leader is disputed.
    pub arrival: Snapshot,
    /// The cars known when the arrival was coordinated, excluding the arrival.
    pub members: Vec<Snapshot>,
    pub supervisor: CarName,
    pub supervisor_claim: Option<CarName>,
    pub backup: CarName,
    pub backup_claim: Option<CarName>,
}

impl Dispute {
    /// The name of the disputed arrival.
    pub fn disputed(&self) -> CarName {
        self.arrival.name
    }

    /// The cars present when the dispute was raised, all of which are entitled to vote.
    pub fn voters(&self) -> BTreeSet<CarName> {
        self.members
            .iter()
            .filter(|member| member.role != RoleKind::Infrastructure)
            .map(|member| member.name)
            .chain(std::iter::once(self.arrival.name))
            .collect()
    }

    /// Recomputes the assignment from the recorded membership.
    pub fn replay(&self, lies: bool) -> Option<CarName> {
        coordinate(&self.members, &self.arrival, lies)
    }

    /// The last known state of a car involved in the dispute.
    pub fn member(&self, name: CarName) -> Option<&Snapshot> {
        self.members.iter().find(|member| member.name == name)
    }

    /// The claimants whose claim disagrees with `leader`.
    fn losers(&self, leader: Option<CarName>) -> SmallVec<[CarName; 2]> {
        let mut losers = SmallVec::new();
        if self.supervisor_claim != leader {
            losers.push(self.supervisor);
        }
        if self.backup_claim != leader {
            losers.push(self.backup);
        }
        losers
    }
}

/// How a dispute was settled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeOutcome {
    /// A strict majority agreed on `leader`; the `faulty` claimants disagreed with it.
    Resolved {
        disputed: CarName,
        leader: Option<CarName>,
        faulty: SmallVec<[CarName; 2]>,
    },
    /// No candidate gathered a strict majority.
    Unresolved { disputed: CarName },
}

impl DisputeOutcome {
    pub fn disputed(&self) -> CarName {
        match self {
            DisputeOutcome::Resolved { disputed, .. } => *disputed,
            DisputeOutcome::Unresolved { disputed } => *disputed,
        }
    }
}

#[derive(Clone, Debug)]
struct OpenDispute {
    dispute: Dispute,
    voters: BTreeSet<CarName>,
    votes: BTreeMap<CarName, Option<CarName>>,
    ticks_left: u32,
}

impl OpenDispute {
    fn is_complete(&self) -> bool {
        self.voters.iter().all(|voter| self.votes.contains_key(voter))
    }

    fn outcome(&self) -> DisputeOutcome {
        let disputed = self.dispute.disputed();
        match tally(self.voters.len(), self.votes.values().copied()) {
            Some(leader) => DisputeOutcome::Resolved {
                disputed,
                leader,
                faulty: self.dispute.losers(leader),
            },
            None => DisputeOutcome::Unresolved { disputed },
        }
    }
}

/// Returns the candidate backed by strictly more than half of `voters`, if any.
pub fn tally(
    voters: usize,
    votes: impl IntoIterator<Item = Option<CarName>>,
) -> Option<Option<CarName>> {
    votes
        .into_iter()
        .counts()
        .into_iter()
        .find(|(_, count)| 2 * count > voters)
        .map(|(candidate, _)| candidate)
}

/// The disputes a car is following, keyed by the disputed arrival.
#[derive(Clone, Debug, Default)]
pub struct DisputeLedger {
    open: BTreeMap<CarName, OpenDispute>,
}

impl DisputeLedger {
    /// Starts tallying a dispute. Returns `false` if it is already open.
    pub fn open(&mut self, dispute: Dispute, timeout: u32) -> bool {
        let disputed = dispute.disputed();
        if self.open.contains_key(&disputed) {
            return false;
        }
        let voters = dispute.voters();
        self.open.insert(
            disputed,
            OpenDispute {
                dispute,
                voters,
                votes: BTreeMap::new(),
                ticks_left: timeout,
            },
        );
        true
    }

    pub fn is_open(&self, disputed: CarName) -> bool {
        self.open.contains_key(&disputed)
    }

    /// Records a vote. Votes on unknown disputes, from cars that were not
    /// present when the dispute was raised, or repeated votes are ignored.
    pub fn vote(&mut self, disputed: CarName, voter: CarName, leader: Option<CarName>) -> bool {
        match self.open.get_mut(&disputed) {
            Some(open) if open.voters.contains(&voter) && !open.votes.contains_key(&voter) => {
                open.votes.insert(voter, leader);
                true
            }
            _ => false,
        }
    }

    /// A voter has left; it will not vote.
    pub fn withdraw(&mut self, voter: CarName) {
        for open in self.open.values_mut() {
            if !open.votes.contains_key(&voter) {
                open.ticks_left = open.ticks_left.min(1);
            }
        }
    }

    /// Advances every open dispute by one tick, closing those with every vote
    /// in or with no time left.
    pub fn tick(&mut self) -> Vec<(Dispute, DisputeOutcome)> {
        let mut closed = vec![];
        for (disputed, open) in self.open.iter_mut() {
            open.ticks_left = open.ticks_left.saturating_sub(1);
            if open.is_complete() || open.ticks_left == 0 {
                closed.push(*disputed);
            }
        }
        closed
            .into_iter()
            .filter_map(|disputed| self.open.remove(&disputed))
            .map(|open| {
                let outcome = open.outcome();
                (open.dispute, outcome)
            })
            .collect()
    }
}
