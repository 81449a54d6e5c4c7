//! Assignment of leaders to new arrivals.

use crate::geometry::cross_path;
use crate::message::Snapshot;
use crate::role::RoleKind;
use crate::CarName;
use itertools::Itertools;

/// Chooses the car a new arrival should follow, or `None` if it should lead its own caravan.
///
/// The known cars are scanned deepest caravan first, latest arrival first within
/// the same depth, and the arrival follows the first earlier arrival whose path
/// crosses its own. The order of the scan decides who follows whom and must
/// not change.
pub fn assign_leader<'a>(
    members: impl IntoIterator<Item = &'a Snapshot>,
    arrival: &Snapshot,
) -> Option<CarName> {
    candidates(members, arrival)
        .find(|member| {
            cross_path(
                arrival.lane,
                arrival.intention,
                member.lane,
                member.intention,
            )
        })
        .map(|member| member.name)
}

/// Chooses a deliberately wrong leader for a new arrival: the first earlier
/// arrival in scan order that differs from the correct choice, or no leader if
/// there is no such car.
pub fn misassign_leader<'a>(
    members: impl IntoIterator<Item = &'a Snapshot>,
    arrival: &Snapshot,
) -> Option<CarName> {
    let members = members.into_iter().collect::<Vec<_>>();
    let honest = assign_leader(members.iter().copied(), arrival);
    candidates(members, arrival)
        .map(|member| member.name)
        .find(|name| Some(*name) != honest)
}

/// Runs the coordination algorithm, misassigning on purpose if `lies` is set.
pub fn coordinate<'a>(
    members: impl IntoIterator<Item = &'a Snapshot>,
    arrival: &Snapshot,
    lies: bool,
) -> Option<CarName> {
    if lies {
        misassign_leader(members, arrival)
    } else {
        assign_leader(members, arrival)
    }
}

/// The cars that arrived before `arrival`, in scan order.
fn candidates<'a>(
    members: impl IntoIterator<Item = &'a Snapshot>,
    arrival: &Snapshot,
) -> impl Iterator<Item = &'a Snapshot> {
    let name = arrival.name;
    members
        .into_iter()
        .filter(move |member| member.name < name && member.role != RoleKind::Infrastructure)
        .sorted_by(|a, b| (b.caravan_depth, b.name).cmp(&(a.caravan_depth, a.name)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Intention::{self, *};
    use crate::message::test::snapshot;

    fn member(name: CarName, lane: u8, intention: Intention, depth: u32) -> Snapshot {
        let mut s = snapshot(name, lane, intention);
        s.caravan_depth = depth;
        s
    }

    #[test]
    fn perpendicular_arrival_follows_earlier_car() {
        let members = [member(1, 0, Straight, 0)];
        let arrival = member(2, 1, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), Some(1));
    }

    #[test]
    fn same_lane_builds_a_chain() {
        let members = [member(1, 0, Straight, 0), member(2, 0, Straight, 1)];
        let arrival = member(3, 0, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), Some(2));
    }

    #[test]
    fn depth_dominates_recency() {
        // Car 2 is more recent, but car 1 sits deeper in a caravan
        let members = [
            member(1, 0, Straight, 3),
            member(2, 0, Straight, 0),
            member(0, 2, Left, 2),
        ];
        let arrival = member(5, 0, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), Some(1));
    }

    #[test]
    fn non_crossing_arrival_leads() {
        // Opposing straight-through traffic keeps to its own side
        let members = [member(1, 0, Straight, 0)];
        let arrival = member(2, 2, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), None);
    }

    #[test]
    fn later_arrivals_are_never_leaders() {
        let members = [member(4, 0, Straight, 0), member(3, 0, Straight, 1)];
        let arrival = member(3, 0, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), None);
    }

    #[test]
    fn assignment_is_deterministic() {
        let members = [
            member(1, 0, Right, 0),
            member(2, 1, Left, 1),
            member(3, 3, Straight, 0),
            member(4, 2, Straight, 2),
        ];
        let arrival = member(5, 1, Straight, 0);
        let first = assign_leader(&members, &arrival);
        let mut reversed = members.clone();
        reversed.reverse();
        for _ in 0..10 {
            assert_eq!(assign_leader(&members, &arrival), first);
            assert_eq!(assign_leader(&reversed, &arrival), first);
        }
    }

    #[test]
    fn misassignment_differs_when_possible() {
        let members = [member(1, 0, Straight, 0), member(2, 1, Straight, 1)];
        let arrival = member(3, 2, Straight, 0);
        assert_eq!(assign_leader(&members, &arrival), Some(2));
        assert_eq!(misassign_leader(&members, &arrival), Some(1));
        assert_eq!(coordinate(&members, &arrival, true), Some(1));
        assert_eq!(coordinate(&members, &arrival, false), Some(2));

        let members = [member(1, 0, Straight, 0)];
        let arrival = member(2, 2, Straight, 0);
        assert_eq!(misassign_leader(&members, &arrival), Some(1));

        let arrival = member(2, 0, Straight, 0);
        assert_eq!(misassign_leader(&members, &arrival), None);
    }
}
