//! Intersection geometry: entry points, path-crossing compatibility and the
//! one-dimensional "virtual distance" that places every vehicle on a common
//! caravan axis regardless of the shape of its path.

use crate::math::{forward, left, project_local, Point2d};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// The width and height of the simulated area.
pub const SCREEN_SIZE: f64 = 768.0; // px

/// Distance from an entry point to the centre of the intersection.
pub const CONFLICT_ZONE_RADIUS: f64 = 384.0; // px

/// The width of the carriageway crossing the intersection.
pub const PATH_WIDTH: f64 = 172.0; // px

/// Radius of a right turn; right turns hug the near corner.
pub const RIGHT_TURN_RADIUS: f64 = PATH_WIDTH / 4.0; // px

/// Radius of a left turn.
pub const LEFT_TURN_RADIUS: f64 = 3.0 * PATH_WIDTH / 4.0; // px

/// Length of the straight run-up before a turning vehicle starts to turn.
pub const INITIAL_STRAIGHT_SECTION: f64 = CONFLICT_ZONE_RADIUS - PATH_WIDTH / 2.0; // px

/// The number of approaches to the intersection.
pub const NUM_LANES: u8 = 4;

/// Entry point `(x, y, heading)` of each lane.
const ENTRY_POINTS: [(f64, f64, f64); NUM_LANES as usize] = [
    (435.0, 760.0, 0.0),
    (760.0, 345.0, 90.0),
    (345.0, 10.0, 180.0),
    (10.0, 435.0, 270.0),
];

/// Path-crossing tables indexed by `(self_lane - other_lane) mod 4`, then by the
/// intention of each vehicle in left/straight/right order.
const CROSS_PATH_TABLES: [[[bool; 3]; 3]; NUM_LANES as usize] = [
    [[true, true, true], [true, true, true], [true, true, true]],
    [[true, true, false], [true, true, false], [false, true, false]],
    [[true, true, true], [true, false, false], [true, false, false]],
    [[true, true, false], [true, true, true], [false, false, false]],
];

/// Where a vehicle intends to go once it reaches the intersection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Intention {
    Left,
    Straight,
    Right,
}

impl Intention {
    /// Every intention, in table order.
    pub const ALL: [Intention; 3] = [Intention::Left, Intention::Straight, Intention::Right];

    fn table_index(self) -> usize {
        match self {
            Intention::Left => 0,
            Intention::Straight => 1,
            Intention::Right => 2,
        }
    }

    /// The radius of the turn, or `None` for straight-through vehicles.
    pub fn turn_radius(self) -> Option<f64> {
        match self {
            Intention::Left => Some(LEFT_TURN_RADIUS),
            Intention::Straight => None,
            Intention::Right => Some(RIGHT_TURN_RADIUS),
        }
    }

    /// The sign of the heading change while turning: left turns increase the heading.
    pub fn turn_sign(self) -> f64 {
        match self {
            Intention::Left => 1.0,
            Intention::Straight => 0.0,
            Intention::Right => -1.0,
        }
    }
}

/// A position in screen space plus a heading in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub position: Point2d,
    pub direction: f64,
}

impl Coordinates {
    /// Creates a new set of coordinates.
    pub fn new(x: f64, y: f64, direction: f64) -> Self {
        Self {
            position: Point2d::new(x, y),
            direction,
        }
    }

    /// The coordinates at which vehicles enter the given lane.
    ///
    /// # Panics
    /// Panics if `lane >= NUM_LANES`.
    pub fn entry(lane: u8) -> Self {
        let (x, y, direction) = ENTRY_POINTS[lane as usize];
        Self::new(x, y, direction)
    }

    /// Whether the position lies within the simulated area.
    pub fn on_screen(&self) -> bool {
        let p = self.position;
        (0.0..=SCREEN_SIZE).contains(&p.x) && (0.0..=SCREEN_SIZE).contains(&p.y)
    }
}

/// Returns whether the path of a vehicle can physically intersect the path of another.
///
/// The lookup is deliberately asymmetric: a turning vehicle only has to yield
/// to some of the approaches that would have to yield to it.
pub fn cross_path(
    self_lane: u8,
    self_intention: Intention,
    other_lane: u8,
    other_intention: Intention,
) -> bool {
    let offset = (i32::from(self_lane) - i32::from(other_lane)).rem_euclid(NUM_LANES as i32);
    CROSS_PATH_TABLES[offset as usize][self_intention.table_index()][other_intention.table_index()]
}

/// Forward offset of `actual` from `origin`, measured along the origin heading.
pub fn virtual_x(origin: &Coordinates, actual: &Coordinates) -> f64 {
    local_offset(origin, actual).x.abs()
}

/// Lateral offset of `actual` from `origin`; positive values lie to the left.
pub fn virtual_y(origin: &Coordinates, actual: &Coordinates) -> f64 {
    local_offset(origin, actual).y
}

fn local_offset(origin: &Coordinates, actual: &Coordinates) -> Point2d {
    project_local(
        actual.position,
        origin.position,
        forward(origin.direction),
        left(origin.direction),
    )
}

/// Maps a position on a (possibly curved) path onto a single increasing scalar.
///
/// Straight-through vehicles use their forward offset. Turning vehicles use the
/// run-up length plus the arc length travelled around the turn, rescaled so that
/// every path reaches the far side of the conflict zone at the same value.
pub fn virtual_distance(origin: &Coordinates, actual: &Coordinates, intention: Intention) -> f64 {
    let vx = virtual_x(origin, actual);
    let radius = match intention.turn_radius() {
        Some(radius) => radius,
        None => return vx,
    };
    // Lateral offset towards the inside of the turn
    let lateral = intention.turn_sign() * virtual_y(origin, actual);

    let straight = INITIAL_STRAIGHT_SECTION;
    let arc = PI * radius / 2.0;
    let raw = if vx <= straight {
        vx
    } else if lateral < radius {
        straight + ((vx - straight) / (radius - lateral)).atan() * radius
    } else {
        straight + arc + lateral - radius
    };

    let a = PATH_WIDTH / 2.0;
    let b = RIGHT_TURN_RADIUS + PATH_WIDTH / 4.0;
    if raw <= straight + arc {
        raw * (straight + a + b) / (straight + arc)
    } else {
        raw + a + b - arc
    }
}

/// The virtual distance at which a vehicle has left the conflict zone.
pub fn exit_distance() -> f64 {
    INITIAL_STRAIGHT_SECTION + PATH_WIDTH
}

/// Implemented by anything that knows where a vehicle entered and where it is now.
pub trait PathPosition {
    /// Where the vehicle entered the simulation.
    fn origin_coordinates(&self) -> Coordinates;

    /// Where the vehicle is now.
    fn actual_coordinates(&self) -> Coordinates;

    /// The vehicle's intention at the intersection.
    fn intention(&self) -> Intention;

    fn virtual_x(&self) -> f64 {
        virtual_x(&self.origin_coordinates(), &self.actual_coordinates())
    }

    fn virtual_y(&self) -> f64 {
        virtual_y(&self.origin_coordinates(), &self.actual_coordinates())
    }

    /// Position along the vehicle's own path. [Read more](virtual_distance).
    fn virtual_distance(&self) -> f64 {
        virtual_distance(
            &self.origin_coordinates(),
            &self.actual_coordinates(),
            self.intention(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Builds screen coordinates from a forward/lateral offset relative to lane 0.
    fn lane0_at(vx: f64, vy: f64) -> Coordinates {
        let origin = Coordinates::entry(0);
        let p = origin.position + vx * forward(0.0) + vy * left(0.0);
        Coordinates::new(p.x, p.y, 0.0)
    }

    #[test]
    fn same_lane_always_crosses() {
        for lane in 0..NUM_LANES {
            for a in Intention::ALL {
                for b in Intention::ALL {
                    assert!(cross_path(lane, a, lane, b));
                }
            }
        }
    }

    #[test]
    fn cross_path_depends_only_on_offset() {
        use Intention::*;
        // Westbound straight against northbound straight
        assert!(cross_path(1, Straight, 0, Straight));
        assert!(cross_path(2, Straight, 1, Straight));
        // Northbound right turn never meets the westbound approach
        assert!(!cross_path(0, Right, 1, Left));
        assert!(!cross_path(0, Right, 1, Straight));
        assert!(!cross_path(0, Right, 1, Right));
        // Opposing straight-through vehicles keep to their own side
        assert!(!cross_path(2, Straight, 0, Straight));
        assert!(cross_path(2, Left, 0, Straight));
    }

    #[test]
    fn cross_path_matches_table() {
        // One block per (self_lane - other_lane) mod 4; rows are this car's
        // intention and columns the other car's, both in left, straight, right order
        let expected = [
            ["TTT", "TTT", "TTT"],
            ["TTF", "TTF", "FTF"],
            ["TTT", "TFF", "TFF"],
            ["TTF", "TTT", "FFF"],
        ];
        for (offset, rows) in (0..NUM_LANES).zip(expected) {
            for (a, row) in Intention::ALL.into_iter().zip(rows) {
                for (b, cell) in Intention::ALL.into_iter().zip(row.chars()) {
                    for other in 0..NUM_LANES {
                        let lane = (other + offset) % NUM_LANES;
                        assert_eq!(
                            cross_path(lane, a, other, b),
                            cell == 'T',
                            "lane {} {:?} against lane {} {:?}",
                            lane,
                            a,
                            other,
                            b
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn virtual_offsets_at_entry() {
        for lane in 0..NUM_LANES {
            let entry = Coordinates::entry(lane);
            assert_approx_eq!(virtual_x(&entry, &entry), 0.0);
            assert_approx_eq!(virtual_y(&entry, &entry), 0.0);
        }
        let origin = Coordinates::entry(1);
        let moved = Coordinates::new(700.0, 355.0, 90.0);
        assert_approx_eq!(virtual_x(&origin, &moved), 60.0);
        // Heading west, the left-hand side is south (larger y)
        assert_approx_eq!(virtual_y(&origin, &moved), 10.0);
    }

    #[test]
    fn straight_distance_is_forward_offset() {
        let origin = Coordinates::entry(0);
        let actual = lane0_at(123.0, 0.0);
        assert_approx_eq!(virtual_distance(&origin, &actual, Intention::Straight), 123.0);
    }

    #[test]
    fn turn_distance_is_continuous() {
        let origin = Coordinates::entry(0);
        for intention in [Intention::Left, Intention::Right] {
            let radius = intention.turn_radius().unwrap();
            let side = intention.turn_sign();
            // Just before and after leaving the arc, a quarter turn around the centre
            let eps = 1e-6;
            let before = lane0_at(INITIAL_STRAIGHT_SECTION + radius, side * (radius - eps));
            let after = lane0_at(INITIAL_STRAIGHT_SECTION + radius, side * (radius + eps));
            let d0 = virtual_distance(&origin, &before, intention);
            let d1 = virtual_distance(&origin, &after, intention);
            assert_approx_eq!(d0, d1, 1e-3);
            assert_approx_eq!(d0, exit_distance(), 1e-3);
        }
    }

    #[test]
    fn turn_distance_increases_along_ideal_arc() {
        let origin = Coordinates::entry(0);
        for intention in [Intention::Left, Intention::Right] {
            let radius = intention.turn_radius().unwrap();
            let side = intention.turn_sign();
            let mut last = f64::MIN;
            for i in 0..=100 {
                let theta = 0.5 * PI * i as f64 / 100.0;
                let vx = INITIAL_STRAIGHT_SECTION + radius * theta.sin();
                let vy = side * radius * (1.0 - theta.cos());
                let d = virtual_distance(&origin, &lane0_at(vx, vy), intention);
                assert!(d >= last);
                last = d;
            }
        }
    }

    #[test]
    fn entry_points_are_on_screen() {
        for lane in 0..NUM_LANES {
            assert!(Coordinates::entry(lane).on_screen());
        }
        assert!(!Coordinates::new(-1.0, 300.0, 0.0).on_screen());
    }
}
