use crate::geometry::Coordinates;
use crate::math::forward;
use crate::util::Interval;

/// Integrates the speed over one time step, keeping it within `limits`.
pub fn accelerate(speed: f64, acceleration: f64, dt: f64, limits: Interval<f64>) -> f64 {
    limits.clamp(speed + acceleration * dt)
}

/// Rotates the heading for one time step along an arc of the given radius.
///
/// `sign` is positive for left turns. The total heading change never exceeds 90°.
/// Returns the new heading and the new cumulative heading change, both in degrees.
pub fn turn(
    direction: f64,
    heading_change: f64,
    speed: f64,
    dt: f64,
    radius: f64,
    sign: f64,
) -> (f64, f64) {
    let step = (speed * dt / radius).to_degrees();
    let step = f64::min(step, 90.0 - heading_change).max(0.0);
    ((direction + sign * step).rem_euclid(360.0), heading_change + step)
}

/// Euler-integrates the position along the current heading.
pub fn advance(coords: Coordinates, speed: f64, dt: f64) -> Coordinates {
    Coordinates {
        position: coords.position + speed * dt * forward(coords.direction),
        direction: coords.direction,
    }
}
