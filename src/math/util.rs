use super::{Point2d, Vector2d};
use cgmath::prelude::*;

/// Projects a point onto a local coordinate system.
///
/// # Parameters
/// * `point` - The point to project
/// * `origin` - The origin of the coordinate system
/// * `x_axis` - The basis vector pointing in the positive x-axis.
/// * `y_axis` - The basis vector pointing in the positive y-axis.
pub fn project_local(
    point: Point2d,
    origin: Point2d,
    x_axis: Vector2d,
    y_axis: Vector2d,
) -> Point2d {
    let point = point - origin;
    Point2d::new(point.dot(x_axis), point.dot(y_axis))
}

/// The unit vector a vehicle with the given heading (in degrees) travels along.
///
/// Headings are measured in screen space, where y grows downwards:
/// 0° points up the screen, 90° points left.
pub fn forward(direction: f64) -> Vector2d {
    let rad = direction.to_radians();
    Vector2d::new(-rad.sin(), -rad.cos())
}

/// The unit vector pointing to the left of a vehicle with the given heading.
pub fn left(direction: f64) -> Vector2d {
    let rad = direction.to_radians();
    Vector2d::new(-rad.cos(), rad.sin())
}
