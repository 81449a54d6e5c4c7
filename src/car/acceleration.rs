use crate::config::FollowerParams;
use crate::util::Interval;

/// The acceleration model of a car.
#[derive(Clone, Copy, Debug)]
pub struct AccelerationModel {
    limits: Interval<f64>,
    params: FollowerParams,
}

/// The state of the leader as last reported.
#[derive(Clone, Copy, Debug)]
pub struct LeaderState {
    /// The gap between the leader and this car in virtual distance, in px.
    pub gap: f64,
    /// The leader's speed in px/s.
    pub speed: f64,
    /// The leader's acceleration in px/s<sup>2</sup>.
    pub acceleration: f64,
}

impl AccelerationModel {
    /// Creates a new acceleration model.
    pub fn new(limits: Interval<f64>, params: FollowerParams) -> Self {
        Self { limits, params }
    }

    /// The acceleration of a car that is not following anyone: flat out.
    pub fn free(&self) -> f64 {
        self.limits.max
    }

    /// The gap to keep to the leader at the given speed.
    pub fn desired_gap(&self, my_speed: f64) -> f64 {
        self.params.standstill_distance + self.params.time_headway * my_speed
    }

    /// Calculates the acceleration needed to follow the leader.
    ///
    /// # Arguments
    /// * `my_speed` - The speed of the simulated car (px/s).
    /// * `leader` - The leader's last reported state.
    pub fn follow(&self, my_speed: f64, leader: LeaderState) -> f64 {
        let gap_error = leader.gap - self.desired_gap(my_speed);
        let acc = self.params.gap_gain * gap_error
            + self.params.speed_gain * (leader.speed - my_speed)
            + leader.acceleration;
        self.limits.clamp(acc)
    }
}
