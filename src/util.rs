//! Miscellaneous utility structs and functions.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// An interval on the real number line.
#[derive(Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    /// Creates a new interval.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd + Copy> Interval<T> {
    /// Returns true if this interval contains the value.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    /// Returns true if the interval is non-empty, i.e. `min <= max`.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    /// Restricts `value` to the interval.
    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

impl<T: Debug> Debug for Interval<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interval({:?}, {:?})", &self.min, &self.max)
    }
}

#[cfg(test)]
mod test {
    use super::Interval;

    #[test]
    fn clamp_to_bounds() {
        let limits = Interval::new(-6.0, 3.0);
        assert_eq!(limits.clamp(-10.0), -6.0);
        assert_eq!(limits.clamp(1.5), 1.5);
        assert_eq!(limits.clamp(7.0), 3.0);
        assert!(limits.contains(3.0));
        assert!(!limits.contains(3.1));
    }

    #[test]
    fn inverted_interval_is_invalid() {
        assert!(Interval::new(0.0, 0.0).is_valid());
        assert!(!Interval::new(1.0, 0.0).is_valid());
    }
}
