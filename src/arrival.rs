//! The stochastic arrival of cars at each lane.

use crate::geometry::Intention;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp};

/// Exponentially distributed arrivals at one lane. An arrival that cannot be
/// admitted stays pending until it can.
#[derive(Clone, Debug)]
pub struct ArrivalProcess {
    lane: u8,
    interarrival: Exp<f64>,
    /// Time until the next arrival, in s.
    wait: f64,
    pending: Option<Intention>,
}

impl ArrivalProcess {
    /// Creates an arrival process with `rate` arrivals per second, or `None`
    /// if the rate is not positive.
    pub fn new(lane: u8, rate: f64, rng: &mut impl Rng) -> Option<Self> {
        if !(rate > 0.0) {
            return None;
        }
        let interarrival = Exp::new(rate).ok()?;
        let wait = interarrival.sample(rng);
        Some(Self {
            lane,
            interarrival,
            wait,
            pending: None,
        })
    }

    pub fn lane(&self) -> u8 {
        self.lane
    }

    /// Advances the process by `dt` seconds and returns the intention of a car
    /// due to arrive, if any.
    pub fn poll(&mut self, dt: f64, rng: &mut impl Rng) -> Option<Intention> {
        if self.pending.is_none() {
            self.wait -= dt;
            if self.wait <= 0.0 {
                self.wait += self.interarrival.sample(rng);
                self.pending = Intention::ALL.choose(rng).copied();
            }
        }
        self.pending
    }

    /// The pending arrival has been admitted.
    pub fn admitted(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn zero_rate_disables_arrivals() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(ArrivalProcess::new(0, 0.0, &mut rng).is_none());
        assert!(ArrivalProcess::new(0, -1.0, &mut rng).is_none());
    }

    #[test]
    fn arrival_stays_pending_until_admitted() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut process = ArrivalProcess::new(2, 5.0, &mut rng).unwrap();
        let mut arrival = None;
        for _ in 0..10_000 {
            arrival = process.poll(0.05, &mut rng);
            if arrival.is_some() {
                break;
            }
        }
        assert!(arrival.is_some());
        assert_eq!(process.poll(0.05, &mut rng), arrival);
        process.admitted();
        assert_eq!(process.lane(), 2);
    }

    #[test]
    fn mean_rate_is_respected() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut process = ArrivalProcess::new(0, 0.5, &mut rng).unwrap();
        let mut count = 0;
        // 2000 s of simulated time
        for _ in 0..40_000 {
            if process.poll(0.05, &mut rng).is_some() {
                process.admitted();
                count += 1;
            }
        }
        assert!((800..1200).contains(&count), "{} arrivals", count);
    }
}
