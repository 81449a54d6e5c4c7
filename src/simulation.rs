use crate::arrival::ArrivalProcess;
use crate::car::{Car, FaultInjection};
use crate::config::{ConfigResult, SimConfig};
use crate::geometry::{Coordinates, Intention, NUM_LANES};
use crate::message::{Message, MessageBody};
use crate::record::{CarRecord, Collision};
use crate::{CarId, CarName, CarSet, INFRASTRUCTURE_NAME};
use cgmath::MetricSpace;
use itertools::Itertools;
use log::{info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// A simulation of cars crossing a signal-free intersection.
pub struct Simulation {
    config: SimConfig,
    /// The cars being simulated.
    cars: CarSet,
    /// Car IDs by name.
    names: BTreeMap<CarName, CarId>,
    /// The name given to the next car.
    next_name: CarName,
    /// The current tick of simulation.
    tick: u64,
    /// Messages produced during the previous tick, in delivery order.
    messages: Vec<Message>,
    /// Per-lane arrival processes.
    arrivals: Vec<ArrivalProcess>,
    rng: StdRng,
    /// Cars that left the intersection.
    departed: Vec<CarRecord>,
    collisions: Vec<Collision>,
}

impl Simulation {
    /// Creates a new simulation.
    pub fn new(config: SimConfig) -> ConfigResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.arrivals.seed);
        let arrivals = (0..NUM_LANES)
            .filter_map(|lane| ArrivalProcess::new(lane, config.arrivals.rate, &mut rng))
            .collect();
        let mut sim = Self {
            config,
            cars: CarSet::default(),
            names: BTreeMap::new(),
            next_name: 1,
            tick: 0,
            messages: vec![],
            arrivals,
            rng,
            departed: vec![],
            collisions: vec![],
        };
        if sim.config.centralized {
            let config = &sim.config;
            let id = sim
                .cars
                .insert_with_key(|id| Car::infrastructure(id, 0, config));
            sim.names.insert(INFRASTRUCTURE_NAME, id);
            info!("Infrastructure supervises the intersection");
        }
        Ok(sim)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Gets the current tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Adds a car at the entry point of `lane`, unless another car is too close to it.
    /// Returns the new car's name.
    ///
    /// # Panics
    /// Panics if `lane >= NUM_LANES`.
    pub fn add_car(&mut self, lane: u8, intention: Intention) -> Option<CarName> {
        assert!(lane < NUM_LANES, "no such lane: {}", lane);
        if self.entry_occupied(lane) {
            return None;
        }
        let name = self.next_name;
        self.next_name += 1;
        let (tick, config) = (self.tick, &self.config);
        let id = self
            .cars
            .insert_with_key(|id| Car::new(id, name, lane, intention, tick, config));
        self.names.insert(name, id);
        info!("Car {} arrives in lane {} going {:?}", name, lane, intention);
        Some(name)
    }

    /// Whether a car is too close to the entry point of `lane` for another to enter.
    fn entry_occupied(&self, lane: u8) -> bool {
        let entry = Coordinates::entry(lane).position;
        self.cars.values().any(|car| {
            car.name() != INFRASTRUCTURE_NAME
                && car.coordinates().position.distance(entry) < self.config.entry_clearance
        })
    }

    /// Removes a car without letting it announce its departure, as if it had crashed.
    pub fn remove_car_silently(&mut self, name: CarName) -> Option<CarRecord> {
        let id = self.names.remove(&name)?;
        let car = self.cars.remove(id)?;
        warn!("Car {} removed silently", name);
        Some(car.record())
    }

    /// Sets the faults injected into a car. Returns `false` if there is no such car.
    pub fn set_faults(&mut self, name: CarName, faults: FaultInjection) -> bool {
        match self.car_mut(name) {
            Some(car) => {
                car.set_faults(faults);
                true
            }
            None => false,
        }
    }

    /// Advances the simulation by one tick.
    pub fn step(&mut self) {
        self.admit_arrivals();
        self.deliver_messages();
        let mut messages = self.update_cars();
        self.remove_departed(&mut messages);
        self.detect_collisions();

        // Stable, so messages of equal rank keep their emission order
        messages.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then(a.transmitter().cmp(&b.transmitter()))
        });
        self.messages = messages;
        self.tick += 1;
    }

    /// Gets a reference to the car with the given name.
    pub fn car(&self, name: CarName) -> Option<&Car> {
        self.names.get(&name).and_then(|id| self.cars.get(*id))
    }

    fn car_mut(&mut self, name: CarName) -> Option<&mut Car> {
        let id = *self.names.get(&name)?;
        self.cars.get_mut(id)
    }

    /// Returns an iterator over the cars in the simulation, in name order.
    pub fn iter_cars(&self) -> impl Iterator<Item = &Car> {
        self.names.values().filter_map(|id| self.cars.get(*id))
    }

    /// The messages produced during the last tick, in the order they will be delivered.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Records of the cars that left the intersection.
    pub fn departed(&self) -> &[CarRecord] {
        &self.departed
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    /// A structured snapshot of the simulation.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "tick": self.tick,
            "cars": self.iter_cars().map(Car::to_json).collect::<Vec<_>>(),
            "departed": self.departed,
            "collisions": self.collisions,
        })
    }

    /// Admits the cars due to arrive at each lane.
    fn admit_arrivals(&mut self) {
        for idx in 0..self.arrivals.len() {
            let lane = self.arrivals[idx].lane();
            let Some(intention) = self.arrivals[idx].poll(self.config.dt, &mut self.rng) else {
                continue;
            };
            if self.add_car(lane, intention).is_some() {
                self.arrivals[idx].admitted();
            }
        }
    }

    /// Delivers the previous tick's messages.
    fn deliver_messages(&mut self) {
        let messages = std::mem::take(&mut self.messages);
        for message in &messages {
            let recipients = message.transmit();
            for id in self.names.values() {
                let Some(car) = self.cars.get_mut(*id) else {
                    continue;
                };
                if car.name() != message.transmitter() && recipients.includes(car.name()) {
                    trace!("{:?} from {} to {}", message.body, message.transmitter(), car.name());
                    car.receive(message, &self.config);
                }
            }
        }
    }

    /// Runs every car's logic for this tick and collects what they produce.
    fn update_cars(&mut self) -> Vec<Message> {
        let mut messages = vec![];
        for id in self.names.values() {
            if let Some(car) = self.cars.get_mut(*id) {
                messages.extend(car.update(&self.config));
            }
        }
        messages
    }

    /// Removes the cars that have left the screen. Their routine messages of this tick are
    /// replaced by their departure announcements.
    fn remove_departed(&mut self, messages: &mut Vec<Message>) {
        let gone = self
            .iter_cars()
            .filter(|car| car.name() != INFRASTRUCTURE_NAME && !car.coordinates().on_screen())
            .map(Car::name)
            .collect::<BTreeSet<_>>();
        if gone.is_empty() {
            return;
        }
        messages.retain(|m| {
            !(gone.contains(&m.transmitter())
                && matches!(m.body, MessageBody::Info | MessageBody::NewCar))
        });
        for &name in &gone {
            let Some(id) = self.names.remove(&name) else {
                continue;
            };
            if let Some(mut car) = self.cars.remove(id) {
                messages.extend(car.depart(self.tick, &gone));
                self.departed.push(car.record());
            }
        }
    }

    /// Removes every pair of cars that collided.
    fn detect_collisions(&mut self) {
        let limit = self.config.collision_distance;
        let cars = self
            .iter_cars()
            .filter(|car| car.name() != INFRASTRUCTURE_NAME)
            .collect::<Vec<_>>();
        let pairs = cars
            .into_iter()
            .tuple_combinations()
            .filter(|(a, b)| a.coordinates().position.distance(b.coordinates().position) < limit)
            .map(|(a, b)| (a.name(), b.name()))
            .collect::<Vec<_>>();
        for (a, b) in pairs {
            if !self.names.contains_key(&a) || !self.names.contains_key(&b) {
                continue;
            }
            warn!("Cars {} and {} collided at tick {}", a, b, self.tick);
            let records = [a, b].map(|name| self.remove_car_silently(name));
            if let [Some(first), Some(second)] = records {
                self.collisions.push(Collision {
                    tick: self.tick,
                    cars: [first, second],
                });
            }
        }
    }
}
