use std::process::ExitCode;
use std::time::Instant;

use caravan_sim::{ArrivalParams, SimConfig, Simulation};
use log::{error, info};

const DEFAULT_TICKS: u64 = 2000;

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(json) => SimConfig::from_json(&json),
            Err(err) => {
                error!("Could not read {}: {}", path, err);
                return ExitCode::FAILURE;
            }
        },
        None => Ok(SimConfig {
            arrivals: ArrivalParams { rate: 0.2, seed: 1 },
            ..Default::default()
        }),
    };
    let ticks = match args.next().map(|arg| arg.parse::<u64>()) {
        Some(Ok(ticks)) => ticks,
        Some(Err(err)) => {
            error!("Invalid number of ticks: {}", err);
            return ExitCode::FAILURE;
        }
        None => DEFAULT_TICKS,
    };
    let mut sim = match config.and_then(Simulation::new) {
        Ok(sim) => sim,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    info!("Simulating {} ticks...", ticks);
    let start = Instant::now();
    for _ in 0..ticks {
        sim.step();
    }
    let elapsed = start.elapsed();
    println!(
        "Simulated {} ticks in {:?}: {} cars present, {} departed, {} collisions",
        ticks,
        elapsed,
        sim.iter_cars().count(),
        sim.departed().len(),
        sim.collisions().len(),
    );
    ExitCode::SUCCESS
}
