//! Simulated valve hardware. Turns actuator commands into delayed execution
//! outcomes, with the failure modes real field valves show.

use greenhouse_engine::ActuatorCommand;
use time::{Duration, OffsetDateTime};

/// Nominal drip line flow per valve.
const FLOW_LITERS_PER_MIN: f64 = 400.0;

/// Runs are cut short before the engine's execution deadline.
const MAX_RUN_MIN: f64 = 45.0;

const FAILURE_PROB: f64 = 0.10;
const LOST_PROB: f64 = 0.05;

/// What the valve reports back, if anything.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Outcome reported at `at`.
    Reported {
        at: OffsetDateTime,
        delivered_liters: f64,
        error: Option<String>,
    },
    /// The node never answered. Only the timeout sweeper can close it.
    Lost,
}

pub struct SimActuator {
    rng: fastrand::Rng,
}

impl SimActuator {
    pub fn new(rng: fastrand::Rng) -> Self {
        Self { rng }
    }

    pub fn execute(&mut self, cmd: &ActuatorCommand) -> Outcome {
        let roll = self.rng.f64();
        if roll < LOST_PROB {
            return Outcome::Lost;
        }

        let wanted_min = (cmd.target_volume_liters / FLOW_LITERS_PER_MIN).min(MAX_RUN_MIN);
        let capped_liters = wanted_min * FLOW_LITERS_PER_MIN;

        if roll < LOST_PROB + FAILURE_PROB {
            // Valve stuck part way through the run.
            let fraction = 0.2 + 0.5 * self.rng.f64();
            let minutes = wanted_min * fraction;
            return Outcome::Reported {
                at: cmd.issued_at + Duration::seconds_f64(minutes * 60.0),
                delivered_liters: capped_liters * fraction,
                error: Some(format!("valve {} stalled after {minutes:.1} min", cmd.valve_id)),
            };
        }

        Outcome::Reported {
            at: cmd.issued_at + Duration::seconds_f64(wanted_min * 60.0),
            delivered_liters: capped_liters,
            error: None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
