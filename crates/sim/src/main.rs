//! Accelerated greenhouse simulation. Drives the engine through simulated
//! days of hourly weather, plays the operator and the valve hardware, and
//! prints the final status snapshot as JSON on stdout.

mod actuator;
mod weather;

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use greenhouse_engine::{
    config, sweeper, ActorRef, Engine, IrrigationRecommendation, OperationMode, OutboundMessage,
    RecommendationStatus, RecordingOutbound,
};
use time::macros::{date, time};
use time::{Duration, OffsetDateTime, Time};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use actuator::{Outcome, SimActuator};
use weather::{Scenario, WeatherSim};

static INIT: Once = Once::new();

/// Daily water balance runs this late in the evening.
const CYCLE_AT: Time = time!(23:30);

/// The simulated operator looks at new recommendations after this delay.
const OPERATOR_DELAY: Duration = Duration::minutes(15);

/// Real time the sweeper gets per simulated hour.
const SWEEP_EVERY: std::time::Duration = std::time::Duration::from_millis(5);

fn init_logging(json: bool) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // stdout carries the final snapshot only
        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    });
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Shared simulated wall clock, read by the sweeper task.
#[derive(Clone)]
struct SimClock(Arc<AtomicI64>);

impl SimClock {
    fn new(at: OffsetDateTime) -> Self {
        Self(Arc::new(AtomicI64::new(at.unix_timestamp())))
    }

    fn set(&self, at: OffsetDateTime) {
        self.0.store(at.unix_timestamp(), Ordering::SeqCst);
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.0.load(Ordering::SeqCst))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

struct Sim {
    engine: Arc<Engine>,
    outbound: Arc<RecordingOutbound>,
    weather: WeatherSim,
    actuator: SimActuator,
    /// Sector id to weather index.
    index: HashMap<String, usize>,
    operator: ActorRef,
}

impl Sim {
    /// Route everything the engine emitted since the last call. Confirming
    /// and dispatching can emit more, so loop until the outbox is empty.
    fn pump(&mut self) {
        loop {
            let messages = self.outbound.drain();
            if messages.is_empty() {
                return;
            }
            for msg in messages {
                match msg {
                    OutboundMessage::Recommendation(rec) => self.on_recommendation(&rec),
                    OutboundMessage::ActuatorCommand { sector_id, command } => {
                        info!(
                            sector = %sector_id,
                            recommendation = %command.recommendation_id,
                            valve = %command.valve_id,
                            liters = format!("{:.0}", command.target_volume_liters),
                            "actuator: command received"
                        );
                        self.on_command(&sector_id, &command);
                    }
                    OutboundMessage::ClimateAlert { sector_id, state } => {
                        info!(
                            sector = %sector_id,
                            vpd_kpa = format!("{:.2}", state.vpd_kpa),
                            class = %state.classification,
                            action = %state.action,
                            temperature_alert = state.temperature_alert,
                            "alert: climate"
                        );
                    }
                }
            }
        }
    }

    fn on_recommendation(&mut self, rec: &IrrigationRecommendation) {
        if rec.status != RecommendationStatus::Pending
            || self.engine.settings().mode != OperationMode::SemiAuto
        {
            return;
        }
        let at = rec.created_at + OPERATOR_DELAY;
        let result = self
            .engine
            .confirm_recommendation(rec.id, &self.operator, at)
            .and_then(|_| self.engine.dispatch(rec.id, at));
        if let Err(err) = result {
            warn!(recommendation = %rec.id, "operator: {err}");
        }
    }

    fn on_command(&mut self, sector_id: &str, cmd: &greenhouse_engine::ActuatorCommand) {
        match self.actuator.execute(cmd) {
            Outcome::Lost => {
                warn!(recommendation = %cmd.recommendation_id, "actuator: outcome lost");
            }
            Outcome::Reported {
                at,
                delivered_liters,
                error,
            } => {
                if let (Some(&i), Ok(profile)) =
                    (self.index.get(sector_id), self.engine.profile(sector_id))
                {
                    self.weather.irrigate(i, delivered_liters / profile.area_m2);
                }
                if let Err(err) = self.engine.report_execution_outcome(
                    cmd.recommendation_id,
                    delivered_liters,
                    error,
                    at,
                ) {
                    warn!(recommendation = %cmd.recommendation_id, "actuator: {err}");
                }
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let json_logs = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    init_logging(json_logs);

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let days: u32 = env_or("SIM_DAYS", 14);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let seed: u64 = env_or("SIM_SEED", fastrand::u64(..));

    let cfg = config::load(&config_path)?;
    let outbound = Arc::new(RecordingOutbound::new());
    let engine = Arc::new(
        Engine::from_config(&cfg, outbound.clone()).context("failed to build engine")?,
    );

    let sector_ids = engine.sector_ids();
    info!(
        config = %config_path,
        %scenario,
        days,
        seed,
        mode = ?engine.settings().mode,
        sectors = sector_ids.len(),
        "sim: starting"
    );

    let mut rng = fastrand::Rng::with_seed(seed);
    let mut sim = Sim {
        engine: Arc::clone(&engine),
        outbound,
        weather: WeatherSim::new(scenario, sector_ids.len(), rng.fork()),
        actuator: SimActuator::new(rng.fork()),
        index: sector_ids.iter().cloned().zip(0..).collect(),
        operator: ActorRef::new("sim-operator"),
    };

    let start = date!(2026-05-01);
    let clock = SimClock::new(start.midnight().assume_utc());
    let sweeper_clock = clock.clone();
    let sweeper = tokio::spawn(sweeper::run_with_clock(
        Arc::clone(&engine),
        SWEEP_EVERY,
        move || sweeper_clock.now(),
    ));

    // ── Day loop ────────────────────────────────────────────────────
    for day in 0..days {
        let date = start + Duration::days(i64::from(day));

        for i in 0..sim.weather.sector_count() {
            sim.weather.start_day(i);
        }

        for hour in 0..24u8 {
            let ts = date.with_hms(hour, 0, 0)?.assume_utc();
            clock.set(ts);

            for (i, sector_id) in sector_ids.iter().enumerate() {
                let sample = sim.weather.sample(i, hour);
                for reading in sample.readings(sector_id, ts) {
                    if let Err(err) = engine.ingest_reading(&reading, ts) {
                        debug!(sector = %sector_id, kind = ?reading.kind, "sim: {err}");
                    }
                }
                if let Err(err) = engine.evaluate_climate(
                    sector_id,
                    sample.temperature_c,
                    sample.relative_humidity,
                    ts,
                ) {
                    debug!(sector = %sector_id, "sim: climate skipped: {err}");
                }
            }
            sim.pump();

            // Let the sweeper observe this hour.
            tokio::time::sleep(SWEEP_EVERY * 2).await;
        }

        let cycle_ts = date.with_time(CYCLE_AT).assume_utc();
        clock.set(cycle_ts);
        let rainfall = sim.weather.rainfall_mm();
        for sector_id in &sector_ids {
            match engine.run_cycle(sector_id, date, rainfall, cycle_ts) {
                Ok(report) => {
                    let soil = report
                        .soil_moisture
                        .map(|s| format!("{:.1}", s.mean))
                        .unwrap_or_else(|| "-".to_string());
                    info!(
                        sector = %sector_id,
                        %date,
                        etc_mm = format!("{:.2}", report.et.etc_mm_day),
                        rainfall_mm = format!("{rainfall:.1}"),
                        deficit_mm = format!("{:.2}", report.balance.deficit_mm),
                        status = %report.balance.status,
                        soil_moisture = %soil,
                        "sim: day closed"
                    );
                }
                Err(err) => warn!(sector = %sector_id, %date, "sim: cycle failed: {err}"),
            }
        }
        sim.pump();
        tokio::time::sleep(SWEEP_EVERY * 2).await;
    }

    sweeper.abort();

    let status = engine.status();
    info!(metrics = ?status.metrics, mode = ?status.mode, "sim: finished");
    for id in &sector_ids {
        if let Ok(history) = engine.et_history(id) {
            let total: f64 = history.iter().map(|e| e.etc_mm_day).sum();
            debug!(sector = %id, days = history.len(), etc_total_mm = format!("{total:.1}"), "sim: et history");
        }
    }

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn env_or_falls_back_on_missing_or_bad_values() {
        assert_eq!(env_or("GREENHOUSE_SIM_TEST_UNSET", 14u32), 14);
        env::set_var("GREENHOUSE_SIM_TEST_BAD", "fourteen");
        assert_eq!(env_or("GREENHOUSE_SIM_TEST_BAD", 7u32), 7);
        env::set_var("GREENHOUSE_SIM_TEST_GOOD", "3");
        assert_eq!(env_or("GREENHOUSE_SIM_TEST_GOOD", 7u32), 3);
    }

    #[test]
    fn sim_clock_is_shared() {
        let clock = SimClock::new(datetime!(2026-05-01 00:00 UTC));
        let reader = clock.clone();
        clock.set(datetime!(2026-05-03 07:00 UTC));
        assert_eq!(reader.now(), datetime!(2026-05-03 07:00 UTC));
    }

    #[test]
    fn sample_config_runs_a_semi_auto_week() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config.toml");
        let cfg = config::load(path).unwrap();
        let outbound = Arc::new(RecordingOutbound::new());
        let engine = Arc::new(Engine::from_config(&cfg, outbound.clone()).unwrap());
        let ids = engine.sector_ids();

        let mut rng = fastrand::Rng::with_seed(5);
        let mut sim = Sim {
            engine: Arc::clone(&engine),
            outbound,
            weather: WeatherSim::new(Scenario::Heatwave, ids.len(), rng.fork()),
            actuator: SimActuator::new(rng.fork()),
            index: ids.iter().cloned().zip(0..).collect(),
            operator: ActorRef::new("sim-operator"),
        };

        let start = date!(2026-05-01);
        for day in 0..7 {
            let date = start + Duration::days(day);
            for i in 0..ids.len() {
                sim.weather.start_day(i);
            }
            for hour in 0..24u8 {
                let ts = date.with_hms(hour, 0, 0).unwrap().assume_utc();
                for (i, id) in ids.iter().enumerate() {
                    for r in sim.weather.sample(i, hour).readings(id, ts) {
                        let _ = engine.ingest_reading(&r, ts);
                    }
                }
            }
            let cycle_ts = date.with_time(CYCLE_AT).assume_utc();
            let rain = sim.weather.rainfall_mm();
            for id in &ids {
                engine.run_cycle(id, date, rain, cycle_ts).unwrap();
            }
            sim.pump();
            engine.sweep_timeouts(cycle_ts + Duration::hours(3));
        }

        let status = engine.status();
        assert_eq!(status.metrics.cycles_computed, 7 * ids.len() as u64);
        assert!(status.metrics.recommendations_emitted > 0);
        // Every recommendation the operator saw got closed one way or another.
        for id in &ids {
            assert!(engine.open_recommendation(id).unwrap().is_none());
        }
    }
}
