//! Stateful greenhouse weather simulator for local development.
//!
//! Models per-sector behaviour:
//! - Day-to-day random walk of temperature and humidity offsets
//! - Diurnal temperature cycle peaking mid-afternoon
//! - Solar radiation bell between sunrise and sunset, dimmed by clouds
//! - Humidity moving against temperature
//! - Soil moisture drying through the day and rising with irrigation
//! - Occasional faulty humidity readings (sensor flakiness)

use std::fmt;

use greenhouse_engine::{ReadingKind, SensorReading};
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
pub(crate) fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
pub(crate) fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured weather profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Warm, bright, moderate humidity. Deficits build within a week.
    Sunny,
    /// Mild and dim with frequent rain credit. Deficits build slowly.
    Cloudy,
    /// Hot, dry air. VPD goes critical in the afternoons and the
    /// temperature guard fires.
    Heatwave,
    /// Saturated air. VPD stays low and ventilation is recommended.
    Humid,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cloudy" => Self::Cloudy,
            "heatwave" => Self::Heatwave,
            "humid" => Self::Humid,
            _ => Self::Sunny, // default
        }
    }

    fn params(self) -> Params {
        match self {
            Self::Sunny => Params {
                t_mean: 24.0,
                t_amplitude: 7.0,
                rh_mean: 60.0,
                radiation_peak: 800.0,
                wind_mean: 1.2,
                cloudiness: 0.1,
                rain_prob: 0.02,
            },
            Self::Cloudy => Params {
                t_mean: 19.0,
                t_amplitude: 4.0,
                rh_mean: 75.0,
                radiation_peak: 350.0,
                wind_mean: 1.8,
                cloudiness: 0.6,
                rain_prob: 0.25,
            },
            Self::Heatwave => Params {
                t_mean: 31.0,
                t_amplitude: 8.0,
                rh_mean: 38.0,
                radiation_peak: 900.0,
                wind_mean: 0.8,
                cloudiness: 0.05,
                rain_prob: 0.0,
            },
            Self::Humid => Params {
                t_mean: 26.0,
                t_amplitude: 4.0,
                rh_mean: 90.0,
                radiation_peak: 500.0,
                wind_mean: 0.6,
                cloudiness: 0.3,
                rain_prob: 0.1,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sunny => write!(f, "sunny"),
            Self::Cloudy => write!(f, "cloudy"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Humid => write!(f, "humid"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Params {
    t_mean: f64,
    t_amplitude: f64,
    rh_mean: f64,
    /// W/m² at solar noon under a clear sky.
    radiation_peak: f64,
    wind_mean: f64,
    /// 0 = clear, 1 = overcast.
    cloudiness: f64,
    /// Chance of a rainy day.
    rain_prob: f64,
}

/// Chance that a humidity sample comes out physically impossible.
const FAULT_PROB: f64 = 0.01;

// ---------------------------------------------------------------------------
// Per-sector state
// ---------------------------------------------------------------------------

struct SectorWeather {
    /// Day-level deviation from the scenario mean temperature (°C).
    temp_offset: f64,
    /// Day-level deviation from the scenario mean humidity (%).
    rh_offset: f64,
    /// Today's cloud cover, 0..1.
    cloud: f64,
    /// Volumetric soil moisture (%).
    soil: f64,
}

/// One hour of weather for one sector, in canonical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourSample {
    pub temperature_c: f64,
    pub relative_humidity: f64,
    pub solar_radiation: f64,
    pub wind_speed: f64,
    pub soil_moisture: f64,
}

impl HourSample {
    pub fn readings(&self, sector_id: &str, ts: OffsetDateTime) -> [SensorReading; 5] {
        [
            SensorReading::new(sector_id, ts, ReadingKind::Temperature, self.temperature_c),
            SensorReading::new(sector_id, ts, ReadingKind::RelativeHumidity, self.relative_humidity),
            SensorReading::new(sector_id, ts, ReadingKind::SolarRadiation, self.solar_radiation),
            SensorReading::new(sector_id, ts, ReadingKind::WindSpeed, self.wind_speed),
            SensorReading::new(sector_id, ts, ReadingKind::SoilMoisture, self.soil_moisture),
        ]
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct WeatherSim {
    params: Params,
    sectors: Vec<SectorWeather>,
    rng: fastrand::Rng,
}

impl WeatherSim {
    pub fn new(scenario: Scenario, sector_count: usize, mut rng: fastrand::Rng) -> Self {
        let params = scenario.params();
        let sectors = (0..sector_count)
            .map(|_| SectorWeather {
                temp_offset: gaussian(&mut rng, 0.0, 1.0),
                rh_offset: gaussian(&mut rng, 0.0, 3.0),
                cloud: params.cloudiness,
                soil: gaussian(&mut rng, 32.0, 2.0).clamp(20.0, 45.0),
            })
            .collect();
        Self {
            params,
            sectors,
            rng,
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    /// Advance the day-level random walk for the sector at `index`.
    pub fn start_day(&mut self, index: usize) {
        let p = self.params;
        let walk_t = gaussian(&mut self.rng, 0.0, 0.8);
        let walk_rh = gaussian(&mut self.rng, 0.0, 2.0);
        let cloud = (p.cloudiness + gaussian(&mut self.rng, 0.0, 0.15)).clamp(0.0, 1.0);

        let s = &mut self.sectors[index];
        // Mean reversion keeps the offsets bounded.
        s.temp_offset = 0.8 * s.temp_offset + walk_t;
        s.rh_offset = 0.8 * s.rh_offset + walk_rh;
        s.cloud = cloud;
    }

    /// Produce the sample for `hour` (0..24) of the current day.
    pub fn sample(&mut self, index: usize, hour: u8) -> HourSample {
        let p = self.params;
        let h = f64::from(hour);

        // Temperature: sinusoid peaking at 15:00.
        let phase = (h - 9.0) / 24.0 * std::f64::consts::TAU;
        let noise_t = gaussian(&mut self.rng, 0.0, 0.3);
        let wind_noise = gaussian(&mut self.rng, 0.0, 0.3);
        let fault = self.rng.f64() < FAULT_PROB;
        let fault_value = 101.0 + 20.0 * self.rng.f64();

        let s = &mut self.sectors[index];
        let temperature = p.t_mean + s.temp_offset + p.t_amplitude * phase.sin() + noise_t;

        // Radiation: half-sine between 06:00 and 20:00.
        let day_fraction = (h - 6.0) / 14.0;
        let radiation = if (0.0..=1.0).contains(&day_fraction) {
            p.radiation_peak * (std::f64::consts::PI * day_fraction).sin() * (1.0 - 0.7 * s.cloud)
        } else {
            0.0
        };

        // Warm hours are drier.
        let rh = (p.rh_mean + s.rh_offset - 2.0 * (temperature - p.t_mean)).clamp(10.0, 100.0);
        let relative_humidity = if fault { fault_value } else { rh };

        // Evaporation dries the root zone while the sun is up.
        s.soil = (s.soil - 0.05 - radiation / 8000.0).max(5.0);

        HourSample {
            temperature_c: temperature.clamp(-10.0, 60.0),
            relative_humidity,
            solar_radiation: radiation.max(0.0),
            wind_speed: (p.wind_mean + wind_noise).max(0.0),
            soil_moisture: s.soil,
        }
    }

    /// Rain credited today (mm). Vents let it reach every sector alike.
    pub fn rainfall_mm(&mut self) -> f64 {
        if self.rng.f64() < self.params.rain_prob {
            (2.0 + gaussian(&mut self.rng, 4.0, 2.0)).max(0.5)
        } else {
            0.0
        }
    }

    /// Irrigation reached the root zone of the sector at `index`.
    pub fn irrigate(&mut self, index: usize, depth_mm: f64) {
        let s = &mut self.sectors[index];
        s.soil = (s.soil + depth_mm * 0.5).min(50.0);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sim(scenario: Scenario) -> WeatherSim {
        WeatherSim::new(scenario, 2, fastrand::Rng::with_seed(7))
    }

    fn day_of_samples(sim: &mut WeatherSim, index: usize) -> Vec<HourSample> {
        sim.start_day(index);
        (0..24).map(|h| sim.sample(index, h)).collect()
    }

    #[test]
    fn samples_within_sensor_ranges() {
        let mut sim = sim(Scenario::Heatwave);
        for _ in 0..30 {
            for s in day_of_samples(&mut sim, 0) {
                assert!((-10.0..=60.0).contains(&s.temperature_c), "{s:?}");
                assert!((0.0..=1500.0).contains(&s.solar_radiation), "{s:?}");
                assert!(s.wind_speed >= 0.0, "{s:?}");
                assert!((0.0..=100.0).contains(&s.soil_moisture), "{s:?}");
            }
        }
    }

    #[test]
    fn no_radiation_at_night() {
        let mut sim = sim(Scenario::Sunny);
        let day = day_of_samples(&mut sim, 0);
        assert_eq!(day[2].solar_radiation, 0.0);
        assert_eq!(day[22].solar_radiation, 0.0);
        assert!(day[13].solar_radiation > 300.0, "noon radiation {}", day[13].solar_radiation);
    }

    #[test]
    fn afternoon_warmer_than_dawn() {
        let mut sim = sim(Scenario::Sunny);
        let day = day_of_samples(&mut sim, 1);
        assert!(day[15].temperature_c > day[4].temperature_c + 5.0);
    }

    #[test]
    fn humid_scenario_more_humid_than_heatwave() {
        fn mean_rh(sim: &mut WeatherSim) -> f64 {
            let samples: Vec<f64> = (0..5)
                .flat_map(|_| day_of_samples(sim, 0))
                .map(|s| s.relative_humidity.min(100.0))
                .collect();
            samples.iter().sum::<f64>() / samples.len() as f64
        }
        let humid = mean_rh(&mut sim(Scenario::Humid));
        let heatwave = mean_rh(&mut sim(Scenario::Heatwave));
        assert!(humid > heatwave + 30.0, "humid {humid:.1} vs heatwave {heatwave:.1}");
    }

    #[test]
    fn irrigation_raises_soil_moisture() {
        let mut sim = sim(Scenario::Sunny);
        let before = day_of_samples(&mut sim, 0)[23].soil_moisture;
        sim.irrigate(0, 20.0);
        let after = sim.sample(0, 0).soil_moisture;
        assert!(after > before + 5.0, "before {before:.1} after {after:.1}");
    }

    #[test]
    fn heatwave_never_rains() {
        let mut sim = sim(Scenario::Heatwave);
        assert!((0..100).all(|_| sim.rainfall_mm() == 0.0));
    }

    #[test]
    fn readings_carry_sector_and_kinds() {
        let mut sim = sim(Scenario::Sunny);
        let ts = datetime!(2026-06-01 12:00 UTC);
        let readings = sim.sample(0, 12).readings("s1", ts);
        assert!(readings.iter().all(|r| r.sector_id == "s1" && r.timestamp == ts));
        assert_eq!(readings[3].kind, ReadingKind::WindSpeed);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("sunny"), Scenario::Sunny);
        assert_eq!(Scenario::from_str_lossy("CLOUDY"), Scenario::Cloudy);
        assert_eq!(Scenario::from_str_lossy("Heatwave"), Scenario::Heatwave);
        assert_eq!(Scenario::from_str_lossy("humid"), Scenario::Humid);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Sunny);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Sunny);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Sunny.to_string(), "sunny");
        assert_eq!(Scenario::Heatwave.to_string(), "heatwave");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let mut rng = fastrand::Rng::with_seed(42);
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal(&mut rng)).sum();
        let mean = sum / n as f64;
        assert!(
            mean.abs() < 0.15,
            "approx_std_normal mean should be near zero: {mean}"
        );
    }
}
