//! Sensor reading types, unit normalization and the per-cycle reading window.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

use crate::error::InvalidReading;

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    /// °C
    Temperature,
    /// %
    RelativeHumidity,
    /// W/m²
    SolarRadiation,
    /// m/s
    WindSpeed,
    /// % volumetric
    SoilMoisture,
}

impl ReadingKind {
    /// Kinds the Penman-Monteith equation cannot do without.
    pub const REQUIRED_FOR_ET: [ReadingKind; 4] = [
        ReadingKind::Temperature,
        ReadingKind::RelativeHumidity,
        ReadingKind::SolarRadiation,
        ReadingKind::WindSpeed,
    ];

    /// Physically plausible range in canonical units.
    pub fn plausible_range(self) -> (f64, f64) {
        match self {
            Self::Temperature => (-10.0, 60.0),
            Self::RelativeHumidity => (0.0, 100.0),
            Self::SolarRadiation => (0.0, 1500.0),
            Self::WindSpeed => (0.0, 60.0),
            Self::SoilMoisture => (0.0, 100.0),
        }
    }

    pub fn canonical_unit(self) -> Unit {
        match self {
            Self::Temperature => Unit::Celsius,
            Self::RelativeHumidity | Self::SoilMoisture => Unit::Percent,
            Self::SolarRadiation => Unit::WattsPerSquareMeter,
            Self::WindSpeed => Unit::MetersPerSecond,
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Temperature => "temperature",
            Self::RelativeHumidity => "relative_humidity",
            Self::SolarRadiation => "solar_radiation",
            Self::WindSpeed => "wind_speed",
            Self::SoilMoisture => "soil_moisture",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Kelvin,
    Percent,
    Fraction,
    WattsPerSquareMeter,
    MetersPerSecond,
    KilometersPerHour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Good,
    Suspect,
    Bad,
}

/// One raw sample as delivered by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sector_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: ReadingKind,
    pub value: f64,
    pub unit: Unit,
    #[serde(default)]
    pub quality: Quality,
}

impl SensorReading {
    /// Reading already expressed in the kind's canonical unit.
    pub fn new(sector_id: &str, timestamp: OffsetDateTime, kind: ReadingKind, value: f64) -> Self {
        Self {
            sector_id: sector_id.to_string(),
            timestamp,
            kind,
            value,
            unit: kind.canonical_unit(),
            quality: Quality::Good,
        }
    }
}

/// A reading that passed validation, value in canonical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidReading {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: ReadingKind,
    pub value: f64,
    pub suspect: bool,
}

// ---------------------------------------------------------------------------
// Unit normalization
// ---------------------------------------------------------------------------

/// Convert `value` from `unit` into the canonical unit for `kind`.
pub fn normalize(kind: ReadingKind, unit: Unit, value: f64) -> Result<f64, InvalidReading> {
    use ReadingKind::*;
    use Unit::*;

    let converted = match (kind, unit) {
        (Temperature, Celsius) => value,
        (Temperature, Fahrenheit) => (value - 32.0) * 5.0 / 9.0,
        (Temperature, Kelvin) => value - 273.15,
        (RelativeHumidity | SoilMoisture, Percent) => value,
        (RelativeHumidity | SoilMoisture, Fraction) => value * 100.0,
        (SolarRadiation, WattsPerSquareMeter) => value,
        (WindSpeed, MetersPerSecond) => value,
        (WindSpeed, KilometersPerHour) => value / 3.6,
        _ => return Err(InvalidReading::UnitMismatch { kind, unit }),
    };
    Ok(converted)
}

// ---------------------------------------------------------------------------
// Reading window
// ---------------------------------------------------------------------------

/// Summary of one kind's samples over a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KindStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Validated readings collected for a sector since the last cycle.
#[derive(Debug, Default, Clone)]
pub struct ReadingWindow {
    samples: BTreeMap<ReadingKind, Vec<f64>>,
    latest: BTreeMap<ReadingKind, ValidReading>,
}

impl ReadingWindow {
    pub fn push(&mut self, reading: ValidReading) {
        self.samples.entry(reading.kind).or_default().push(reading.value);

        let newer = self
            .latest
            .get(&reading.kind)
            .map_or(true, |prev| reading.timestamp >= prev.timestamp);
        if newer {
            self.latest.insert(reading.kind, reading);
        }
    }

    pub fn stats(&self, kind: ReadingKind) -> Option<KindStats> {
        let values = self.samples.get(&kind).filter(|v| !v.is_empty())?;
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(KindStats {
            mean: sum / values.len() as f64,
            min,
            max,
            count: values.len(),
        })
    }

    /// Most recent sample of `kind`, kept across cycles.
    pub fn latest(&self, kind: ReadingKind) -> Option<ValidReading> {
        self.latest.get(&kind).copied()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    /// Drop accumulated samples; latest values survive for climate evaluation.
    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
