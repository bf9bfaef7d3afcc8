//! TOML config file loading and validation for engine settings, default
//! thresholds and sector profiles.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use time::macros::format_description;
use time::{Date, Duration};

use crate::climate::ClimateBands;
use crate::ledger::LedgerThresholds;
use crate::profile::{GrowthStage, KcSchedule, SectorProfile};
use crate::reading::ReadingKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub defaults: SectorThresholds,
    #[serde(default)]
    pub sectors: Vec<SectorEntry>,
}

/// How far the engine goes on its own once a sector reaches DEFICIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Recommendations wait for a human confirmation.
    #[default]
    SemiAuto,
    /// Confirm and dispatch immediately.
    Auto,
    /// Journal deficits, never recommend.
    Monitor,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub mode: OperationMode,
    pub max_reading_age_min: i64,
    pub cycle_hours: f64,
    pub alert_cooldown_min: i64,
    pub et_history_len: usize,
    pub fallbacks: Fallbacks,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: OperationMode::default(),
            max_reading_age_min: 30,
            cycle_hours: 24.0,
            alert_cooldown_min: 30,
            et_history_len: 30,
            fallbacks: Fallbacks::default(),
        }
    }
}

impl EngineSettings {
    pub fn max_reading_age(&self) -> Duration {
        Duration::minutes(self.max_reading_age_min)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::minutes(self.alert_cooldown_min)
    }

    /// Length of one cycle as a fraction of a day.
    pub fn period_days(&self) -> f64 {
        self.cycle_hours / 24.0
    }
}

/// Constants substituted for a reading kind with no sample in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fallbacks {
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub wind_speed: Option<f64>,
}

impl Fallbacks {
    pub fn to_map(&self) -> BTreeMap<ReadingKind, f64> {
        [
            (ReadingKind::Temperature, self.temperature),
            (ReadingKind::RelativeHumidity, self.relative_humidity),
            (ReadingKind::SolarRadiation, self.solar_radiation),
            (ReadingKind::WindSpeed, self.wind_speed),
        ]
        .into_iter()
        .filter_map(|(kind, v)| v.map(|v| (kind, v)))
        .collect()
    }
}

/// Per-sector tunables. `[defaults]` fills every field; a sector's
/// `[sectors.thresholds]` table overrides any subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorThresholds {
    pub warning_fraction: f64,
    /// Falls back to the profile's RAW depth when unset.
    pub raw_threshold_mm: Option<f64>,
    pub safety_margin: f64,
    pub vpd_low_kpa: f64,
    pub vpd_high_kpa: f64,
    pub vpd_critical_kpa: f64,
    pub hysteresis_kpa: f64,
    pub efficiency_factor: f64,
    pub execution_timeout_min: i64,
    pub critical_temp_min_c: f64,
    pub critical_temp_max_c: f64,
}

impl Default for SectorThresholds {
    fn default() -> Self {
        let bands = ClimateBands::default();
        Self {
            warning_fraction: 0.5,
            raw_threshold_mm: None,
            safety_margin: 1.5,
            vpd_low_kpa: bands.vpd_low_kpa,
            vpd_high_kpa: bands.vpd_high_kpa,
            vpd_critical_kpa: bands.vpd_critical_kpa,
            hysteresis_kpa: bands.hysteresis_kpa,
            efficiency_factor: 1.0,
            execution_timeout_min: 60,
            critical_temp_min_c: bands.critical_temp_min_c,
            critical_temp_max_c: bands.critical_temp_max_c,
        }
    }
}

impl SectorThresholds {
    pub fn ledger(&self, profile: &SectorProfile) -> LedgerThresholds {
        LedgerThresholds {
            raw_threshold_mm: self.raw_threshold_mm.unwrap_or(profile.raw_mm),
            warning_fraction: self.warning_fraction,
            safety_margin: self.safety_margin,
        }
    }

    pub fn climate_bands(&self) -> ClimateBands {
        ClimateBands {
            vpd_low_kpa: self.vpd_low_kpa,
            vpd_high_kpa: self.vpd_high_kpa,
            vpd_critical_kpa: self.vpd_critical_kpa,
            hysteresis_kpa: self.hysteresis_kpa,
            critical_temp_min_c: self.critical_temp_min_c,
            critical_temp_max_c: self.critical_temp_max_c,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::minutes(self.execution_timeout_min)
    }

    /// Push every violation into `errors`, prefixed by `ctx`.
    pub fn check(&self, ctx: &str, errors: &mut Vec<String>) {
        if !(self.warning_fraction > 0.0 && self.warning_fraction < 1.0) {
            errors.push(format!(
                "{ctx}: warning_fraction {} out of range (0, 1)",
                self.warning_fraction
            ));
        }
        if let Some(raw) = self.raw_threshold_mm {
            if !(raw > 0.0) {
                errors.push(format!("{ctx}: raw_threshold_mm must be positive, got {raw}"));
            }
        }
        if !(self.safety_margin >= 1.0) {
            errors.push(format!(
                "{ctx}: safety_margin must be at least 1, got {}",
                self.safety_margin
            ));
        }
        if !(self.vpd_low_kpa >= 0.0
            && self.vpd_low_kpa < self.vpd_high_kpa
            && self.vpd_high_kpa < self.vpd_critical_kpa)
        {
            errors.push(format!(
                "{ctx}: vpd bands must be strictly increasing (low {} < high {} < critical {})",
                self.vpd_low_kpa, self.vpd_high_kpa, self.vpd_critical_kpa
            ));
        }
        if !(self.hysteresis_kpa >= 0.0 && self.hysteresis_kpa < self.vpd_high_kpa - self.vpd_low_kpa) {
            errors.push(format!(
                "{ctx}: hysteresis_kpa {} must be non-negative and smaller than the optimal band",
                self.hysteresis_kpa
            ));
        }
        if !(self.efficiency_factor > 0.0) {
            errors.push(format!(
                "{ctx}: efficiency_factor must be positive, got {}",
                self.efficiency_factor
            ));
        }
        if self.execution_timeout_min <= 0 {
            errors.push(format!(
                "{ctx}: execution_timeout_min must be positive, got {}",
                self.execution_timeout_min
            ));
        }
        if !(self.critical_temp_min_c < self.critical_temp_max_c) {
            errors.push(format!(
                "{ctx}: critical_temp_min_c ({}) must be below critical_temp_max_c ({})",
                self.critical_temp_min_c, self.critical_temp_max_c
            ));
        }
    }
}

/// Partial threshold table; unset fields inherit from `[defaults]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdOverrides {
    pub warning_fraction: Option<f64>,
    pub raw_threshold_mm: Option<f64>,
    pub safety_margin: Option<f64>,
    pub vpd_low_kpa: Option<f64>,
    pub vpd_high_kpa: Option<f64>,
    pub vpd_critical_kpa: Option<f64>,
    pub hysteresis_kpa: Option<f64>,
    pub efficiency_factor: Option<f64>,
    pub execution_timeout_min: Option<i64>,
    pub critical_temp_min_c: Option<f64>,
    pub critical_temp_max_c: Option<f64>,
}

impl ThresholdOverrides {
    pub fn apply(&self, base: &SectorThresholds) -> SectorThresholds {
        SectorThresholds {
            warning_fraction: self.warning_fraction.unwrap_or(base.warning_fraction),
            raw_threshold_mm: self.raw_threshold_mm.or(base.raw_threshold_mm),
            safety_margin: self.safety_margin.unwrap_or(base.safety_margin),
            vpd_low_kpa: self.vpd_low_kpa.unwrap_or(base.vpd_low_kpa),
            vpd_high_kpa: self.vpd_high_kpa.unwrap_or(base.vpd_high_kpa),
            vpd_critical_kpa: self.vpd_critical_kpa.unwrap_or(base.vpd_critical_kpa),
            hysteresis_kpa: self.hysteresis_kpa.unwrap_or(base.hysteresis_kpa),
            efficiency_factor: self.efficiency_factor.unwrap_or(base.efficiency_factor),
            execution_timeout_min: self.execution_timeout_min.unwrap_or(base.execution_timeout_min),
            critical_temp_min_c: self.critical_temp_min_c.unwrap_or(base.critical_temp_min_c),
            critical_temp_max_c: self.critical_temp_max_c.unwrap_or(base.critical_temp_max_c),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectorEntry {
    pub sector_id: String,
    pub name: String,
    pub crop: String,
    pub area_m2: f64,
    pub latitude: f64,
    pub altitude_m: f64,
    pub field_capacity_mm: f64,
    pub raw_mm: f64,
    pub valve_id: String,
    /// `YYYY-MM-DD`
    pub planting_date: String,
    #[serde(default = "default_wind_height")]
    pub wind_height_m: f64,
    #[serde(default)]
    pub kc_schedule: Vec<KcEntry>,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KcEntry {
    pub stage: String,
    pub start_day: u32,
    pub days: u32,
    pub kc: f64,
}

fn default_wind_height() -> f64 {
    2.0
}

fn parse_date(s: &str) -> Result<Date, time::error::Parse> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
}

/// A sector ready to be handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorSetup {
    pub profile: SectorProfile,
    pub thresholds: SectorThresholds,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.defaults.check("defaults", &mut errors);
        self.validate_sectors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        if e.max_reading_age_min <= 0 {
            errors.push(format!(
                "engine: max_reading_age_min must be positive, got {}",
                e.max_reading_age_min
            ));
        }
        if !(e.cycle_hours > 0.0 && e.cycle_hours <= 24.0) {
            errors.push(format!("engine: cycle_hours {} out of range (0, 24]", e.cycle_hours));
        }
        if e.alert_cooldown_min < 0 {
            errors.push(format!(
                "engine: alert_cooldown_min must not be negative, got {}",
                e.alert_cooldown_min
            ));
        }
        if e.et_history_len == 0 {
            errors.push("engine: et_history_len must be positive".to_string());
        }
        for (kind, value) in e.fallbacks.to_map() {
            let (min, max) = kind.plausible_range();
            if !(min..=max).contains(&value) {
                errors.push(format!(
                    "engine.fallbacks: {kind} {value} out of range [{min}, {max}]"
                ));
            }
        }
    }

    fn validate_sectors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_valves: HashSet<&str> = HashSet::new();

        for (i, s) in self.sectors.iter().enumerate() {
            let ctx = if s.sector_id.is_empty() {
                format!("sectors[{i}]")
            } else {
                format!("sector '{}'", s.sector_id)
            };

            // ── Identity ────────────────────────────────────────
            if s.sector_id.trim().is_empty() {
                errors.push(format!("{ctx}: sector_id is empty"));
            } else if !seen_ids.insert(&s.sector_id) {
                errors.push(format!("{ctx}: duplicate sector_id"));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            if s.valve_id.trim().is_empty() {
                errors.push(format!("{ctx}: valve_id is empty"));
            } else if !seen_valves.insert(&s.valve_id) {
                errors.push(format!(
                    "{ctx}: valve_id '{}' is already used by another sector",
                    s.valve_id
                ));
            }

            // ── Site ────────────────────────────────────────────
            if !(s.area_m2 > 0.0) {
                errors.push(format!("{ctx}: area_m2 must be positive, got {}", s.area_m2));
            }
            if !(-90.0..=90.0).contains(&s.latitude) {
                errors.push(format!("{ctx}: latitude {} out of range [-90, 90]", s.latitude));
            }
            if !(s.wind_height_m > 0.1) {
                errors.push(format!("{ctx}: wind_height_m {} too low", s.wind_height_m));
            }
            if parse_date(&s.planting_date).is_err() {
                errors.push(format!(
                    "{ctx}: planting_date '{}' is not YYYY-MM-DD",
                    s.planting_date
                ));
            }

            // ── Soil water ──────────────────────────────────────
            if !(s.field_capacity_mm > 0.0) {
                errors.push(format!(
                    "{ctx}: field_capacity_mm must be positive, got {}",
                    s.field_capacity_mm
                ));
            }
            if !(s.raw_mm > 0.0) {
                errors.push(format!("{ctx}: raw_mm must be positive, got {}", s.raw_mm));
            } else if s.raw_mm > s.field_capacity_mm {
                errors.push(format!(
                    "{ctx}: raw_mm ({}) exceeds field_capacity_mm ({})",
                    s.raw_mm, s.field_capacity_mm
                ));
            }

            // ── Kc schedule ─────────────────────────────────────
            if s.kc_schedule.is_empty() {
                errors.push(format!("{ctx}: kc_schedule is empty"));
            }
            let mut seen_days: HashSet<u32> = HashSet::new();
            for k in &s.kc_schedule {
                if !(k.kc > 0.0 && k.kc <= 2.0) {
                    errors.push(format!(
                        "{ctx}: stage '{}' kc {} out of range (0, 2]",
                        k.stage, k.kc
                    ));
                }
                if k.days == 0 {
                    errors.push(format!("{ctx}: stage '{}' has zero days", k.stage));
                }
                if !seen_days.insert(k.start_day) {
                    errors.push(format!(
                        "{ctx}: more than one stage starts on day {}",
                        k.start_day
                    ));
                }
            }

            // ── Thresholds ──────────────────────────────────────
            s.thresholds.apply(&self.defaults).check(&ctx, errors);
        }
    }

    /// Turn validated sector entries into engine-ready profiles.
    pub fn sector_setups(&self) -> Result<Vec<SectorSetup>> {
        self.sectors
            .iter()
            .map(|s| -> Result<SectorSetup> {
                let planting_date = parse_date(&s.planting_date)
                    .with_context(|| format!("sector '{}': bad planting_date", s.sector_id))?;
                let stages = s
                    .kc_schedule
                    .iter()
                    .map(|k| GrowthStage {
                        name: k.stage.clone(),
                        start_day: k.start_day,
                        days: k.days,
                        kc: k.kc,
                    })
                    .collect();
                let kc_schedule = KcSchedule::new(stages)
                    .with_context(|| format!("sector '{}': bad kc_schedule", s.sector_id))?;

                Ok(SectorSetup {
                    profile: SectorProfile {
                        sector_id: s.sector_id.clone(),
                        name: s.name.clone(),
                        crop: s.crop.clone(),
                        area_m2: s.area_m2,
                        latitude_deg: s.latitude,
                        altitude_m: s.altitude_m,
                        field_capacity_mm: s.field_capacity_mm,
                        raw_mm: s.raw_mm,
                        valve_id: s.valve_id.clone(),
                        planting_date,
                        wind_height_m: s.wind_height_m,
                        kc_schedule,
                    },
                    thresholds: s.thresholds.apply(&self.defaults),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
