//! VPD classification with hysteresis out of CRITICAL, plus the alert gate
//! that throttles repeated climate alerts.

use serde::Serialize;
use std::fmt;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::et::saturation_vapor_pressure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VpdClass {
    Low,
    Optimal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClimateAction {
    None,
    Ventilate,
    Shade,
    Alert,
}

impl fmt::Display for VpdClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ClimateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl VpdClass {
    pub fn action(self) -> ClimateAction {
        match self {
            Self::Low => ClimateAction::Ventilate,
            Self::Optimal => ClimateAction::None,
            Self::High => ClimateAction::Shade,
            Self::Critical => ClimateAction::Alert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClimateBands {
    /// Below this VPD the air is too humid.
    pub vpd_low_kpa: f64,
    /// Upper bound of the optimal band.
    pub vpd_high_kpa: f64,
    /// Above this VPD the sector is critical.
    pub vpd_critical_kpa: f64,
    pub hysteresis_kpa: f64,
    pub critical_temp_min_c: f64,
    pub critical_temp_max_c: f64,
}

impl Default for ClimateBands {
    fn default() -> Self {
        Self {
            vpd_low_kpa: 0.4,
            vpd_high_kpa: 1.2,
            vpd_critical_kpa: 1.6,
            hysteresis_kpa: 0.1,
            critical_temp_min_c: 10.0,
            critical_temp_max_c: 35.0,
        }
    }
}

impl ClimateBands {
    fn classify(&self, vpd: f64) -> VpdClass {
        if vpd < self.vpd_low_kpa {
            VpdClass::Low
        } else if vpd <= self.vpd_high_kpa {
            VpdClass::Optimal
        } else if vpd <= self.vpd_critical_kpa {
            VpdClass::High
        } else {
            VpdClass::Critical
        }
    }

    /// VPD below which a CRITICAL sector is allowed to reclassify.
    pub fn critical_exit_kpa(&self) -> f64 {
        self.vpd_high_kpa - self.hysteresis_kpa
    }
}

/// VPD (kPa) from air temperature and relative humidity.
pub fn vapor_pressure_deficit(temperature_c: f64, relative_humidity: f64) -> f64 {
    (saturation_vapor_pressure(temperature_c) * (1.0 - relative_humidity / 100.0)).max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateState {
    pub sector_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub temperature_c: f64,
    pub relative_humidity: f64,
    pub vpd_kpa: f64,
    pub classification: VpdClass,
    pub action: ClimateAction,
    pub temperature_alert: bool,
}

/// Classification rules for one sector. The last classification is the
/// only state carried from one evaluation to the next.
#[derive(Debug, Clone)]
pub struct ClimateRules {
    bands: ClimateBands,
    last: Option<VpdClass>,
}

impl ClimateRules {
    pub fn new(bands: ClimateBands) -> Self {
        Self { bands, last: None }
    }

    pub fn set_bands(&mut self, bands: ClimateBands) {
        self.bands = bands;
    }

    pub fn last_classification(&self) -> Option<VpdClass> {
        self.last
    }

    pub fn evaluate(
        &mut self,
        sector_id: &str,
        temperature_c: f64,
        relative_humidity: f64,
        at: OffsetDateTime,
    ) -> ClimateState {
        let vpd = vapor_pressure_deficit(temperature_c, relative_humidity);

        let classification = match self.last {
            Some(VpdClass::Critical) if vpd >= self.bands.critical_exit_kpa() => VpdClass::Critical,
            _ => self.bands.classify(vpd),
        };

        let temperature_alert = temperature_c < self.bands.critical_temp_min_c
            || temperature_c > self.bands.critical_temp_max_c;
        let action = if temperature_alert {
            ClimateAction::Alert
        } else {
            classification.action()
        };

        if self.last != Some(classification) {
            info!(
                sector = %sector_id,
                vpd_kpa = format!("{vpd:.3}"),
                from = ?self.last,
                to = %classification,
                "climate: classification changed"
            );
        }
        self.last = Some(classification);

        ClimateState {
            sector_id: sector_id.to_string(),
            timestamp: at,
            temperature_c,
            relative_humidity,
            vpd_kpa: vpd,
            classification,
            action,
            temperature_alert,
        }
    }
}

// ---------------------------------------------------------------------------
// Alert gate
// ---------------------------------------------------------------------------

/// Lets an alert through when the action changed or the cooldown elapsed.
#[derive(Debug, Clone)]
pub struct AlertGate {
    cooldown: Duration,
    last: Option<(ClimateAction, OffsetDateTime)>,
}

impl AlertGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: None,
        }
    }

    pub fn should_emit(&mut self, state: &ClimateState) -> bool {
        if state.action == ClimateAction::None {
            self.last = None;
            return false;
        }
        let emit = match self.last {
            Some((action, at)) => action != state.action || state.timestamp - at >= self.cooldown,
            None => true,
        };
        if emit {
            self.last = Some((state.action, state.timestamp));
        }
        emit
    }
}

// ===========================================================================
// Tests
// ===========================================================================
