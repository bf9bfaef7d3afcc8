//! FAO-56 Penman-Monteith reference evapotranspiration and crop ET.
//!
//! Daily time step: soil heat flux is taken as zero and radiation samples
//! are averaged over the whole day (night samples included), so the mean
//! W/m² converts to MJ/m²/day by a factor of 0.0864.

use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use time::{Date, OffsetDateTime};

use crate::error::{EngineError, EngineResult};
use crate::profile::SectorProfile;
use crate::reading::{ReadingKind, ReadingWindow};

/// Solar constant, MJ m⁻² min⁻¹.
const SOLAR_CONSTANT: f64 = 0.0820;
/// Stefan-Boltzmann constant, MJ K⁻⁴ m⁻² day⁻¹.
const STEFAN_BOLTZMANN: f64 = 4.903e-9;
/// Albedo of the hypothetical grass reference crop.
const ALBEDO: f64 = 0.23;
const W_M2_TO_MJ_DAY: f64 = 0.0864;

// ---------------------------------------------------------------------------
// Physical terms
// ---------------------------------------------------------------------------

/// Saturation vapour pressure (kPa) at `t` °C.
pub fn saturation_vapor_pressure(t: f64) -> f64 {
    0.6108 * ((17.27 * t) / (t + 237.3)).exp()
}

/// Slope of the saturation vapour pressure curve (kPa/°C) at `t` °C.
pub fn svp_slope(t: f64) -> f64 {
    4098.0 * saturation_vapor_pressure(t) / (t + 237.3).powi(2)
}

/// Atmospheric pressure (kPa) at `altitude_m`.
pub fn atmospheric_pressure(altitude_m: f64) -> f64 {
    101.3 * ((293.0 - 0.0065 * altitude_m) / 293.0).powf(5.26)
}

/// Psychrometric constant (kPa/°C) at `altitude_m`.
pub fn psychrometric_constant(altitude_m: f64) -> f64 {
    0.000665 * atmospheric_pressure(altitude_m)
}

/// Extraterrestrial radiation (MJ/m²/day) for a latitude and day of year.
pub fn extraterrestrial_radiation(latitude_deg: f64, day_of_year: u16) -> f64 {
    let phi = latitude_deg.to_radians();
    let j = f64::from(day_of_year);
    let dr = 1.0 + 0.033 * (2.0 * PI * j / 365.0).cos();
    let delta = 0.409 * (2.0 * PI * j / 365.0 - 1.39).sin();
    // Clamped so polar day/night stay defined.
    let ws = (-phi.tan() * delta.tan()).clamp(-1.0, 1.0).acos();

    let ra = (24.0 * 60.0 / PI)
        * SOLAR_CONSTANT
        * dr
        * (ws * phi.sin() * delta.sin() + phi.cos() * delta.cos() * ws.sin());
    ra.max(0.0)
}

/// Wind speed converted to the 2 m reference height.
pub fn wind_at_two_meters(speed: f64, height_m: f64) -> f64 {
    if (height_m - 2.0).abs() < f64::EPSILON {
        return speed;
    }
    speed * 4.87 / (67.8 * height_m - 5.42).ln()
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// No growth stage covers the date; `stage`'s Kc was borrowed.
    KcExtrapolated { stage: String },
    /// A configured constant stood in for a missing reading kind.
    FallbackUsed { reading: ReadingKind },
}

/// Intermediate terms kept for explainability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EtTerms {
    pub mean_temperature_c: f64,
    pub net_radiation_mj: f64,
    pub extraterrestrial_radiation_mj: f64,
    pub clear_sky_radiation_mj: f64,
    pub psychrometric_constant: f64,
    pub svp_slope: f64,
    pub saturation_vp_kpa: f64,
    pub actual_vp_kpa: f64,
    pub wind_2m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtResult {
    pub sector_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub date: Date,
    pub et0_mm_day: f64,
    pub stage: String,
    pub kc: f64,
    pub etc_mm_day: f64,
    /// Fraction of a day this result accounts for in the water balance.
    pub period_days: f64,
    pub terms: EtTerms,
    pub advisories: Vec<Advisory>,
}

/// The accounting period an ET result covers: its date plus, for cycles
/// shorter than a day, the slot of the day its timestamp falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeriodKey {
    pub date: Date,
    pub slot: u32,
}

impl EtResult {
    pub fn etc_mm_for_period(&self) -> f64 {
        self.etc_mm_day * self.period_days
    }

    pub fn period_key(&self) -> PeriodKey {
        let slot = if self.period_days >= 1.0 || self.period_days <= 0.0 {
            0
        } else {
            let (h, m, sec) = self.timestamp.to_offset(time::UtcOffset::UTC).time().as_hms();
            let secs = f64::from(h) * 3600.0 + f64::from(m) * 60.0 + f64::from(sec);
            (secs / (self.period_days * 86_400.0)).floor() as u32
        };
        PeriodKey {
            date: self.date,
            slot,
        }
    }

    pub fn kc_extrapolated(&self) -> bool {
        self.advisories
            .iter()
            .any(|a| matches!(a, Advisory::KcExtrapolated { .. }))
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Daily weather summary fed to the Penman-Monteith equation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyWeather {
    pub t_mean: f64,
    pub t_min: f64,
    pub t_max: f64,
    pub rh_mean: f64,
    pub radiation_w_m2: f64,
    pub wind_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EtCalculator {
    fallbacks: BTreeMap<ReadingKind, f64>,
    period_days: f64,
}

impl EtCalculator {
    pub fn new(fallbacks: BTreeMap<ReadingKind, f64>, period_days: f64) -> Self {
        Self {
            fallbacks,
            period_days,
        }
    }

    /// Summarise the window, substituting configured constants for missing
    /// kinds. Fails with `InsufficientData` naming every kind still absent.
    pub fn daily_weather(
        &self,
        sector_id: &str,
        readings: &ReadingWindow,
    ) -> EngineResult<(DailyWeather, Vec<Advisory>)> {
        let mut missing = Vec::new();
        let mut advisories = Vec::new();
        let mut pick = |kind: ReadingKind| match readings.stats(kind) {
            Some(s) => Some((s.mean, s.min, s.max)),
            None => match self.fallbacks.get(&kind) {
                Some(&v) => {
                    advisories.push(Advisory::FallbackUsed { reading: kind });
                    Some((v, v, v))
                }
                None => {
                    missing.push(kind);
                    None
                }
            },
        };

        let temp = pick(ReadingKind::Temperature);
        let rh = pick(ReadingKind::RelativeHumidity);
        let rad = pick(ReadingKind::SolarRadiation);
        let wind = pick(ReadingKind::WindSpeed);

        match (temp, rh, rad, wind) {
            (Some(t), Some(rh), Some(rad), Some(wind)) => Ok((
                DailyWeather {
                    t_mean: t.0,
                    t_min: t.1,
                    t_max: t.2,
                    rh_mean: rh.0,
                    radiation_w_m2: rad.0,
                    wind_ms: wind.0,
                },
                advisories,
            )),
            _ => Err(EngineError::InsufficientData {
                sector: sector_id.to_string(),
                missing,
            }),
        }
    }

    pub fn compute(
        &self,
        profile: &SectorProfile,
        readings: &ReadingWindow,
        date: Date,
        timestamp: OffsetDateTime,
    ) -> EngineResult<EtResult> {
        let (weather, mut advisories) = self.daily_weather(&profile.sector_id, readings)?;
        let (et0, terms) = penman_monteith(profile, &weather, date.ordinal());

        let kc = profile.kc_for(date).ok_or_else(|| {
            EngineError::InvalidProfile(format!("{}: kc schedule is empty", profile.sector_id))
        })?;
        if kc.extrapolated {
            advisories.push(Advisory::KcExtrapolated {
                stage: kc.stage.clone(),
            });
        }

        Ok(EtResult {
            sector_id: profile.sector_id.clone(),
            timestamp,
            date,
            et0_mm_day: et0,
            etc_mm_day: et0 * kc.kc,
            stage: kc.stage,
            kc: kc.kc,
            period_days: self.period_days,
            terms,
            advisories,
        })
    }
}

/// Reference ET0 (mm/day) floored at zero, plus the terms used.
pub fn penman_monteith(profile: &SectorProfile, w: &DailyWeather, day_of_year: u16) -> (f64, EtTerms) {
    let gamma = psychrometric_constant(profile.altitude_m);
    let delta = svp_slope(w.t_mean);

    let es = (saturation_vapor_pressure(w.t_max) + saturation_vapor_pressure(w.t_min)) / 2.0;
    let ea = es * w.rh_mean / 100.0;

    let ra = extraterrestrial_radiation(profile.latitude_deg, day_of_year);
    let rso = (0.75 + 2e-5 * profile.altitude_m) * ra;
    let rs = w.radiation_w_m2 * W_M2_TO_MJ_DAY;
    let rns = (1.0 - ALBEDO) * rs;

    let relative_shortwave = if rso > 0.0 { (rs / rso).min(1.0) } else { 0.5 };
    // Cloudiness factor stays in [0.05, 1]; below that longwave would turn into a gain.
    let cloudiness = (1.35 * relative_shortwave - 0.35).clamp(0.05, 1.0);
    let tmax_k4 = (w.t_max + 273.16).powi(4);
    let tmin_k4 = (w.t_min + 273.16).powi(4);
    let rnl = STEFAN_BOLTZMANN * ((tmax_k4 + tmin_k4) / 2.0) * (0.34 - 0.14 * ea.sqrt()) * cloudiness;
    let rn = rns - rnl;

    let u2 = wind_at_two_meters(w.wind_ms, profile.wind_height_m);

    let numerator = 0.408 * delta * rn + gamma * (900.0 / (w.t_mean + 273.0)) * u2 * (es - ea);
    let denominator = delta + gamma * (1.0 + 0.34 * u2);
    let et0 = (numerator / denominator).max(0.0);

    let terms = EtTerms {
        mean_temperature_c: w.t_mean,
        net_radiation_mj: rn,
        extraterrestrial_radiation_mj: ra,
        clear_sky_radiation_mj: rso,
        psychrometric_constant: gamma,
        svp_slope: delta,
        saturation_vp_kpa: es,
        actual_vp_kpa: ea,
        wind_2m: u2,
    };
    (et0, terms)
}

// ===========================================================================
// Tests
// ===========================================================================
