//! Sector metadata and the crop-coefficient schedule.

use serde::Serialize;
use std::collections::BTreeMap;
use time::Date;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthStage {
    pub name: String,
    /// Days after planting at which the stage begins.
    pub start_day: u32,
    pub days: u32,
    pub kc: f64,
}

impl GrowthStage {
    fn covers(&self, day: u32) -> bool {
        day >= self.start_day && day - self.start_day < self.days
    }
}

/// Result of a schedule lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct KcLookup {
    pub stage: String,
    pub kc: f64,
    /// True when no stage covers the day and a neighbour's Kc was borrowed.
    pub extrapolated: bool,
}

/// Growth stages ordered by their start day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KcSchedule {
    stages: BTreeMap<u32, GrowthStage>,
}

impl KcSchedule {
    pub fn new(stages: Vec<GrowthStage>) -> EngineResult<Self> {
        if stages.is_empty() {
            return Err(EngineError::InvalidProfile("kc schedule is empty".into()));
        }
        let mut map = BTreeMap::new();
        for stage in stages {
            if !(stage.kc > 0.0 && stage.kc <= 2.0) {
                return Err(EngineError::InvalidProfile(format!(
                    "stage '{}': kc {} out of range (0, 2]",
                    stage.name, stage.kc
                )));
            }
            let start = stage.start_day;
            if map.insert(start, stage).is_some() {
                return Err(EngineError::InvalidProfile(format!(
                    "two stages start on day {start}"
                )));
            }
        }
        Ok(Self { stages: map })
    }

    /// The latest stage starting on or before `day` wins. Before the first
    /// stage the earliest one is used; both fallbacks flag extrapolation.
    pub fn lookup(&self, day: u32) -> Option<KcLookup> {
        let (stage, extrapolated) = match self.stages.range(..=day).next_back() {
            Some((_, stage)) => (stage, !stage.covers(day)),
            None => (self.stages.values().next()?, true),
        };
        Some(KcLookup {
            stage: stage.name.clone(),
            kc: stage.kc,
            extrapolated,
        })
    }

    pub fn stages(&self) -> impl Iterator<Item = &GrowthStage> {
        self.stages.values()
    }
}

/// Static description of a greenhouse sector. Owned by configuration and
/// never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorProfile {
    pub sector_id: String,
    pub name: String,
    pub crop: String,
    pub area_m2: f64,
    pub latitude_deg: f64,
    pub altitude_m: f64,
    pub field_capacity_mm: f64,
    /// Readily available water depth.
    pub raw_mm: f64,
    pub valve_id: String,
    pub planting_date: Date,
    pub wind_height_m: f64,
    pub kc_schedule: KcSchedule,
}

impl SectorProfile {
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: String| Err(EngineError::InvalidProfile(format!("{}: {msg}", self.sector_id)));

        if self.sector_id.trim().is_empty() {
            return Err(EngineError::InvalidProfile("sector_id is empty".into()));
        }
        if !(self.area_m2 > 0.0) {
            return fail(format!("area_m2 must be positive, got {}", self.area_m2));
        }
        if !(-90.0..=90.0).contains(&self.latitude_deg) {
            return fail(format!("latitude {} out of range [-90, 90]", self.latitude_deg));
        }
        if !(self.raw_mm > 0.0) || self.raw_mm > self.field_capacity_mm {
            return fail(format!(
                "raw_mm ({}) must be positive and not exceed field_capacity_mm ({})",
                self.raw_mm, self.field_capacity_mm
            ));
        }
        if !(self.wind_height_m > 0.1) {
            return fail(format!("wind_height_m {} too low", self.wind_height_m));
        }
        Ok(())
    }

    /// Days after planting; dates before planting count as day 0.
    pub fn days_after_planting(&self, date: Date) -> u32 {
        let days = (date - self.planting_date).whole_days();
        u32::try_from(days.max(0)).unwrap_or(u32::MAX)
    }

    pub fn kc_for(&self, date: Date) -> Option<KcLookup> {
        self.kc_schedule.lookup(self.days_after_planting(date))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
