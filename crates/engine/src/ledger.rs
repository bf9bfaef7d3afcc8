//! Per-sector root-zone water balance.
//!
//! The deficit only moves through three doors: ETc accumulation, rainfall
//! credited alongside an ET update, and delivered irrigation reported for a
//! recommendation. Each door is keyed so replays are detected and ignored.
//!
//! ```text
//! Ok ──[deficit ≥ warn]──▶ ApproachingDeficit ──[deficit ≥ RAW]──▶ Deficit
//!  ▲                                                                  │
//!  │                                                        [irrigation confirmed]
//!  │                                                                  ▼
//!  └────────[delivered volume recorded / irrigation released]──── Irrigating
//! ```

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::decision::RecommendationId;
use crate::et::{EtResult, PeriodKey};

/// Number of ET periods remembered for replay detection.
const REPLAY_WINDOW: usize = 400;

/// Credited recommendations remembered. Covers every id the recommendation
/// book still retains, older ids are already rejected there.
const CREDIT_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceStatus {
    Ok,
    ApproachingDeficit,
    Deficit,
    Irrigating,
}

impl fmt::Display for BalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::ApproachingDeficit => "APPROACHING_DEFICIT",
            Self::Deficit => "DEFICIT",
            Self::Irrigating => "IRRIGATING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerThresholds {
    pub raw_threshold_mm: f64,
    /// Fraction of the RAW threshold at which the sector is flagged.
    pub warning_fraction: f64,
    /// Upper clamp on the deficit, as a multiple of the RAW threshold.
    pub safety_margin: f64,
}

impl LedgerThresholds {
    pub fn max_deficit_mm(&self) -> f64 {
        self.raw_threshold_mm * self.safety_margin
    }

    pub fn status_for(&self, deficit_mm: f64) -> BalanceStatus {
        if deficit_mm >= self.raw_threshold_mm {
            BalanceStatus::Deficit
        } else if deficit_mm >= self.raw_threshold_mm * self.warning_fraction {
            BalanceStatus::ApproachingDeficit
        } else {
            BalanceStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaterBalanceState {
    pub sector_id: String,
    pub deficit_mm: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    pub raw_threshold_mm: f64,
    pub status: BalanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerUpdate {
    Applied,
    /// Same key seen before; nothing counted.
    Replay,
    /// Older than anything the replay window can vouch for.
    Stale,
}

#[derive(Debug, Clone)]
pub struct WaterBalanceLedger {
    state: WaterBalanceState,
    thresholds: LedgerThresholds,
    applied: BTreeSet<PeriodKey>,
    credited: BTreeSet<RecommendationId>,
}

impl WaterBalanceLedger {
    pub fn new(sector_id: &str, thresholds: LedgerThresholds) -> Self {
        Self {
            state: WaterBalanceState {
                sector_id: sector_id.to_string(),
                deficit_mm: 0.0,
                last_update: None,
                raw_threshold_mm: thresholds.raw_threshold_mm,
                status: BalanceStatus::Ok,
            },
            thresholds,
            applied: BTreeSet::new(),
            credited: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &WaterBalanceState {
        &self.state
    }

    pub fn thresholds(&self) -> &LedgerThresholds {
        &self.thresholds
    }

    /// Reconfiguration keeps the deficit, re-clamped to the new bounds.
    pub fn set_thresholds(&mut self, thresholds: LedgerThresholds) {
        self.thresholds = thresholds;
        self.state.raw_threshold_mm = thresholds.raw_threshold_mm;
        self.state.deficit_mm = self.clamp(self.state.deficit_mm);
        if self.state.status != BalanceStatus::Irrigating {
            self.state.status = thresholds.status_for(self.state.deficit_mm);
        }
    }

    /// Add one period's ETc and subtract rainfall, once per accounting
    /// period. A second result for a period already counted is a replay,
    /// whatever its timestamp.
    pub fn update_balance(&mut self, et: &EtResult, rainfall_mm: f64) -> (LedgerUpdate, WaterBalanceState) {
        let key = et.period_key();
        if self.applied.contains(&key) {
            debug!(sector = %self.state.sector_id, date = %key.date, slot = key.slot, "ledger: replayed ET update ignored");
            return (LedgerUpdate::Replay, self.state.clone());
        }
        if self.applied.len() >= REPLAY_WINDOW && self.applied.first().is_some_and(|first| key < *first) {
            debug!(sector = %self.state.sector_id, date = %key.date, "ledger: ET update older than replay window ignored");
            return (LedgerUpdate::Stale, self.state.clone());
        }

        self.applied.insert(key);
        while self.applied.len() > REPLAY_WINDOW {
            self.applied.pop_first();
        }

        let etc = et.etc_mm_for_period().max(0.0);
        let rain = rainfall_mm.max(0.0);
        let before = self.state.status;
        self.state.deficit_mm = self.clamp(self.state.deficit_mm + etc - rain);
        self.touch(et.timestamp);

        if self.state.status != BalanceStatus::Irrigating {
            self.state.status = self.thresholds.status_for(self.state.deficit_mm);
        }
        self.log_transition(before);

        (LedgerUpdate::Applied, self.state.clone())
    }

    /// Credit volume delivered for a recommendation, once per recommendation.
    pub fn record_irrigation(
        &mut self,
        recommendation: RecommendationId,
        delivered_liters: f64,
        area_m2: f64,
        at: OffsetDateTime,
    ) -> (LedgerUpdate, WaterBalanceState) {
        if !self.credited.insert(recommendation) {
            return (LedgerUpdate::Replay, self.state.clone());
        }
        while self.credited.len() > CREDIT_WINDOW {
            self.credited.pop_first();
        }

        let mm = if area_m2 > 0.0 {
            delivered_liters.max(0.0) / area_m2
        } else {
            0.0
        };
        let before = self.state.status;
        self.state.deficit_mm = self.clamp(self.state.deficit_mm - mm);
        self.touch(at);
        self.state.status = self.thresholds.status_for(self.state.deficit_mm);
        self.log_transition(before);

        (LedgerUpdate::Applied, self.state.clone())
    }

    /// An irrigation was confirmed; ET updates no longer move the status.
    pub fn begin_irrigation(&mut self) {
        let before = self.state.status;
        self.state.status = BalanceStatus::Irrigating;
        self.log_transition(before);
    }

    /// The in-flight irrigation ended without (full) delivery.
    pub fn release_irrigation(&mut self) {
        if self.state.status == BalanceStatus::Irrigating {
            self.state.status = self.thresholds.status_for(self.state.deficit_mm);
            self.log_transition(BalanceStatus::Irrigating);
        }
    }

    fn clamp(&self, deficit: f64) -> f64 {
        deficit.clamp(0.0, self.thresholds.max_deficit_mm())
    }

    fn touch(&mut self, at: OffsetDateTime) {
        if self.state.last_update.map_or(true, |prev| at > prev) {
            self.state.last_update = Some(at);
        }
    }

    fn log_transition(&self, before: BalanceStatus) {
        if before != self.state.status {
            info!(
                sector = %self.state.sector_id,
                from = %before,
                to = %self.state.status,
                deficit_mm = format!("{:.2}", self.state.deficit_mm),
                "ledger: status changed"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
