//! The engine facade.
//!
//! Every sector lives in its own `Mutex`-guarded unit; all work for one
//! sector (validation, ET, ledger, climate, recommendation lifecycle) runs
//! inside that unit's critical section, so different sectors proceed in
//! parallel and one sector's operations never interleave. Outbound
//! messages are buffered while the lock is held and delivered after it is
//! released.
//!
//! Lock order: registry, then sector unit, then the recommendation owner
//! index. The registry lock is never taken while a unit is held.

use anyhow::Context;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::climate::{AlertGate, ClimateRules, ClimateState};
use crate::config::{Config, EngineSettings, OperationMode, SectorThresholds};
use crate::decision::{
    ActorRef, ActuatorCommand, IrrigationRecommendation, RecommendationBook, RecommendationId,
    RecommendationStatus,
};
use crate::error::{EngineError, EngineResult, InvalidReading};
use crate::et::{Advisory, EtCalculator, EtResult};
use crate::ledger::{BalanceStatus, LedgerUpdate, WaterBalanceLedger, WaterBalanceState};
use crate::outbound::{Outbound, OutboundMessage};
use crate::profile::SectorProfile;
use crate::reading::{KindStats, ReadingKind, ReadingWindow, SensorReading, ValidReading};
use crate::state::{Counter, EventJournal, EventKind, Metrics, SectorStatus, StatusSnapshot};
use crate::validate::ReadingValidator;

/// Closed recommendations listed per sector in the status snapshot.
const STATUS_RECENT: usize = 10;

// ---------------------------------------------------------------------------
// Per-sector unit
// ---------------------------------------------------------------------------

struct SectorUnit {
    profile: SectorProfile,
    thresholds: SectorThresholds,
    validator: ReadingValidator,
    window: ReadingWindow,
    ledger: WaterBalanceLedger,
    climate: ClimateRules,
    climate_state: Option<ClimateState>,
    alerts: AlertGate,
    book: RecommendationBook,
    et_history: VecDeque<EtResult>,
    journal: EventJournal,
}

impl SectorUnit {
    fn new(profile: SectorProfile, thresholds: SectorThresholds, settings: &EngineSettings) -> Self {
        Self {
            validator: ReadingValidator::new(settings.max_reading_age()),
            window: ReadingWindow::default(),
            ledger: WaterBalanceLedger::new(&profile.sector_id, thresholds.ledger(&profile)),
            climate: ClimateRules::new(thresholds.climate_bands()),
            climate_state: None,
            alerts: AlertGate::new(settings.alert_cooldown()),
            book: RecommendationBook::default(),
            et_history: VecDeque::with_capacity(settings.et_history_len),
            journal: EventJournal::default(),
            profile,
            thresholds,
        }
    }

    /// Profile and thresholds change; accumulated state stays.
    fn reconfigure(&mut self, profile: SectorProfile, thresholds: SectorThresholds) {
        self.ledger.set_thresholds(thresholds.ledger(&profile));
        self.climate.set_bands(thresholds.climate_bands());
        self.profile = profile;
        self.thresholds = thresholds;
    }

    fn status(&self) -> SectorStatus {
        SectorStatus {
            name: self.profile.name.clone(),
            crop: self.profile.crop.clone(),
            balance: self.ledger.state().clone(),
            climate: self.climate_state.clone(),
            et_history: self.et_history.iter().cloned().collect(),
            open_recommendation: self.book.open().cloned(),
            recent_recommendations: self
                .book
                .all()
                .rev()
                .filter(|r| r.status.is_terminal())
                .take(STATUS_RECENT)
                .cloned()
                .collect(),
            events: self.journal.newest_first(),
        }
    }
}

/// Everything one computation cycle produced for a sector.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub sector_id: String,
    pub et: EtResult,
    pub balance: WaterBalanceState,
    pub climate: Option<ClimateState>,
    /// Recommendation created by this cycle, if any.
    pub recommendation: Option<IrrigationRecommendation>,
    /// Advisory only; never written into the ledger.
    pub soil_moisture: Option<KindStats>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    settings: EngineSettings,
    calculator: EtCalculator,
    outbound: Arc<dyn Outbound>,
    sectors: RwLock<HashMap<String, Arc<Mutex<SectorUnit>>>>,
    owners: RwLock<HashMap<RecommendationId, String>>,
    next_id: AtomicU64,
    metrics: Metrics,
}

impl Engine {
    pub fn new(settings: EngineSettings, outbound: Arc<dyn Outbound>) -> Self {
        let calculator = EtCalculator::new(settings.fallbacks.to_map(), settings.period_days());
        Self {
            settings,
            calculator,
            outbound,
            sectors: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: Metrics::default(),
        }
    }

    /// Build an engine with every sector of a validated config registered.
    pub fn from_config(config: &Config, outbound: Arc<dyn Outbound>) -> anyhow::Result<Self> {
        let engine = Self::new(config.engine.clone(), outbound);
        for setup in config.sector_setups()? {
            let id = setup.profile.sector_id.clone();
            engine
                .ingest_sector_profile(setup.profile, setup.thresholds)
                .with_context(|| format!("failed to register sector '{id}'"))?;
        }
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // -- Inbound: configuration ---------------------------------------------

    /// Register a sector, or reconfigure it while keeping its ledger,
    /// climate and recommendation state.
    pub fn ingest_sector_profile(
        &self,
        profile: SectorProfile,
        thresholds: SectorThresholds,
    ) -> EngineResult<()> {
        profile.validate()?;
        let mut problems = Vec::new();
        thresholds.check(&profile.sector_id, &mut problems);
        if !problems.is_empty() {
            return Err(EngineError::InvalidProfile(problems.join("; ")));
        }

        // The registry guard is released before a busy unit is waited on.
        let existing = {
            let mut sectors = self.sectors.write().unwrap_or_else(PoisonError::into_inner);
            match sectors.entry(profile.sector_id.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    info!(
                        sector = %profile.sector_id,
                        crop = %profile.crop,
                        area_m2 = profile.area_m2,
                        "engine: sector registered"
                    );
                    let unit = SectorUnit::new(profile, thresholds, &self.settings);
                    entry.insert(Arc::new(Mutex::new(unit)));
                    return Ok(());
                }
            }
        };

        let mut unit = existing.lock().unwrap_or_else(PoisonError::into_inner);
        info!(sector = %profile.sector_id, "engine: sector reconfigured");
        unit.reconfigure(profile, thresholds);
        Ok(())
    }

    // -- Inbound: readings --------------------------------------------------

    /// Validate a reading and add it to the sector's window. Rejections are
    /// logged, journalled and counted, then returned to the caller.
    pub fn ingest_reading(&self, reading: &SensorReading, now: OffsetDateTime) -> EngineResult<ValidReading> {
        self.with_sector(&reading.sector_id, |unit, _| {
            match unit.validator.validate(reading, now) {
                Ok(valid) => {
                    if valid.suspect {
                        unit.journal.record(
                            now,
                            EventKind::ReadingSuspect,
                            format!("{} = {} flagged suspect", valid.kind, valid.value),
                        );
                    }
                    unit.window.push(valid);
                    self.metrics.bump(Counter::ReadingAccepted);
                    Ok(valid)
                }
                Err(reason) => {
                    warn!(sector = %reading.sector_id, kind = %reading.kind, "engine: reading rejected: {reason}");
                    unit.journal.record(now, EventKind::ReadingRejected, reason.to_string());
                    self.metrics.bump(Counter::ReadingRejected);
                    Err(EngineError::InvalidReading {
                        sector: reading.sector_id.clone(),
                        reason,
                    })
                }
            }
        })
    }

    // -- Computation --------------------------------------------------------

    /// ET for the sector's current window, without touching any state.
    pub fn compute_et(&self, sector_id: &str, date: Date, now: OffsetDateTime) -> EngineResult<EtResult> {
        self.with_sector(sector_id, |unit, _| {
            self.calculator.compute(&unit.profile, &unit.window, date, now)
        })
    }

    /// Apply one ET result (plus rainfall) to the sector's ledger. A second
    /// result for an accounting period already counted is ignored.
    pub fn update_balance(&self, et: &EtResult, rainfall_mm: f64) -> EngineResult<WaterBalanceState> {
        self.with_sector(&et.sector_id, |unit, out| {
            Ok(self.apply_balance(unit, et, rainfall_mm, out).1)
        })
    }

    /// One full cycle: ET from the collected window, ledger update,
    /// recommendation per operation mode, climate from the latest values.
    ///
    /// With insufficient data the cycle is skipped and the deficit stays
    /// where it was.
    pub fn run_cycle(
        &self,
        sector_id: &str,
        date: Date,
        rainfall_mm: f64,
        now: OffsetDateTime,
    ) -> EngineResult<CycleReport> {
        self.with_sector(sector_id, |unit, out| {
            let et = match self.calculator.compute(&unit.profile, &unit.window, date, now) {
                Ok(et) => et,
                Err(err) => {
                    warn!(sector = %sector_id, "engine: cycle skipped: {err}");
                    unit.journal.record(now, EventKind::CycleSkipped, err.to_string());
                    self.metrics.bump(Counter::CycleSkipped);
                    return Err(err);
                }
            };
            self.metrics.bump(Counter::CycleComputed);

            for advisory in &et.advisories {
                match advisory {
                    Advisory::KcExtrapolated { stage } => {
                        warn!(sector = %sector_id, %stage, "engine: no growth stage covers {date}, kc extrapolated");
                    }
                    Advisory::FallbackUsed { reading } => {
                        debug!(sector = %sector_id, %reading, "engine: fallback constant used");
                    }
                }
            }
            info!(
                sector = %sector_id,
                et0 = format!("{:.2}", et.et0_mm_day),
                kc = et.kc,
                etc = format!("{:.2}", et.etc_mm_day),
                samples = unit.window.sample_count(),
                "engine: cycle computed"
            );

            let soil_moisture = unit.window.stats(ReadingKind::SoilMoisture);
            unit.window.clear_samples();

            let (update, _, recommendation) = self.apply_balance(unit, &et, rainfall_mm, out);
            if update == LedgerUpdate::Applied {
                unit.et_history.push_back(et.clone());
                while unit.et_history.len() > self.settings.et_history_len {
                    unit.et_history.pop_front();
                }
            } else {
                warn!(sector = %sector_id, %date, "engine: period already counted, ledger unchanged");
                unit.journal.record(
                    now,
                    EventKind::Balance,
                    format!("cycle for {date} already counted ({update:?}), ledger unchanged"),
                );
            }

            // Only samples young enough to pass validation now describe the air.
            let max_age = self.settings.max_reading_age();
            let fresh = |r: Option<ValidReading>| r.filter(|r| now - r.timestamp <= max_age);
            let climate = match (
                fresh(unit.window.latest(ReadingKind::Temperature)),
                fresh(unit.window.latest(ReadingKind::RelativeHumidity)),
            ) {
                (Some(t), Some(rh)) => Some(self.climate_in(unit, t.value, rh.value, now, out)),
                _ => {
                    debug!(sector = %sector_id, "engine: no fresh temperature/humidity pair, climate not evaluated");
                    None
                }
            };

            Ok(CycleReport {
                sector_id: sector_id.to_string(),
                et,
                balance: unit.ledger.state().clone(),
                climate,
                recommendation,
                soil_moisture,
            })
        })
    }

    /// Classify VPD for a temperature/humidity pair and emit an alert when
    /// the gate lets it through.
    pub fn evaluate_climate(
        &self,
        sector_id: &str,
        temperature_c: f64,
        relative_humidity: f64,
        at: OffsetDateTime,
    ) -> EngineResult<ClimateState> {
        for (kind, value) in [
            (ReadingKind::Temperature, temperature_c),
            (ReadingKind::RelativeHumidity, relative_humidity),
        ] {
            let reason = if !value.is_finite() {
                Some(InvalidReading::NotFinite { kind })
            } else {
                let (min, max) = kind.plausible_range();
                (!(min..=max).contains(&value)).then_some(InvalidReading::OutOfRange { kind, value, min, max })
            };
            if let Some(reason) = reason {
                return Err(EngineError::InvalidReading {
                    sector: sector_id.to_string(),
                    reason,
                });
            }
        }

        self.with_sector(sector_id, |unit, out| {
            Ok(self.climate_in(unit, temperature_c, relative_humidity, at, out))
        })
    }

    // -- Inbound: recommendation lifecycle ----------------------------------

    pub fn confirm_recommendation(
        &self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, _| self.confirm_in(unit, id, actor, now))
    }

    pub fn reject_recommendation(
        &self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, _| {
            let rec = unit.book.reject(id, actor, now)?;
            unit.journal.record(now, EventKind::Recommendation, format!("{id} rejected by {actor}"));
            Ok(rec)
        })
    }

    /// Withdraw a PENDING or CONFIRMED recommendation. Once dispatched only
    /// an outcome or the timeout can close it.
    pub fn cancel_recommendation(
        &self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, _| {
            let rec = unit.book.cancel(id, actor, now)?;
            unit.ledger.release_irrigation();
            unit.journal.record(now, EventKind::Recommendation, format!("{id} cancelled by {actor}"));
            Ok(rec)
        })
    }

    /// Hand a CONFIRMED recommendation to the actuator collaborator.
    pub fn dispatch(&self, id: RecommendationId, now: OffsetDateTime) -> EngineResult<ActuatorCommand> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, out| self.dispatch_in(unit, id, now, out))
    }

    /// Close an EXECUTING recommendation. Any delivered volume, even from a
    /// failed run, is credited to the ledger.
    pub fn report_execution_outcome(
        &self,
        id: RecommendationId,
        delivered_liters: f64,
        error: Option<String>,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, _| {
            let rec = unit.book.report_outcome(id, delivered_liters, error, now)?;
            let delivered = rec.execution.as_ref().map_or(0.0, |e| e.delivered_liters);
            let (_, balance) = unit.ledger.record_irrigation(id, delivered, unit.profile.area_m2, now);

            match rec.status {
                RecommendationStatus::Completed => info!(
                    sector = %sector,
                    recommendation = %id,
                    delivered_liters = delivered,
                    deficit_mm = format!("{:.2}", balance.deficit_mm),
                    "engine: irrigation completed"
                ),
                _ => warn!(
                    sector = %sector,
                    recommendation = %id,
                    delivered_liters = delivered,
                    "engine: irrigation failed"
                ),
            }
            unit.journal.record(
                now,
                EventKind::Recommendation,
                format!(
                    "{id} {}: {delivered:.1} l delivered, deficit {:.2} mm ({})",
                    rec.status, balance.deficit_mm, balance.status
                ),
            );
            Ok(rec)
        })
    }

    /// Force every CONFIRMED or EXECUTING recommendation past its deadline
    /// to FAILED and release the sector's ledger from IRRIGATING.
    pub fn sweep_timeouts(&self, now: OffsetDateTime) -> Vec<IrrigationRecommendation> {
        let mut expired = Vec::new();
        for unit in self.units() {
            let mut unit = unit.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(rec) = unit.book.expire(now) {
                unit.ledger.release_irrigation();
                self.metrics.bump(Counter::Timeout);
                let balance = unit.ledger.state();
                warn!(
                    sector = %rec.sector_id,
                    recommendation = %rec.id,
                    status = %balance.status,
                    "engine: execution timed out"
                );
                let detail = format!(
                    "{} timed out, ledger back to {} at {:.2} mm",
                    rec.id, balance.status, balance.deficit_mm
                );
                unit.journal.record(now, EventKind::Error, detail);
                expired.push(rec);
            }
            self.forget(unit.book.take_pruned());
        }
        expired
    }

    // -- Read accessors -----------------------------------------------------

    pub fn sector_ids(&self) -> Vec<String> {
        let sectors = self.sectors.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sectors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn profile(&self, sector_id: &str) -> EngineResult<SectorProfile> {
        self.with_sector(sector_id, |unit, _| Ok(unit.profile.clone()))
    }

    pub fn water_balance(&self, sector_id: &str) -> EngineResult<WaterBalanceState> {
        self.with_sector(sector_id, |unit, _| Ok(unit.ledger.state().clone()))
    }

    pub fn climate_state(&self, sector_id: &str) -> EngineResult<Option<ClimateState>> {
        self.with_sector(sector_id, |unit, _| Ok(unit.climate_state.clone()))
    }

    pub fn et_history(&self, sector_id: &str) -> EngineResult<Vec<EtResult>> {
        self.with_sector(sector_id, |unit, _| Ok(unit.et_history.iter().cloned().collect()))
    }

    pub fn open_recommendation(&self, sector_id: &str) -> EngineResult<Option<IrrigationRecommendation>> {
        self.with_sector(sector_id, |unit, _| Ok(unit.book.open().cloned()))
    }

    pub fn recommendation(&self, id: RecommendationId) -> EngineResult<IrrigationRecommendation> {
        let sector = self.owner(id)?;
        self.with_sector(&sector, |unit, _| {
            unit.book
                .get(id)
                .cloned()
                .ok_or(EngineError::UnknownRecommendation(id))
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        let sectors: BTreeMap<String, SectorStatus> = self
            .units_with_ids()
            .into_iter()
            .map(|(id, unit)| {
                let unit = unit.lock().unwrap_or_else(PoisonError::into_inner);
                (id, unit.status())
            })
            .collect();
        StatusSnapshot {
            mode: self.settings.mode,
            sectors,
            metrics: self.metrics.snapshot(),
        }
    }

    // -- Internals ----------------------------------------------------------

    fn apply_balance(
        &self,
        unit: &mut SectorUnit,
        et: &EtResult,
        rainfall_mm: f64,
        out: &mut Vec<OutboundMessage>,
    ) -> (LedgerUpdate, WaterBalanceState, Option<IrrigationRecommendation>) {
        let (update, state) = unit.ledger.update_balance(et, rainfall_mm);
        if update != LedgerUpdate::Applied {
            return (update, state, None);
        }
        unit.journal.record(
            et.timestamp,
            EventKind::Balance,
            format!(
                "etc {:.2} mm, rain {:.2} mm: deficit {:.2} mm ({})",
                et.etc_mm_for_period(),
                rainfall_mm.max(0.0),
                state.deficit_mm,
                state.status
            ),
        );

        let recommendation = self.maybe_recommend(unit, et.timestamp, out);
        (update, unit.ledger.state().clone(), recommendation)
    }

    fn maybe_recommend(
        &self,
        unit: &mut SectorUnit,
        now: OffsetDateTime,
        out: &mut Vec<OutboundMessage>,
    ) -> Option<IrrigationRecommendation> {
        let balance = unit.ledger.state().clone();
        if balance.status != BalanceStatus::Deficit {
            return None;
        }

        if self.settings.mode == OperationMode::Monitor {
            info!(
                sector = %balance.sector_id,
                deficit_mm = format!("{:.2}", balance.deficit_mm),
                "engine: deficit reached (monitor mode, no recommendation)"
            );
            unit.journal.record(
                now,
                EventKind::Recommendation,
                format!("deficit {:.2} mm, monitor mode: not recommending", balance.deficit_mm),
            );
            return None;
        }

        let rec = unit.book.recommend(
            &balance,
            unit.profile.area_m2,
            unit.thresholds.efficiency_factor,
            now,
            || RecommendationId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        )?;
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rec.id, balance.sector_id.clone());
        self.metrics.bump(Counter::RecommendationEmitted);
        unit.journal.record(
            now,
            EventKind::Recommendation,
            format!(
                "{} created: {:.1} l for {:.2} mm deficit",
                rec.id, rec.volume_liters, rec.deficit_mm
            ),
        );
        out.push(OutboundMessage::Recommendation(rec.clone()));

        if self.settings.mode == OperationMode::Auto {
            let auto = self
                .confirm_in(unit, rec.id, &ActorRef::system(), now)
                .and_then(|_| self.dispatch_in(unit, rec.id, now, out));
            if let Err(err) = auto {
                warn!(sector = %balance.sector_id, recommendation = %rec.id, "engine: auto dispatch failed: {err}");
                unit.journal.record(now, EventKind::Error, err.to_string());
            }
        }

        unit.book.get(rec.id).cloned()
    }

    fn confirm_in(
        &self,
        unit: &mut SectorUnit,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let rec = unit
            .book
            .confirm(id, actor, now, unit.thresholds.execution_timeout())?;
        unit.ledger.begin_irrigation();
        unit.journal.record(now, EventKind::Recommendation, format!("{id} confirmed by {actor}"));
        Ok(rec)
    }

    fn dispatch_in(
        &self,
        unit: &mut SectorUnit,
        id: RecommendationId,
        now: OffsetDateTime,
        out: &mut Vec<OutboundMessage>,
    ) -> EngineResult<ActuatorCommand> {
        let (_, command) = unit.book.dispatch(id, &unit.profile.valve_id, now)?;
        info!(
            sector = %command.sector_id,
            recommendation = %id,
            valve = %command.valve_id,
            liters = format!("{:.1}", command.target_volume_liters),
            "engine: actuator command issued"
        );
        unit.journal.record(
            now,
            EventKind::Recommendation,
            format!("{id} dispatched to {}", command.valve_id),
        );
        out.push(OutboundMessage::ActuatorCommand {
            sector_id: command.sector_id.clone(),
            command: command.clone(),
        });
        Ok(command)
    }

    fn climate_in(
        &self,
        unit: &mut SectorUnit,
        temperature_c: f64,
        relative_humidity: f64,
        at: OffsetDateTime,
        out: &mut Vec<OutboundMessage>,
    ) -> ClimateState {
        let before = unit.climate.last_classification();
        let state = unit
            .climate
            .evaluate(&unit.profile.sector_id, temperature_c, relative_humidity, at);

        if before != Some(state.classification) {
            unit.journal.record(
                at,
                EventKind::Climate,
                format!("vpd {:.2} kPa: {} ({})", state.vpd_kpa, state.classification, state.action),
            );
        }
        if unit.alerts.should_emit(&state) {
            out.push(OutboundMessage::ClimateAlert {
                sector_id: state.sector_id.clone(),
                state: state.clone(),
            });
        }
        unit.climate_state = Some(state.clone());
        state
    }

    fn with_sector<T>(
        &self,
        sector_id: &str,
        f: impl FnOnce(&mut SectorUnit, &mut Vec<OutboundMessage>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let unit = {
            let sectors = self.sectors.read().unwrap_or_else(PoisonError::into_inner);
            sectors
                .get(sector_id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownSector(sector_id.to_string()))?
        };

        let mut out = Vec::new();
        let result = {
            let mut guard = unit.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut guard, &mut out);
            self.forget(guard.book.take_pruned());
            result
        };
        for message in &out {
            message.deliver(self.outbound.as_ref());
        }
        result
    }

    /// Drop owner entries for recommendations the book no longer keeps.
    fn forget(&self, pruned: Vec<RecommendationId>) {
        if pruned.is_empty() {
            return;
        }
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        for id in pruned {
            owners.remove(&id);
        }
    }

    fn owner(&self, id: RecommendationId) -> EngineResult<String> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownRecommendation(id))
    }

    fn units(&self) -> Vec<Arc<Mutex<SectorUnit>>> {
        self.units_with_ids().into_iter().map(|(_, unit)| unit).collect()
    }

    fn units_with_ids(&self) -> Vec<(String, Arc<Mutex<SectorUnit>>)> {
        let sectors = self.sectors.read().unwrap_or_else(PoisonError::into_inner);
        let mut units: Vec<_> = sectors
            .iter()
            .map(|(id, unit)| (id.clone(), Arc::clone(unit)))
            .collect();
        units.sort_by(|a, b| a.0.cmp(&b.0));
        units
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{et_result, DAY0};
    use crate::outbound::RecordingOutbound;
    use crate::profile::tests::test_profile;
    use pretty_assertions::assert_eq;
    use crate::decision::RETAINED_CLOSED;
    use std::sync::mpsc;
    use std::thread;
    use time::macros::{date, datetime};
    use time::Duration;

    fn engine_with(mode: OperationMode) -> (Engine, Arc<RecordingOutbound>) {
        let out = Arc::new(RecordingOutbound::new());
        let settings = EngineSettings {
            mode,
            ..EngineSettings::default()
        };
        let engine = Engine::new(settings, out.clone());
        engine
            .ingest_sector_profile(test_profile("s1"), SectorThresholds::default())
            .unwrap();
        (engine, out)
    }

    fn day(n: i64) -> OffsetDateTime {
        DAY0 + Duration::days(n)
    }

    fn recommendations(out: &RecordingOutbound) -> Vec<IrrigationRecommendation> {
        out.messages()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Recommendation(rec) => Some(rec),
                _ => None,
            })
            .collect()
    }

    fn commands(out: &RecordingOutbound) -> Vec<ActuatorCommand> {
        out.messages()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::ActuatorCommand { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Drive sector s1 to a 20 mm deficit and return the recommendation.
    fn reach_deficit(engine: &Engine) -> IrrigationRecommendation {
        for n in 0..5 {
            engine.update_balance(&et_result("s1", 4.0, day(n)), 0.0).unwrap();
        }
        engine.open_recommendation("s1").unwrap().unwrap()
    }

    // -- Water balance scenarios --------------------------------------------

    #[test]
    fn five_days_of_deficit_emit_one_recommendation() {
        let (engine, out) = engine_with(OperationMode::SemiAuto);

        let mut statuses = Vec::new();
        for n in 0..8 {
            let st = engine.update_balance(&et_result("s1", 4.0, day(n)), 0.0).unwrap();
            statuses.push(st.status);
        }
        assert_eq!(
            statuses[..5].to_vec(),
            vec![
                BalanceStatus::Ok,
                BalanceStatus::Ok,
                BalanceStatus::ApproachingDeficit,
                BalanceStatus::ApproachingDeficit,
                BalanceStatus::Deficit,
            ]
        );

        let recs = recommendations(&out);
        assert_eq!(recs.len(), 1, "exactly one recommendation, got {recs:?}");
        assert_eq!(recs[0].deficit_mm, 20.0);
        assert_eq!(recs[0].volume_liters, 10_000.0);
        assert_eq!(recs[0].created_at, day(4));
        assert_eq!(engine.status().metrics.recommendations_emitted, 1);
    }

    #[test]
    fn replayed_update_not_double_counted() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let et = et_result("s1", 4.0, day(0));
        engine.update_balance(&et, 1.0).unwrap();
        let st = engine.update_balance(&et, 1.0).unwrap();
        assert_eq!(st.deficit_mm, 3.0);
    }

    #[test]
    fn reconfiguration_keeps_deficit() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        engine.update_balance(&et_result("s1", 8.0, day(0)), 0.0).unwrap();

        let mut profile = test_profile("s1");
        profile.name = "Tomatoes north (renamed)".into();
        let thresholds = SectorThresholds {
            raw_threshold_mm: Some(8.0),
            ..SectorThresholds::default()
        };
        engine.ingest_sector_profile(profile, thresholds).unwrap();

        let st = engine.water_balance("s1").unwrap();
        assert_eq!(st.deficit_mm, 8.0);
        assert_eq!(st.status, BalanceStatus::Deficit);
        assert_eq!(engine.profile("s1").unwrap().name, "Tomatoes north (renamed)");
    }

    #[test]
    fn invalid_thresholds_rejected_on_ingest() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let thresholds = SectorThresholds {
            efficiency_factor: 0.0,
            ..SectorThresholds::default()
        };
        let err = engine
            .ingest_sector_profile(test_profile("s2"), thresholds)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidProfile(_)));
        assert_eq!(engine.sector_ids(), vec!["s1".to_string()]);
    }

    // -- Recommendation lifecycle -------------------------------------------

    #[test]
    fn confirm_dispatch_complete_clears_deficit() {
        let (engine, out) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        let t = day(5);

        engine.confirm_recommendation(rec.id, &ActorRef::new("alice"), t).unwrap();
        assert_eq!(engine.water_balance("s1").unwrap().status, BalanceStatus::Irrigating);

        let cmd = engine.dispatch(rec.id, t + Duration::minutes(1)).unwrap();
        assert_eq!(cmd.valve_id, "valve-s1");
        assert_eq!(commands(&out), vec![cmd]);

        let done = engine
            .report_execution_outcome(rec.id, 10_000.0, None, t + Duration::minutes(21))
            .unwrap();
        assert_eq!(done.status, RecommendationStatus::Completed);
        assert_eq!(done.execution.unwrap().duration_sec, Some(1200));

        let st = engine.water_balance("s1").unwrap();
        assert_eq!(st.deficit_mm, 0.0);
        assert_eq!(st.status, BalanceStatus::Ok);
        assert!(engine.open_recommendation("s1").unwrap().is_none());
    }

    #[test]
    fn confirm_on_rejected_or_completed_is_refused() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let alice = ActorRef::new("alice");

        let rec = reach_deficit(&engine);
        engine.reject_recommendation(rec.id, &alice, day(5)).unwrap();
        let before = engine.recommendation(rec.id).unwrap();
        let err = engine.confirm_recommendation(rec.id, &alice, day(5)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: RecommendationStatus::Rejected, .. }));
        assert_eq!(engine.recommendation(rec.id).unwrap(), before);
        assert_eq!(engine.water_balance("s1").unwrap().status, BalanceStatus::Deficit);

        // Still in deficit: the next update produces a fresh recommendation.
        engine.update_balance(&et_result("s1", 1.0, day(5)), 0.0).unwrap();
        let second = engine.open_recommendation("s1").unwrap().unwrap();
        assert_ne!(second.id, rec.id);
        engine.confirm_recommendation(second.id, &alice, day(6)).unwrap();
        engine.dispatch(second.id, day(6)).unwrap();
        engine.report_execution_outcome(second.id, 10_500.0, None, day(6)).unwrap();

        let before = engine.recommendation(second.id).unwrap();
        let balance = engine.water_balance("s1").unwrap();
        let err = engine.confirm_recommendation(second.id, &alice, day(7)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: RecommendationStatus::Completed, .. }));
        assert_eq!(engine.recommendation(second.id).unwrap(), before);
        assert_eq!(engine.water_balance("s1").unwrap(), balance);
    }

    #[test]
    fn failed_outcome_credits_partial_volume() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        engine.confirm_recommendation(rec.id, &ActorRef::new("alice"), day(5)).unwrap();
        engine.dispatch(rec.id, day(5)).unwrap();

        let failed = engine
            .report_execution_outcome(rec.id, 5_000.0, Some("pressure drop".into()), day(5))
            .unwrap();
        assert_eq!(failed.status, RecommendationStatus::Failed);

        let st = engine.water_balance("s1").unwrap();
        assert_eq!(st.deficit_mm, 10.0);
        assert_eq!(st.status, BalanceStatus::ApproachingDeficit);
    }

    #[test]
    fn replayed_outcome_is_refused_and_not_credited_twice() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        engine.confirm_recommendation(rec.id, &ActorRef::new("alice"), day(5)).unwrap();
        engine.dispatch(rec.id, day(5)).unwrap();
        engine.report_execution_outcome(rec.id, 4_000.0, None, day(5)).unwrap();

        let err = engine.report_execution_outcome(rec.id, 4_000.0, None, day(5)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(engine.water_balance("s1").unwrap().deficit_mm, 12.0);
    }

    #[test]
    fn cancel_releases_irrigating() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        let alice = ActorRef::new("alice");
        engine.confirm_recommendation(rec.id, &alice, day(5)).unwrap();

        let cancelled = engine.cancel_recommendation(rec.id, &alice, day(5)).unwrap();
        assert_eq!(cancelled.status, RecommendationStatus::Rejected);
        assert_eq!(engine.water_balance("s1").unwrap().status, BalanceStatus::Deficit);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        assert_eq!(
            engine.water_balance("nope").unwrap_err(),
            EngineError::UnknownSector("nope".into())
        );
        assert_eq!(
            engine.dispatch(RecommendationId(42), day(0)).unwrap_err(),
            EngineError::UnknownRecommendation(RecommendationId(42))
        );
    }

    #[test]
    fn pruned_recommendations_leave_no_owner_behind() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let alice = ActorRef::new("alice");
        let mut ids = Vec::new();
        for n in 0..(RETAINED_CLOSED as i64 + 10) {
            engine.update_balance(&et_result("s1", 20.0, day(n)), 0.0).unwrap();
            let rec = engine.open_recommendation("s1").unwrap().unwrap();
            engine.reject_recommendation(rec.id, &alice, day(n)).unwrap();
            ids.push(rec.id);
        }

        let owners = engine.owners.read().unwrap().len();
        assert!(owners <= RETAINED_CLOSED + 1, "owner index holds {owners}");
        assert_eq!(
            engine.recommendation(ids[0]).unwrap_err(),
            EngineError::UnknownRecommendation(ids[0])
        );
        assert_eq!(
            engine.confirm_recommendation(ids[0], &alice, day(80)).unwrap_err(),
            EngineError::UnknownRecommendation(ids[0])
        );
        let newest = ids[ids.len() - 1];
        assert_eq!(engine.recommendation(newest).unwrap().status, RecommendationStatus::Rejected);
    }

    // -- Timeouts -----------------------------------------------------------

    #[test]
    fn confirmed_without_outcome_times_out_back_to_deficit() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        let t = day(5);
        engine.confirm_recommendation(rec.id, &ActorRef::new("alice"), t).unwrap();

        assert!(engine.sweep_timeouts(t + Duration::minutes(59)).is_empty());
        let expired = engine.sweep_timeouts(t + Duration::minutes(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, RecommendationStatus::Failed);

        let st = engine.water_balance("s1").unwrap();
        assert_eq!(st.status, BalanceStatus::Deficit);
        assert_eq!(st.deficit_mm, 20.0);
        assert_eq!(engine.status().metrics.timeouts, 1);

        // Sweeping again finds nothing; the late outcome is refused.
        assert!(engine.sweep_timeouts(t + Duration::minutes(120)).is_empty());
        assert!(engine
            .report_execution_outcome(rec.id, 10_000.0, None, t + Duration::minutes(121))
            .is_err());
    }

    // -- Operation modes ----------------------------------------------------

    #[test]
    fn auto_mode_confirms_and_dispatches() {
        let (engine, out) = engine_with(OperationMode::Auto);
        let rec = reach_deficit(&engine);

        assert_eq!(rec.status, RecommendationStatus::Executing);
        assert_eq!(rec.actor, Some(ActorRef::system()));
        assert_eq!(recommendations(&out).len(), 1);
        assert_eq!(commands(&out).len(), 1);
        assert_eq!(engine.water_balance("s1").unwrap().status, BalanceStatus::Irrigating);
    }

    #[test]
    fn monitor_mode_only_journals_deficits() {
        let (engine, out) = engine_with(OperationMode::Monitor);
        for n in 0..5 {
            engine.update_balance(&et_result("s1", 4.0, day(n)), 0.0).unwrap();
        }
        assert_eq!(engine.water_balance("s1").unwrap().status, BalanceStatus::Deficit);
        assert!(out.messages().is_empty());
        assert!(engine.open_recommendation("s1").unwrap().is_none());

        let status = engine.status();
        let events = &status.sectors["s1"].events;
        assert!(events[0].detail.contains("monitor mode"), "got {:?}", events[0]);
    }

    // -- Readings and cycles ------------------------------------------------

    fn feed_day(engine: &Engine, sector: &str, date: Date) {
        let midnight = date.midnight().assume_utc();
        for hour in 0..24 {
            let ts = midnight + Duration::hours(hour);
            let daylight = (6..20).contains(&hour);
            let phase = (hour as f64 - 8.0) / 24.0 * std::f64::consts::TAU;
            let samples = [
                (ReadingKind::Temperature, 20.0 + 6.0 * phase.sin()),
                (ReadingKind::RelativeHumidity, 65.0),
                (ReadingKind::SolarRadiation, if daylight { 450.0 } else { 0.0 }),
                (ReadingKind::WindSpeed, 1.0),
                (ReadingKind::SoilMoisture, 30.0),
            ];
            for (kind, value) in samples {
                engine
                    .ingest_reading(&SensorReading::new(sector, ts, kind, value), ts)
                    .unwrap();
            }
        }
    }

    #[test]
    fn run_cycle_from_collected_readings() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let date = date!(2026 - 06 - 01);
        feed_day(&engine, "s1", date);

        let now = datetime!(2026-06-01 23:30 UTC);
        let report = engine.run_cycle("s1", date, 0.0, now).unwrap();

        assert!(report.et.et0_mm_day > 0.0, "et0 = {}", report.et.et0_mm_day);
        assert_eq!(report.et.stage, "mid");
        assert_eq!(report.balance.deficit_mm, report.et.etc_mm_day);
        assert_eq!(report.soil_moisture.map(|s| s.count), Some(24));
        assert!(report.climate.is_some());
        assert_eq!(engine.et_history("s1").unwrap().len(), 1);

        // Window is cleared: with no fallbacks the next cycle cannot run.
        let err = engine
            .run_cycle("s1", date, 0.0, now + Duration::minutes(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
        assert_eq!(engine.water_balance("s1").unwrap().deficit_mm, report.balance.deficit_mm);

        let metrics = engine.status().metrics;
        assert_eq!(metrics.readings_accepted, 24 * 5);
        assert_eq!(metrics.cycles_computed, 1);
        assert_eq!(metrics.cycles_skipped, 1);
    }

    #[test]
    fn second_cycle_for_same_date_keeps_deficit() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let date = date!(2026 - 06 - 01);
        feed_day(&engine, "s1", date);
        let first = engine
            .run_cycle("s1", date, 0.0, datetime!(2026-06-01 23:30 UTC))
            .unwrap();

        // Late samples arrive and the same day is closed again.
        let late = datetime!(2026-06-01 23:40 UTC);
        let samples = [
            (ReadingKind::Temperature, 18.0),
            (ReadingKind::RelativeHumidity, 70.0),
            (ReadingKind::SolarRadiation, 0.0),
            (ReadingKind::WindSpeed, 1.0),
        ];
        for (kind, value) in samples {
            engine
                .ingest_reading(&SensorReading::new("s1", late, kind, value), late)
                .unwrap();
        }
        let second = engine
            .run_cycle("s1", date, 0.0, datetime!(2026-06-01 23:45 UTC))
            .unwrap();

        assert_eq!(second.balance.deficit_mm, first.balance.deficit_mm);
        assert_eq!(engine.water_balance("s1").unwrap().deficit_mm, first.balance.deficit_mm);
        assert_eq!(engine.et_history("s1").unwrap().len(), 1);
        assert!(second.recommendation.is_none());
    }

    #[test]
    fn stale_readings_do_not_drive_climate() {
        let out = Arc::new(RecordingOutbound::new());
        let settings = EngineSettings {
            fallbacks: crate::config::Fallbacks {
                temperature: Some(20.0),
                relative_humidity: Some(60.0),
                solar_radiation: Some(200.0),
                wind_speed: Some(1.0),
            },
            ..EngineSettings::default()
        };
        let engine = Engine::new(settings, out.clone());
        engine
            .ingest_sector_profile(test_profile("s1"), SectorThresholds::default())
            .unwrap();

        // Hot and dry enough to be critical, but five days old by the cycle.
        let ts = datetime!(2026-06-01 12:00 UTC);
        for (kind, value) in [(ReadingKind::Temperature, 25.0), (ReadingKind::RelativeHumidity, 40.0)] {
            engine
                .ingest_reading(&SensorReading::new("s1", ts, kind, value), ts)
                .unwrap();
        }
        let report = engine
            .run_cycle("s1", date!(2026 - 06 - 06), 0.0, datetime!(2026-06-06 23:30 UTC))
            .unwrap();

        assert!(report.climate.is_none());
        assert!(engine.climate_state("s1").unwrap().is_none());
        assert!(!out
            .messages()
            .iter()
            .any(|m| matches!(m, OutboundMessage::ClimateAlert { .. })));
    }

    #[test]
    fn insufficient_data_names_missing_kinds() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let ts = datetime!(2026-06-01 12:00 UTC);
        engine
            .ingest_reading(&SensorReading::new("s1", ts, ReadingKind::Temperature, 21.0), ts)
            .unwrap();

        let err = engine.run_cycle("s1", ts.date(), 0.0, ts).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientData {
                sector: "s1".into(),
                missing: vec![
                    ReadingKind::RelativeHumidity,
                    ReadingKind::SolarRadiation,
                    ReadingKind::WindSpeed,
                ],
            }
        );
        let status = engine.status();
        assert_eq!(status.sectors["s1"].events[0].kind, EventKind::CycleSkipped);
    }

    #[test]
    fn rejected_reading_is_journalled_and_counted() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let ts = datetime!(2026-06-01 12:00 UTC);
        let err = engine
            .ingest_reading(&SensorReading::new("s1", ts, ReadingKind::RelativeHumidity, 120.0), ts)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidReading { reason: InvalidReading::OutOfRange { .. }, .. }
        ));

        let status = engine.status();
        assert_eq!(status.metrics.readings_rejected, 1);
        assert_eq!(status.sectors["s1"].events[0].kind, EventKind::ReadingRejected);
    }

    // -- Climate ------------------------------------------------------------

    #[test]
    fn climate_alert_throttled_by_cooldown() {
        let (engine, out) = engine_with(OperationMode::SemiAuto);
        let t0 = datetime!(2026-06-01 13:00 UTC);

        let st = engine.evaluate_climate("s1", 25.0, 40.0, t0).unwrap();
        assert_eq!(st.classification, crate::climate::VpdClass::Critical);
        engine.evaluate_climate("s1", 25.0, 40.0, t0 + Duration::minutes(10)).unwrap();
        engine.evaluate_climate("s1", 25.0, 40.0, t0 + Duration::minutes(40)).unwrap();

        let alerts = out
            .messages()
            .into_iter()
            .filter(|m| matches!(m, OutboundMessage::ClimateAlert { .. }))
            .count();
        assert_eq!(alerts, 2);
        assert_eq!(
            engine.climate_state("s1").unwrap().map(|s| s.timestamp),
            Some(t0 + Duration::minutes(40))
        );
    }

    #[test]
    fn climate_rejects_impossible_humidity() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let err = engine
            .evaluate_climate("s1", 25.0, f64::NAN, datetime!(2026-06-01 13:00 UTC))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidReading { reason: InvalidReading::NotFinite { .. }, .. }
        ));
    }

    // -- Concurrency --------------------------------------------------------

    #[test]
    fn concurrent_updates_keep_one_open_recommendation() {
        let (engine, out) = engine_with(OperationMode::SemiAuto);
        engine
            .ingest_sector_profile(test_profile("s2"), SectorThresholds::default())
            .unwrap();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let sector = if worker % 2 == 0 { "s1" } else { "s2" };
                    for n in 0..5 {
                        let ts = day(worker * 10 + n);
                        engine.update_balance(&et_result(sector, 3.0, ts), 0.0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let recs = recommendations(&out);
        assert_eq!(recs.iter().filter(|r| r.sector_id == "s1").count(), 1);
        assert_eq!(recs.iter().filter(|r| r.sector_id == "s2").count(), 1);
        assert_eq!(engine.water_balance("s1").unwrap().deficit_mm, 30.0);
    }

    #[test]
    fn reconfiguring_a_busy_sector_does_not_stall_others() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        engine
            .ingest_sector_profile(test_profile("s2"), SectorThresholds::default())
            .unwrap();
        let engine = Arc::new(engine);

        let s1 = Arc::clone(&engine.sectors.read().unwrap()["s1"]);
        let busy = s1.lock().unwrap();

        let reconfigure = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .ingest_sector_profile(test_profile("s1"), SectorThresholds::default())
                    .unwrap();
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let _ = tx.send(engine.water_balance("s2"));
            });
        }
        let balance = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(busy);
        reconfigure.join().unwrap();
        assert!(matches!(balance, Ok(Ok(_))), "s2 stalled behind s1: {balance:?}");
    }

    // -- Status snapshot ----------------------------------------------------

    #[test]
    fn status_snapshot_serializes() {
        let (engine, _) = engine_with(OperationMode::SemiAuto);
        let rec = reach_deficit(&engine);
        engine.reject_recommendation(rec.id, &ActorRef::new("bob"), day(5)).unwrap();

        let status = engine.status();
        let s1 = &status.sectors["s1"];
        assert!(s1.open_recommendation.is_none());
        assert_eq!(s1.recent_recommendations.len(), 1);
        assert!(s1.events[0].detail.contains("rejected by bob"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "semi_auto");
        assert_eq!(json["sectors"]["s1"]["balance"]["status"], "DEFICIT");
        assert_eq!(json["sectors"]["s1"]["recent_recommendations"][0]["status"], "REJECTED");
    }
}
