//! Irrigation recommendation lifecycle.
//!
//! ```text
//! Pending ──confirm──▶ Confirmed ──dispatch──▶ Executing ──outcome ok──▶ Completed
//!    │                    │  │                    │
//!  reject               cancel timeout        outcome err / timeout
//!    ▼                    ▼  ▼                    ▼
//! Rejected ◀──────────────┘  └──────────────▶  Failed
//! ```
//!
//! Every edge not drawn above is refused with `InvalidTransition` and the
//! recommendation is left untouched. At most one non-terminal
//! recommendation exists per sector.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::ledger::{BalanceStatus, WaterBalanceState};

/// Terminal recommendations retained per sector for inspection.
pub(crate) const RETAINED_CLOSED: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RecommendationId(pub u64);

impl fmt::Display for RecommendationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}

/// Opaque reference to whoever confirmed or rejected; never resolved here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ActorRef(pub String);

impl ActorRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Actor used when the engine confirms on its own in auto mode.
    pub fn system() -> Self {
        Self("auto".to_string())
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Pending,
    Confirmed,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl RecommendationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Rejected => "REJECTED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// The transition table. Anything not listed is refused.
pub fn transition_allowed(from: RecommendationStatus, to: RecommendationStatus) -> bool {
    use RecommendationStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Rejected)
            | (Confirmed, Executing)
            | (Confirmed, Rejected)
            | (Confirmed, Failed)
            | (Executing, Completed)
            | (Executing, Failed)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Actuator(String),
    ExecutionTimeout {
        #[serde(with = "time::serde::rfc3339")]
        deadline: OffsetDateTime,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub delivered_liters: f64,
    pub duration_sec: Option<i64>,
    pub error: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub from: RecommendationStatus,
    pub to: RecommendationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub actor: Option<ActorRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRecommendation {
    pub id: RecommendationId,
    pub sector_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub deficit_mm: f64,
    pub volume_liters: f64,
    pub status: RecommendationStatus,
    pub actor: Option<ActorRef>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatched_at: Option<OffsetDateTime>,
    pub execution: Option<ExecutionResult>,
    pub transitions: Vec<TransitionRecord>,
}

impl IrrigationRecommendation {
    fn advance(
        &mut self,
        to: RecommendationStatus,
        actor: Option<&ActorRef>,
        at: OffsetDateTime,
    ) -> EngineResult<()> {
        if !transition_allowed(self.status, to) {
            return Err(EngineError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        info!(
            recommendation = %self.id,
            sector = %self.sector_id,
            from = %self.status,
            to = %to,
            actor = actor.map(|a| a.0.as_str()).unwrap_or("-"),
            "recommendation: transition"
        );
        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            at,
            actor: actor.cloned(),
        });
        self.status = to;
        if let Some(actor) = actor {
            self.actor = Some(actor.clone());
        }
        Ok(())
    }
}

/// Command handed to the actuator collaborator on dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorCommand {
    pub recommendation_id: RecommendationId,
    pub sector_id: String,
    pub valve_id: String,
    pub target_volume_liters: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Volume (liters) for a deficit: deficit × area × efficiency factor.
pub fn recommended_volume(deficit_mm: f64, area_m2: f64, efficiency_factor: f64) -> f64 {
    deficit_mm * area_m2 * efficiency_factor
}

// ---------------------------------------------------------------------------
// Per-sector book
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct RecommendationBook {
    entries: BTreeMap<RecommendationId, IrrigationRecommendation>,
    open: Option<RecommendationId>,
    /// Ids dropped by pruning since the last `take_pruned`.
    pruned: Vec<RecommendationId>,
}

impl RecommendationBook {
    pub fn get(&self, id: RecommendationId) -> Option<&IrrigationRecommendation> {
        self.entries.get(&id)
    }

    /// The sector's single non-terminal recommendation, if any.
    pub fn open(&self) -> Option<&IrrigationRecommendation> {
        self.open.and_then(|id| self.entries.get(&id))
    }

    pub fn all(&self) -> impl DoubleEndedIterator<Item = &IrrigationRecommendation> {
        self.entries.values()
    }

    /// Create a recommendation when the sector is in DEFICIT and nothing is
    /// already in flight. `next_id` is only called when one is created.
    pub fn recommend(
        &mut self,
        balance: &WaterBalanceState,
        area_m2: f64,
        efficiency_factor: f64,
        now: OffsetDateTime,
        next_id: impl FnOnce() -> RecommendationId,
    ) -> Option<IrrigationRecommendation> {
        if balance.status != BalanceStatus::Deficit || self.open.is_some() {
            return None;
        }

        let id = next_id();
        let rec = IrrigationRecommendation {
            id,
            sector_id: balance.sector_id.clone(),
            created_at: now,
            deficit_mm: balance.deficit_mm,
            volume_liters: recommended_volume(balance.deficit_mm, area_m2, efficiency_factor),
            status: RecommendationStatus::Pending,
            actor: None,
            deadline: None,
            dispatched_at: None,
            execution: None,
            transitions: Vec::new(),
        };
        info!(
            recommendation = %id,
            sector = %rec.sector_id,
            deficit_mm = format!("{:.2}", rec.deficit_mm),
            volume_liters = format!("{:.1}", rec.volume_liters),
            "recommendation: created"
        );
        self.entries.insert(id, rec.clone());
        self.open = Some(id);
        self.prune();
        Some(rec)
    }

    pub fn confirm(
        &mut self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
        timeout: Duration,
    ) -> EngineResult<IrrigationRecommendation> {
        let rec = self.entry(id)?;
        rec.advance(RecommendationStatus::Confirmed, Some(actor), now)?;
        rec.deadline = Some(now + timeout);
        Ok(rec.clone())
    }

    pub fn reject(
        &mut self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let rec = self.entry(id)?;
        if rec.status != RecommendationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: rec.status,
                to: RecommendationStatus::Rejected,
            });
        }
        rec.advance(RecommendationStatus::Rejected, Some(actor), now)?;
        let rec = rec.clone();
        self.close(id);
        Ok(rec)
    }

    /// Withdraw a recommendation before the actuator sees it.
    pub fn cancel(
        &mut self,
        id: RecommendationId,
        actor: &ActorRef,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let rec = self.entry(id)?;
        rec.advance(RecommendationStatus::Rejected, Some(actor), now)?;
        rec.execution = Some(ExecutionResult {
            delivered_liters: 0.0,
            duration_sec: None,
            error: Some(FailureReason::Cancelled),
        });
        let rec = rec.clone();
        self.close(id);
        Ok(rec)
    }

    pub fn dispatch(
        &mut self,
        id: RecommendationId,
        valve_id: &str,
        now: OffsetDateTime,
    ) -> EngineResult<(IrrigationRecommendation, ActuatorCommand)> {
        let rec = self.entry(id)?;
        rec.advance(RecommendationStatus::Executing, None, now)?;
        rec.dispatched_at = Some(now);
        let command = ActuatorCommand {
            recommendation_id: id,
            sector_id: rec.sector_id.clone(),
            valve_id: valve_id.to_string(),
            target_volume_liters: rec.volume_liters,
            issued_at: now,
        };
        Ok((rec.clone(), command))
    }

    pub fn report_outcome(
        &mut self,
        id: RecommendationId,
        delivered_liters: f64,
        error: Option<String>,
        now: OffsetDateTime,
    ) -> EngineResult<IrrigationRecommendation> {
        let rec = self.entry(id)?;
        let to = if error.is_some() {
            RecommendationStatus::Failed
        } else {
            RecommendationStatus::Completed
        };
        // Outcomes only close an execution, never a merely confirmed one.
        if rec.status != RecommendationStatus::Executing {
            return Err(EngineError::InvalidTransition {
                id,
                from: rec.status,
                to,
            });
        }
        rec.advance(to, None, now)?;
        rec.execution = Some(ExecutionResult {
            delivered_liters: delivered_liters.max(0.0),
            duration_sec: rec.dispatched_at.map(|d| (now - d).whole_seconds()),
            error: error.map(FailureReason::Actuator),
        });
        let rec = rec.clone();
        self.close(id);
        Ok(rec)
    }

    /// Force the open recommendation to FAILED once its deadline passed.
    pub fn expire(&mut self, now: OffsetDateTime) -> Option<IrrigationRecommendation> {
        let id = self.open?;
        let rec = self.entries.get_mut(&id)?;
        let deadline = rec.deadline?;
        if now < deadline {
            return None;
        }
        rec.advance(RecommendationStatus::Failed, None, now).ok()?;
        rec.execution = Some(ExecutionResult {
            delivered_liters: 0.0,
            duration_sec: rec.dispatched_at.map(|d| (now - d).whole_seconds()),
            error: Some(FailureReason::ExecutionTimeout { deadline }),
        });
        let rec = rec.clone();
        self.close(id);
        Some(rec)
    }

    fn entry(&mut self, id: RecommendationId) -> EngineResult<&mut IrrigationRecommendation> {
        self.entries
            .get_mut(&id)
            .ok_or(EngineError::UnknownRecommendation(id))
    }

    fn close(&mut self, id: RecommendationId) {
        if self.open == Some(id) {
            self.open = None;
        }
        self.prune();
    }

    /// Drain the ids pruned since the last call, so indexes kept outside the
    /// book can forget them too.
    pub fn take_pruned(&mut self) -> Vec<RecommendationId> {
        std::mem::take(&mut self.pruned)
    }

    fn prune(&mut self) {
        let closed = self.entries.values().filter(|r| r.status.is_terminal()).count();
        let mut excess = closed.saturating_sub(RETAINED_CLOSED);
        let pruned = &mut self.pruned;
        self.entries.retain(|id, r| {
            if excess > 0 && r.status.is_terminal() {
                excess -= 1;
                pruned.push(*id);
                false
            } else {
                true
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
