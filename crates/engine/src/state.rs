//! Per-sector event journal, engine-wide counters and the serialisable
//! status snapshot built from them.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

use crate::climate::ClimateState;
use crate::config::OperationMode;
use crate::decision::IrrigationRecommendation;
use crate::et::EtResult;
use crate::ledger::WaterBalanceState;

/// Maximum number of events retained per sector.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReadingRejected,
    ReadingSuspect,
    CycleSkipped,
    Balance,
    Climate,
    Recommendation,
    Error,
}

/// Bounded ring buffer; the oldest event is evicted first.
#[derive(Debug, Clone)]
pub struct EventJournal {
    events: VecDeque<EngineEvent>,
}

impl Default for EventJournal {
    fn default() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }
}

impl EventJournal {
    pub fn record(&mut self, ts: OffsetDateTime, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(EngineEvent { ts, kind, detail });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn newest_first(&self) -> Vec<EngineEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Metrics {
    readings_accepted: AtomicU64,
    readings_rejected: AtomicU64,
    cycles_computed: AtomicU64,
    cycles_skipped: AtomicU64,
    recommendations_emitted: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub cycles_computed: u64,
    pub cycles_skipped: u64,
    pub recommendations_emitted: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    ReadingAccepted,
    ReadingRejected,
    CycleComputed,
    CycleSkipped,
    RecommendationEmitted,
    Timeout,
}

impl Metrics {
    pub(crate) fn bump(&self, counter: Counter) {
        let slot = match counter {
            Counter::ReadingAccepted => &self.readings_accepted,
            Counter::ReadingRejected => &self.readings_rejected,
            Counter::CycleComputed => &self.cycles_computed,
            Counter::CycleSkipped => &self.cycles_skipped,
            Counter::RecommendationEmitted => &self.recommendations_emitted,
            Counter::Timeout => &self.timeouts,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            readings_rejected: self.readings_rejected.load(Ordering::Relaxed),
            cycles_computed: self.cycles_computed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            recommendations_emitted: self.recommendations_emitted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SectorStatus {
    pub name: String,
    pub crop: String,
    pub balance: WaterBalanceState,
    pub climate: Option<ClimateState>,
    pub et_history: Vec<EtResult>,
    pub open_recommendation: Option<IrrigationRecommendation>,
    /// Newest first.
    pub recent_recommendations: Vec<IrrigationRecommendation>,
    /// Newest first.
    pub events: Vec<EngineEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: OperationMode,
    pub sectors: BTreeMap<String, SectorStatus>,
    pub metrics: MetricsSnapshot,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2026-06-01 00:00 UTC);

    // -- Journal ------------------------------------------------------------

    #[test]
    fn journal_evicts_oldest_first() {
        let mut journal = EventJournal::default();
        for n in 0..(MAX_EVENTS + 5) {
            journal.record(T0 + Duration::minutes(n as i64), EventKind::Balance, format!("event {n}"));
        }
        assert_eq!(journal.len(), MAX_EVENTS);

        let events = journal.newest_first();
        assert_eq!(events[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(events[MAX_EVENTS - 1].detail, "event 5");
    }

    #[test]
    fn event_serializes_snake_case_kind() {
        let mut journal = EventJournal::default();
        journal.record(T0, EventKind::CycleSkipped, "missing wind_speed".into());
        let json = serde_json::to_value(journal.newest_first()).unwrap();
        assert_eq!(json[0]["kind"], "cycle_skipped");
        assert_eq!(json[0]["ts"], "2026-06-01T00:00:00Z");
    }

    // -- Metrics ------------------------------------------------------------

    #[test]
    fn metrics_snapshot_counts() {
        let m = Metrics::default();
        m.bump(Counter::ReadingAccepted);
        m.bump(Counter::ReadingAccepted);
        m.bump(Counter::Timeout);
        let snap = m.snapshot();
        assert_eq!(snap.readings_accepted, 2);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.cycles_computed, 0);
    }
}
