//! Error taxonomy for the decision core.
//!
//! No variant is fatal: each one either drops a single data point or
//! rejects a caller's request without touching state.

use thiserror::Error;

use crate::decision::{RecommendationId, RecommendationStatus};
use crate::reading::{ReadingKind, Unit};

pub type EngineResult<T> = Result<T, EngineError>;

/// Why a sensor reading was refused by the validation layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReading {
    #[error("{kind} value is not a finite number")]
    NotFinite { kind: ReadingKind },

    #[error("{kind} value {value} out of range [{min}, {max}]")]
    OutOfRange {
        kind: ReadingKind,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("unit {unit:?} cannot express {kind}")]
    UnitMismatch { kind: ReadingKind, unit: Unit },

    #[error("{kind} reading is {age_sec}s old (max {max_age_sec}s)")]
    Stale {
        kind: ReadingKind,
        age_sec: i64,
        max_age_sec: i64,
    },

    #[error("{kind} reading is timestamped {ahead_sec}s in the future")]
    FromTheFuture { kind: ReadingKind, ahead_sec: i64 },

    #[error("duplicate {kind} reading for this timestamp")]
    Duplicate { kind: ReadingKind },

    #[error("{kind} reading flagged bad by the sensor")]
    BadQuality { kind: ReadingKind },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid reading for sector '{sector}': {reason}")]
    InvalidReading {
        sector: String,
        reason: InvalidReading,
    },

    #[error("insufficient data for sector '{sector}': missing {missing:?}")]
    InsufficientData {
        sector: String,
        missing: Vec<ReadingKind>,
    },

    #[error("recommendation {id}: transition {from} -> {to} not allowed")]
    InvalidTransition {
        id: RecommendationId,
        from: RecommendationStatus,
        to: RecommendationStatus,
    },

    #[error("unknown sector '{0}'")]
    UnknownSector(String),

    #[error("unknown recommendation {0}")]
    UnknownRecommendation(RecommendationId),

    #[error("invalid sector profile: {0}")]
    InvalidProfile(String),
}
