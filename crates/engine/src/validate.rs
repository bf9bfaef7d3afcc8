//! Range, freshness and duplicate checks applied before any reading reaches
//! a formula. Out-of-range values are reported, never clamped.

use std::collections::BTreeSet;
use time::{Duration, OffsetDateTime};

use crate::error::InvalidReading;
use crate::reading::{normalize, Quality, ReadingKind, SensorReading, ValidReading};

/// Clock skew tolerated for readings stamped slightly ahead of `now`.
const FUTURE_TOLERANCE: Duration = Duration::minutes(1);

/// Per-sector validator. The only state it keeps is the recent
/// (timestamp, kind) keys needed to spot duplicates.
#[derive(Debug, Clone)]
pub struct ReadingValidator {
    max_age: Duration,
    seen: BTreeSet<(OffsetDateTime, ReadingKind)>,
}

impl ReadingValidator {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            seen: BTreeSet::new(),
        }
    }

    pub fn validate(
        &mut self,
        reading: &SensorReading,
        now: OffsetDateTime,
    ) -> Result<ValidReading, InvalidReading> {
        let kind = reading.kind;

        if reading.quality == Quality::Bad {
            return Err(InvalidReading::BadQuality { kind });
        }
        if !reading.value.is_finite() {
            return Err(InvalidReading::NotFinite { kind });
        }

        let value = normalize(kind, reading.unit, reading.value)?;
        let (min, max) = kind.plausible_range();
        if !(min..=max).contains(&value) {
            return Err(InvalidReading::OutOfRange {
                kind,
                value,
                min,
                max,
            });
        }

        let age = now - reading.timestamp;
        if age < -FUTURE_TOLERANCE {
            return Err(InvalidReading::FromTheFuture {
                kind,
                ahead_sec: -age.whole_seconds(),
            });
        }
        if age > self.max_age {
            return Err(InvalidReading::Stale {
                kind,
                age_sec: age.whole_seconds(),
                max_age_sec: self.max_age.whole_seconds(),
            });
        }

        self.prune(now);
        if !self.seen.insert((reading.timestamp, kind)) {
            return Err(InvalidReading::Duplicate { kind });
        }

        Ok(ValidReading {
            timestamp: reading.timestamp,
            kind,
            value,
            suspect: reading.quality == Quality::Suspect,
        })
    }

    /// Keys older than the max age can go: such readings fail as stale.
    fn prune(&mut self, now: OffsetDateTime) {
        let cutoff = now - self.max_age;
        self.seen = self.seen.split_off(&(cutoff, ReadingKind::Temperature));
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.seen.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
