//! Outbound collaborator seam. The engine never talks to a transport; it
//! hands recommendations, actuator commands and climate alerts to an
//! `Outbound` implementation after the sector's critical section ends.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};

use crate::climate::ClimateState;
use crate::decision::{ActuatorCommand, IrrigationRecommendation};

pub trait Outbound: Send + Sync {
    fn emit_recommendation(&self, recommendation: &IrrigationRecommendation);
    fn emit_actuator_command(&self, sector_id: &str, command: &ActuatorCommand);
    fn emit_climate_alert(&self, sector_id: &str, state: &ClimateState);
}

/// One emitted message, as buffered inside the engine and recorded by
/// [`RecordingOutbound`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Recommendation(IrrigationRecommendation),
    ActuatorCommand {
        sector_id: String,
        command: ActuatorCommand,
    },
    ClimateAlert {
        sector_id: String,
        state: ClimateState,
    },
}

impl OutboundMessage {
    pub(crate) fn deliver(&self, out: &dyn Outbound) {
        match self {
            Self::Recommendation(rec) => out.emit_recommendation(rec),
            Self::ActuatorCommand { sector_id, command } => out.emit_actuator_command(sector_id, command),
            Self::ClimateAlert { sector_id, state } => out.emit_climate_alert(sector_id, state),
        }
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutbound;

impl Outbound for NullOutbound {
    fn emit_recommendation(&self, _: &IrrigationRecommendation) {}
    fn emit_actuator_command(&self, _: &str, _: &ActuatorCommand) {}
    fn emit_climate_alert(&self, _: &str, _: &ClimateState) {}
}

/// Keeps every message in memory until drained.
#[derive(Debug, Default)]
pub struct RecordingOutbound {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all messages recorded so far.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *messages)
    }

    /// Copy of the recorded messages, leaving them in place.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, message: OutboundMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

impl Outbound for RecordingOutbound {
    fn emit_recommendation(&self, recommendation: &IrrigationRecommendation) {
        self.push(OutboundMessage::Recommendation(recommendation.clone()));
    }

    fn emit_actuator_command(&self, sector_id: &str, command: &ActuatorCommand) {
        self.push(OutboundMessage::ActuatorCommand {
            sector_id: sector_id.to_string(),
            command: command.clone(),
        });
    }

    fn emit_climate_alert(&self, sector_id: &str, state: &ClimateState) {
        self.push(OutboundMessage::ClimateAlert {
            sector_id: sector_id.to_string(),
            state: state.clone(),
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::{ClimateBands, ClimateRules};
    use crate::decision::RecommendationId;
    use time::macros::datetime;

    fn command() -> ActuatorCommand {
        ActuatorCommand {
            recommendation_id: RecommendationId(4),
            sector_id: "s1".into(),
            valve_id: "valve-s1".into(),
            target_volume_liters: 1_200.0,
            issued_at: datetime!(2026-06-01 08:00 UTC),
        }
    }

    #[test]
    fn recording_outbound_drains_in_order() {
        let out = RecordingOutbound::new();
        let climate = ClimateRules::new(ClimateBands::default()).evaluate(
            "s1",
            25.0,
            40.0,
            datetime!(2026-06-01 13:00 UTC),
        );

        OutboundMessage::ActuatorCommand {
            sector_id: "s1".into(),
            command: command(),
        }
        .deliver(&out);
        out.emit_climate_alert("s1", &climate);

        let drained = out.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], OutboundMessage::ActuatorCommand { .. }));
        assert!(matches!(drained[1], OutboundMessage::ClimateAlert { .. }));
        assert!(out.drain().is_empty());
    }

    #[test]
    fn message_serializes_with_type_tag() {
        let msg = OutboundMessage::ActuatorCommand {
            sector_id: "s1".into(),
            command: command(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "actuator_command");
        assert_eq!(json["command"]["recommendation_id"], 4);
        assert_eq!(json["command"]["valve_id"], "valve-s1");
    }
}
