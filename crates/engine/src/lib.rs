//! Greenhouse advisory core: sensor validation, FAO-56 evapotranspiration,
//! per-sector water balance, VPD climate rules and the irrigation
//! recommendation lifecycle.
//!
//! Transport, persistence and UI live outside this crate. They talk to the
//! [`Engine`] through its inbound methods and receive its output through an
//! [`Outbound`] implementation.

pub mod climate;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod et;
pub mod ledger;
pub mod outbound;
pub mod profile;
pub mod reading;
pub mod state;
pub mod sweeper;
pub mod validate;

pub use climate::{ClimateAction, ClimateState, VpdClass};
pub use config::{Config, EngineSettings, OperationMode, SectorThresholds};
pub use decision::{
    ActorRef, ActuatorCommand, IrrigationRecommendation, RecommendationId, RecommendationStatus,
};
pub use engine::{CycleReport, Engine};
pub use error::{EngineError, EngineResult, InvalidReading};
pub use et::EtResult;
pub use ledger::{BalanceStatus, WaterBalanceState};
pub use outbound::{NullOutbound, Outbound, OutboundMessage, RecordingOutbound};
pub use profile::SectorProfile;
pub use reading::{Quality, ReadingKind, SensorReading, Unit};
pub use state::StatusSnapshot;
