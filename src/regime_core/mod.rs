//! Regime & execution-permission core
//!
//! Deterministic, synchronous and I/O free. The runtime feeds one
//! `InstrumentEngine` per instrument; replay drives the same engine directly.

pub mod acceptance;
pub mod alignment;
pub mod calendar;
pub mod candle;
pub mod compression;
pub mod error;
pub mod events;
pub mod guard;
pub mod indicators;
pub mod instrument;
pub mod levels;
pub mod permission;
pub mod regime;
pub mod risk;
pub mod session;

pub use acceptance::{AcceptanceEvent, AcceptanceEventKind, AcceptanceTracker, CounterKey, ACCEPTANCE_CLOSES};
pub use alignment::{AlignmentConfig, AlignmentSnapshot, EmaPosition, HtfBias, MarketView};
pub use calendar::{SessionCalendar, SessionPhase, SessionPreset};
pub use candle::{Candle, Timeframe};
pub use compression::{CompressionConfig, CompressionDetector, CompressionSignal, RangeCompression};
pub use error::EngineError;
pub use events::{
    AcceptanceProgress, Alarm, Directive, EngineEvent, EngineOutput, EngineUpdate, PositionUpdate, ReasonCode,
    TransitionRecord,
};
pub use guard::{ForceExit, PositionState, Side};
pub use instrument::InstrumentEngine;
pub use levels::{LevelSet, MovingAverageUpdate, MovingAverages, TriggerKind};
pub use permission::{Strategy, StrategySet};
pub use regime::{Direction, ReclaimEpisode, RegimeState};
pub use risk::{RiskFlagUpdate, RiskFlags};
pub use session::{SessionConfig, SessionState};
