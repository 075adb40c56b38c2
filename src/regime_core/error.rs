//! Engine error taxonomy
//!
//! Rejections (malformed, out-of-order, duplicate, stale) leave instrument
//! state untouched. `InvariantViolation` is the only variant that forces a
//! reset of the instrument.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use super::candle::Timeframe;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("malformed candle ({timeframe}): {reason}")]
    MalformedCandle { timeframe: Timeframe, reason: String },

    #[error("malformed level set for {instrument}: {reason}")]
    MalformedLevels { instrument: String, reason: String },

    #[error("malformed position update: {reason}")]
    MalformedPosition { reason: String },

    #[error("malformed moving averages ({timeframe}): {reason}")]
    MalformedAverages { timeframe: Timeframe, reason: String },

    #[error("out-of-order {timeframe} candle: close {close_time} precedes last processed {last}")]
    OutOfOrder {
        timeframe: Timeframe,
        close_time: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("duplicate final {timeframe} candle closing at {close_time}")]
    DuplicateCandle {
        timeframe: Timeframe,
        close_time: DateTime<Utc>,
    },

    #[error("stale level set for session {session_date} (current session {current})")]
    StaleLevels {
        session_date: NaiveDate,
        current: NaiveDate,
    },

    #[error("event for instrument {got} routed to engine for {expected}")]
    WrongInstrument { expected: String, got: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("engine for {0} is no longer running")]
    EngineStopped(String),
}

impl EngineError {
    /// Rejections are recovered locally; everything else is surfaced to operators.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            EngineError::InvariantViolation(_) | EngineError::EngineStopped(_)
        )
    }
}
