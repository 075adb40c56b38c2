//! Execution Guard
//!
//! The 21-EMA kill-switch. A 5-minute close on the wrong side of the 5m 21 EMA
//! while a position is open is an unconditional exit: no alignment override, no
//! minimum hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::candle::{Candle, Timeframe};

/// Position side as reported by order management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Position snapshot owned by the order-management collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub direction: Side,
    pub entry_price: f64,
    pub is_open: bool,
}

impl PositionState {
    pub fn flat(direction: Side) -> Self {
        Self {
            direction,
            entry_price: 0.0,
            is_open: false,
        }
    }
}

/// Unconditional exit signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceExit {
    pub timestamp: DateTime<Utc>,
    pub direction: Side,
    pub close: f64,
    pub ema21: f64,
}

/// Would `close` against `ema21` force an exit of `position`?
pub fn crosses_against(position: &PositionState, close: f64, ema21: f64) -> bool {
    if !position.is_open {
        return false;
    }
    match position.direction {
        Side::Long => close < ema21,
        Side::Short => close > ema21,
    }
}

/// Evaluate the kill-switch on a 5m candle.
///
/// Intrabar candles are only evaluated when `include_intrabar` is set.
pub fn on_candle_close(
    candle: &Candle,
    position: &PositionState,
    ema21_5m: Option<f64>,
    include_intrabar: bool,
) -> Option<ForceExit> {
    if candle.timeframe != Timeframe::M5 || (!candle.is_final && !include_intrabar) {
        return None;
    }
    let ema21 = ema21_5m?;
    if !crosses_against(position, candle.close, ema21) {
        return None;
    }

    warn!(
        "KILL SWITCH: {} position, 5m close {:.2} crossed 21 EMA {:.2}",
        position.direction, candle.close, ema21
    );

    Some(ForceExit {
        timestamp: candle.close_time,
        direction: position.direction,
        close: candle.close,
        ema21,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::candle;

    fn long() -> PositionState {
        PositionState {
            direction: Side::Long,
            entry_price: 101.0,
            is_open: true,
        }
    }

    #[test]
    fn test_long_close_below_ema_fires() {
        let c = candle(Timeframe::M5, 0, 99.5);
        let exit = on_candle_close(&c, &long(), Some(100.0), false).unwrap();
        assert_eq!(exit.direction, Side::Long);
        assert_eq!(exit.close, 99.5);
    }

    #[test]
    fn test_short_close_above_ema_fires() {
        let short = PositionState {
            direction: Side::Short,
            entry_price: 99.0,
            is_open: true,
        };
        let c = candle(Timeframe::M5, 0, 100.5);
        assert!(on_candle_close(&c, &short, Some(100.0), false).is_some());
    }

    #[test]
    fn test_close_at_ema_or_trend_side_holds() {
        assert!(on_candle_close(&candle(Timeframe::M5, 0, 100.0), &long(), Some(100.0), false).is_none());
        assert!(on_candle_close(&candle(Timeframe::M5, 0, 101.0), &long(), Some(100.0), false).is_none());
    }

    #[test]
    fn test_flat_position_never_fires() {
        let c = candle(Timeframe::M5, 0, 90.0);
        assert!(on_candle_close(&c, &PositionState::flat(Side::Long), Some(100.0), false).is_none());
    }

    #[test]
    fn test_other_timeframes_and_ticks() {
        assert!(on_candle_close(&candle(Timeframe::M15, 0, 90.0), &long(), Some(100.0), false).is_none());

        let mut tick = candle(Timeframe::M5, 0, 90.0);
        tick.is_final = false;
        assert!(on_candle_close(&tick, &long(), Some(100.0), false).is_none());
        assert!(on_candle_close(&tick, &long(), Some(100.0), true).is_some());
    }

    #[test]
    fn test_missing_ema_cannot_fire() {
        assert!(on_candle_close(&candle(Timeframe::M5, 0, 90.0), &long(), None, false).is_none());
    }
}
