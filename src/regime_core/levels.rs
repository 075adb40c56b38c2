//! Structural levels published by the external level feed
//!
//! The engine never computes these. A level set is keyed by
//! (instrument, session date); a second publication for the same session is a
//! correction and only affects closes that arrive after it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::candle::Timeframe;
use super::error::EngineError;
use super::regime::Direction;

/// Moving averages for one timeframe
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MovingAverages {
    #[serde(default)]
    pub ema21: Option<f64>,
    #[serde(default)]
    pub sma200: Option<f64>,
}

/// Per-instrument, per-session level set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSet {
    pub instrument: String,
    pub session_date: NaiveDate,
    pub breakout_trigger: f64,
    pub breakdown_trigger: f64,
    pub daily_support: f64,
    pub daily_resistance: f64,
    #[serde(default)]
    pub htf_support: Option<f64>,
    #[serde(default)]
    pub htf_resistance: Option<f64>,
    #[serde(default)]
    pub opening_range_high: Option<f64>,
    #[serde(default)]
    pub opening_range_low: Option<f64>,
    #[serde(default)]
    pub moving_averages: BTreeMap<Timeframe, MovingAverages>,
}

/// Mid-session moving-average publication from the level feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingAverageUpdate {
    pub timeframe: Timeframe,
    pub as_of: DateTime<Utc>,
    #[serde(flatten)]
    pub values: MovingAverages,
}

/// Which trigger a counter or signal refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    Breakout,
    Breakdown,
}

impl TriggerKind {
    /// Direction of a discovery through this trigger
    pub fn discovery_direction(&self) -> Direction {
        match self {
            TriggerKind::Breakout => Direction::Up,
            TriggerKind::Breakdown => Direction::Down,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Breakout => write!(f, "BO"),
            TriggerKind::Breakdown => write!(f, "BD"),
        }
    }
}

impl LevelSet {
    pub fn validate(&self) -> Result<(), EngineError> {
        let malformed = |reason: String| EngineError::MalformedLevels {
            instrument: self.instrument.clone(),
            reason,
        };

        if self.instrument.trim().is_empty() {
            return Err(malformed("instrument is empty".to_string()));
        }

        let required = [
            ("breakout_trigger", self.breakout_trigger),
            ("breakdown_trigger", self.breakdown_trigger),
            ("daily_support", self.daily_support),
            ("daily_resistance", self.daily_resistance),
        ];
        for (name, value) in required {
            if !value.is_finite() || value <= 0.0 {
                return Err(malformed(format!("{} must be a positive price", name)));
            }
        }

        let optional = [
            ("htf_support", self.htf_support),
            ("htf_resistance", self.htf_resistance),
            ("opening_range_high", self.opening_range_high),
            ("opening_range_low", self.opening_range_low),
        ];
        for (name, value) in optional {
            if matches!(value, Some(v) if !v.is_finite()) {
                return Err(malformed(format!("{} is not finite", name)));
            }
        }

        if self.breakout_trigger <= self.breakdown_trigger {
            return Err(malformed(format!(
                "breakout trigger {:.4} not above breakdown trigger {:.4}",
                self.breakout_trigger, self.breakdown_trigger
            )));
        }

        if self.daily_support > self.daily_resistance {
            return Err(malformed(format!(
                "daily support {:.4} above daily resistance {:.4}",
                self.daily_support, self.daily_resistance
            )));
        }

        for (tf, ma) in &self.moving_averages {
            for value in [ma.ema21, ma.sma200].into_iter().flatten() {
                if !value.is_finite() {
                    return Err(malformed(format!("{} moving average is not finite", tf)));
                }
            }
        }

        Ok(())
    }

    pub fn trigger(&self, kind: TriggerKind) -> f64 {
        match kind {
            TriggerKind::Breakout => self.breakout_trigger,
            TriggerKind::Breakdown => self.breakdown_trigger,
        }
    }

    /// Midpoint between the triggers
    pub fn range_center(&self) -> f64 {
        (self.breakout_trigger + self.breakdown_trigger) / 2.0
    }

    pub fn trigger_span(&self) -> f64 {
        self.breakout_trigger - self.breakdown_trigger
    }

    /// Nearest trigger to `price` and its absolute distance
    pub fn nearest_trigger(&self, price: f64) -> (TriggerKind, f64) {
        let to_bo = (price - self.breakout_trigger).abs();
        let to_bd = (price - self.breakdown_trigger).abs();
        if to_bo <= to_bd {
            (TriggerKind::Breakout, to_bo)
        } else {
            (TriggerKind::Breakdown, to_bd)
        }
    }

    pub fn moving_averages(&self, timeframe: Timeframe) -> MovingAverages {
        self.moving_averages
            .get(&timeframe)
            .copied()
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::level_set;
    use super::*;

    #[test]
    fn test_valid_level_set() {
        let levels = level_set(100.0, 90.0);
        assert!(levels.validate().is_ok());
        assert_eq!(levels.range_center(), 95.0);
        assert_eq!(levels.nearest_trigger(99.0), (TriggerKind::Breakout, 1.0));
        assert_eq!(levels.nearest_trigger(91.5), (TriggerKind::Breakdown, 1.5));
    }

    #[test]
    fn test_inverted_triggers_rejected() {
        let levels = level_set(90.0, 100.0);
        assert!(matches!(
            levels.validate(),
            Err(EngineError::MalformedLevels { .. })
        ));
    }

    #[test]
    fn test_missing_required_field_fails_to_parse() {
        let json = r#"{
            "instrument": "ES",
            "session_date": "2025-03-04",
            "breakout_trigger": 5000.0,
            "daily_support": 4950.0,
            "daily_resistance": 5050.0
        }"#;
        assert!(serde_json::from_str::<LevelSet>(json).is_err());
    }

    #[test]
    fn test_moving_averages_keyed_by_timeframe() {
        let json = r#"{
            "instrument": "ES",
            "session_date": "2025-03-04",
            "breakout_trigger": 5010.0,
            "breakdown_trigger": 4990.0,
            "daily_support": 4950.0,
            "daily_resistance": 5050.0,
            "moving_averages": {"1h": {"ema21": 5001.5, "sma200": 4980.0}}
        }"#;
        let levels: LevelSet = serde_json::from_str(json).unwrap();
        assert_eq!(levels.moving_averages(Timeframe::H1).ema21, Some(5001.5));
        assert_eq!(levels.moving_averages(Timeframe::H4), MovingAverages::default());
    }
}
