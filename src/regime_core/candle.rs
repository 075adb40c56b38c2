//! Candles and timeframes delivered by the candle feed

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Candle timeframes the feed delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1_440,
            Timeframe::W1 => 10_080,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown timeframe '{}'", s))
    }
}

/// A candle as delivered by the feed. Non-final candles are intrabar updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub is_final: bool,
}

impl Candle {
    /// Reject candles no feed should ever produce
    pub fn validate(&self) -> Result<(), EngineError> {
        let malformed = |reason: String| EngineError::MalformedCandle {
            timeframe: self.timeframe,
            reason,
        };

        for (name, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !value.is_finite() {
                return Err(malformed(format!("{} is not finite", name)));
            }
        }

        if self.high < self.low {
            return Err(malformed(format!(
                "high {:.4} below low {:.4}",
                self.high, self.low
            )));
        }

        for (name, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(malformed(format!(
                    "{} {:.4} outside range {:.4}..{:.4}",
                    name, value, self.low, self.high
                )));
            }
        }

        if self.close_time <= self.open_time {
            return Err(malformed(format!(
                "close time {} not after open time {}",
                self.close_time, self.open_time
            )));
        }

        Ok(())
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::candle;
    use super::*;

    #[test]
    fn test_rejects_inverted_range() {
        let mut c = candle(Timeframe::M15, 0, 100.0);
        c.high = 99.0;
        c.low = 101.0;
        assert!(matches!(
            c.validate(),
            Err(EngineError::MalformedCandle { .. })
        ));
    }

    #[test]
    fn test_rejects_open_or_close_outside_range() {
        let mut c = candle(Timeframe::M15, 0, 100.0);
        c.close = 100.5;
        assert!(matches!(
            c.validate(),
            Err(EngineError::MalformedCandle { .. })
        ));

        let mut c = candle(Timeframe::M15, 0, 100.0);
        c.open = 99.5;
        assert!(c.validate().is_err());

        // Touching the extremes is fine
        let mut c = candle(Timeframe::M15, 0, 100.0);
        c.open = c.low;
        c.close = c.high;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_finite_and_zero_length() {
        let mut c = candle(Timeframe::M5, 0, 100.0);
        c.close = f64::NAN;
        assert!(c.validate().is_err());

        let mut c = candle(Timeframe::M5, 0, 100.0);
        c.close_time = c.open_time;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("15m".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert_eq!("4H".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("2m".parse::<Timeframe>().is_err());
        assert_eq!(
            serde_json::to_string(&Timeframe::H1).unwrap(),
            "\"1h\""
        );
    }
}
