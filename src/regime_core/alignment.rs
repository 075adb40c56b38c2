//! Alignment Evaluator
//!
//! Pure function of the current market view: higher-timeframe bias,
//! stochastic reset, lower-timeframe structure and position relative to the
//! 5-minute 21 EMA. Nothing here is stored; the permission resolver consumes the
//! snapshot immediately.

use serde::{Deserialize, Serialize};

use super::candle::Candle;
use super::indicators::{stochastic_series, StochasticReading};
use super::levels::MovingAverages;
use super::regime::Direction;

/// Configuration for alignment evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Stochastic %K lookback (default: 14)
    pub stoch_k: usize,
    /// %K smoothing (default: 3)
    pub stoch_smooth: usize,
    /// %D period (default: 3)
    pub stoch_d: usize,
    /// Overbought bound (default: 80)
    pub overbought: f64,
    /// Oversold bound (default: 20)
    pub oversold: f64,
    /// Half-width of the mid-range band around 50 that counts as "reset" (default: 10)
    pub stoch_mid_band: f64,
    /// Smoothed readings searched for the overbought/oversold extreme a reset comes back from (default: 12)
    pub reset_lookback_bars: usize,
    /// Max distance from the 5m 21 EMA, as a fraction of the EMA, for a valid pullback (default: 0.35%)
    pub max_extension_pct: f64,
    /// Distance from the 5m 21 EMA treated as sitting on it (default: 0.02%)
    pub ema_flat_tolerance_pct: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            stoch_k: 14,
            stoch_smooth: 3,
            stoch_d: 3,
            overbought: 80.0,
            oversold: 20.0,
            stoch_mid_band: 10.0,
            reset_lookback_bars: 12,
            max_extension_pct: 0.0035,
            ema_flat_tolerance_pct: 0.0002,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtfBias {
    Bull,
    Bear,
    Neutral,
}

impl HtfBias {
    /// Bias that fully supports a move in `direction`
    pub fn supporting(direction: Direction) -> HtfBias {
        match direction {
            Direction::Up => HtfBias::Bull,
            Direction::Down => HtfBias::Bear,
        }
    }

    pub fn supports(&self, direction: Direction) -> bool {
        *self == HtfBias::supporting(direction)
    }

    pub fn opposes(&self, direction: Direction) -> bool {
        *self == HtfBias::supporting(direction.opposite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmaPosition {
    Aligned,
    Against,
    Flat,
}

/// Ephemeral alignment result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSnapshot {
    pub direction: Direction,
    pub htf_bias: HtfBias,
    pub stochastic_reset: bool,
    pub ltf_structure_valid: bool,
    pub ema_position: EmaPosition,
    /// False when any input (MA, stochastic, 5m close) was unavailable
    pub data_complete: bool,
    pub stochastic: Option<StochasticReading>,
}

/// Read-only view of the instrument's market data
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    /// Latest observed price (final or intrabar)
    pub price: Option<f64>,
    pub ema21_5m: Option<f64>,
    pub h1: MovingAverages,
    pub h4: MovingAverages,
    /// Final 5m candles, oldest first
    pub candles_5m: &'a [Candle],
}

impl MarketView<'_> {
    fn last_close_5m(&self) -> Option<f64> {
        self.candles_5m.last().map(|c| c.close)
    }
}

/// Bull when price is above every 1h/4h 21 EMA and 200 SMA, Bear when below
/// every one. Any missing average yields Neutral.
pub fn htf_bias(price: f64, h1: &MovingAverages, h4: &MovingAverages) -> Option<HtfBias> {
    let averages = [h1.ema21?, h1.sma200?, h4.ema21?, h4.sma200?];
    if averages.iter().all(|ma| price > *ma) {
        Some(HtfBias::Bull)
    } else if averages.iter().all(|ma| price < *ma) {
        Some(HtfBias::Bear)
    } else {
        Some(HtfBias::Neutral)
    }
}

/// Oscillator has come back from the extreme toward mid-range for `direction`.
///
/// `readings` are oldest first. The extreme (overbought for an upside
/// pullback, oversold for a downside one) must appear within the lookback,
/// and both %K and %D must have left it.
pub fn stochastic_reset(readings: &[StochasticReading], direction: Direction, config: &AlignmentConfig) -> bool {
    let Some(latest) = readings.last() else {
        return false;
    };
    let recent = &readings[readings.len().saturating_sub(config.reset_lookback_bars.max(1))..];
    match direction {
        Direction::Up => {
            recent.iter().any(|r| r.k >= config.overbought)
                && latest.k < config.overbought
                && latest.d < config.overbought
                && latest.k.min(latest.d) <= 50.0 + config.stoch_mid_band
        }
        Direction::Down => {
            recent.iter().any(|r| r.k <= config.oversold)
                && latest.k > config.oversold
                && latest.d > config.oversold
                && latest.k.max(latest.d) >= 50.0 - config.stoch_mid_band
        }
    }
}

/// Signed distance of `close` from `ema` in the trend direction, as a fraction of the EMA
fn trend_side_distance(close: f64, ema: f64, direction: Direction) -> f64 {
    let raw = (close - ema) / ema;
    match direction {
        Direction::Up => raw,
        Direction::Down => -raw,
    }
}

pub fn evaluate(view: &MarketView<'_>, direction: Direction, config: &AlignmentConfig) -> AlignmentSnapshot {
    let bias = view
        .price
        .and_then(|price| htf_bias(price, &view.h1, &view.h4));

    let readings = stochastic_series(view.candles_5m, config.stoch_k, config.stoch_smooth, config.stoch_d);
    let stoch_ok = stochastic_reset(&readings, direction, config);
    let reading = readings.last().copied();

    let distance = match (view.last_close_5m(), view.ema21_5m) {
        (Some(close), Some(ema)) if ema > 0.0 => Some(trend_side_distance(close, ema, direction)),
        _ => None,
    };

    let ema_position = match distance {
        Some(d) if d.abs() <= config.ema_flat_tolerance_pct => EmaPosition::Flat,
        Some(d) if d > 0.0 => EmaPosition::Aligned,
        Some(_) => EmaPosition::Against,
        None => EmaPosition::Flat,
    };

    // Pulled back toward the EMA without closing through it
    let ltf_structure_valid = matches!(distance, Some(d) if d >= 0.0 && d <= config.max_extension_pct);

    AlignmentSnapshot {
        direction,
        htf_bias: bias.unwrap_or(HtfBias::Neutral),
        stochastic_reset: stoch_ok,
        ltf_structure_valid,
        ema_position,
        data_complete: bias.is_some() && reading.is_some() && distance.is_some(),
        stochastic: reading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::candle;
    use crate::regime_core::candle::Timeframe;

    fn ma(ema21: f64, sma200: f64) -> MovingAverages {
        MovingAverages {
            ema21: Some(ema21),
            sma200: Some(sma200),
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| candle(Timeframe::M5, i as i64, *c))
            .collect()
    }

    /// Rally to 115 then a pullback into the 106 area
    fn pullback_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..16).map(|i| 100.0 + i as f64).collect();
        closes.extend([112.0, 109.0, 107.0, 106.0]);
        closes
    }

    #[test]
    fn test_htf_bias_classification() {
        let h1 = ma(100.0, 95.0);
        let h4 = ma(101.0, 90.0);
        assert_eq!(htf_bias(105.0, &h1, &h4), Some(HtfBias::Bull));
        assert_eq!(htf_bias(85.0, &h1, &h4), Some(HtfBias::Bear));
        assert_eq!(htf_bias(100.5, &h1, &h4), Some(HtfBias::Neutral));
        assert_eq!(htf_bias(105.0, &MovingAverages::default(), &h4), None);
    }

    #[test]
    fn test_bias_opposition() {
        assert!(HtfBias::Bear.opposes(Direction::Up));
        assert!(!HtfBias::Neutral.opposes(Direction::Up));
        assert!(HtfBias::Bull.supports(Direction::Up));
    }

    #[test]
    fn test_pullback_is_aligned_for_upside() {
        let closes = pullback_closes();
        let c5 = candles(&closes);
        let view = MarketView {
            price: Some(106.0),
            ema21_5m: Some(105.8),
            h1: ma(100.0, 95.0),
            h4: ma(101.0, 90.0),
            candles_5m: &c5,
        };
        let snap = evaluate(&view, Direction::Up, &AlignmentConfig::default());
        assert_eq!(snap.htf_bias, HtfBias::Bull);
        assert!(snap.stochastic_reset);
        assert!(snap.ltf_structure_valid);
        assert_eq!(snap.ema_position, EmaPosition::Aligned);
        assert!(snap.data_complete);
    }

    #[test]
    fn test_extended_rally_not_reset() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let c5 = candles(&closes);
        let view = MarketView {
            price: Some(119.0),
            ema21_5m: Some(110.0),
            h1: ma(100.0, 95.0),
            h4: ma(101.0, 90.0),
            candles_5m: &c5,
        };
        let snap = evaluate(&view, Direction::Up, &AlignmentConfig::default());
        assert!(!snap.stochastic_reset);
        assert!(!snap.ltf_structure_valid, "8% above the EMA is extension, not a pullback");
    }

    #[test]
    fn test_close_through_ema_is_against() {
        let c5 = candles(&pullback_closes());
        let view = MarketView {
            price: Some(106.0),
            ema21_5m: Some(107.0),
            h1: ma(100.0, 95.0),
            h4: ma(101.0, 90.0),
            candles_5m: &c5,
        };
        let snap = evaluate(&view, Direction::Up, &AlignmentConfig::default());
        assert_eq!(snap.ema_position, EmaPosition::Against);
        assert!(!snap.ltf_structure_valid);
    }

    #[test]
    fn test_mid_range_chop_is_not_a_reset() {
        // Never reaches overbought, so a reading near 50 is not a pullback reset
        let closes: Vec<f64> = (0..19).map(|i| [100.0, 101.0, 102.0, 101.0][i % 4]).collect();
        let readings = stochastic_series(&candles(&closes), 14, 3, 3);
        let latest = readings.last().unwrap();
        assert!(latest.k <= 60.0, "k = {}", latest.k);
        assert!(readings.iter().all(|r| r.k < 80.0));
        assert!(!stochastic_reset(&readings, Direction::Up, &AlignmentConfig::default()));
    }

    #[test]
    fn test_downside_bounce_off_oversold_is_reset() {
        let mut closes: Vec<f64> = (0..16).map(|i| 115.0 - i as f64).collect();
        closes.extend([103.0, 106.0, 108.0, 109.0]);
        let readings = stochastic_series(&candles(&closes), 14, 3, 3);
        let config = AlignmentConfig::default();
        assert!(stochastic_reset(&readings, Direction::Down, &config));
        assert!(!stochastic_reset(&readings, Direction::Up, &config));
    }

    #[test]
    fn test_extreme_outside_lookback_does_not_count() {
        let readings = stochastic_series(&candles(&pullback_closes()), 14, 3, 3);
        let config = AlignmentConfig {
            reset_lookback_bars: 2,
            ..Default::default()
        };
        assert!(stochastic_reset(&readings, Direction::Up, &AlignmentConfig::default()));
        assert!(!stochastic_reset(&readings, Direction::Up, &config));
    }

    #[test]
    fn test_missing_inputs_are_incomplete() {
        let view = MarketView {
            price: Some(100.0),
            ema21_5m: None,
            h1: MovingAverages::default(),
            h4: MovingAverages::default(),
            candles_5m: &[],
        };
        let snap = evaluate(&view, Direction::Down, &AlignmentConfig::default());
        assert!(!snap.data_complete);
        assert!(!snap.stochastic_reset);
        assert!(!snap.ltf_structure_valid);
        assert_eq!(snap.htf_bias, HtfBias::Neutral);
    }
}
