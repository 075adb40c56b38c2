//! Oscillator and moving-average helpers over final candles

use serde::{Deserialize, Serialize};

use super::candle::Candle;

/// Slow stochastic reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StochasticReading {
    pub k_raw: f64,
    /// Smoothed %K (slow %K)
    pub k: f64,
    /// SMA of the smoothed %K
    pub d: f64,
}

/// Simple average of the last `n` values (or all of them when fewer exist)
fn trailing_mean(values: &[f64], n: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let window = &values[values.len().saturating_sub(n.max(1))..];
    window.iter().sum::<f64>() / window.len() as f64
}

/// Slow stochastic for every bar from the `k_period`-th onward (oldest first).
///
/// Empty until at least `k_period` candles exist. A flat window
/// (highest high == lowest low) reads as 50.
pub fn stochastic_series(candles: &[Candle], k_period: usize, smooth: usize, d_period: usize) -> Vec<StochasticReading> {
    if k_period == 0 || candles.len() < k_period {
        return Vec::new();
    }

    let k_series: Vec<f64> = (k_period - 1..candles.len())
        .map(|i| {
            let window = &candles[i + 1 - k_period..=i];
            let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            let span = highest - lowest;
            if span <= 0.0 {
                50.0
            } else {
                (candles[i].close - lowest) / span * 100.0
            }
        })
        .collect();

    let smoothed: Vec<f64> = (1..=k_series.len())
        .map(|n| trailing_mean(&k_series[..n], smooth))
        .collect();

    (1..=smoothed.len())
        .map(|n| StochasticReading {
            k_raw: k_series[n - 1],
            k: smoothed[n - 1],
            d: trailing_mean(&smoothed[..n], d_period),
        })
        .collect()
}

/// Latest slow stochastic over `candles`, `None` until `k_period` candles exist
pub fn stochastic(candles: &[Candle], k_period: usize, smooth: usize, d_period: usize) -> Option<StochasticReading> {
    stochastic_series(candles, k_period, smooth, d_period).pop()
}

/// Exponential moving average rolled forward one close at a time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollingEma {
    period: usize,
    value: Option<f64>,
}

impl RollingEma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            value: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        2.0 / (self.period as f64 + 1.0)
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Replace the current value with a published one
    pub fn seed(&mut self, value: f64) {
        self.value = Some(value);
    }

    /// Roll forward with a new close. Without a seed the first close seeds it.
    pub fn update(&mut self, close: f64) -> f64 {
        let next = match self.value {
            Some(prev) => prev + self.alpha() * (close - prev),
            None => close,
        };
        self.value = Some(next);
        next
    }

    pub fn clear(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::candle;
    use crate::regime_core::candle::Timeframe;

    fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| candle(Timeframe::M5, i as i64, *c))
            .collect()
    }

    #[test]
    fn test_stochastic_needs_full_window() {
        let candles = series(&[100.0; 13]);
        assert!(stochastic(&candles, 14, 3, 3).is_none());
    }

    #[test]
    fn test_stochastic_pinned_high_on_steady_rally() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let reading = stochastic(&series(&closes), 14, 3, 3).unwrap();
        assert!(reading.k > 90.0, "k = {}", reading.k);
        assert!(reading.d > 90.0);
    }

    #[test]
    fn test_stochastic_flat_market_reads_mid() {
        let mut candles = series(&[100.0; 16]);
        for c in &mut candles {
            c.high = 100.0;
            c.low = 100.0;
        }
        let reading = stochastic(&candles, 14, 3, 3).unwrap();
        assert_eq!(reading.k, 50.0);
    }

    #[test]
    fn test_stochastic_pullback_comes_off_overbought() {
        let mut closes: Vec<f64> = (0..16).map(|i| 100.0 + i as f64).collect();
        closes.extend([112.0, 109.0, 107.0, 106.0]);
        let reading = stochastic(&series(&closes), 14, 3, 3).unwrap();
        assert!(reading.k < 70.0, "k = {}", reading.k);
    }

    #[test]
    fn test_series_ends_with_latest_reading() {
        let mut closes: Vec<f64> = (0..16).map(|i| 100.0 + i as f64).collect();
        closes.extend([112.0, 109.0, 107.0, 106.0]);
        let candles = series(&closes);
        let all = stochastic_series(&candles, 14, 3, 3);
        assert_eq!(all.len(), 7);
        assert!(all[0].k > 90.0, "rally pinned high, k = {}", all[0].k);
        assert_eq!(all.last().copied(), stochastic(&candles, 14, 3, 3));
    }

    #[test]
    fn test_rolling_ema_seed_and_update() {
        let mut ema = RollingEma::new(21);
        assert_eq!(ema.value(), None);
        ema.seed(100.0);
        let next = ema.update(111.0);
        assert!((next - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_ema_self_seeds() {
        let mut ema = RollingEma::new(21);
        assert_eq!(ema.update(50.0), 50.0);
    }
}
