//! Compression detection near a trigger
//!
//! "Compression" is qualitative in trading doctrine (narrowing range with
//! repeated pressure toward a trigger), so the session machine only depends on
//! the `CompressionDetector` trait. `RangeCompression` is the default detector.

use serde::{Deserialize, Serialize};

use super::candle::Candle;
use super::levels::{LevelSet, TriggerKind};

/// A detected compression against a trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionSignal {
    pub trigger: TriggerKind,
    /// Absolute distance of the last close from the trigger
    pub distance: f64,
    /// Recent average range divided by the earlier average range
    pub range_ratio: f64,
}

/// Pluggable compression detector
pub trait CompressionDetector: Send + Sync + std::fmt::Debug {
    /// `candles` are the recent final 15m candles, oldest first
    fn detect(&self, candles: &[Candle], levels: &LevelSet) -> Option<CompressionSignal>;
}

/// Configuration for the default detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Candles compared, split into an earlier and a recent half (default: 6)
    pub lookback_bars: usize,
    /// Recent average range must be at most this fraction of the earlier one (default: 0.8)
    pub narrowing_ratio: f64,
    /// Max distance of the last close from a trigger, as a fraction of the trigger span (default: 0.25)
    pub proximity_of_span: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 6,
            narrowing_ratio: 0.8,
            proximity_of_span: 0.25,
        }
    }
}

/// Narrowing 15m ranges with the last close near a trigger
#[derive(Debug, Clone, Default)]
pub struct RangeCompression {
    config: CompressionConfig,
}

impl RangeCompression {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }
}

fn mean_range(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    candles.iter().map(Candle::range).sum::<f64>() / candles.len() as f64
}

impl CompressionDetector for RangeCompression {
    fn detect(&self, candles: &[Candle], levels: &LevelSet) -> Option<CompressionSignal> {
        let lookback = self.config.lookback_bars.max(2);
        if candles.len() < lookback {
            return None;
        }

        let window = &candles[candles.len() - lookback..];
        let (earlier, recent) = window.split_at(lookback / 2);
        let earlier_range = mean_range(earlier);
        if earlier_range <= 0.0 {
            return None;
        }
        let range_ratio = mean_range(recent) / earlier_range;
        if range_ratio > self.config.narrowing_ratio {
            return None;
        }

        let last_close = window.last()?.close;
        let (trigger, distance) = levels.nearest_trigger(last_close);
        if distance > levels.trigger_span() * self.config.proximity_of_span {
            return None;
        }

        Some(CompressionSignal {
            trigger,
            distance,
            range_ratio,
        })
    }
}
