//! Engine configuration

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::regime_core::alignment::AlignmentConfig;
use crate::regime_core::calendar::SessionPreset;
use crate::regime_core::compression::CompressionConfig;
use crate::regime_core::session::SessionConfig;

/// Configuration shared by every instrument engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 15m closes back across a trigger that confirm a reclaim (default: 2)
    pub reclaim_closes: u32,

    /// Evaluate the kill-switch on intrabar 5m updates too (default: false)
    pub guard_on_intrabar: bool,

    /// Final 5m candles kept for the stochastic (default: 200)
    pub history_5m: usize,

    /// Final 15m candles kept for compression detection (default: 64)
    pub history_15m: usize,

    /// Session whose open is the daily reset boundary
    pub session_preset: SessionPreset,

    pub alignment: AlignmentConfig,

    pub session: SessionConfig,

    pub compression: CompressionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reclaim_closes: 2,
            guard_on_intrabar: false,
            history_5m: 200,
            history_15m: 64,
            session_preset: SessionPreset::NyFutures,
            alignment: AlignmentConfig::default(),
            session: SessionConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Slower to grant: three-close reclaims, shorter opportunity window, kill-switch on ticks
    pub fn conservative() -> Self {
        Self {
            reclaim_closes: 3,
            guard_on_intrabar: true,
            session: SessionConfig {
                acceptance_window_bars: 24, // 2 hours
                stand_down_cooldown_minutes: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// US cash equities (09:30 New York open)
    pub fn ny_equity() -> Self {
        Self {
            session_preset: SessionPreset::NyEquity,
            ..Default::default()
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "default" | "standard" => Some(Self::default()),
            "conservative" => Some(Self::conservative()),
            "ny-equity" | "equity" => Some(Self::ny_equity()),
            _ => None,
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reclaim_closes == 0 {
            bail!("reclaim_closes must be at least 1");
        }
        if self.alignment.stoch_k == 0 || self.alignment.stoch_smooth == 0 || self.alignment.stoch_d == 0 {
            bail!("stochastic periods must be positive");
        }
        if self.alignment.oversold >= self.alignment.overbought {
            bail!(
                "oversold bound {} must be below overbought bound {}",
                self.alignment.oversold,
                self.alignment.overbought
            );
        }
        if self.history_5m < self.alignment.stoch_k + self.alignment.stoch_smooth + self.alignment.stoch_d {
            bail!("history_5m ({}) too short for the stochastic", self.history_5m);
        }
        if self.history_15m < self.compression.lookback_bars {
            bail!("history_15m ({}) shorter than compression lookback", self.history_15m);
        }
        if self.session.watch_timeout_bars == 0 || self.session.acceptance_window_bars == 0 {
            bail!("watch timeout and acceptance window must be positive");
        }
        if self.session.stand_down_cooldown_minutes < 0 {
            bail!("stand-down cooldown cannot be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.reclaim_closes, 2);
        assert_eq!(config.session.acceptance_window_bars, 48);
        assert_eq!(config.alignment.stoch_k, 14);
    }

    #[test]
    fn test_presets() {
        assert_eq!(EngineConfig::preset("conservative").unwrap().reclaim_closes, 3);
        assert_eq!(
            EngineConfig::preset("equity").unwrap().session_preset,
            SessionPreset::NyEquity
        );
        assert!(EngineConfig::preset("yolo").is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reclaim_closes": 3, "session": {{"watch_timeout_bars": 6}}}}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.reclaim_closes, 3);
        assert_eq!(config.session.watch_timeout_bars, 6);
        assert_eq!(config.session.acceptance_window_bars, 48);
        assert_eq!(config.alignment, AlignmentConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reclaim_closes": 0}}"#).unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }
}
