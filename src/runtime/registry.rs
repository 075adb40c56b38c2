//! Instrument registry: spawns an engine task the first time an instrument is seen

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};

use crate::config::EngineConfig;
use crate::regime_core::{EngineError, EngineEvent, EngineOutput, EngineUpdate};

use super::actor::{self, EngineHandle};
use super::Notice;

pub struct EngineRegistry {
    config: EngineConfig,
    engines: RwLock<HashMap<String, EngineHandle>>,
    notices: broadcast::Sender<Notice>,
}

impl EngineRegistry {
    pub fn new(config: EngineConfig, notice_capacity: usize) -> Self {
        let (notices, _rx) = broadcast::channel(notice_capacity);
        Self {
            config,
            engines: RwLock::new(HashMap::new()),
            notices,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stream of transition records, forced exits, alarms and rejections
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn get(&self, instrument: &str) -> Option<EngineHandle> {
        self.engines.read().await.get(instrument).cloned()
    }

    /// Handle for `instrument`, starting its engine if needed
    pub async fn handle(&self, instrument: &str) -> EngineHandle {
        if let Some(handle) = self.get(instrument).await {
            return handle;
        }
        let mut engines = self.engines.write().await;
        engines
            .entry(instrument.to_string())
            .or_insert_with(|| actor::spawn(instrument, self.config.clone(), self.notices.clone()))
            .clone()
    }

    pub async fn ingest(&self, instrument: &str, event: EngineEvent) -> Result<EngineUpdate, EngineError> {
        self.handle(instrument).await.ingest(event).await
    }

    pub async fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn snapshot(&self, instrument: &str) -> Option<EngineOutput> {
        self.get(instrument).await.map(|h| h.snapshot())
    }

    pub async fn snapshots(&self) -> Vec<EngineOutput> {
        let engines = self.engines.read().await;
        let mut outputs: Vec<EngineOutput> = engines.values().map(EngineHandle::snapshot).collect();
        outputs.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        outputs
    }

    pub async fn shutdown(&self) {
        let engines = self.engines.read().await;
        for handle in engines.values() {
            handle.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::candle;
    use crate::regime_core::levels::test_support::level_set;
    use crate::regime_core::{RegimeState, SessionState, Timeframe};

    #[tokio::test]
    async fn test_instruments_are_independent() {
        let registry = EngineRegistry::new(EngineConfig::default(), 256);

        let mut es = level_set(5000.0, 4980.0);
        es.instrument = "ES".to_string();
        registry.ingest("NQ", EngineEvent::Levels(level_set(100.0, 90.0))).await.unwrap();
        registry.ingest("ES", EngineEvent::Levels(es)).await.unwrap();

        registry
            .ingest("NQ", EngineEvent::Candle(candle(Timeframe::M15, 0, 101.0)))
            .await
            .unwrap();
        registry
            .ingest("NQ", EngineEvent::Candle(candle(Timeframe::M15, 1, 102.0)))
            .await
            .unwrap();

        assert_eq!(registry.instruments().await, vec!["ES".to_string(), "NQ".to_string()]);
        let nq = registry.snapshot("NQ").await.unwrap();
        let es = registry.snapshot("ES").await.unwrap();
        assert!(matches!(nq.regime, RegimeState::Discovery(_)));
        assert_eq!(es.regime, RegimeState::Balance);
        assert_eq!(es.session_state, SessionState::Observation);
    }

    #[tokio::test]
    async fn test_levels_routed_to_wrong_instrument_rejected() {
        let registry = EngineRegistry::new(EngineConfig::default(), 16);
        let result = registry.ingest("ES", EngineEvent::Levels(level_set(100.0, 90.0))).await;
        assert!(matches!(result, Err(EngineError::WrongInstrument { .. })));
    }

    #[tokio::test]
    async fn test_unknown_instrument_has_no_snapshot() {
        let registry = EngineRegistry::new(EngineConfig::default(), 16);
        assert!(registry.snapshot("CL").await.is_none());
        assert!(registry.snapshots().await.is_empty());
    }
}
