use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::regime_core::{EngineOutput, TransitionRecord};
use crate::runtime::{EngineRegistry, Notice};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    Connected { instruments: Vec<String> },
    Snapshot { outputs: Vec<EngineOutput> },
    Notice { notice: Notice },
    Error { message: String },
}

/// Client request over the WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub instrument: Option<String>,
}

/// Recent transition records kept for late joiners
pub struct RecordLog {
    capacity: usize,
    records: Vec<TransitionRecord>,
}

impl RecordLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TransitionRecord) {
        self.records.push(record);
        if self.records.len() > self.capacity {
            let excess = self.records.len() - self.capacity;
            self.records.drain(..excess);
        }
    }

    pub fn for_instrument(&self, instrument: &str, limit: usize) -> Vec<TransitionRecord> {
        let mut matching: Vec<TransitionRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| r.instrument == instrument)
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }
}

/// Shared application state
pub struct AppState {
    pub registry: EngineRegistry,
    pub history: RwLock<RecordLog>,
}
