// Library crate - regime classification and execution permission

pub mod regime_core;
pub mod config;
pub mod cache;
pub mod replay;
pub mod runtime;
pub mod types;
pub mod api;
pub mod server;

// Re-export commonly used types
pub use config::EngineConfig;
pub use regime_core::{EngineError, EngineEvent, EngineOutput, EngineUpdate, InstrumentEngine};
