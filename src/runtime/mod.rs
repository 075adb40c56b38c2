//! Async runtime around the synchronous core

pub mod actor;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::regime_core::{Alarm, ForceExit, TransitionRecord};

pub use actor::EngineHandle;
pub use registry::EngineRegistry;

/// Everything fanned out to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notice {
    Transition(TransitionRecord),
    ForceExit { instrument: String, exit: ForceExit },
    Alarm(Alarm),
    Rejected {
        instrument: String,
        event: String,
        reason: String,
    },
}
