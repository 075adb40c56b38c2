//! Engine inputs and outputs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::SessionPhase;
use super::candle::Candle;
use super::guard::{ForceExit, PositionState, Side};
use super::levels::{LevelSet, MovingAverageUpdate};
use super::permission::Strategy;
use super::regime::{Direction, RegimeState};
use super::risk::RiskFlagUpdate;
use super::session::SessionState;

/// Why an output changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    AcceptanceConfirmed2Close,
    ReclaimConfirmed,
    TriggerPressure,
    CompressionDetected,
    WatchExpired,
    ReturnedToRangeCenter,
    AcceptanceWindowExpired,
    ReclaimWindowExpired,
    StrategyGranted,
    StrategyWithdrawn,
    EntryTaken,
    PositionClosed,
    EmaKillSwitch,
    RuleViolation,
    EmotionalInstability,
    NewsWindow,
    PostLossCooldown,
    CooldownElapsed,
    SessionReset,
    InvariantFault,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::AcceptanceConfirmed2Close => "ACCEPTANCE_CONFIRMED_2_CLOSE",
            ReasonCode::ReclaimConfirmed => "RECLAIM_CONFIRMED",
            ReasonCode::TriggerPressure => "TRIGGER_PRESSURE",
            ReasonCode::CompressionDetected => "COMPRESSION_DETECTED",
            ReasonCode::WatchExpired => "WATCH_EXPIRED",
            ReasonCode::ReturnedToRangeCenter => "RETURNED_TO_RANGE_CENTER",
            ReasonCode::AcceptanceWindowExpired => "ACCEPTANCE_WINDOW_EXPIRED",
            ReasonCode::ReclaimWindowExpired => "RECLAIM_WINDOW_EXPIRED",
            ReasonCode::StrategyGranted => "STRATEGY_GRANTED",
            ReasonCode::StrategyWithdrawn => "STRATEGY_WITHDRAWN",
            ReasonCode::EntryTaken => "ENTRY_TAKEN",
            ReasonCode::PositionClosed => "POSITION_CLOSED",
            ReasonCode::EmaKillSwitch => "EMA_KILL_SWITCH",
            ReasonCode::RuleViolation => "RULE_VIOLATION",
            ReasonCode::EmotionalInstability => "EMOTIONAL_INSTABILITY",
            ReasonCode::NewsWindow => "NEWS_WINDOW",
            ReasonCode::PostLossCooldown => "POST_LOSS_COOLDOWN",
            ReasonCode::CooldownElapsed => "COOLDOWN_ELAPSED",
            ReasonCode::SessionReset => "SESSION_RESET",
            ReasonCode::InvariantFault => "INVARIANT_FAULT",
        };
        write!(f, "{}", s)
    }
}

/// Position report from order management
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub timestamp: DateTime<Utc>,
    pub direction: Side,
    pub entry_price: f64,
    pub is_open: bool,
}

impl PositionUpdate {
    pub fn state(&self) -> PositionState {
        PositionState {
            direction: self.direction,
            entry_price: self.entry_price,
            is_open: self.is_open,
        }
    }
}

/// Everything an instrument engine consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Candle(Candle),
    Levels(LevelSet),
    MovingAverages(MovingAverageUpdate),
    RiskFlags(RiskFlagUpdate),
    Position(PositionUpdate),
    /// Time passing with no market data (drives cooldowns and the session boundary)
    Clock(DateTime<Utc>),
}

impl EngineEvent {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            EngineEvent::Candle(c) => Some(c.close_time),
            EngineEvent::Levels(_) => None,
            EngineEvent::MovingAverages(u) => Some(u.as_of),
            EngineEvent::RiskFlags(u) => Some(u.timestamp),
            EngineEvent::Position(p) => Some(p.timestamp),
            EngineEvent::Clock(ts) => Some(*ts),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Candle(_) => "candle",
            EngineEvent::Levels(_) => "levels",
            EngineEvent::MovingAverages(_) => "moving_averages",
            EngineEvent::RiskFlags(_) => "risk_flags",
            EngineEvent::Position(_) => "position",
            EngineEvent::Clock(_) => "clock",
        }
    }
}

/// Deterministic action label for presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    /// Nothing to do
    HoldFire,
    /// Acceptance in progress or confirmed without a grant
    Wait,
    /// A strategy is permitted (or being executed)
    Go,
    StandDown,
    /// A forced exit is outstanding
    Exit,
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::HoldFire => write!(f, "HOLD FIRE"),
            Directive::Wait => write!(f, "WAIT"),
            Directive::Go => write!(f, "GO"),
            Directive::StandDown => write!(f, "STAND DOWN"),
            Directive::Exit => write!(f, "EXIT"),
        }
    }
}

/// Closes toward acceptance, e.g. 1/2 above the breakout trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceProgress {
    pub direction: Option<Direction>,
    pub count: u32,
    pub required: u32,
}

/// Queryable per-instrument snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub instrument: String,
    pub session_state: SessionState,
    /// Calibrating and Closed never carry a new grant
    pub session_phase: SessionPhase,
    pub regime: RegimeState,
    pub permitted_strategy: Option<Strategy>,
    pub forced_exit_pending: bool,
    pub reclaim_pending: bool,
    pub acceptance: AcceptanceProgress,
    pub directive: Directive,
    pub as_of: Option<DateTime<Utc>>,
}

impl EngineOutput {
    pub fn initial(instrument: &str, required: u32) -> Self {
        Self {
            instrument: instrument.to_string(),
            session_state: SessionState::Observation,
            session_phase: SessionPhase::Closed,
            regime: RegimeState::Balance,
            permitted_strategy: None,
            forced_exit_pending: false,
            reclaim_pending: false,
            acceptance: AcceptanceProgress {
                direction: None,
                count: 0,
                required,
            },
            directive: Directive::HoldFire,
            as_of: None,
        }
    }

    /// Do the fields carried on a transition record differ?
    pub fn differs_from(&self, other: &EngineOutput) -> bool {
        self.session_state != other.session_state
            || self.regime != other.regime
            || self.permitted_strategy != other.permitted_strategy
            || self.forced_exit_pending != other.forced_exit_pending
    }
}

/// Emitted whenever an output field changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub from_state: SessionState,
    pub to_state: SessionState,
    pub regime: RegimeState,
    pub permitted_strategy: Option<Strategy>,
    pub forced_exit_pending: bool,
    pub reason: ReasonCode,
}

/// Operator alarm raised on an invariant fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub message: String,
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineUpdate {
    pub records: Vec<TransitionRecord>,
    pub force_exit: Option<ForceExit>,
    pub alarms: Vec<Alarm>,
    pub output: EngineOutput,
}
