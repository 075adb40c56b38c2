//! Session State Machine
//!
//! Five states per instrument. Transitions are only taken along the edges in
//! `SessionState::can_transition`; moving backward to Observation is always an
//! edge (except out of StandDown, which needs its cooldown), moving forward
//! never skips a state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::EngineError;
use super::events::ReasonCode;

/// Configuration for session progression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 15m closes without acceptance progress before TransitionWatch lapses (default: 4)
    pub watch_timeout_bars: u32,
    /// Half-width of the range-centre band, as a fraction of the trigger span (default: 0.25)
    pub center_band: f64,
    /// 5m closes after acceptance before an unused opportunity expires (default: 48 = 4h)
    pub acceptance_window_bars: u32,
    /// 15m closes a reclaim episode stays pending (default: 8)
    pub reclaim_window_bars: u32,
    /// Minutes StandDown is held after the last risk flag clears (default: 30)
    pub stand_down_cooldown_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watch_timeout_bars: 4,
            center_band: 0.25,
            acceptance_window_bars: 48,
            reclaim_window_bars: 8,
            stand_down_cooldown_minutes: 30,
        }
    }
}

/// Session state of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Watching for something worth acting on
    Observation,
    /// Pressure on a trigger, acceptance not yet confirmed
    TransitionWatch,
    /// Acceptance confirmed, an entry may be taken
    AcceptanceConfirmed,
    /// Position open under a granted strategy
    ExecutionActive,
    /// Risk flag active, nothing is permitted
    StandDown,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Observation
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Observation => write!(f, "OBSERVATION"),
            SessionState::TransitionWatch => write!(f, "TRANSITION_WATCH"),
            SessionState::AcceptanceConfirmed => write!(f, "ACCEPTANCE_CONFIRMED"),
            SessionState::ExecutionActive => write!(f, "EXECUTION_ACTIVE"),
            SessionState::StandDown => write!(f, "STAND_DOWN"),
        }
    }
}

impl SessionState {
    /// Is `from -> to` an edge of the machine?
    pub fn can_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (StandDown, StandDown) => false,
            (_, StandDown) => true,
            (StandDown, Observation) => true,
            (StandDown, _) => false,
            (Observation, Observation) => false,
            (_, Observation) => true,
            (Observation, TransitionWatch) => true,
            (TransitionWatch, AcceptanceConfirmed) => true,
            (AcceptanceConfirmed, ExecutionActive) => true,
            _ => false,
        }
    }
}

/// A session state change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: ReasonCode,
}

/// State plus the bar counters that drive timeouts
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: SessionState,
    /// 15m closes in TransitionWatch since the last progress
    watch_idle_bars: u32,
    /// 5m closes since acceptance was confirmed
    window_bars: u32,
    stand_down_until: Option<DateTime<Utc>>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stand_down_until(&self) -> Option<DateTime<Utc>> {
        self.stand_down_until
    }

    pub fn window_bars(&self) -> u32 {
        self.window_bars
    }

    /// Move to `to`. Returns `None` when already there, an error for a
    /// transition that is not an edge.
    pub fn transition(&mut self, to: SessionState, reason: ReasonCode) -> Result<Option<SessionTransition>, EngineError> {
        let from = self.state;
        if from == to {
            return Ok(None);
        }
        if !SessionState::can_transition(from, to) {
            return Err(EngineError::InvariantViolation(format!(
                "illegal session transition {} -> {} ({})",
                from, to, reason
            )));
        }
        Ok(Some(self.enter(to, reason)))
    }

    /// Unconditional move used by fault recovery
    pub fn force(&mut self, to: SessionState, reason: ReasonCode) -> Option<SessionTransition> {
        if self.state == to {
            return None;
        }
        Some(self.enter(to, reason))
    }

    fn enter(&mut self, to: SessionState, reason: ReasonCode) -> SessionTransition {
        let from = self.state;
        self.state = to;
        self.watch_idle_bars = 0;
        self.window_bars = 0;
        if to != SessionState::StandDown {
            self.stand_down_until = None;
        }
        info!("SESSION: {} -> {} ({})", from, to, reason);
        SessionTransition { from, to, reason }
    }

    /// Record a 15m close in TransitionWatch. Returns true once the watch has lapsed.
    pub fn watch_bar(&mut self, progressed: bool, config: &SessionConfig) -> bool {
        if self.state != SessionState::TransitionWatch {
            return false;
        }
        if progressed {
            self.watch_idle_bars = 0;
            return false;
        }
        self.watch_idle_bars += 1;
        self.watch_idle_bars >= config.watch_timeout_bars
    }

    /// Record a final 5m close in AcceptanceConfirmed. Returns true once the window has expired.
    pub fn window_bar(&mut self, config: &SessionConfig) -> bool {
        if self.state != SessionState::AcceptanceConfirmed {
            return false;
        }
        self.window_bars += 1;
        self.window_bars >= config.acceptance_window_bars
    }

    /// Restart the acceptance window (a fresh acceptance while already confirmed)
    pub fn restart_window(&mut self) {
        self.window_bars = 0;
    }

    /// Push the StandDown cooldown to at least `now + cooldown`
    pub fn extend_stand_down(&mut self, now: DateTime<Utc>, config: &SessionConfig) {
        let until = now + Duration::minutes(config.stand_down_cooldown_minutes);
        self.stand_down_until = Some(self.stand_down_until.map_or(until, |u| u.max(until)));
    }

    /// StandDown may be left once the cooldown has run out
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::StandDown && self.stand_down_until.map_or(true, |until| now >= until)
    }
}
