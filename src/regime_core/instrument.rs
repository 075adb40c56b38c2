//! Per-instrument engine
//!
//! Owns every piece of state for one instrument and processes one event at a
//! time. Each event either is rejected with state untouched, or runs to
//! completion and yields an `EngineUpdate`.
//!
//! Processing order for a candle:
//! 1. validation and ordering (rejections happen here, before any mutation)
//! 2. session boundary
//! 3. Execution Guard (5m only, always first)
//! 4. acceptance, regime, session progression (15m final only, not while executing)
//! 5. risk flags, then permission, then invariant checks

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;

use super::acceptance::{AcceptanceEvent, AcceptanceEventKind, AcceptanceTracker, CounterKey, CounterRole, ACCEPTANCE_CLOSES};
use super::alignment::{self, HtfBias, MarketView};
use super::calendar::{SessionCalendar, SessionPhase};
use super::candle::{Candle, Timeframe};
use super::compression::{CompressionDetector, RangeCompression};
use super::error::EngineError;
use super::events::{
    AcceptanceProgress, Alarm, Directive, EngineEvent, EngineOutput, EngineUpdate, PositionUpdate, ReasonCode,
    TransitionRecord,
};
use super::guard::{self, ForceExit, PositionState};
use super::indicators::RollingEma;
use super::levels::{LevelSet, MovingAverageUpdate, MovingAverages};
use super::permission::{self, PermissionInput, Strategy};
use super::regime::{Direction, ReclaimEpisode, RegimeChange, RegimeClassifier, RegimeState};
use super::risk::{RiskFlagUpdate, RiskFlags};
use super::session::{SessionMachine, SessionState, SessionTransition};

/// Accumulates the side effects of one event
#[derive(Default)]
struct Step {
    records: Vec<TransitionRecord>,
    force_exit: Option<ForceExit>,
    alarms: Vec<Alarm>,
}

#[derive(Debug)]
pub struct InstrumentEngine {
    instrument: String,
    config: EngineConfig,
    detector: Box<dyn CompressionDetector>,
    calendar: SessionCalendar,

    levels: Option<LevelSet>,
    averages: BTreeMap<Timeframe, MovingAverages>,
    ema_5m: RollingEma,
    candles_5m: Vec<Candle>,
    candles_15m: Vec<Candle>,
    last_price: Option<f64>,

    tracker: AcceptanceTracker,
    classifier: RegimeClassifier,
    session: SessionMachine,
    reclaim: Option<ReclaimEpisode>,
    permitted: Option<Strategy>,
    /// Strategy under which the current ExecutionActive entry was taken
    active_strategy: Option<Strategy>,
    forced_exit_pending: bool,
    position: Option<PositionState>,
    risk: RiskFlags,

    last_final: BTreeMap<Timeframe, DateTime<Utc>>,
    last_tick: BTreeMap<Timeframe, DateTime<Utc>>,
    now: Option<DateTime<Utc>>,
    trading_day: Option<NaiveDate>,

    /// Output as of the last recorded sub-step
    published: EngineOutput,
}

impl InstrumentEngine {
    pub fn new(instrument: &str, config: EngineConfig) -> Self {
        let detector = Box::new(RangeCompression::new(config.compression.clone()));
        Self::with_detector(instrument, config, detector)
    }

    pub fn with_detector(instrument: &str, config: EngineConfig, detector: Box<dyn CompressionDetector>) -> Self {
        Self {
            instrument: instrument.to_string(),
            calendar: SessionCalendar::new(config.session_preset),
            tracker: AcceptanceTracker::new(config.reclaim_closes),
            detector,
            levels: None,
            averages: BTreeMap::new(),
            ema_5m: RollingEma::new(21),
            candles_5m: Vec::new(),
            candles_15m: Vec::new(),
            last_price: None,
            classifier: RegimeClassifier::new(),
            session: SessionMachine::new(),
            reclaim: None,
            permitted: None,
            active_strategy: None,
            forced_exit_pending: false,
            position: None,
            risk: RiskFlags::default(),
            last_final: BTreeMap::new(),
            last_tick: BTreeMap::new(),
            now: None,
            trading_day: None,
            published: EngineOutput::initial(instrument, ACCEPTANCE_CLOSES),
            config,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn output(&self) -> &EngineOutput {
        &self.published
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn regime(&self) -> RegimeState {
        self.classifier.state()
    }

    pub fn permitted_strategy(&self) -> Option<Strategy> {
        self.permitted
    }

    pub fn reclaim_episode(&self) -> Option<&ReclaimEpisode> {
        self.reclaim.as_ref()
    }

    pub fn position(&self) -> Option<&PositionState> {
        self.position.as_ref()
    }

    pub fn levels(&self) -> Option<&LevelSet> {
        self.levels.as_ref()
    }

    pub fn tracker(&self) -> &AcceptanceTracker {
        &self.tracker
    }

    pub fn ema21_5m(&self) -> Option<f64> {
        self.ema_5m.value()
    }

    /// Process one event to completion
    pub fn handle(&mut self, event: &EngineEvent) -> Result<EngineUpdate, EngineError> {
        let mut step = Step::default();

        let result = match event {
            EngineEvent::Candle(candle) => self.on_candle(candle, &mut step),
            EngineEvent::Levels(levels) => self.on_levels(levels, &mut step),
            EngineEvent::MovingAverages(update) => self.on_moving_averages(update, &mut step),
            EngineEvent::RiskFlags(update) => {
                self.on_risk_flags(update, &mut step);
                Ok(())
            }
            EngineEvent::Position(update) => self.on_position(update, &mut step),
            EngineEvent::Clock(ts) => {
                self.advance_clock(*ts, &mut step);
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!("{}: rejected {} event: {}", self.instrument, event.kind(), err);
            return Err(err);
        }

        self.settle(&mut step);

        Ok(EngineUpdate {
            records: step.records,
            force_exit: step.force_exit,
            alarms: step.alarms,
            output: self.published.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    fn on_candle(&mut self, candle: &Candle, step: &mut Step) -> Result<(), EngineError> {
        candle.validate()?;
        self.check_order(candle)?;

        if candle.is_final {
            self.last_final.insert(candle.timeframe, candle.close_time);
        } else {
            self.last_tick.insert(candle.timeframe, candle.close_time);
        }

        self.advance_clock(candle.close_time, step);
        self.last_price = Some(candle.close);

        match candle.timeframe {
            Timeframe::M5 => self.on_five_minute(candle, step),
            Timeframe::M15 if candle.is_final => self.on_fifteen_minute(candle, step),
            _ => {}
        }
        Ok(())
    }

    fn check_order(&self, candle: &Candle) -> Result<(), EngineError> {
        let tf = candle.timeframe;
        let ts = candle.close_time;

        if let Some(&last) = self.last_final.get(&tf) {
            if candle.is_final && ts == last {
                return Err(EngineError::DuplicateCandle {
                    timeframe: tf,
                    close_time: ts,
                });
            }
            if ts <= last {
                return Err(EngineError::OutOfOrder {
                    timeframe: tf,
                    close_time: ts,
                    last,
                });
            }
        }
        // Ticks of the same bar may repeat a close time, but never go back
        if let Some(&last) = self.last_tick.get(&tf) {
            if ts < last {
                return Err(EngineError::OutOfOrder {
                    timeframe: tf,
                    close_time: ts,
                    last,
                });
            }
        }
        Ok(())
    }

    fn on_five_minute(&mut self, candle: &Candle, step: &mut Step) {
        self.run_guard(candle, step);

        if !candle.is_final {
            return;
        }

        self.candles_5m.push(candle.clone());
        trim_history(&mut self.candles_5m, self.config.history_5m);
        self.ema_5m.update(candle.close);

        if self.session.window_bar(&self.config.session) {
            info!(
                "{}: acceptance window of {} 5m closes expired without an entry",
                self.instrument, self.config.session.acceptance_window_bars
            );
            self.transition(SessionState::Observation, ReasonCode::AcceptanceWindowExpired, step);
        }
    }

    fn run_guard(&mut self, candle: &Candle, step: &mut Step) {
        if self.forced_exit_pending {
            return;
        }
        let Some(position) = self.position else {
            return;
        };
        // The EMA is compared before this close rolls it forward
        let Some(exit) = guard::on_candle_close(
            candle,
            &position,
            self.ema_5m.value(),
            self.config.guard_on_intrabar,
        ) else {
            return;
        };

        self.forced_exit_pending = true;
        self.permitted = None;
        step.force_exit = Some(exit);

        if self.session.state() == SessionState::StandDown {
            self.record(ReasonCode::EmaKillSwitch, step);
        } else if self.session.state() == SessionState::Observation {
            self.resolve_step(ReasonCode::EmaKillSwitch, step);
        } else {
            self.transition(SessionState::Observation, ReasonCode::EmaKillSwitch, step);
        }
    }

    fn on_fifteen_minute(&mut self, candle: &Candle, step: &mut Step) {
        self.candles_15m.push(candle.clone());
        trim_history(&mut self.candles_15m, self.config.history_15m);

        if self.session.state() == SessionState::ExecutionActive {
            return;
        }
        if !self.in_session(candle) {
            debug!(
                "{}: 15m close at {} outside the active session, acceptance not evaluated",
                self.instrument, candle.close_time
            );
            return;
        }
        let Some(levels) = self.levels.as_ref() else {
            debug!("{}: 15m close before any level set, acceptance not evaluated", self.instrument);
            return;
        };

        let events = self.tracker.on_final_candle(candle, levels);
        let compression = self.detector.detect(&self.candles_15m, levels);
        let near_center = (candle.close - levels.range_center()).abs()
            <= levels.trigger_span() * self.config.session.center_band;

        let pressure = events
            .iter()
            .any(|e| e.kind != AcceptanceEventKind::Reset && self.is_relevant(e));
        let relevant_reset = events
            .iter()
            .any(|e| e.kind == AcceptanceEventKind::Reset && self.is_relevant(e));

        self.age_reclaim(step);

        let changes = self.classifier.apply(&events);
        for change in &changes {
            self.on_regime_change(change, step);
        }
        if !changes.is_empty() {
            return;
        }

        match self.session.state() {
            SessionState::Observation => {
                if pressure {
                    self.transition(SessionState::TransitionWatch, ReasonCode::TriggerPressure, step);
                } else if let Some(signal) = compression {
                    info!(
                        "{}: compression at {} trigger (range ratio {:.2}, {:.2} away)",
                        self.instrument, signal.trigger, signal.range_ratio, signal.distance
                    );
                    self.transition(SessionState::TransitionWatch, ReasonCode::CompressionDetected, step);
                }
            }
            SessionState::TransitionWatch => {
                let lapsed = self.session.watch_bar(pressure, &self.config.session);
                if relevant_reset && near_center {
                    self.transition(SessionState::Observation, ReasonCode::ReturnedToRangeCenter, step);
                } else if lapsed {
                    self.transition(SessionState::Observation, ReasonCode::WatchExpired, step);
                }
            }
            _ => {}
        }
    }

    /// Does this counter bear on the current regime?
    ///
    /// Discovery counters matter unless they extend the discovery already
    /// accepted; reclaim counters only matter against an active discovery
    /// through the same trigger.
    fn is_relevant(&self, event: &AcceptanceEvent) -> bool {
        let key: CounterKey = event.key;
        match (key.role(), self.classifier.state()) {
            (CounterRole::Discovery, RegimeState::Discovery(d)) => d != key.direction,
            (CounterRole::Discovery, RegimeState::Balance) => true,
            (CounterRole::Reclaim, RegimeState::Discovery(d)) => {
                self.classifier.discovery_trigger() == Some(key.trigger) && key.direction == d.opposite()
            }
            (CounterRole::Reclaim, RegimeState::Balance) => false,
        }
    }

    fn age_reclaim(&mut self, step: &mut Step) {
        let Some(episode) = self.reclaim.as_mut() else {
            return;
        };
        episode.age_bars += 1;
        if episode.age_bars > self.config.session.reclaim_window_bars {
            info!(
                "{}: reclaim of failed {} discovery expired after {} 15m closes",
                self.instrument, episode.failed_direction, episode.age_bars
            );
            self.reclaim = None;
            self.resolve_step(ReasonCode::ReclaimWindowExpired, step);
        }
    }

    fn on_regime_change(&mut self, change: &RegimeChange, step: &mut Step) {
        let (direction, reason) = match change {
            RegimeChange::DiscoveryAccepted { direction, .. } => {
                self.reclaim = None;
                (*direction, ReasonCode::AcceptanceConfirmed2Close)
            }
            RegimeChange::Reclaimed(episode) => {
                self.reclaim = Some(*episode);
                (episode.failed_direction.opposite(), ReasonCode::ReclaimConfirmed)
            }
        };

        // One record per change, carrying `reason`, taken after the session edge
        match self.session.state() {
            SessionState::Observation => {
                if self.shift(SessionState::TransitionWatch, reason, step) {
                    self.confirm_acceptance(direction, reason, step);
                }
            }
            SessionState::TransitionWatch => self.confirm_acceptance(direction, reason, step),
            SessionState::AcceptanceConfirmed => {
                self.session.restart_window();
                self.resolve_step(reason, step);
            }
            SessionState::ExecutionActive | SessionState::StandDown => self.resolve_step(reason, step),
        }
    }

    fn confirm_acceptance(&mut self, direction: Direction, reason: ReasonCode, step: &mut Step) {
        if self.htf_bias().is_some_and(|bias| bias.opposes(direction)) {
            info!(
                "{}: acceptance {} held in TransitionWatch, HTF bias in direct conflict",
                self.instrument, direction
            );
            self.session.watch_bar(true, &self.config.session);
            self.resolve_step(reason, step);
            return;
        }
        if !self.transition(SessionState::AcceptanceConfirmed, reason, step) {
            self.resolve_step(reason, step);
        }
    }

    fn on_levels(&mut self, levels: &LevelSet, step: &mut Step) -> Result<(), EngineError> {
        levels.validate()?;
        if levels.instrument != self.instrument {
            return Err(EngineError::WrongInstrument {
                expected: self.instrument.clone(),
                got: levels.instrument.clone(),
            });
        }
        if let Some(current) = &self.levels {
            if levels.session_date < current.session_date {
                return Err(EngineError::StaleLevels {
                    session_date: levels.session_date,
                    current: current.session_date,
                });
            }
        }

        let correction = self
            .levels
            .as_ref()
            .is_some_and(|current| current.session_date == levels.session_date);

        for (tf, values) in &levels.moving_averages {
            self.merge_averages(*tf, values);
        }
        self.levels = Some(levels.clone());

        if correction {
            info!(
                "{}: level correction for {} (BO {:.2} / BD {:.2})",
                self.instrument, levels.session_date, levels.breakout_trigger, levels.breakdown_trigger
            );
            return Ok(());
        }

        info!(
            "{}: levels for {} (BO {:.2} / BD {:.2}, support {:.2}, resistance {:.2})",
            self.instrument,
            levels.session_date,
            levels.breakout_trigger,
            levels.breakdown_trigger,
            levels.daily_support,
            levels.daily_resistance
        );

        // A new session that the clock has not already rolled into
        if self.trading_day.is_some_and(|day| levels.session_date > day) {
            self.trading_day = Some(levels.session_date);
            self.session_reset(step);
        }
        Ok(())
    }

    fn on_moving_averages(&mut self, update: &MovingAverageUpdate, step: &mut Step) -> Result<(), EngineError> {
        for (name, value) in [("ema21", update.values.ema21), ("sma200", update.values.sma200)] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(EngineError::MalformedAverages {
                        timeframe: update.timeframe,
                        reason: format!("{} = {}", name, v),
                    });
                }
            }
        }

        self.advance_clock(update.as_of, step);
        self.merge_averages(update.timeframe, &update.values);
        Ok(())
    }

    fn merge_averages(&mut self, timeframe: Timeframe, values: &MovingAverages) {
        let entry = self.averages.entry(timeframe).or_default();
        if values.ema21.is_some() {
            entry.ema21 = values.ema21;
        }
        if values.sma200.is_some() {
            entry.sma200 = values.sma200;
        }
        if timeframe == Timeframe::M5 {
            if let Some(ema) = values.ema21 {
                self.ema_5m.seed(ema);
            }
        }
    }

    fn on_risk_flags(&mut self, update: &RiskFlagUpdate, step: &mut Step) {
        self.advance_clock(update.timestamp, step);

        let was_active = self.risk.any();
        self.risk = update.flags;

        if self.risk.any() {
            warn!("{}: risk flags raised {:?}", self.instrument, self.risk);
        } else if was_active {
            info!("{}: risk flags cleared", self.instrument);
            if self.session.state() == SessionState::StandDown {
                // Cooldown runs from the moment the last flag clears
                let now = self.clock();
                self.session.extend_stand_down(now, &self.config.session);
            }
        }
    }

    fn on_position(&mut self, update: &PositionUpdate, step: &mut Step) -> Result<(), EngineError> {
        if !update.entry_price.is_finite() || (update.is_open && update.entry_price <= 0.0) {
            return Err(EngineError::MalformedPosition {
                reason: format!("entry price {}", update.entry_price),
            });
        }

        self.advance_clock(update.timestamp, step);

        let was_open = self.position.is_some_and(|p| p.is_open);
        self.position = Some(update.state());

        if !was_open && update.is_open {
            self.on_entry(update, step);
        } else if was_open && !update.is_open {
            info!("{}: {} position closed", self.instrument, update.direction);
            self.forced_exit_pending = false;
            if self.session.state() == SessionState::ExecutionActive {
                self.transition(SessionState::Observation, ReasonCode::PositionClosed, step);
            } else {
                self.resolve_step(ReasonCode::PositionClosed, step);
            }
        }
        Ok(())
    }

    fn on_entry(&mut self, update: &PositionUpdate, step: &mut Step) {
        match (self.session.state(), self.permitted) {
            (SessionState::AcceptanceConfirmed, Some(strategy)) => {
                info!(
                    "{}: {} entry at {:.2} under {}",
                    self.instrument, update.direction, update.entry_price, strategy
                );
                self.active_strategy = Some(strategy);
                if strategy == Strategy::SnapbackReclaim {
                    self.reclaim = None;
                }
                self.transition(SessionState::ExecutionActive, ReasonCode::EntryTaken, step);
            }
            (state, permitted) => {
                warn!(
                    "{}: {} position opened outside an execution grant (session {}, permitted {:?}); guard only",
                    self.instrument, update.direction, state, permitted
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Clock and session boundary
    // ------------------------------------------------------------------

    fn advance_clock(&mut self, ts: DateTime<Utc>, step: &mut Step) {
        if self.now.is_some_and(|now| ts <= now) {
            return;
        }
        self.now = Some(ts);

        let day = self.calendar.session_date(ts);
        match self.trading_day {
            None => self.trading_day = Some(day),
            Some(current) if day > current => {
                info!(
                    "{}: {} session open, new trading day {}",
                    self.instrument,
                    self.calendar.preset(),
                    day
                );
                self.trading_day = Some(day);
                self.session_reset(step);
            }
            Some(_) => {}
        }
    }

    fn phase(&self) -> SessionPhase {
        self.calendar.phase(self.clock())
    }

    /// Bar lies wholly inside the active part of its session
    fn in_session(&self, candle: &Candle) -> bool {
        self.calendar.phase(candle.open_time) == SessionPhase::Active
            && self.calendar.phase(candle.close_time) == SessionPhase::Active
    }

    /// Timestamp used on records
    fn clock(&self) -> DateTime<Utc> {
        self.now
            .or_else(|| {
                self.levels
                    .as_ref()
                    .and_then(|l| self.calendar.session_open(l.session_date))
            })
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn session_reset(&mut self, step: &mut Step) {
        self.tracker.reset();
        self.classifier.reset();
        self.reclaim = None;

        if self.session.state() == SessionState::StandDown {
            self.resolve_step(ReasonCode::SessionReset, step);
        } else if !self.transition(SessionState::Observation, ReasonCode::SessionReset, step) {
            self.resolve_step(ReasonCode::SessionReset, step);
        }
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    fn settle(&mut self, step: &mut Step) {
        self.apply_risk(step);

        let before = self.published.permitted_strategy;
        if let Err(err) = self.refresh_permission() {
            self.fault(err, step);
        } else {
            let reason = if before.is_some() && self.permitted.is_none() {
                ReasonCode::StrategyWithdrawn
            } else {
                ReasonCode::StrategyGranted
            };
            self.record(reason, step);
        }

        if let Some(violation) = self.invariant_violation() {
            self.fault(EngineError::InvariantViolation(violation), step);
            // Flags still stand after a fault
            self.apply_risk(step);
        }

        self.published = self.snapshot();
    }

    fn apply_risk(&mut self, step: &mut Step) {
        let now = self.clock();
        if let Some(reason) = self.risk.primary_reason() {
            if self.session.state() != SessionState::StandDown {
                self.transition(SessionState::StandDown, reason, step);
            }
            self.session.extend_stand_down(now, &self.config.session);
        } else if self.session.cooldown_elapsed(now) {
            self.transition(SessionState::Observation, ReasonCode::CooldownElapsed, step);
        }
    }

    /// Take a session edge and record it; returns whether the state changed
    fn transition(&mut self, to: SessionState, reason: ReasonCode, step: &mut Step) -> bool {
        let changed = self.shift(to, reason, step);
        if changed {
            self.resolve_step(reason, step);
        }
        changed
    }

    /// Take a session edge without recording it. The caller records once the
    /// whole step has settled.
    fn shift(&mut self, to: SessionState, reason: ReasonCode, step: &mut Step) -> bool {
        match self.session.transition(to, reason) {
            Ok(Some(change)) => {
                self.on_enter(&change);
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.fault(err, step);
                false
            }
        }
    }

    fn on_enter(&mut self, change: &SessionTransition) {
        if change.from == SessionState::ExecutionActive {
            self.active_strategy = None;
            self.tracker.rearm();
        }
        if change.to == SessionState::StandDown {
            self.active_strategy = None;
            self.permitted = None;
        }
        if change.from == SessionState::StandDown {
            self.tracker.rearm();
        }
    }

    /// Recompute permission, then record the sub-step
    fn resolve_step(&mut self, reason: ReasonCode, step: &mut Step) {
        match self.refresh_permission() {
            Ok(()) => self.record(reason, step),
            Err(err) => self.fault(err, step),
        }
    }

    fn refresh_permission(&mut self) -> Result<(), EngineError> {
        // Cleared first: a stale grant never survives a failed resolution
        self.permitted = None;

        if self.session.state() == SessionState::ExecutionActive {
            self.permitted = if self.forced_exit_pending {
                None
            } else {
                self.active_strategy
            };
            return Ok(());
        }
        if self.levels.is_none() || self.phase() != SessionPhase::Active {
            return Ok(());
        }

        let h1 = self.averages.get(&Timeframe::H1).copied().unwrap_or_default();
        let h4 = self.averages.get(&Timeframe::H4).copied().unwrap_or_default();
        let view = MarketView {
            price: self.last_price,
            ema21_5m: self.ema_5m.value(),
            h1,
            h4,
            candles_5m: &self.candles_5m,
        };

        let regime = self.classifier.state();
        let snapshot = match regime {
            RegimeState::Discovery(direction) => Some(alignment::evaluate(&view, direction, &self.config.alignment)),
            RegimeState::Balance => None,
        };
        let htf_bias = self.htf_bias();

        let set = permission::resolve(&PermissionInput {
            session: self.session.state(),
            regime,
            alignment: snapshot.as_ref(),
            htf_bias,
            reclaim: self.reclaim.as_ref(),
            forced_exit_pending: self.forced_exit_pending,
        })?;

        self.permitted = set.get();
        Ok(())
    }

    fn htf_bias(&self) -> Option<HtfBias> {
        let price = self.last_price?;
        let h1 = self.averages.get(&Timeframe::H1)?;
        let h4 = self.averages.get(&Timeframe::H4)?;
        alignment::htf_bias(price, h1, h4)
    }

    /// Append a transition record when any recorded output field changed
    fn record(&mut self, reason: ReasonCode, step: &mut Step) {
        let output = self.snapshot();
        if output.differs_from(&self.published) {
            let record = TransitionRecord {
                timestamp: self.clock(),
                instrument: self.instrument.clone(),
                from_state: self.published.session_state,
                to_state: output.session_state,
                regime: output.regime,
                permitted_strategy: output.permitted_strategy,
                forced_exit_pending: output.forced_exit_pending,
                reason,
            };
            debug!("{}: record {:?}", self.instrument, record);
            step.records.push(record);
        }
        self.published = output;
    }

    fn invariant_violation(&self) -> Option<String> {
        let state = self.session.state();
        let regime = self.classifier.state();
        let position_open = self.position.is_some_and(|p| p.is_open);

        if state == SessionState::StandDown && self.permitted.is_some() {
            return Some(format!("{:?} permitted during StandDown", self.permitted));
        }
        if state != SessionState::ExecutionActive && self.permitted.is_some() && self.phase() != SessionPhase::Active {
            return Some(format!("{:?} permitted outside the active session", self.permitted));
        }
        if self.forced_exit_pending && self.permitted.is_some() {
            return Some(format!("{:?} permitted with a forced exit pending", self.permitted));
        }
        if state == SessionState::ExecutionActive && (!position_open || self.active_strategy.is_none()) {
            return Some(format!(
                "ExecutionActive with position open = {} and strategy {:?}",
                position_open, self.active_strategy
            ));
        }
        match self.permitted {
            Some(Strategy::CoreTriggerPullback)
                if !matches!(regime, RegimeState::Discovery(_))
                    || !matches!(state, SessionState::AcceptanceConfirmed | SessionState::ExecutionActive) =>
            {
                Some(format!("CoreTriggerPullback permitted in {} / {}", regime, state))
            }
            Some(Strategy::RangeToTriggerTransition) if regime != RegimeState::Balance => {
                Some(format!("RangeToTriggerTransition permitted in {}", regime))
            }
            _ => None,
        }
    }

    /// Reset to Observation/Balance, emit an InvariantFault record and an alarm
    fn fault(&mut self, err: EngineError, step: &mut Step) {
        error!("{}: INVARIANT FAULT: {}; resetting to Observation/Balance", self.instrument, err);

        self.tracker.reset();
        self.classifier.reset();
        self.reclaim = None;
        self.permitted = None;
        self.active_strategy = None;
        self.session.force(SessionState::Observation, ReasonCode::InvariantFault);

        let timestamp = self.clock();
        let output = self.snapshot();
        step.records.push(TransitionRecord {
            timestamp,
            instrument: self.instrument.clone(),
            from_state: self.published.session_state,
            to_state: output.session_state,
            regime: output.regime,
            permitted_strategy: output.permitted_strategy,
            forced_exit_pending: output.forced_exit_pending,
            reason: ReasonCode::InvariantFault,
        });
        step.alarms.push(Alarm {
            timestamp,
            instrument: self.instrument.clone(),
            message: err.to_string(),
        });
        self.published = output;
    }

    fn snapshot(&self) -> EngineOutput {
        let acceptance = match self.tracker.discovery_progress() {
            Some((direction, count)) if self.classifier.state() != RegimeState::Discovery(direction) => {
                AcceptanceProgress {
                    direction: Some(direction),
                    count: count.min(ACCEPTANCE_CLOSES),
                    required: ACCEPTANCE_CLOSES,
                }
            }
            _ => AcceptanceProgress {
                direction: None,
                count: 0,
                required: ACCEPTANCE_CLOSES,
            },
        };

        let state = self.session.state();
        let directive = if self.forced_exit_pending {
            Directive::Exit
        } else if state == SessionState::StandDown {
            Directive::StandDown
        } else if self.permitted.is_some() {
            Directive::Go
        } else if matches!(state, SessionState::TransitionWatch | SessionState::AcceptanceConfirmed)
            || acceptance.count > 0
        {
            Directive::Wait
        } else {
            Directive::HoldFire
        };

        EngineOutput {
            instrument: self.instrument.clone(),
            session_state: state,
            session_phase: self.phase(),
            regime: self.classifier.state(),
            permitted_strategy: self.permitted,
            forced_exit_pending: self.forced_exit_pending,
            reclaim_pending: self.reclaim.is_some(),
            acceptance,
            directive,
            as_of: self.now,
        }
    }
}

fn trim_history(candles: &mut Vec<Candle>, cap: usize) {
    if candles.len() > cap {
        let excess = candles.len() - cap;
        candles.drain(..excess);
    }
}
