//! Acceptance Tracker
//!
//! Counts consecutive final 15-minute closes beyond a trigger, per
//! trigger/direction pair. Four pairs are tracked at all times:
//!
//! - breakout trigger, closes below (reclaim of a failed upside discovery)
//! - breakdown trigger, closes above (reclaim of a failed downside discovery)
//! - breakout trigger, closes above (discovery up)
//! - breakdown trigger, closes below (discovery down)
//!
//! Discovery pairs confirm at `ACCEPTANCE_CLOSES`; reclaim pairs confirm at the
//! configured reclaim threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::candle::{Candle, Timeframe};
use super::levels::{LevelSet, TriggerKind};
use super::regime::Direction;

/// Closes required to accept a move through a trigger
pub const ACCEPTANCE_CLOSES: u32 = 2;

/// The only timeframe that participates in acceptance
pub const ACCEPTANCE_TIMEFRAME: Timeframe = Timeframe::M15;

/// What a counter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterRole {
    /// Closes through the trigger away from balance
    Discovery,
    /// Closes back across the trigger toward balance
    Reclaim,
}

/// Identity of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub trigger: TriggerKind,
    pub direction: Direction,
}

impl CounterKey {
    /// Reclaim pairs come first so a failed discovery is unwound before a
    /// discovery in the other direction is accepted on the same close.
    pub const ALL: [CounterKey; 4] = [
        CounterKey { trigger: TriggerKind::Breakout, direction: Direction::Down },
        CounterKey { trigger: TriggerKind::Breakdown, direction: Direction::Up },
        CounterKey { trigger: TriggerKind::Breakout, direction: Direction::Up },
        CounterKey { trigger: TriggerKind::Breakdown, direction: Direction::Down },
    ];

    pub fn role(&self) -> CounterRole {
        if self.trigger.discovery_direction() == self.direction {
            CounterRole::Discovery
        } else {
            CounterRole::Reclaim
        }
    }

    /// Is `close` strictly beyond `trigger` in this counter's direction?
    fn is_beyond(&self, close: f64, trigger: f64) -> bool {
        match self.direction {
            Direction::Up => close > trigger,
            Direction::Down => close < trigger,
        }
    }
}

/// Consecutive confirming closes for one trigger/direction pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCounter {
    pub key: CounterKey,
    pub consecutive_closes: u32,
    pub last_close_time: Option<DateTime<Utc>>,
}

impl AcceptanceCounter {
    fn new(key: CounterKey) -> Self {
        Self {
            key,
            consecutive_closes: 0,
            last_close_time: None,
        }
    }
}

/// Counter transition emitted by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AcceptanceEventKind {
    /// Counter advanced but has not reached its threshold
    Progressing,
    /// Counter reached its threshold on this close
    Confirmed,
    /// A nonzero counter returned to zero
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceEvent {
    pub key: CounterKey,
    pub kind: AcceptanceEventKind,
    pub count: u32,
    pub close: f64,
    pub close_time: DateTime<Utc>,
}

/// Tracks all four counters for one instrument
#[derive(Debug, Clone)]
pub struct AcceptanceTracker {
    counters: [AcceptanceCounter; 4],
    reclaim_closes: u32,
}

impl AcceptanceTracker {
    pub fn new(reclaim_closes: u32) -> Self {
        Self {
            counters: CounterKey::ALL.map(AcceptanceCounter::new),
            reclaim_closes: reclaim_closes.max(1),
        }
    }

    pub fn threshold(&self, key: CounterKey) -> u32 {
        match key.role() {
            CounterRole::Discovery => ACCEPTANCE_CLOSES,
            CounterRole::Reclaim => self.reclaim_closes,
        }
    }

    pub fn counter(&self, key: CounterKey) -> &AcceptanceCounter {
        let idx = match (key.trigger, key.direction) {
            (TriggerKind::Breakout, Direction::Down) => 0,
            (TriggerKind::Breakdown, Direction::Up) => 1,
            (TriggerKind::Breakout, Direction::Up) => 2,
            (TriggerKind::Breakdown, Direction::Down) => 3,
        };
        &self.counters[idx]
    }

    pub fn counters(&self) -> &[AcceptanceCounter] {
        &self.counters
    }

    /// Feed one final 15-minute candle. Anything else is ignored.
    ///
    /// Events come back in `CounterKey::ALL` order.
    pub fn on_final_candle(&mut self, candle: &Candle, levels: &LevelSet) -> Vec<AcceptanceEvent> {
        if candle.timeframe != ACCEPTANCE_TIMEFRAME || !candle.is_final {
            return Vec::new();
        }

        let mut events = Vec::new();
        for idx in 0..self.counters.len() {
            let key = self.counters[idx].key;
            let threshold = self.threshold(key);
            let trigger = levels.trigger(key.trigger);
            let counter = &mut self.counters[idx];

            counter.last_close_time = Some(candle.close_time);

            let kind = if key.is_beyond(candle.close, trigger) {
                counter.consecutive_closes = counter.consecutive_closes.saturating_add(1);
                if counter.consecutive_closes == threshold {
                    Some(AcceptanceEventKind::Confirmed)
                } else if counter.consecutive_closes < threshold {
                    Some(AcceptanceEventKind::Progressing)
                } else {
                    None
                }
            } else if counter.consecutive_closes > 0 {
                counter.consecutive_closes = 0;
                Some(AcceptanceEventKind::Reset)
            } else {
                None
            };

            if let Some(kind) = kind {
                debug!(
                    "acceptance {:?} {}/{:?}: {:?} ({}/{}) close={:.2} trigger={:.2}",
                    key.role(),
                    key.trigger,
                    key.direction,
                    kind,
                    counter.consecutive_closes,
                    threshold,
                    candle.close,
                    trigger
                );
                events.push(AcceptanceEvent {
                    key,
                    kind,
                    count: counter.consecutive_closes,
                    close: candle.close,
                    close_time: candle.close_time,
                });
            }
        }
        events
    }

    /// Zero every counter without emitting events (re-arm)
    pub fn rearm(&mut self) {
        for counter in &mut self.counters {
            counter.consecutive_closes = 0;
        }
    }

    pub fn reset(&mut self) {
        self.counters = CounterKey::ALL.map(AcceptanceCounter::new);
    }

    /// Largest discovery-counter progress, with its direction
    pub fn discovery_progress(&self) -> Option<(Direction, u32)> {
        self.counters
            .iter()
            .filter(|c| c.key.role() == CounterRole::Discovery && c.consecutive_closes > 0)
            .max_by_key(|c| c.consecutive_closes)
            .map(|c| (c.key.direction, c.consecutive_closes))
    }
}
