//! Regime Classification
//!
//! Determines whether the market is in Balance (rotation around fair value
//! between the triggers) or Discovery (a directional auction accepted beyond a
//! trigger). The regime is derived only from confirmed acceptance events, so a
//! single close, or any intrabar excursion, can never change it.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::acceptance::{AcceptanceEvent, AcceptanceEventKind, CounterRole};
use super::levels::TriggerKind;

/// Direction of a move through a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "regime", content = "direction")]
pub enum RegimeState {
    /// Rotational market between the triggers
    Balance,
    /// Accepted directional auction beyond a trigger
    Discovery(Direction),
}

impl Default for RegimeState {
    fn default() -> Self {
        RegimeState::Balance
    }
}

impl std::fmt::Display for RegimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegimeState::Balance => write!(f, "BALANCE"),
            RegimeState::Discovery(d) => write!(f, "DISCOVERY({})", d),
        }
    }
}

/// A failed discovery that was reclaimed back into balance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReclaimEpisode {
    pub episode_id: Uuid,
    /// Trigger the failed discovery went through
    pub trigger: TriggerKind,
    /// Direction of the discovery that failed
    pub failed_direction: Direction,
    /// 15m closes seen since the reclaim was confirmed
    pub age_bars: u32,
}

/// Regime change produced by an acceptance event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegimeChange {
    DiscoveryAccepted {
        episode_id: Uuid,
        trigger: TriggerKind,
        direction: Direction,
    },
    Reclaimed(ReclaimEpisode),
}

/// Maintains `RegimeState` from acceptance events
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    state: RegimeState,
    /// Trigger and id of the active discovery episode
    discovery: Option<(TriggerKind, Uuid)>,
}

impl RegimeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RegimeState {
        self.state
    }

    pub fn discovery_trigger(&self) -> Option<TriggerKind> {
        self.discovery.map(|(trigger, _)| trigger)
    }

    pub fn reset(&mut self) {
        self.state = RegimeState::Balance;
        self.discovery = None;
    }

    /// Apply acceptance events in order; returns every regime change made
    pub fn apply(&mut self, events: &[AcceptanceEvent]) -> Vec<RegimeChange> {
        let mut changes = Vec::new();

        for event in events {
            if event.kind != AcceptanceEventKind::Confirmed {
                continue;
            }

            match (event.key.role(), self.state) {
                (CounterRole::Discovery, current) => {
                    let direction = event.key.direction;
                    if current == RegimeState::Discovery(direction) {
                        continue;
                    }
                    let episode_id = Uuid::new_v4();
                    self.state = RegimeState::Discovery(direction);
                    self.discovery = Some((event.key.trigger, episode_id));
                    info!(
                        "REGIME: {} -> DISCOVERY({}) via {} close {:.2}",
                        current, direction, event.key.trigger, event.close
                    );
                    changes.push(RegimeChange::DiscoveryAccepted {
                        episode_id,
                        trigger: event.key.trigger,
                        direction,
                    });
                }
                (CounterRole::Reclaim, RegimeState::Discovery(direction)) => {
                    // Only a reclaim across the same trigger the discovery used
                    let Some((trigger, episode_id)) = self.discovery else {
                        continue;
                    };
                    if trigger != event.key.trigger || event.key.direction != direction.opposite() {
                        continue;
                    }
                    self.state = RegimeState::Balance;
                    self.discovery = None;
                    info!(
                        "REGIME: DISCOVERY({}) -> BALANCE, {} reclaimed at {:.2}",
                        direction, trigger, event.close
                    );
                    changes.push(RegimeChange::Reclaimed(ReclaimEpisode {
                        episode_id,
                        trigger,
                        failed_direction: direction,
                        age_bars: 0,
                    }));
                }
                (CounterRole::Reclaim, RegimeState::Balance) => {}
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::acceptance::AcceptanceTracker;
    use crate::regime_core::candle::test_support::candle;
    use crate::regime_core::candle::Timeframe;
    use crate::regime_core::levels::test_support::level_set;

    fn feed(closes: &[f64]) -> (RegimeClassifier, Vec<RegimeChange>) {
        let levels = level_set(100.0, 90.0);
        let mut tracker = AcceptanceTracker::new(2);
        let mut classifier = RegimeClassifier::new();
        let mut changes = Vec::new();
        for (i, close) in closes.iter().enumerate() {
            let events = tracker.on_final_candle(&candle(Timeframe::M15, i as i64, *close), &levels);
            changes.extend(classifier.apply(&events));
        }
        (classifier, changes)
    }

    #[test]
    fn test_single_excursion_stays_balance() {
        let (classifier, changes) = feed(&[101.0, 99.0]);
        assert_eq!(classifier.state(), RegimeState::Balance);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_two_closes_enter_discovery_up() {
        let (classifier, changes) = feed(&[101.0, 102.0]);
        assert_eq!(classifier.state(), RegimeState::Discovery(Direction::Up));
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            RegimeChange::DiscoveryAccepted { direction: Direction::Up, trigger: TriggerKind::Breakout, .. }
        ));
    }

    #[test]
    fn test_breakdown_enters_discovery_down() {
        let (classifier, _) = feed(&[89.0, 88.5]);
        assert_eq!(classifier.state(), RegimeState::Discovery(Direction::Down));
    }

    #[test]
    fn test_reclaim_returns_to_balance() {
        let (classifier, changes) = feed(&[101.0, 102.0, 99.0, 98.0]);
        assert_eq!(classifier.state(), RegimeState::Balance);
        assert!(matches!(
            changes.last(),
            Some(RegimeChange::Reclaimed(ReclaimEpisode { failed_direction: Direction::Up, .. }))
        ));
    }

    #[test]
    fn test_oscillation_around_trigger_never_changes_regime() {
        let (classifier, changes) = feed(&[101.0, 99.0, 101.0, 99.0, 100.5, 99.5]);
        assert_eq!(classifier.state(), RegimeState::Balance);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_full_reversal_reclaims_then_discovers_down() {
        let (classifier, changes) = feed(&[101.0, 102.0, 89.0, 88.0]);
        assert_eq!(classifier.state(), RegimeState::Discovery(Direction::Down));
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[1], RegimeChange::Reclaimed(_)));
    }
}
