//! Strategy Permission Resolver
//!
//! Grants at most one strategy. Resolution always starts from an empty set, so
//! a previous grant never survives a change of inputs by accident.

use serde::{Deserialize, Serialize};

use super::alignment::{AlignmentSnapshot, HtfBias};
use super::error::EngineError;
use super::regime::{ReclaimEpisode, RegimeState};
use super::session::SessionState;

/// The three permitted playbooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Pullback toward the 5m 21 EMA after accepted discovery
    CoreTriggerPullback,
    /// Fade of a failed discovery after its trigger is reclaimed
    SnapbackReclaim,
    /// Rotation from range interior toward a trigger while balanced
    RangeToTriggerTransition,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::CoreTriggerPullback,
        Strategy::SnapbackReclaim,
        Strategy::RangeToTriggerTransition,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Strategy::CoreTriggerPullback => "core_trigger_pullback",
            Strategy::SnapbackReclaim => "snapback_reclaim",
            Strategy::RangeToTriggerTransition => "range_to_trigger",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CoreTriggerPullback => "Core Trigger Pullback",
            Strategy::SnapbackReclaim => "Snapback / Reclaim",
            Strategy::RangeToTriggerTransition => "Range-to-Trigger Transition",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Strategy::CoreTriggerPullback => {
                "Two 15m closes beyond a trigger, HTF aligned, enter on the 5m pullback toward the 21 EMA"
            }
            Strategy::SnapbackReclaim => {
                "Failed breakout reclaimed by two 15m closes back inside, target the opposite side of the range"
            }
            Strategy::RangeToTriggerTransition => {
                "Balanced day, trade from range interior toward a trigger and stand aside at the trigger"
            }
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Catalogue entry for presentation layers
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub strategy: Strategy,
    pub id: &'static str,
    pub name: &'static str,
    pub summary: &'static str,
}

pub fn catalogue() -> Vec<StrategyInfo> {
    Strategy::ALL
        .iter()
        .map(|s| StrategyInfo {
            strategy: *s,
            id: s.id(),
            name: s.name(),
            summary: s.summary(),
        })
        .collect()
}

/// Permitted strategies; never more than one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySet(Option<Strategy>);

impl StrategySet {
    pub fn empty() -> Self {
        StrategySet(None)
    }

    pub fn single(strategy: Strategy) -> Self {
        StrategySet(Some(strategy))
    }

    pub fn get(&self) -> Option<Strategy> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn len(&self) -> usize {
        usize::from(self.0.is_some())
    }

    pub fn contains(&self, strategy: Strategy) -> bool {
        self.0 == Some(strategy)
    }
}

/// Everything resolution depends on
#[derive(Debug, Clone, Copy)]
pub struct PermissionInput<'a> {
    pub session: SessionState,
    pub regime: RegimeState,
    /// Alignment for the discovery direction, when in Discovery
    pub alignment: Option<&'a AlignmentSnapshot>,
    /// Current HTF bias; `None` when the averages are not known
    pub htf_bias: Option<HtfBias>,
    pub reclaim: Option<&'a ReclaimEpisode>,
    pub forced_exit_pending: bool,
}

fn core_candidate(input: &PermissionInput<'_>) -> bool {
    let RegimeState::Discovery(direction) = input.regime else {
        return false;
    };
    if input.session != SessionState::AcceptanceConfirmed {
        return false;
    }
    let Some(alignment) = input.alignment else {
        return false;
    };
    alignment.direction == direction
        && alignment.data_complete
        && !alignment.htf_bias.opposes(direction)
        && alignment.stochastic_reset
        && alignment.ltf_structure_valid
}

fn snapback_candidate(input: &PermissionInput<'_>) -> bool {
    let Some(episode) = input.reclaim else {
        return false;
    };
    let Some(bias) = input.htf_bias else {
        return false;
    };
    matches!(
        input.session,
        SessionState::Observation | SessionState::TransitionWatch | SessionState::AcceptanceConfirmed
    ) && !bias.supports(episode.failed_direction)
}

fn range_candidate(input: &PermissionInput<'_>) -> bool {
    input.regime == RegimeState::Balance
        && matches!(input.session, SessionState::Observation | SessionState::TransitionWatch)
        && input.reclaim.is_none()
}

/// Resolve the permitted set for the current inputs.
///
/// More than one qualifying candidate is an invariant violation; the caller
/// treats it as a fault rather than picking one.
pub fn resolve(input: &PermissionInput<'_>) -> Result<StrategySet, EngineError> {
    if input.session == SessionState::StandDown || input.forced_exit_pending {
        return Ok(StrategySet::empty());
    }

    let candidates: Vec<Strategy> = [
        (Strategy::CoreTriggerPullback, core_candidate(input)),
        (Strategy::SnapbackReclaim, snapback_candidate(input)),
        (Strategy::RangeToTriggerTransition, range_candidate(input)),
    ]
    .into_iter()
    .filter_map(|(strategy, ok)| ok.then_some(strategy))
    .collect();

    match candidates.as_slice() {
        [] => Ok(StrategySet::empty()),
        [only] => Ok(StrategySet::single(*only)),
        many => Err(EngineError::InvariantViolation(format!(
            "{} strategies qualified at once: {:?}",
            many.len(),
            many
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::alignment::EmaPosition;
    use crate::regime_core::levels::TriggerKind;
    use crate::regime_core::regime::Direction;
    use uuid::Uuid;

    fn aligned(direction: Direction, htf_bias: HtfBias) -> AlignmentSnapshot {
        AlignmentSnapshot {
            direction,
            htf_bias,
            stochastic_reset: true,
            ltf_structure_valid: true,
            ema_position: EmaPosition::Aligned,
            data_complete: true,
            stochastic: None,
        }
    }

    fn episode(failed_direction: Direction) -> ReclaimEpisode {
        ReclaimEpisode {
            episode_id: Uuid::new_v4(),
            trigger: TriggerKind::Breakout,
            failed_direction,
            age_bars: 0,
        }
    }

    fn input<'a>(session: SessionState, regime: RegimeState) -> PermissionInput<'a> {
        PermissionInput {
            session,
            regime,
            alignment: None,
            htf_bias: Some(HtfBias::Neutral),
            reclaim: None,
            forced_exit_pending: false,
        }
    }

    #[test]
    fn test_core_granted_when_aligned() {
        let snap = aligned(Direction::Up, HtfBias::Bull);
        let mut i = input(SessionState::AcceptanceConfirmed, RegimeState::Discovery(Direction::Up));
        i.alignment = Some(&snap);
        assert_eq!(resolve(&i).unwrap(), StrategySet::single(Strategy::CoreTriggerPullback));
    }

    #[test]
    fn test_core_denied_against_htf() {
        let snap = aligned(Direction::Up, HtfBias::Bear);
        let mut i = input(SessionState::AcceptanceConfirmed, RegimeState::Discovery(Direction::Up));
        i.alignment = Some(&snap);
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_core_denied_with_incomplete_data() {
        let mut snap = aligned(Direction::Down, HtfBias::Neutral);
        snap.data_complete = false;
        let mut i = input(SessionState::AcceptanceConfirmed, RegimeState::Discovery(Direction::Down));
        i.alignment = Some(&snap);
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_core_needs_acceptance_state() {
        let snap = aligned(Direction::Up, HtfBias::Bull);
        let mut i = input(SessionState::TransitionWatch, RegimeState::Discovery(Direction::Up));
        i.alignment = Some(&snap);
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_range_in_balance() {
        let i = input(SessionState::Observation, RegimeState::Balance);
        assert_eq!(resolve(&i).unwrap().get(), Some(Strategy::RangeToTriggerTransition));

        let i = input(SessionState::AcceptanceConfirmed, RegimeState::Balance);
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_snapback_replaces_range_while_reclaim_pending() {
        let ep = episode(Direction::Up);
        let mut i = input(SessionState::Observation, RegimeState::Balance);
        i.reclaim = Some(&ep);
        i.htf_bias = Some(HtfBias::Bear);
        assert_eq!(resolve(&i).unwrap().get(), Some(Strategy::SnapbackReclaim));

        // HTF still backs the failed breakout: nothing, not even Range
        i.htf_bias = Some(HtfBias::Bull);
        assert!(resolve(&i).unwrap().is_empty());

        i.htf_bias = None;
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_stand_down_and_forced_exit_deny_everything() {
        let i = input(SessionState::StandDown, RegimeState::Balance);
        assert!(resolve(&i).unwrap().is_empty());

        let mut i = input(SessionState::Observation, RegimeState::Balance);
        i.forced_exit_pending = true;
        assert!(resolve(&i).unwrap().is_empty());
    }

    #[test]
    fn test_two_candidates_is_a_fault() {
        // Only reachable with inconsistent inputs: discovery plus a pending reclaim
        let snap = aligned(Direction::Up, HtfBias::Neutral);
        let ep = episode(Direction::Down);
        let mut i = input(SessionState::AcceptanceConfirmed, RegimeState::Discovery(Direction::Up));
        i.alignment = Some(&snap);
        i.reclaim = Some(&ep);
        assert!(matches!(resolve(&i), Err(EngineError::InvariantViolation(_))));
    }

    #[test]
    fn test_catalogue_is_stable() {
        let ids: Vec<_> = catalogue().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["core_trigger_pullback", "snapback_reclaim", "range_to_trigger"]);
    }
}
