//! Risk flags that force StandDown

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::ReasonCode;

/// Flags supplied by the risk collaborator. All false means clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskFlags {
    pub violation: bool,
    pub emotional_instability: bool,
    pub news_window: bool,
    pub post_loss_cooldown: bool,
}

impl RiskFlags {
    pub fn any(&self) -> bool {
        self.violation || self.emotional_instability || self.news_window || self.post_loss_cooldown
    }

    /// Most severe active flag as a reason code
    pub fn primary_reason(&self) -> Option<ReasonCode> {
        if self.violation {
            Some(ReasonCode::RuleViolation)
        } else if self.emotional_instability {
            Some(ReasonCode::EmotionalInstability)
        } else if self.news_window {
            Some(ReasonCode::NewsWindow)
        } else if self.post_loss_cooldown {
            Some(ReasonCode::PostLossCooldown)
        } else {
            None
        }
    }
}

/// Full replacement of an instrument's risk flags
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskFlagUpdate {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub flags: RiskFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_flags() {
        let flags = RiskFlags::default();
        assert!(!flags.any());
        assert_eq!(flags.primary_reason(), None);
    }

    #[test]
    fn test_violation_outranks_news() {
        let flags = RiskFlags {
            news_window: true,
            violation: true,
            ..Default::default()
        };
        assert!(flags.any());
        assert_eq!(flags.primary_reason(), Some(ReasonCode::RuleViolation));
    }

    #[test]
    fn test_flattened_json() {
        let update: RiskFlagUpdate =
            serde_json::from_str(r#"{"timestamp":"2025-03-04T14:00:00Z","news_window":true}"#).unwrap();
        assert!(update.flags.news_window);
        assert!(!update.flags.violation);
    }
}
