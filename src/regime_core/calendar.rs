//! Session calendar: which trading day a timestamp belongs to, and where in
//! the session it falls
//!
//! A trading day starts at the session open in the exchange's local time zone.
//! Timestamps before the open belong to the previous trading day. DST is
//! handled by chrono-tz.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Opening range lock after the open
pub const LOCK_MINUTES: i64 = 30;

/// Where a timestamp falls relative to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Inside the opening lock: levels are settling, nothing is evaluated
    Calibrating,
    Active,
    /// Past the session's duration, until the next open
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Calibrating => write!(f, "CALIBRATING"),
            SessionPhase::Active => write!(f, "ACTIVE"),
            SessionPhase::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Named session opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPreset {
    /// CME index futures, 08:30 New York
    NyFutures,
    /// US cash equities, 09:30 New York
    NyEquity,
    /// 08:00 London
    London,
    /// 09:00 Tokyo
    Tokyo,
}

impl Default for SessionPreset {
    fn default() -> Self {
        SessionPreset::NyFutures
    }
}

impl std::fmt::Display for SessionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPreset::NyFutures => write!(f, "NY Futures"),
            SessionPreset::NyEquity => write!(f, "NY Equity"),
            SessionPreset::London => write!(f, "London"),
            SessionPreset::Tokyo => write!(f, "Tokyo"),
        }
    }
}

impl std::str::FromStr for SessionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "nyfutures" | "futures" => Ok(SessionPreset::NyFutures),
            "nyequity" | "equity" => Ok(SessionPreset::NyEquity),
            "london" => Ok(SessionPreset::London),
            "tokyo" => Ok(SessionPreset::Tokyo),
            other => Err(format!("unknown session preset: {}", other)),
        }
    }
}

impl SessionPreset {
    pub fn timezone(&self) -> Tz {
        match self {
            SessionPreset::NyFutures | SessionPreset::NyEquity => chrono_tz::America::New_York,
            SessionPreset::London => chrono_tz::Europe::London,
            SessionPreset::Tokyo => chrono_tz::Asia::Tokyo,
        }
    }

    pub fn open_time(&self) -> NaiveTime {
        let (h, m) = match self {
            SessionPreset::NyFutures => (8, 30),
            SessionPreset::NyEquity => (9, 30),
            SessionPreset::London => (8, 0),
            SessionPreset::Tokyo => (9, 0),
        };
        NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
    }

    /// Session length from the open, in minutes
    pub fn duration_minutes(&self) -> i64 {
        match self {
            SessionPreset::NyFutures | SessionPreset::London => 480,
            SessionPreset::NyEquity => 390,
            SessionPreset::Tokyo => 360,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCalendar {
    preset: SessionPreset,
}

impl SessionCalendar {
    pub fn new(preset: SessionPreset) -> Self {
        Self { preset }
    }

    pub fn preset(&self) -> SessionPreset {
        self.preset
    }

    /// Trading day that `ts` falls in
    pub fn session_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        let local = ts.with_timezone(&self.preset.timezone());
        let date = local.date_naive();
        if local.time() >= self.preset.open_time() {
            date
        } else {
            date - Duration::days(1)
        }
    }

    /// UTC instant the given trading day opens
    pub fn session_open(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.preset
            .timezone()
            .from_local_datetime(&date.and_time(self.preset.open_time()))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Phase of the session `ts` falls in. The lock end itself is active, the
    /// session end itself is still active.
    pub fn phase(&self, ts: DateTime<Utc>) -> SessionPhase {
        let Some(open) = self.session_open(self.session_date(ts)) else {
            return SessionPhase::Closed;
        };
        let elapsed = ts - open;
        if elapsed < Duration::minutes(LOCK_MINUTES) {
            SessionPhase::Calibrating
        } else if elapsed > Duration::minutes(self.preset.duration_minutes()) {
            SessionPhase::Closed
        } else {
            SessionPhase::Active
        }
    }
}
