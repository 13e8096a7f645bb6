//! Snooze primitive shared by rate-discrepancy alerts and budget reminders.

use serde::{Deserialize, Serialize};

/// How long an alert stays suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "until", rename_all = "snake_case")]
pub enum SnoozeUntil {
    /// Expires on its own at this unix timestamp (seconds)
    Timed(u64),
    /// Persists until explicitly cleared
    Indefinite,
}

impl SnoozeUntil {
    pub fn is_active(&self, now: u64) -> bool {
        match self {
            SnoozeUntil::Timed(until) => *until > now,
            SnoozeUntil::Indefinite => true,
        }
    }
}

/// Persisted snooze record for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnoozeState {
    pub until: Option<SnoozeUntil>,
    /// Number of times this key has been snoozed
    pub count: u32,
}

impl SnoozeState {
    pub fn is_active(&self, now: u64) -> bool {
        self.until.is_some_and(|u| u.is_active(now))
    }

    /// Apply a menu choice. `Immediate` leaves the state untouched.
    pub fn apply(&mut self, choice: SnoozeChoice, now: u64) {
        if let Some(until) = choice.until(now) {
            self.snooze(until);
        }
    }

    pub fn snooze(&mut self, until: SnoozeUntil) {
        self.until = Some(until);
        self.count = self.count.saturating_add(1);
    }

    /// Clear the deadline; the count is history and stays.
    pub fn clear(&mut self) {
        self.until = None;
    }
}

/// The fixed snooze duration menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnoozeChoice {
    /// Dismiss now without snoozing
    Immediate,
    Minutes15,
    Minutes30,
    Hours2,
    Hours6,
    Hours24,
    Indefinite,
}

impl SnoozeChoice {
    pub const MENU: [SnoozeChoice; 7] = [
        SnoozeChoice::Immediate,
        SnoozeChoice::Minutes15,
        SnoozeChoice::Minutes30,
        SnoozeChoice::Hours2,
        SnoozeChoice::Hours6,
        SnoozeChoice::Hours24,
        SnoozeChoice::Indefinite,
    ];

    /// Map a minute count: -1 is indefinite, 0 is immediate, anything else timed.
    ///
    /// Values outside the menu are accepted as a custom timed snooze.
    pub fn from_minutes(minutes: i64) -> Option<Self> {
        match minutes {
            -1 => Some(SnoozeChoice::Indefinite),
            0 => Some(SnoozeChoice::Immediate),
            15 => Some(SnoozeChoice::Minutes15),
            30 => Some(SnoozeChoice::Minutes30),
            120 => Some(SnoozeChoice::Hours2),
            360 => Some(SnoozeChoice::Hours6),
            1440 => Some(SnoozeChoice::Hours24),
            _ => None,
        }
    }

    pub fn minutes(&self) -> Option<u64> {
        match self {
            SnoozeChoice::Immediate => Some(0),
            SnoozeChoice::Minutes15 => Some(15),
            SnoozeChoice::Minutes30 => Some(30),
            SnoozeChoice::Hours2 => Some(120),
            SnoozeChoice::Hours6 => Some(360),
            SnoozeChoice::Hours24 => Some(1440),
            SnoozeChoice::Indefinite => None,
        }
    }

    /// Deadline this choice produces, `None` for `Immediate`.
    pub fn until(&self, now: u64) -> Option<SnoozeUntil> {
        match self.minutes() {
            Some(0) => None,
            Some(m) => Some(SnoozeUntil::Timed(m.saturating_mul(60).saturating_add(now))),
            None => Some(SnoozeUntil::Indefinite),
        }
    }
}

/// Deadline for an arbitrary minute count, using the same encoding as the menu.
pub fn until_for_minutes(minutes: i64, now: u64) -> Option<SnoozeUntil> {
    match minutes {
        m if m < 0 => Some(SnoozeUntil::Indefinite),
        0 => None,
        m => Some(SnoozeUntil::Timed((m as u64).saturating_mul(60).saturating_add(now))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_minute_count_saturates() {
        let until = until_for_minutes(i64::MAX / 2, 1_700_000_000);
        assert_eq!(until, Some(SnoozeUntil::Timed(u64::MAX)));
        let until = until_for_minutes(i64::MAX, 1_700_000_000);
        assert_eq!(until, Some(SnoozeUntil::Timed(u64::MAX)));
    }

    #[test]
    fn test_timed_expires() {
        let mut state = SnoozeState::default();
        state.apply(SnoozeChoice::Minutes15, 1_000);
        assert_eq!(state.until, Some(SnoozeUntil::Timed(1_900)));
        assert_eq!(state.count, 1);
        assert!(state.is_active(1_899));
        assert!(!state.is_active(1_900));
    }

    #[test]
    fn test_indefinite_never_expires() {
        let mut state = SnoozeState::default();
        state.apply(SnoozeChoice::Indefinite, 0);
        assert!(state.is_active(u64::MAX));
        state.clear();
        assert!(!state.is_active(0));
        assert_eq!(state.count, 1, "un-snooze keeps history");
    }

    #[test]
    fn test_immediate_is_noop() {
        let mut state = SnoozeState::default();
        state.apply(SnoozeChoice::Immediate, 500);
        assert_eq!(state, SnoozeState::default());
    }

    #[test]
    fn test_from_minutes_menu() {
        assert_eq!(SnoozeChoice::from_minutes(-1), Some(SnoozeChoice::Indefinite));
        assert_eq!(SnoozeChoice::from_minutes(0), Some(SnoozeChoice::Immediate));
        assert_eq!(SnoozeChoice::from_minutes(120), Some(SnoozeChoice::Hours2));
        assert_eq!(SnoozeChoice::from_minutes(7), None);
        for choice in SnoozeChoice::MENU {
            if let Some(m) = choice.minutes() {
                assert_eq!(SnoozeChoice::from_minutes(m as i64), Some(choice));
            }
        }
    }

    #[test]
    fn test_until_for_minutes() {
        assert_eq!(until_for_minutes(-1, 10), Some(SnoozeUntil::Indefinite));
        assert_eq!(until_for_minutes(0, 10), None);
        assert_eq!(until_for_minutes(2, 10), Some(SnoozeUntil::Timed(130)));
    }

    #[test]
    fn test_serde_shape() {
        let state = SnoozeState {
            until: Some(SnoozeUntil::Indefinite),
            count: 3,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"until":{"kind":"indefinite"},"count":3}"#);
        let back: SnoozeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
