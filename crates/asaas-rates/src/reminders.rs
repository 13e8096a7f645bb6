//! Budget reminders: which expenses, salaries and dividends are due soon.
//!
//! Snoozes and paid marks are per item and per month, kept in device
//! settings:
//!   snooze.budget.snooze.{category}.{id}.{YYYY-MM}   (via SnoozeBook)
//!   budget.paid.{category}.{id}.{YYYY-MM}            bool

use anyhow::Result;
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::snooze::{SnoozeChoice, SnoozeState};
use asaas_state::{SharedSettings, SnoozeBook};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderCategory {
    Expense,
    Salary,
    Dividend,
}

impl ReminderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderCategory::Expense => "expense",
            ReminderCategory::Salary => "salary",
            ReminderCategory::Dividend => "dividend",
        }
    }
}

/// A calendar month, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> AsaasResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(AsaasError::Validation(format!("invalid month {month}")));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)?.pred_opt()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        Month::of(date) == *self
    }

    /// `day` in this month, clamped to the month's last day.
    pub fn clamp_day(&self, day: u32) -> Option<NaiveDate> {
        let last = self.last_day()?;
        NaiveDate::from_ymd_opt(self.year, self.month, day.clamp(1, last.day()))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = AsaasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AsaasError::Validation(format!("invalid month {s:?}, expected YYYY-MM"));
        let (y, m) = s.split_once('-').ok_or_else(invalid)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(invalid());
        }
        let year = y.parse().map_err(|_| invalid())?;
        let month = m.parse().map_err(|_| invalid())?;
        Month::new(year, month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DueRule {
    /// Due once, on this date
    Once { date: NaiveDate },
    /// Due every month on this day (clamped to short months)
    Monthly { day: u32 },
}

impl DueRule {
    /// The due date falling in `month`, if any.
    pub fn due_in(&self, month: Month) -> Option<NaiveDate> {
        match self {
            DueRule::Once { date } => month.contains(*date).then_some(*date),
            DueRule::Monthly { day } => month.clamp_day(*day),
        }
    }
}

/// Something that may need paying, supplied by the budget feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderCandidate {
    pub id: String,
    pub category: ReminderCategory,
    pub title: String,
    pub amount: f64,
    pub currency: String,
    pub due: DueRule,
    #[serde(default)]
    pub is_paid: bool,
    /// Locked items are settled for the period and never remind
    #[serde(default)]
    pub is_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueReminder {
    pub id: String,
    pub category: ReminderCategory,
    pub title: String,
    pub amount: f64,
    pub currency: String,
    pub due_date: NaiveDate,
    pub snooze: SnoozeState,
}

impl DueReminder {
    fn from_candidate(c: &ReminderCandidate, due_date: NaiveDate, snooze: SnoozeState) -> Self {
        Self {
            id: c.id.clone(),
            category: c.category,
            title: c.title.clone(),
            amount: c.amount,
            currency: c.currency.clone(),
            due_date,
            snooze,
        }
    }
}

pub fn snooze_key(category: ReminderCategory, id: &str, month: Month) -> String {
    format!("budget.snooze.{}.{id}.{month}", category.as_str())
}

pub fn paid_key(category: ReminderCategory, id: &str, month: Month) -> String {
    format!("budget.paid.{}.{id}.{month}", category.as_str())
}

pub struct ReminderScheduler {
    settings: SharedSettings,
    snoozes: SnoozeBook,
    days_before: u32,
}

impl ReminderScheduler {
    pub fn new(settings: SharedSettings, days_before: u32) -> Self {
        Self {
            snoozes: SnoozeBook::new(settings.clone()),
            settings,
            days_before,
        }
    }

    pub fn days_before(&self) -> u32 {
        self.days_before
    }

    /// Unpaid, unlocked, unsnoozed items due in `month` no later than
    /// `today + days_before`, earliest first.
    pub async fn scan_due(
        &self,
        candidates: &[ReminderCandidate],
        month: Month,
        today: NaiveDate,
        now: u64,
    ) -> Vec<DueReminder> {
        let horizon = today
            .checked_add_days(Days::new(u64::from(self.days_before)))
            .unwrap_or(NaiveDate::MAX);

        let mut due = Vec::new();
        for c in candidates {
            if c.is_paid || c.is_locked {
                continue;
            }
            let Some(date) = c.due.due_in(month) else {
                continue;
            };
            if date > horizon || self.is_paid(c.category, &c.id, month).await {
                continue;
            }
            let snooze = self.snoozes.get(&snooze_key(c.category, &c.id, month)).await;
            if snooze.is_active(now) {
                continue;
            }
            due.push(DueReminder::from_candidate(c, date, snooze));
        }
        due.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        due
    }

    /// Items of `month` whose reminder is currently snoozed, earliest first.
    pub async fn snoozed(&self, candidates: &[ReminderCandidate], month: Month, now: u64) -> Vec<DueReminder> {
        let mut out = Vec::new();
        for c in candidates {
            let Some(date) = c.due.due_in(month) else {
                continue;
            };
            let snooze = self.snoozes.get(&snooze_key(c.category, &c.id, month)).await;
            if snooze.is_active(now) {
                out.push(DueReminder::from_candidate(c, date, snooze));
            }
        }
        out.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn snooze(
        &self,
        category: ReminderCategory,
        id: &str,
        month: Month,
        choice: SnoozeChoice,
        now: u64,
    ) -> Result<SnoozeState> {
        self.snoozes
            .apply(&snooze_key(category, id, month), choice, now)
            .await
    }

    pub async fn unsnooze(&self, category: ReminderCategory, id: &str, month: Month) -> Result<SnoozeState> {
        self.snoozes.unsnooze(&snooze_key(category, id, month)).await
    }

    pub async fn is_paid(&self, category: ReminderCategory, id: &str, month: Month) -> bool {
        self.settings
            .lock()
            .await
            .get::<bool>(&paid_key(category, id, month))
            .unwrap_or(false)
    }

    /// Mark an item paid for the month, or clear the mark.
    pub async fn set_paid(&self, category: ReminderCategory, id: &str, month: Month, paid: bool) -> Result<()> {
        let key = paid_key(category, id, month);
        let mut settings = self.settings.lock().await;
        if paid {
            settings.set(&key, &true)
        } else {
            settings.remove(&key).map(|_| ())
        }
    }
}
