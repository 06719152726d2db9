//! crates/repetition_core/src/domain.rs
//!
//! Defines the pure, core data structures for the scheduler.
//! These structs are independent of any database or email format.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// The smallest schedule resolution, in milliseconds.
pub const MINUTE_MS: i64 = 60_000;

/// How the book set attached to a rule restricts note selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookDomain {
    All,
    Including,
    Excluding,
}

impl BookDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookDomain::All => "all",
            BookDomain::Including => "including",
            BookDomain::Excluding => "excluding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(BookDomain::All),
            "including" => Some(BookDomain::Including),
            "excluding" => Some(BookDomain::Excluding),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved set of books a rule may draw notes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookScope {
    All,
    Including(Vec<i64>),
    Excluding(Vec<i64>),
}

impl BookScope {
    /// Returns true if a note in `book_id` is eligible under this scope.
    pub fn admits(&self, book_id: i64) -> bool {
        match self {
            BookScope::All => true,
            BookScope::Including(ids) => ids.contains(&book_id),
            BookScope::Excluding(ids) => !ids.contains(&book_id),
        }
    }
}

/// Violations of the repetition rule contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("hour {0} is outside 0..=23")]
    HourOutOfRange(u32),
    #[error("minute {0} is outside 0..=59")]
    MinuteOutOfRange(u32),
    #[error("frequency of {0}ms is below the one minute resolution")]
    FrequencyTooShort(i64),
    #[error("next_active {next_active} is before last_active {last_active}")]
    ScheduleRegressed { last_active: i64, next_active: i64 },
    #[error("book domain '{0}' requires at least one book")]
    EmptyBookSet(BookDomain),
    #[error("book domain 'all' must not list books")]
    UnexpectedBookSet,
    #[error("advancing from {last_active} by {frequency}ms overflows the schedule")]
    ScheduleOverflow { last_active: i64, frequency: i64 },
}

/// A user-owned schedule definition.
#[derive(Debug, Clone, PartialEq)]
pub struct RepetitionRule {
    pub id: i64,
    pub uuid: Uuid,
    pub user_id: i64,
    pub title: String,
    pub hour: u32,
    pub minute: u32,
    /// Minimum spacing between two successful runs, in milliseconds.
    pub frequency: i64,
    pub enabled: bool,
    /// Epoch milliseconds of the most recent successful run, 0 if never run.
    pub last_active: i64,
    /// Epoch milliseconds of the earliest instant the next run may happen.
    pub next_active: i64,
    pub book_domain: BookDomain,
    pub book_ids: Vec<i64>,
    pub note_count: u32,
}

impl RepetitionRule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.hour > 23 {
            return Err(RuleError::HourOutOfRange(self.hour));
        }
        if self.minute > 59 {
            return Err(RuleError::MinuteOutOfRange(self.minute));
        }
        if self.frequency < MINUTE_MS {
            return Err(RuleError::FrequencyTooShort(self.frequency));
        }
        if self.next_active < self.last_active {
            return Err(RuleError::ScheduleRegressed {
                last_active: self.last_active,
                next_active: self.next_active,
            });
        }
        self.book_scope().map(|_| ())
    }

    /// Resolves the book domain and book set into a `BookScope`.
    pub fn book_scope(&self) -> Result<BookScope, RuleError> {
        match self.book_domain {
            BookDomain::All if self.book_ids.is_empty() => Ok(BookScope::All),
            BookDomain::All => Err(RuleError::UnexpectedBookSet),
            BookDomain::Including | BookDomain::Excluding if self.book_ids.is_empty() => {
                Err(RuleError::EmptyBookSet(self.book_domain))
            }
            BookDomain::Including => Ok(BookScope::Including(self.book_ids.clone())),
            BookDomain::Excluding => Ok(BookScope::Excluding(self.book_ids.clone())),
        }
    }

    pub fn has_never_run(&self) -> bool {
        self.last_active == 0 && self.next_active == 0
    }

    /// Cooldown check: the rule may run once `now` reaches `next_active`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.next_active
    }

    /// Returns the rule with its schedule ratcheted forward by one run.
    ///
    /// A rule that never ran anchors its cadence at the start of the minute
    /// of its first run; afterwards the cadence is fixed in epoch space and
    /// ignores polling jitter.
    pub fn advanced(&self, now: DateTime<Utc>) -> Result<RepetitionRule, RuleError> {
        let last_active = if self.has_never_run() {
            floor_to_minute(now.timestamp_millis())
        } else {
            self.next_active
        };
        let next_active = last_active
            .checked_add(self.frequency)
            .ok_or(RuleError::ScheduleOverflow {
                last_active,
                frequency: self.frequency,
            })?;

        Ok(RepetitionRule {
            last_active,
            next_active,
            ..self.clone()
        })
    }
}

fn floor_to_minute(ms: i64) -> i64 {
    ms - ms.rem_euclid(MINUTE_MS)
}

// Represents a user - only the fields the scheduler reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    /// Whether the user holds a subscription entitling them to repetitions.
    pub cloud: bool,
}

/// The contact details attached to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: i64,
    pub email: Option<String>,
    pub email_verified: bool,
}

impl Account {
    /// The address to deliver to, if there is one and it has been verified.
    pub fn verified_email(&self) -> Option<&str> {
        match (&self.email, self.email_verified) {
            (Some(email), true) if !email.trim().is_empty() => Some(email.as_str()),
            _ => None,
        }
    }
}

/// A note as seen by the digest builder, joined with its book label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: i64,
    pub uuid: Uuid,
    pub book_id: i64,
    pub book_label: String,
    pub body: String,
    pub added_on: DateTime<Utc>,
}

/// Coarse age bucket of a note relative to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgeTier {
    /// Added less than 3 days ago.
    Recent = 1,
    /// Added between 3 (inclusive) and 7 (exclusive) days ago.
    ThisWeek = 2,
    /// Added 7 or more days ago.
    Older = 3,
}

impl AgeTier {
    pub const ALL: [AgeTier; 3] = [AgeTier::Recent, AgeTier::ThisWeek, AgeTier::Older];

    pub fn classify(added_on: DateTime<Utc>, now: DateTime<Utc>) -> AgeTier {
        let age = now - added_on;
        if age < Duration::days(3) {
            AgeTier::Recent
        } else if age < Duration::days(7) {
            AgeTier::ThisWeek
        } else {
            AgeTier::Older
        }
    }
}

/// The payload of a digest that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewDigest {
    pub rule_id: i64,
    pub user_id: i64,
    pub notes: Vec<Note>,
}

/// One materialized batch of notes produced by a single rule run.
#[derive(Debug, Clone)]
pub struct Digest {
    pub id: i64,
    pub uuid: Uuid,
    pub rule_id: i64,
    pub user_id: i64,
    pub notes: Vec<Note>,
    pub created_at: DateTime<Utc>,
}

/// The kind of an outbound notification, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    EmailWeekly,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::EmailWeekly => "email_weekly",
        }
    }
}
