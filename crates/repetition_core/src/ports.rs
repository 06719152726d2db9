//! crates/repetition_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the scheduler's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or mailers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Account, BookScope, Digest, NewDigest, Note, RepetitionRule, User};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, SMTP).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Persistence access for repetition rules and everything a run reads or writes.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules for the wall-clock slot that are enabled and owned by a subscribed user.
    async fn find_eligible(&self, hour: u32, minute: u32) -> PortResult<Vec<RepetitionRule>>;

    async fn get_rule_by_uuid(&self, uuid: Uuid) -> PortResult<RepetitionRule>;

    async fn get_account(&self, user_id: i64) -> PortResult<Account>;

    /// Opens an atomic unit of work. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>>;
}

/// One transaction against the store, scoped to a single rule run.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Reads the current state of a rule, locking it for the rest of the unit.
    async fn get_rule(&mut self, rule_id: i64) -> PortResult<RepetitionRule>;

    async fn get_user(&mut self, user_id: i64) -> PortResult<User>;

    /// All notes of `user_id` whose book is admitted by `scope`.
    async fn find_notes(&mut self, user_id: i64, scope: &BookScope) -> PortResult<Vec<Note>>;

    async fn insert_digest(&mut self, digest: NewDigest) -> PortResult<Digest>;

    /// Persists `last_active` and `next_active` of the rule.
    async fn save_schedule_state(&mut self, rule: &RepetitionRule) -> PortResult<()>;

    async fn commit(self: Box<Self>) -> PortResult<()>;

    async fn rollback(self: Box<Self>) -> PortResult<()>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Renders and sends the digest to `address`, then records the notification.
    async fn notify(
        &self,
        user: &User,
        address: &str,
        digest: &Digest,
        rule: &RepetitionRule,
        now: DateTime<Utc>,
    ) -> PortResult<()>;
}
