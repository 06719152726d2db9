//! services/scheduler/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `RuleStore` and `UnitOfWork` ports from the `core` crate. It handles all
//! interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repetition_core::domain::{
    Account, BookDomain, BookScope, Digest, NewDigest, Note, NotificationType, RepetitionRule,
    User,
};
use repetition_core::ports::{PortError, PortResult, RuleStore, UnitOfWork};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Columns of a rule row, with the ids of its books folded into an array.
const RULE_COLUMNS: &str = "r.id, r.uuid, r.user_id, r.title, r.hour, r.minute, r.frequency, \
     r.enabled, r.last_active, r.next_active, r.book_domain, r.note_count, \
     ARRAY(SELECT rb.book_id FROM repetition_rule_books rb \
           WHERE rb.repetition_rule_id = r.id ORDER BY rb.book_id) AS book_ids";

const NOTE_SELECT: &str = "SELECT n.id, n.uuid, n.book_id, b.label AS book_label, n.body, n.added_on \
     FROM notes n INNER JOIN books b ON b.id = n.book_id \
     WHERE n.user_id = $1 AND NOT n.deleted";

/// The kind of an email preferences token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Repetition,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Repetition => "email_repetition",
        }
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `RuleStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Returns the user's unused token of `kind`, creating one on first use.
    pub async fn get_or_create_token(&self, user_id: i64, kind: TokenType) -> PortResult<String> {
        sqlx::query(
            "INSERT INTO tokens (user_id, type, value) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, type) DO NOTHING",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(Uuid::new_v4().simple().to_string())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        let value: String = sqlx::query_scalar("SELECT value FROM tokens WHERE user_id = $1 AND type = $2")
            .bind(user_id)
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => {
                    PortError::NotFound(format!("Token for user {} not found", user_id))
                }
                _ => unexpected(e),
            })?;

        Ok(value)
    }

    /// Appends an entry to the notification audit log.
    pub async fn create_notification(&self, user_id: i64, kind: NotificationType) -> PortResult<()> {
        sqlx::query("INSERT INTO notifications (type, user_id) VALUES ($1, $2)")
            .bind(kind.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct RuleRecord {
    id: i64,
    uuid: Uuid,
    user_id: i64,
    title: String,
    hour: i32,
    minute: i32,
    frequency: i64,
    enabled: bool,
    last_active: i64,
    next_active: i64,
    book_domain: String,
    note_count: i32,
    book_ids: Vec<i64>,
}
impl RuleRecord {
    fn to_domain(self) -> PortResult<RepetitionRule> {
        let corrupt = |field: &str, value: String| {
            PortError::Unexpected(format!("Rule {} has an invalid {}: {}", self.uuid, field, value))
        };

        let book_domain = BookDomain::parse(&self.book_domain)
            .ok_or_else(|| corrupt("book_domain", self.book_domain.clone()))?;
        let hour = u32::try_from(self.hour).map_err(|_| corrupt("hour", self.hour.to_string()))?;
        let minute =
            u32::try_from(self.minute).map_err(|_| corrupt("minute", self.minute.to_string()))?;
        let note_count = u32::try_from(self.note_count)
            .map_err(|_| corrupt("note_count", self.note_count.to_string()))?;

        Ok(RepetitionRule {
            id: self.id,
            uuid: self.uuid,
            user_id: self.user_id,
            title: self.title,
            hour,
            minute,
            frequency: self.frequency,
            enabled: self.enabled,
            last_active: self.last_active,
            next_active: self.next_active,
            book_domain,
            book_ids: self.book_ids,
            note_count,
        })
    }
}

#[derive(FromRow)]
struct UserRecord {
    id: i64,
    uuid: Uuid,
    cloud: bool,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            id: self.id,
            uuid: self.uuid,
            cloud: self.cloud,
        }
    }
}

#[derive(FromRow)]
struct AccountRecord {
    user_id: i64,
    email: Option<String>,
    email_verified: bool,
}
impl AccountRecord {
    fn to_domain(self) -> Account {
        Account {
            user_id: self.user_id,
            email: self.email,
            email_verified: self.email_verified,
        }
    }
}

#[derive(FromRow)]
struct NoteRecord {
    id: i64,
    uuid: Uuid,
    book_id: i64,
    book_label: String,
    body: String,
    added_on: DateTime<Utc>,
}
impl NoteRecord {
    fn to_domain(self) -> Note {
        Note {
            id: self.id,
            uuid: self.uuid,
            book_id: self.book_id,
            book_label: self.book_label,
            body: self.body,
            added_on: self.added_on,
        }
    }
}

#[derive(FromRow)]
struct DigestRecord {
    id: i64,
    uuid: Uuid,
    created_at: DateTime<Utc>,
}

//=========================================================================================
// `RuleStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl RuleStore for DbAdapter {
    async fn find_eligible(&self, hour: u32, minute: u32) -> PortResult<Vec<RepetitionRule>> {
        let sql = format!(
            "SELECT {} FROM repetition_rules r \
             INNER JOIN users u ON u.id = r.user_id \
             WHERE u.cloud AND r.hour = $1 AND r.minute = $2 AND r.enabled",
            RULE_COLUMNS
        );
        let records = sqlx::query_as::<_, RuleRecord>(&sql)
            .bind(hour as i32)
            .bind(minute as i32)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn get_rule_by_uuid(&self, uuid: Uuid) -> PortResult<RepetitionRule> {
        let sql = format!("SELECT {} FROM repetition_rules r WHERE r.uuid = $1", RULE_COLUMNS);
        let record = sqlx::query_as::<_, RuleRecord>(&sql)
            .bind(uuid)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => PortError::NotFound(format!("Repetition rule {} not found", uuid)),
                _ => unexpected(e),
            })?;

        record.to_domain()
    }

    async fn get_account(&self, user_id: i64) -> PortResult<Account> {
        let record = sqlx::query_as::<_, AccountRecord>(
            "SELECT user_id, email, email_verified FROM accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Account for user {} not found", user_id)),
            _ => unexpected(e),
        })?;

        Ok(record.to_domain())
    }

    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(unexpected)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

//=========================================================================================
// `UnitOfWork` Trait Implementation
//=========================================================================================

/// A unit of work backed by one Postgres transaction. Dropping it rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn get_rule(&mut self, rule_id: i64) -> PortResult<RepetitionRule> {
        // Row lock held until commit, so concurrent ticks serialize on the rule.
        let sql = format!(
            "SELECT {} FROM repetition_rules r WHERE r.id = $1 FOR UPDATE OF r",
            RULE_COLUMNS
        );
        let record = sqlx::query_as::<_, RuleRecord>(&sql)
            .bind(rule_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => PortError::NotFound(format!("Repetition rule {} not found", rule_id)),
                _ => unexpected(e),
            })?;

        record.to_domain()
    }

    async fn get_user(&mut self, user_id: i64) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT id, uuid, cloud FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", user_id)),
                _ => unexpected(e),
            })?;

        Ok(record.to_domain())
    }

    async fn find_notes(&mut self, user_id: i64, scope: &BookScope) -> PortResult<Vec<Note>> {
        let records = match scope {
            BookScope::All => {
                let sql = format!("{} ORDER BY n.id", NOTE_SELECT);
                sqlx::query_as::<_, NoteRecord>(&sql)
                    .bind(user_id)
                    .fetch_all(&mut *self.tx)
                    .await
            }
            BookScope::Including(book_ids) => {
                let sql = format!("{} AND n.book_id = ANY($2) ORDER BY n.id", NOTE_SELECT);
                sqlx::query_as::<_, NoteRecord>(&sql)
                    .bind(user_id)
                    .bind(book_ids.as_slice())
                    .fetch_all(&mut *self.tx)
                    .await
            }
            BookScope::Excluding(book_ids) => {
                let sql = format!("{} AND NOT (n.book_id = ANY($2)) ORDER BY n.id", NOTE_SELECT);
                sqlx::query_as::<_, NoteRecord>(&sql)
                    .bind(user_id)
                    .bind(book_ids.as_slice())
                    .fetch_all(&mut *self.tx)
                    .await
            }
        }
        .map_err(unexpected)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn insert_digest(&mut self, digest: NewDigest) -> PortResult<Digest> {
        let record = sqlx::query_as::<_, DigestRecord>(
            "INSERT INTO digests (uuid, rule_id, user_id) VALUES ($1, $2, $3) \
             RETURNING id, uuid, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(digest.rule_id)
        .bind(digest.user_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(unexpected)?;

        for (position, note) in digest.notes.iter().enumerate() {
            sqlx::query("INSERT INTO digest_notes (digest_id, note_id, position) VALUES ($1, $2, $3)")
                .bind(record.id)
                .bind(note.id)
                .bind(position as i32)
                .execute(&mut *self.tx)
                .await
                .map_err(unexpected)?;
        }

        Ok(Digest {
            id: record.id,
            uuid: record.uuid,
            rule_id: digest.rule_id,
            user_id: digest.user_id,
            notes: digest.notes,
            created_at: record.created_at,
        })
    }

    async fn save_schedule_state(&mut self, rule: &RepetitionRule) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE repetition_rules SET last_active = $1, next_active = $2, updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(rule.last_active)
        .bind(rule.next_active)
        .bind(rule.id)
        .execute(&mut *self.tx)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Repetition rule {} not found", rule.uuid)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> PortResult<()> {
        self.tx.commit().await.map_err(unexpected)
    }

    async fn rollback(self: Box<Self>) -> PortResult<()> {
        self.tx.rollback().await.map_err(unexpected)
    }
}
