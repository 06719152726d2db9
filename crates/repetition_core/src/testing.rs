//! In-memory doubles of the ports, for the core's own tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    Account, BookDomain, BookScope, Digest, NewDigest, Note, RepetitionRule, User,
};
use crate::ports::{NotificationGateway, PortError, PortResult, RuleStore, UnitOfWork};

#[derive(Debug, Default, Clone)]
pub struct State {
    pub rules: BTreeMap<i64, RepetitionRule>,
    pub users: BTreeMap<i64, User>,
    pub accounts: BTreeMap<i64, Account>,
    /// Book id to owning user id.
    pub books: BTreeMap<i64, i64>,
    pub notes: Vec<Note>,
    pub digests: Vec<Digest>,
}

/// A store whose units of work copy the state and swap it back in on commit.
///
/// A unit holds the store lock until it finishes, so units are serialized.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<State>>,
    failing_digests: Arc<Mutex<HashSet<i64>>>,
}

impl MemoryStore {
    pub async fn seed(&self, f: impl FnOnce(&mut State)) {
        f(&mut *self.state.lock().await);
    }

    pub async fn rule(&self, id: i64) -> RepetitionRule {
        self.state.lock().await.rules[&id].clone()
    }

    pub async fn digests_for(&self, rule_id: i64) -> Vec<Digest> {
        self.state
            .lock()
            .await
            .digests
            .iter()
            .filter(|d| d.rule_id == rule_id)
            .cloned()
            .collect()
    }

    /// Makes every digest insert for `rule_id` fail.
    pub fn fail_digests_for(&self, rule_id: i64) {
        self.failing_digests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(rule_id);
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn find_eligible(&self, hour: u32, minute: u32) -> PortResult<Vec<RepetitionRule>> {
        let state = self.state.lock().await;
        Ok(state
            .rules
            .values()
            .filter(|r| r.enabled && r.hour == hour && r.minute == minute)
            .filter(|r| state.users.get(&r.user_id).map(|u| u.cloud).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn get_rule_by_uuid(&self, uuid: Uuid) -> PortResult<RepetitionRule> {
        let state = self.state.lock().await;
        state
            .rules
            .values()
            .find(|r| r.uuid == uuid)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Rule {} not found", uuid)))
    }

    async fn get_account(&self, user_id: i64) -> PortResult<Account> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Account for user {} not found", user_id)))
    }

    async fn begin(&self) -> PortResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            working,
            failing_digests: self.failing_digests.clone(),
        }))
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    working: State,
    failing_digests: Arc<Mutex<HashSet<i64>>>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn get_rule(&mut self, rule_id: i64) -> PortResult<RepetitionRule> {
        self.working
            .rules
            .get(&rule_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Rule {} not found", rule_id)))
    }

    async fn get_user(&mut self, user_id: i64) -> PortResult<User> {
        self.working
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn find_notes(&mut self, user_id: i64, _scope: &BookScope) -> PortResult<Vec<Note>> {
        // Filtered by owner only, so book scoping rests on the builder alone.
        let books = &self.working.books;
        Ok(self
            .working
            .notes
            .iter()
            .filter(|n| books.get(&n.book_id) == Some(&user_id))
            .cloned()
            .collect())
    }

    async fn insert_digest(&mut self, digest: NewDigest) -> PortResult<Digest> {
        let failing = self
            .failing_digests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&digest.rule_id);
        if failing {
            return Err(PortError::Unexpected("digest insert failed".to_string()));
        }

        let stored = Digest {
            id: self.working.digests.len() as i64 + 1,
            uuid: Uuid::new_v4(),
            rule_id: digest.rule_id,
            user_id: digest.user_id,
            notes: digest.notes,
            created_at: Utc::now(),
        };
        self.working.digests.push(stored.clone());
        Ok(stored)
    }

    async fn save_schedule_state(&mut self, rule: &RepetitionRule) -> PortResult<()> {
        let stored = self
            .working
            .rules
            .get_mut(&rule.id)
            .ok_or_else(|| PortError::NotFound(format!("Rule {} not found", rule.id)))?;
        stored.last_active = rule.last_active;
        stored.next_active = rule.next_active;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> PortResult<()> {
        let MemoryUnitOfWork {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> PortResult<()> {
        Ok(())
    }
}

/// Records every delivery instead of sending it.
#[derive(Default)]
pub struct RecordingGateway {
    pub sent: Mutex<Vec<(String, i64)>>,
    pub fail: bool,
}

impl RecordingGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, i64)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify(
        &self,
        _user: &User,
        address: &str,
        digest: &Digest,
        _rule: &RepetitionRule,
        _now: DateTime<Utc>,
    ) -> PortResult<()> {
        if self.fail {
            return Err(PortError::Unexpected("smtp unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((address.to_string(), digest.id));
        Ok(())
    }
}

pub fn subscribed_user(id: i64) -> User {
    User {
        id,
        uuid: Uuid::new_v4(),
        cloud: true,
    }
}

pub fn verified_account(user_id: i64) -> Account {
    Account {
        user_id,
        email: Some(format!("user{}@example.com", user_id)),
        email_verified: true,
    }
}

pub fn rule(id: i64, user_id: i64, hour: u32, minute: u32, frequency: i64) -> RepetitionRule {
    RepetitionRule {
        id,
        uuid: Uuid::new_v4(),
        user_id,
        title: format!("Rule {}", id),
        hour,
        minute,
        frequency,
        enabled: true,
        last_active: 0,
        next_active: 0,
        book_domain: BookDomain::All,
        book_ids: Vec::new(),
        note_count: 5,
    }
}

pub fn note(id: i64, book_id: i64, label: &str, added_on: DateTime<Utc>) -> Note {
    Note {
        id,
        uuid: Uuid::new_v4(),
        book_id,
        book_label: label.to_string(),
        body: format!("note {} in {}", id, label),
        added_on,
    }
}
