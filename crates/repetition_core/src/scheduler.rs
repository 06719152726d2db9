//! crates/repetition_core/src/scheduler.rs
//!
//! The per-tick orchestration: find the rules whose slot matches, and for each
//! one build a digest and advance its schedule in one unit of work, then
//! notify the owner once that unit has committed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::digest::DigestBuilder;
use crate::domain::{Digest, RepetitionRule, User};
use crate::effects::best_effort;
use crate::error::ProcessError;
use crate::ports::{NotificationGateway, RuleStore, UnitOfWork};

/// Tunables for a `SchedulerCore`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How many rules of one tick are processed at the same time.
    pub concurrency: usize,
    /// Upper bound on a single notification attempt.
    pub notify_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            notify_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a candidate rule was left untouched. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotDue,
    Disabled,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Sent,
    SkippedUnverified,
    Failed,
}

/// The result of processing one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Skipped(SkipReason),
    Processed {
        digest_id: i64,
        notification: NotificationStatus,
    },
}

/// Counts of what happened during one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: usize,
    pub notification_failures: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &RuleOutcome) {
        match outcome {
            RuleOutcome::Skipped(_) => self.skipped += 1,
            RuleOutcome::Processed { notification, .. } => {
                self.processed += 1;
                match notification {
                    NotificationStatus::Sent => self.notified += 1,
                    NotificationStatus::Failed => self.notification_failures += 1,
                    NotificationStatus::SkippedUnverified => {}
                }
            }
        }
    }
}

/// State that has been committed for a rule and is waiting to be announced.
struct Committed {
    rule: RepetitionRule,
    user: User,
    digest: Digest,
}

enum Step {
    Skip(SkipReason),
    Built(Committed),
}

pub struct SchedulerCore {
    store: Arc<dyn RuleStore>,
    gateway: Arc<dyn NotificationGateway>,
    builder: DigestBuilder,
    settings: SchedulerSettings,
}

impl SchedulerCore {
    pub fn new(
        store: Arc<dyn RuleStore>,
        gateway: Arc<dyn NotificationGateway>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            builder: DigestBuilder::default(),
            settings,
        }
    }

    /// Replaces the default digest builder.
    pub fn with_digest_builder(mut self, builder: DigestBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Runs one scheduling tick at `now`. Never fails as a whole; per-rule
    /// failures are logged and counted in the report.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let (hour, minute) = (now.hour(), now.minute());

        let rules = match self.store.find_eligible(hour, minute).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(hour, minute, error = %e, "Could not query eligible repetition rules");
                return TickReport::default();
            }
        };

        info!(hour, minute, num_rules = rules.len(), "processing rules");

        let mut report = TickReport {
            candidates: rules.len(),
            ..Default::default()
        };

        let results: Vec<(Uuid, Result<RuleOutcome, ProcessError>)> = stream::iter(rules)
            .map(|rule| async move { (rule.uuid, self.process(&rule, now).await) })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (rule_uuid, result) in results {
            match result {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(rule_uuid = %rule_uuid, error = %e, "Could not process the repetition rule");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Processes a single rule by UUID at `now`, regardless of its slot.
    /// The cooldown and subscription checks still apply.
    pub async fn run_rule(&self, uuid: Uuid, now: DateTime<Utc>) -> Result<RuleOutcome, ProcessError> {
        let rule = self.store.get_rule_by_uuid(uuid).await?;
        self.process(&rule, now).await
    }

    async fn process(&self, rule: &RepetitionRule, now: DateTime<Utc>) -> Result<RuleOutcome, ProcessError> {
        info!(rule_uuid = %rule.uuid, "processing repetition");

        let mut uow = self.store.begin().await?;
        let committed = match self.advance(uow.as_mut(), rule.id, now).await {
            Ok(Step::Built(committed)) => committed,
            Ok(Step::Skip(reason)) => {
                uow.rollback().await?;
                return Ok(RuleOutcome::Skipped(reason));
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(rule_uuid = %rule.uuid, error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };
        uow.commit().await?;

        let notification = self.notify(&committed, now).await;

        info!(
            rule_uuid = %rule.uuid,
            digest_id = committed.digest.id,
            note_count = committed.digest.notes.len(),
            last_active = committed.rule.last_active,
            next_active = committed.rule.next_active,
            "finished processing repetition"
        );

        Ok(RuleOutcome::Processed {
            digest_id: committed.digest.id,
            notification,
        })
    }

    /// Everything that must happen atomically for one rule.
    async fn advance(
        &self,
        uow: &mut dyn UnitOfWork,
        rule_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Step, ProcessError> {
        // Fresh read; the candidate copy may predate an earlier tick's advance.
        let rule = uow.get_rule(rule_id).await?;
        if !rule.enabled {
            return Ok(Step::Skip(SkipReason::Disabled));
        }
        if !rule.is_due(now) {
            return Ok(Step::Skip(SkipReason::NotDue));
        }

        let user = uow.get_user(rule.user_id).await?;
        if !user.cloud {
            info!(user_id = user.id, "Skipping repetition due to lack of subscription");
            return Ok(Step::Skip(SkipReason::Unsubscribed));
        }

        let digest = self.builder.build(uow, &rule, now).await?;

        let rule = rule.advanced(now)?;
        uow.save_schedule_state(&rule).await?;

        Ok(Step::Built(Committed { rule, user, digest }))
    }

    async fn notify(&self, committed: &Committed, now: DateTime<Utc>) -> NotificationStatus {
        let Committed { rule, user, digest } = committed;

        let limit = self.settings.notify_timeout;
        let Some(account) = best_effort("load account", limit, self.store.get_account(user.id)).await else {
            return NotificationStatus::Failed;
        };

        let Some(address) = account.verified_email() else {
            info!(user_id = user.id, "Skipping repetition delivery because email is not valid or verified");
            return NotificationStatus::SkippedUnverified;
        };

        let sent = best_effort(
            "send repetition email",
            limit,
            self.gateway.notify(user, address, digest, rule, now),
        )
        .await;

        match sent {
            Some(()) => NotificationStatus::Sent,
            None => NotificationStatus::Failed,
        }
    }
}
