//! crates/repetition_core/src/digest.rs
//!
//! Builds and persists the digest for one rule run.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{Digest, NewDigest, RepetitionRule};
use crate::error::ProcessError;
use crate::ports::UnitOfWork;
use crate::selection::{BalancedSelection, NoteSelectionPolicy};

#[derive(Clone)]
pub struct DigestBuilder {
    policy: Arc<dyn NoteSelectionPolicy>,
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new(Arc::new(BalancedSelection))
    }
}

impl DigestBuilder {
    pub fn new(policy: Arc<dyn NoteSelectionPolicy>) -> Self {
        Self { policy }
    }

    /// Selects notes for `rule` and inserts the digest through `uow`.
    ///
    /// Must run in the same unit of work that saves the rule's schedule state.
    pub async fn build(
        &self,
        uow: &mut dyn UnitOfWork,
        rule: &RepetitionRule,
        now: DateTime<Utc>,
    ) -> Result<Digest, ProcessError> {
        rule.validate()?;
        let scope = rule.book_scope()?;

        let candidates: Vec<_> = uow
            .find_notes(rule.user_id, &scope)
            .await?
            .into_iter()
            .filter(|note| scope.admits(note.book_id))
            .collect();

        let notes = self
            .policy
            .select(candidates, rule.note_count as usize, now);

        let digest = uow
            .insert_digest(NewDigest {
                rule_id: rule.id,
                user_id: rule.user_id,
                notes,
            })
            .await?;

        Ok(digest)
    }
}
