//! crates/repetition_core/src/selection.rs
//!
//! Note-balancing policies used by the digest builder.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::domain::{AgeTier, Note};

/// Chooses which candidate notes go into a digest, and in what order.
///
/// Implementations must be deterministic for identical inputs and should
/// favour spreading a batch across books over packing it from one book.
pub trait NoteSelectionPolicy: Send + Sync {
    fn select(&self, candidates: Vec<Note>, limit: usize, now: DateTime<Utc>) -> Vec<Note>;
}

/// Spreads a batch evenly over the age tiers, and inside each tier walks
/// books round-robin.
///
/// Books are visited in ascending label order and notes inside a book in
/// ascending id order. Quota a tier cannot fill goes to whichever book has
/// the fewest picks so far, across all tiers, ties broken by label. The
/// result is ordered by tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedSelection;

impl NoteSelectionPolicy for BalancedSelection {
    fn select(&self, candidates: Vec<Note>, limit: usize, now: DateTime<Utc>) -> Vec<Note> {
        if limit == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let mut buckets: BTreeMap<AgeTier, Vec<Note>> = BTreeMap::new();
        for note in candidates {
            buckets
                .entry(AgeTier::classify(note.added_on, now))
                .or_default()
                .push(note);
        }

        let mut queues: Vec<VecDeque<Note>> = AgeTier::ALL
            .iter()
            .map(|tier| interleave_books(buckets.remove(tier).unwrap_or_default()))
            .collect();
        let quotas = split_quota(limit, queues.len());

        let mut picked: Vec<Vec<Note>> = vec![Vec::new(); queues.len()];
        for ((queue, quota), out) in queues.iter_mut().zip(quotas).zip(picked.iter_mut()) {
            let take = quota.min(queue.len());
            out.extend(queue.drain(..take));
        }

        let mut picks: BTreeMap<BookKey, usize> = BTreeMap::new();
        for note in picked.iter().flatten() {
            *picks.entry(book_key(note)).or_default() += 1;
        }

        let mut leftovers: BTreeMap<BookKey, VecDeque<(usize, Note)>> = BTreeMap::new();
        for (tier, queue) in queues.into_iter().enumerate() {
            for note in queue {
                leftovers.entry(book_key(&note)).or_default().push_back((tier, note));
            }
        }

        let mut remaining = limit - picked.iter().map(Vec::len).sum::<usize>();
        while remaining > 0 {
            let Some(book) = leftovers
                .keys()
                .min_by_key(|book| (picks.get(*book).copied().unwrap_or(0), *book))
                .cloned()
            else {
                break;
            };
            let Some(queue) = leftovers.get_mut(&book) else {
                break;
            };
            if let Some((tier, note)) = queue.pop_front() {
                picked[tier].push(note);
                remaining -= 1;
                *picks.entry(book.clone()).or_default() += 1;
            }
            if queue.is_empty() {
                leftovers.remove(&book);
            }
        }

        picked.into_iter().flatten().collect()
    }
}

type BookKey = (String, i64);

fn book_key(note: &Note) -> BookKey {
    (note.book_label.clone(), note.book_id)
}

/// Splits `limit` into `parts` near-equal shares, the earlier parts taking the remainder.
fn split_quota(limit: usize, parts: usize) -> Vec<usize> {
    (0..parts)
        .map(|i| limit / parts + usize::from(i < limit % parts))
        .collect()
}

/// Orders notes so that consecutive entries come from different books where possible.
fn interleave_books(notes: Vec<Note>) -> VecDeque<Note> {
    let mut by_book: BTreeMap<BookKey, Vec<Note>> = BTreeMap::new();
    for note in notes {
        by_book
            .entry(book_key(&note))
            .or_default()
            .push(note);
    }

    let mut books: Vec<std::vec::IntoIter<Note>> = by_book
        .into_values()
        .map(|mut notes| {
            notes.sort_by_key(|n| n.id);
            notes.into_iter()
        })
        .collect();

    let mut out = VecDeque::new();
    loop {
        let before = out.len();
        for book in books.iter_mut() {
            if let Some(note) = book.next() {
                out.push_back(note);
            }
        }
        if out.len() == before {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2009, 11, 10, 12, 2, 0).unwrap()
    }

    fn note(id: i64, book_id: i64, label: &str, age: Duration) -> Note {
        Note {
            id,
            uuid: Uuid::new_v4(),
            book_id,
            book_label: label.to_string(),
            body: format!("note {}", id),
            added_on: now() - age,
        }
    }

    fn ids(notes: &[Note]) -> Vec<i64> {
        notes.iter().map(|n| n.id).collect()
    }

    #[test]
    fn one_book_does_not_crowd_out_the_others() {
        let old = Duration::days(30);
        let mut candidates: Vec<Note> = (1..=10).map(|id| note(id, 1, "rust", old)).collect();
        candidates.push(note(11, 2, "go", old));
        candidates.push(note(12, 3, "zig", old));

        let selected = BalancedSelection.select(candidates, 4, now());

        let labels: Vec<&str> = selected.iter().map(|n| n.book_label.as_str()).collect();
        assert_eq!(labels, vec!["go", "rust", "zig", "rust"]);
        assert_eq!(ids(&selected), vec![11, 1, 12, 2]);
    }

    #[test]
    fn selection_ignores_input_order() {
        let mut candidates = vec![
            note(5, 2, "b", Duration::hours(2)),
            note(1, 1, "a", Duration::days(4)),
            note(3, 1, "a", Duration::days(10)),
            note(2, 2, "b", Duration::days(10)),
            note(4, 1, "a", Duration::hours(5)),
            note(6, 3, "c", Duration::days(5)),
        ];
        let first = BalancedSelection.select(candidates.clone(), 4, now());

        candidates.reverse();
        let second = BalancedSelection.select(candidates, 4, now());

        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn quota_is_spread_across_tiers() {
        let candidates = vec![
            note(1, 1, "a", Duration::hours(1)),
            note(2, 1, "a", Duration::hours(2)),
            note(3, 1, "a", Duration::days(4)),
            note(4, 1, "a", Duration::days(5)),
            note(5, 1, "a", Duration::days(8)),
            note(6, 1, "a", Duration::days(9)),
        ];

        let selected = BalancedSelection.select(candidates, 3, now());
        assert_eq!(ids(&selected), vec![1, 3, 5]);
    }

    #[test]
    fn unused_quota_flows_to_other_tiers() {
        let candidates = vec![
            note(1, 1, "a", Duration::days(20)),
            note(2, 2, "b", Duration::days(20)),
            note(3, 1, "a", Duration::days(21)),
            note(4, 3, "c", Duration::hours(1)),
        ];

        let selected = BalancedSelection.select(candidates, 3, now());
        assert_eq!(ids(&selected), vec![4, 1, 2]);
    }

    #[test]
    fn leftover_quota_goes_to_the_least_picked_books() {
        let mut candidates: Vec<Note> = (1..=10).map(|id| note(id, 1, "a", Duration::hours(1))).collect();
        candidates.extend((11..=15).map(|id| note(id, 2, "b", Duration::days(30))));
        candidates.extend((16..=20).map(|id| note(id, 3, "c", Duration::days(30))));

        let selected = BalancedSelection.select(candidates, 6, now());

        let labels: Vec<&str> = selected.iter().map(|n| n.book_label.as_str()).collect();
        assert_eq!(labels, vec!["a", "a", "b", "c", "b", "c"]);
        assert_eq!(ids(&selected), vec![1, 2, 11, 16, 12, 17]);
    }

    #[test]
    fn returns_everything_when_limit_exceeds_candidates() {
        let candidates = vec![
            note(1, 1, "a", Duration::days(1)),
            note(2, 1, "a", Duration::days(8)),
        ];

        assert_eq!(BalancedSelection.select(candidates.clone(), 10, now()).len(), 2);
        assert!(BalancedSelection.select(candidates, 0, now()).is_empty());
    }

    #[test]
    fn quota_split_favours_earlier_tiers() {
        assert_eq!(split_quota(7, 3), vec![3, 2, 2]);
        assert_eq!(split_quota(2, 3), vec![1, 1, 0]);
    }
}
