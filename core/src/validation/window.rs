//! Bounded vote collection windows
//!
//! A window opens with the first vote for a record and closes once its
//! duration elapses or it holds `max_votes_per_window` votes. The decision
//! is taken over the votes inside the window. Votes arriving after the
//! close are kept aside and flag the record for a re-validation pass.

use crate::config::ValidationConfig;
use crate::record::{ValidationMeta, ValidationVote};
use crate::types::RecordId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What happened to an offered vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted toward the pending decision
    Counted,
    /// Arrived after the decision; triggers re-validation
    Late,
    /// Older than or equal to a vote already held from the same instance
    Stale,
}

#[derive(Debug)]
struct Window {
    opened_at: Instant,
    votes: ValidationMeta,
    closed: bool,
    late: ValidationMeta,
}

impl Window {
    fn open(now: Instant) -> Self {
        Self {
            opened_at: now,
            votes: ValidationMeta::default(),
            closed: false,
            late: ValidationMeta::default(),
        }
    }
}

/// Per-record collection windows
#[derive(Debug)]
pub struct VoteWindows {
    duration: Duration,
    max_votes: usize,
    windows: HashMap<RecordId, Window>,
}

impl VoteWindows {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            duration: config.collection_window(),
            max_votes: config.max_votes_per_window,
            windows: HashMap::new(),
        }
    }

    pub fn offer(&mut self, vote: ValidationVote, now: Instant) -> Admission {
        let window = self
            .windows
            .entry(vote.record_id)
            .or_insert_with(|| Window::open(now));

        if window.closed {
            if window.late.record_vote(vote) {
                Admission::Late
            } else {
                Admission::Stale
            }
        } else if window.votes.record_vote(vote) {
            Admission::Counted
        } else {
            Admission::Stale
        }
    }

    /// Open windows whose duration elapsed or whose vote cap is reached
    pub fn due(&self, now: Instant) -> Vec<RecordId> {
        let mut due: Vec<RecordId> = self
            .windows
            .iter()
            .filter(|(_, w)| {
                !w.closed
                    && (now.duration_since(w.opened_at) >= self.duration
                        || w.votes.votes.len() >= self.max_votes)
            })
            .map(|(id, _)| *id)
            .collect();
        due.sort();
        due
    }

    /// Close a window and return the votes the decision is taken over
    pub fn close(&mut self, record_id: &RecordId) -> Vec<ValidationVote> {
        match self.windows.get_mut(record_id) {
            Some(window) => {
                window.closed = true;
                window.votes.votes.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Closed records that received late votes, with the full vote set
    ///
    /// Late votes are folded into the window so the next pass sees them.
    pub fn take_revalidations(&mut self) -> Vec<(RecordId, Vec<ValidationVote>)> {
        let mut out = Vec::new();
        for (id, window) in self.windows.iter_mut() {
            if !window.closed || window.late.votes.is_empty() {
                continue;
            }
            for vote in std::mem::take(&mut window.late.votes).into_values() {
                window.votes.record_vote(vote);
            }
            out.push((*id, window.votes.votes.values().cloned().collect()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn is_closed(&self, record_id: &RecordId) -> bool {
        self.windows.get(record_id).map(|w| w.closed).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
