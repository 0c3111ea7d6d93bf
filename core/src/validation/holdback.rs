//! Holdback queue for votes that arrive before their record
//!
//! Votes travel independently of the records they judge, so a peer can
//! hear a vote before the record itself reaches it. Such votes are held
//! here, indexed by the record they wait for:
//! - When the record is accepted, its waiting votes are released
//! - Votes older than MAX_BUFFER_TIME_MS are dropped
//! - The queue is bounded to prevent unbounded buffering

use crate::record::ValidationVote;
use crate::types::{InstanceId, RecordId};
use std::collections::{HashMap, VecDeque};

/// Maximum number of votes to buffer before rejecting new ones
pub const MAX_BUFFERED_VOTES: usize = 10_000;

/// Maximum time (in milliseconds) a vote can stay buffered
pub const MAX_BUFFER_TIME_MS: u64 = 300_000; // 5 minutes

/// A buffered vote with metadata
#[derive(Debug, Clone)]
struct BufferedVote {
    vote: ValidationVote,

    /// Timestamp when buffered (for expiration)
    buffered_at: u64,
}

/// Holdback queue for votes awaiting their record
#[derive(Debug, Default)]
pub struct VoteHoldback {
    /// Index: record_id -> (voter -> vote)
    waiting_for: HashMap<RecordId, HashMap<InstanceId, BufferedVote>>,

    /// FIFO queue for expiration checking
    insertion_order: VecDeque<(RecordId, InstanceId, u64)>,

    len: usize,
}

impl VoteHoldback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a vote whose record is not yet known
    ///
    /// A newer vote from the same instance replaces the buffered one.
    pub fn buffer(&mut self, vote: ValidationVote, current_time: u64) -> Result<(), String> {
        let existing = self
            .waiting_for
            .get(&vote.record_id)
            .and_then(|voters| voters.get(&vote.instance_id));
        let replacing = existing.is_some();

        if !replacing && self.len >= MAX_BUFFERED_VOTES {
            return Err("Vote holdback queue full".to_string());
        }
        if existing.map(|b| b.vote.timestamp >= vote.timestamp).unwrap_or(false) {
            return Ok(());
        }

        let voters = self.waiting_for.entry(vote.record_id).or_default();

        self.insertion_order
            .push_back((vote.record_id, vote.instance_id.clone(), current_time));
        voters.insert(
            vote.instance_id.clone(),
            BufferedVote {
                vote,
                buffered_at: current_time,
            },
        );
        if !replacing {
            self.len += 1;
        }
        Ok(())
    }

    /// Release votes waiting for a record that has just been accepted
    pub fn on_record_accepted(&mut self, record_id: &RecordId) -> Vec<ValidationVote> {
        match self.waiting_for.remove(record_id) {
            Some(voters) => {
                self.len -= voters.len();
                let mut votes: Vec<ValidationVote> = voters.into_values().map(|b| b.vote).collect();
                votes.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                votes
            }
            None => Vec::new(),
        }
    }

    /// Remove expired votes
    ///
    /// Returns votes that have been buffered longer than MAX_BUFFER_TIME_MS
    pub fn expire_old_votes(&mut self, current_time: u64) -> Vec<ValidationVote> {
        let mut expired = Vec::new();

        // Check from front of queue (oldest first)
        while let Some((record_id, instance, queued_at)) = self.insertion_order.front().cloned() {
            if current_time.saturating_sub(queued_at) <= MAX_BUFFER_TIME_MS {
                // Queue is ordered, so stop at first non-expired
                break;
            }
            self.insertion_order.pop_front();

            let Some(voters) = self.waiting_for.get_mut(&record_id) else {
                // Already released, skip
                continue;
            };
            // A replacement re-queued this voter later; only the entry
            // matching the stored time expires it.
            if voters.get(&instance).map(|b| b.buffered_at) != Some(queued_at) {
                continue;
            }
            if let Some(buffered) = voters.remove(&instance) {
                self.len -= 1;
                expired.push(buffered.vote);
            }
            if voters.is_empty() {
                self.waiting_for.remove(&record_id);
            }
        }

        expired
    }

    /// Get current queue size
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
