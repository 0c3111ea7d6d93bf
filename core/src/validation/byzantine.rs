//! Byzantine-resistant vote aggregation
//!
//! A decision needs a supermajority of the population, `⌊2n/3⌋ + 1`
//! distinct voters. Confidences are sorted and trimmed from both ends
//! before averaging. With `enforce_byzantine_budget`, at least `⌊(n-1)/3⌋`
//! votes are trimmed per side, which is the largest Byzantine share the
//! threshold tolerates, so a colluding minority can never reach the mean.

use crate::config::ValidationConfig;
use crate::record::{Assessment, ValidationVote};
use crate::types::{InstanceId, RecordId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum distinct votes for a decision in a population of `n`
pub fn threshold(n: usize) -> usize {
    2 * n / 3 + 1
}

/// Mean of `sorted` after dropping `trim` values from each end
///
/// `sorted` must be ascending. Returns 0.0 if nothing survives the trim.
pub fn trimmed_mean(sorted: &[f64], trim: usize) -> f64 {
    if sorted.len() <= 2 * trim {
        return 0.0;
    }
    let kept = &sorted[trim..sorted.len() - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Median of an ascending slice
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Decision for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub record_id: RecordId,
    pub valid: bool,
    pub trimmed_mean: f64,
    pub median: f64,
    pub vote_count: usize,
    pub threshold_required: usize,
    pub trimmed_per_side: usize,
    /// Voters whose confidence is far from the median
    pub outliers: Vec<InstanceId>,
}

impl ValidationReport {
    pub fn assessment(&self) -> Assessment {
        Assessment {
            trimmed_mean: self.trimmed_mean,
            median: self.median,
            vote_count: self.vote_count,
            valid: self.valid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Decided(ValidationReport),
    /// Too few distinct voters; the record stays pending
    Insufficient { received: usize, required: usize },
}

impl ValidationOutcome {
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            ValidationOutcome::Decided(report) => Some(report),
            ValidationOutcome::Insufficient { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.report().map(|r| r.valid).unwrap_or(false)
    }

    pub fn into_result(self) -> Result<ValidationReport> {
        match self {
            ValidationOutcome::Decided(report) => Ok(report),
            ValidationOutcome::Insufficient { received, required } => {
                Err(Error::InsufficientVotes { received, required })
            }
        }
    }
}

/// Aggregates votes into a decision
pub trait Validator: Send + Sync {
    fn validate(&self, record_id: &RecordId, votes: &[ValidationVote], population: usize) -> ValidationOutcome;
}

/// Trimmed-mean validator with a supermajority threshold
#[derive(Debug, Clone, Default)]
pub struct ByzantineValidator {
    config: ValidationConfig,
}

impl ByzantineValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Values dropped from each end of `m` sorted votes
    pub fn trim_count(&self, m: usize, population: usize) -> usize {
        let mut trim = (m as f64 * self.config.trim_percent).floor() as usize;
        if self.config.enforce_byzantine_budget {
            trim = trim.max(population.saturating_sub(1) / 3);
        }
        // Always keep at least one value
        if m > 0 && 2 * trim >= m {
            trim = (m - 1) / 2;
        }
        trim
    }

    /// One vote per instance for `record_id`, later votes replacing earlier
    fn deduplicate(record_id: &RecordId, votes: &[ValidationVote]) -> BTreeMap<InstanceId, ValidationVote> {
        let mut meta = crate::record::ValidationMeta::default();
        for vote in votes {
            if vote.record_id != *record_id {
                continue;
            }
            if !(0.0..=1.0).contains(&vote.confidence) {
                debug!(instance = %vote.instance_id, confidence = vote.confidence, "Discarding out-of-range vote");
                continue;
            }
            meta.record_vote(vote.clone());
        }
        meta.votes
    }
}

impl Validator for ByzantineValidator {
    fn validate(&self, record_id: &RecordId, votes: &[ValidationVote], population: usize) -> ValidationOutcome {
        let population = population.max(1);
        let required = threshold(population);
        let votes = Self::deduplicate(record_id, votes);

        if votes.len() < required {
            return ValidationOutcome::Insufficient {
                received: votes.len(),
                required,
            };
        }

        let mut confidences: Vec<f64> = votes.values().map(|v| v.confidence).collect();
        confidences.sort_by(f64::total_cmp);

        let trim = self.trim_count(confidences.len(), population);
        let mean = trimmed_mean(&confidences, trim);
        let mid = median(&confidences);

        let outliers = votes
            .values()
            .filter(|v| (v.confidence - mid).abs() > self.config.outlier_tolerance)
            .map(|v| v.instance_id.clone())
            .collect();

        let report = ValidationReport {
            record_id: *record_id,
            valid: mean >= self.config.validation_threshold,
            trimmed_mean: mean,
            median: mid,
            vote_count: confidences.len(),
            threshold_required: required,
            trimmed_per_side: trim,
            outliers,
        };

        debug!(
            record_id = %record_id,
            votes = report.vote_count,
            trimmed_mean = report.trimmed_mean,
            valid = report.valid,
            "Validated record"
        );

        ValidationOutcome::Decided(report)
    }
}
