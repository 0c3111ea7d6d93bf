//! Convergent consolidation of near-duplicate records
//!
//! Records whose embeddings are at least `similarity_threshold` apart are
//! linked, and every connected group becomes a cluster. Each cluster is
//! refined iteratively: the member nearest the centroid is chosen as
//! representative, the centroid is pulled toward it, and the loop stops
//! once the representative no longer changes. The representative keeps
//! its content and id and gains the union of the members' provenance plus
//! a trimmed-mean confidence. No record is ever removed.
//!
//! The pass is a pure function of its input, so running it on its own
//! output yields the same canonical set. A confidence that changed is
//! written unstamped; the node stamps it with its Lamport clock when the
//! result is stored.

pub mod embedding;

pub use embedding::{cosine, Embedder, TokenHashEmbedder};

use crate::config::{ConsolidationConfig, ValidationConfig};
use crate::crdt::{LwwRegister, Merger, RecordSet};
use crate::record::{ConvergenceMeta, MemoryRecord};
use crate::types::RecordId;
use crate::validation::{trimmed_mean, ByzantineValidator};
use crate::Error;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result for one multi-member cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutcome {
    /// Representative with provenance applied; the first member in
    /// canonical order if the cluster did not converge
    pub canonical_record: MemoryRecord,
    /// All member ids, ascending
    pub sources: Vec<RecordId>,
    pub confidence: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    /// Records that remain canonical, ascending by id
    pub canonical: Vec<MemoryRecord>,
    pub clusters: Vec<ClusterOutcome>,
    pub warnings: Vec<String>,
}

impl ConsolidationReport {
    pub fn canonical_ids(&self) -> Vec<RecordId> {
        self.canonical.iter().map(|r| r.id()).collect()
    }
}

pub struct Consolidator {
    config: ConsolidationConfig,
    validator: ByzantineValidator,
}

impl Consolidator {
    pub fn new(config: ConsolidationConfig, validation: ValidationConfig) -> Self {
        Self {
            config,
            validator: ByzantineValidator::new(validation),
        }
    }

    pub fn consolidate(&self, records: &[MemoryRecord], embedder: &dyn Embedder) -> ConsolidationReport {
        // Collapse replicas of the same id and fix a deterministic order
        let records = records.iter().cloned().collect::<RecordSet>().into_records();
        let embeddings: Vec<Vec<f64>> = records.iter().map(|r| embedder.embed(r.content())).collect();

        let mut report = ConsolidationReport::default();
        for members in self.components(&embeddings) {
            if members.len() == 1 {
                report.canonical.push(records[members[0]].clone());
                continue;
            }

            let outcome = self.refine(&records, &embeddings, &members);
            if outcome.converged {
                report.canonical.push(outcome.canonical_record.clone());
            } else {
                let failure = Error::ConvergenceFailure {
                    iterations: outcome.iterations,
                };
                report
                    .warnings
                    .push(format!("{}; leaving {} records unmerged", failure, members.len()));
                report.canonical.extend(members.iter().map(|&i| records[i].clone()));
            }
            report.clusters.push(outcome);
        }

        report.canonical.sort_by_key(|r| r.id());
        info!(
            input = records.len(),
            canonical = report.canonical.len(),
            clusters = report.clusters.len(),
            warnings = report.warnings.len(),
            "Consolidation pass complete"
        );
        report
    }

    /// Connected groups of the similarity graph, members in canonical order
    fn components(&self, embeddings: &[Vec<f64>]) -> Vec<Vec<usize>> {
        let n = embeddings.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for i in 0..n {
            for j in (i + 1)..n {
                if cosine(&embeddings[i], &embeddings[j]) >= self.config.similarity_threshold {
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    if a != b {
                        parent[a.max(b)] = a.min(b);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }
        groups.into_values().collect()
    }

    fn refine(&self, records: &[MemoryRecord], embeddings: &[Vec<f64>], members: &[usize]) -> ClusterOutcome {
        // Earliest first, ids break ties
        let mut members = members.to_vec();
        members.sort_by_key(|&i| (records[i].created_at(), records[i].id()));

        let mut confidences: Vec<f64> = members.iter().map(|&i| records[i].own_confidence()).collect();
        confidences.sort_by(f64::total_cmp);
        let trim = self.validator.trim_count(confidences.len(), confidences.len());
        let confidence = trimmed_mean(&confidences, trim);

        let mut provenance = ConvergenceMeta::default();
        for &i in &members {
            provenance.merge_in(&records[i].meta.convergence);
            provenance.sources.insert(records[i].id());
        }

        let mut centroid = mean(members.iter().map(|&i| embeddings[i].as_slice()));
        let mut previous: Option<usize> = None;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iterations {
            iterations += 1;
            let representative = nearest(&members, embeddings, &centroid);
            if previous == Some(representative) {
                converged = true;
                break;
            }
            previous = Some(representative);

            // Pull the centroid toward members similar to the representative
            let anchor = &embeddings[representative];
            let mut next = vec![0.0; centroid.len()];
            for &i in &members {
                let weight = cosine(&embeddings[i], anchor).max(0.0);
                for (n, x) in next.iter_mut().zip(&embeddings[i]) {
                    *n += weight * x;
                }
            }
            embedding::normalize(&mut next);
            centroid = next;
        }

        let sources: Vec<RecordId> = provenance.sources.iter().copied().collect();
        let canonical_record = match (converged, previous) {
            (true, Some(representative)) => {
                let mut record = records[representative].clone();
                provenance.confidence = match record.meta.convergence.confidence.take() {
                    Some(current) if *current.value() == confidence => Some(current),
                    _ => Some(LwwRegister::initial(confidence)),
                };
                record.meta.convergence = provenance;
                debug!(
                    record_id = %record.id(),
                    members = members.len(),
                    iterations,
                    confidence,
                    "Cluster converged"
                );
                record
            }
            _ => records[members[0]].clone(),
        };

        ClusterOutcome {
            canonical_record,
            sources,
            confidence,
            iterations,
            converged,
        }
    }
}

fn mean<'a>(vectors: impl Iterator<Item = &'a [f64]>) -> Vec<f64> {
    let mut out: Vec<f64> = Vec::new();
    for v in vectors {
        if out.is_empty() {
            out = vec![0.0; v.len()];
        }
        for (o, x) in out.iter_mut().zip(v) {
            *o += x;
        }
    }
    embedding::normalize(&mut out);
    out
}

/// Member closest to `centroid`; the earlier member wins ties
fn nearest(members: &[usize], embeddings: &[Vec<f64>], centroid: &[f64]) -> usize {
    let mut best = members[0];
    let mut best_score = f64::NEG_INFINITY;
    for &i in members {
        let score = cosine(&embeddings[i], centroid);
        if score > best_score + 1e-12 {
            best = i;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{LocalIdentity, SecretKey};
    use crate::record::CausalStamp;
    use crate::types::{InstanceId, MemoryType};

    fn record(content: &str, created_at: u64, importance: f64) -> MemoryRecord {
        let identity = LocalIdentity::from_secret(InstanceId::new("agent"), &SecretKey::from_bytes([7; 32]), 0);
        let mut r = MemoryRecord::new_signed(&identity, content, MemoryType::Knowledge, created_at, CausalStamp::default());
        r.meta.importance.set(importance, 1, InstanceId::new("agent"));
        r
    }

    fn consolidator() -> Consolidator {
        Consolidator::new(ConsolidationConfig::default(), ValidationConfig::default())
    }

    #[test]
    fn test_near_duplicates_merge_into_earliest() {
        let records = vec![
            record("Deploy failed at 3am.", 20, 0.5),
            record("deploy FAILED at 3am", 10, 0.5),
            record("user prefers dark mode", 30, 0.5),
        ];
        let report = consolidator().consolidate(&records, &TokenHashEmbedder::default());

        assert_eq!(report.canonical.len(), 2);
        assert_eq!(report.clusters.len(), 1);
        let cluster = &report.clusters[0];
        assert!(cluster.converged);
        assert_eq!(cluster.canonical_record.created_at(), 10);
        assert_eq!(cluster.sources.len(), 2);
        assert_eq!(cluster.canonical_record.meta.convergence.sources.len(), 2);
        assert!(report.warnings.is_empty());
        // Content is never rewritten
        cluster.canonical_record.verify().unwrap();
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let records = vec![
            record("cache hit ratio dropped", 1, 0.4),
            record("Cache hit-ratio dropped!", 2, 0.6),
            record("cache HIT ratio dropped", 3, 0.8),
            record("rotate the api keys weekly", 4, 0.5),
        ];
        let c = consolidator();
        let first = c.consolidate(&records, &TokenHashEmbedder::default());
        let second = c.consolidate(&first.canonical, &TokenHashEmbedder::default());
        assert_eq!(first.canonical, second.canonical);
    }

    #[test]
    fn test_confidence_is_trimmed_mean() {
        let records = vec![
            record("disk is full", 1, 0.1),
            record("Disk is full.", 2, 0.8),
            record("DISK IS FULL", 3, 0.9),
            record("disk, is full", 4, 0.9),
        ];
        let report = consolidator().consolidate(&records, &TokenHashEmbedder::default());
        let cluster = &report.clusters[0];
        // Four members: one trimmed per side
        assert!((cluster.confidence - 0.85).abs() < 1e-9);
        assert!((cluster.canonical_record.confidence() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_tracks_lowered_members() {
        let c = consolidator();
        let records = vec![record("queue is backed up", 1, 0.9), record("Queue is backed up.", 2, 0.9)];
        let first = c.consolidate(&records, &TokenHashEmbedder::default());
        assert!((first.clusters[0].confidence - 0.9).abs() < 1e-9);

        let mut lowered = first.canonical.clone();
        lowered.extend(records.iter().cloned());
        for r in &mut lowered {
            r.meta.importance.set(0.1, 5, InstanceId::new("agent"));
        }
        let second = c.consolidate(&lowered, &TokenHashEmbedder::default());
        let cluster = &second.clusters[0];
        assert!((cluster.confidence - 0.1).abs() < 1e-9);
        assert!((cluster.canonical_record.confidence() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_iteration_cap_leaves_cluster_unmerged() {
        let c = Consolidator::new(
            ConsolidationConfig {
                max_iterations: 1,
                ..Default::default()
            },
            ValidationConfig::default(),
        );
        let records = vec![record("build is green", 1, 0.5), record("Build is GREEN", 2, 0.5)];
        let report = c.consolidate(&records, &TokenHashEmbedder::default());

        assert_eq!(report.canonical.len(), 2);
        assert!(!report.clusters[0].converged);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.canonical.iter().all(|r| r.meta.convergence.sources.is_empty()));
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut records = vec![
            record("alpha beta gamma", 1, 0.5),
            record("Alpha, beta, gamma", 2, 0.5),
            record("delta epsilon", 3, 0.5),
        ];
        let c = consolidator();
        let a = c.consolidate(&records, &TokenHashEmbedder::default());
        records.reverse();
        let b = c.consolidate(&records, &TokenHashEmbedder::default());
        assert_eq!(a.canonical, b.canonical);
    }
}
