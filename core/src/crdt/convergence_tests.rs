//! Property-based tests for CRDT convergence
//!
//! Tests that verify the merge laws hold for every replicated structure:
//! - Commutativity: merge(a, b) == merge(b, a)
//! - Associativity: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - Idempotence: merge(a, a) == a

use proptest::prelude::*;
use crate::crdt::{check_merge_laws, LwwRegister, Merger, OrSet, RecordSet, Tag};
use crate::crypto::{LocalIdentity, SecretKey};
use crate::record::{CausalStamp, MemoryRecord, ValidationVote};
use crate::types::*;

const INSTANCES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];
const CONTENTS: [&str; 5] = ["sky is blue", "grass is green", "water is wet", "fire is hot", "ice is cold"];
const LABELS: [&str; 3] = ["urgent", "verified", "archived"];

/// Per-replica edits applied on top of a freshly created record
#[derive(Debug, Clone)]
struct RecordSpec {
    content: usize,
    signer: usize,
    seen: Vec<usize>,
    importance: Option<(u64, usize, f64)>,
    labels: Vec<(usize, u64, usize, bool)>,
    vote: Option<(usize, u64, f64)>,
}

fn identity(index: usize) -> LocalIdentity {
    let secret = SecretKey::from_bytes([index as u8 + 1; 32]);
    LocalIdentity::from_secret(InstanceId::new(INSTANCES[index]), &secret, index)
}

fn arb_spec() -> impl Strategy<Value = RecordSpec> {
    (
        0..CONTENTS.len(),
        0..INSTANCES.len(),
        prop::collection::vec(0..INSTANCES.len(), 0..3),
        prop::option::of((1u64..20, 0..INSTANCES.len(), 0.0f64..1.0)),
        prop::collection::vec((0..LABELS.len(), 1u64..20, 0..INSTANCES.len(), any::<bool>()), 0..4),
        prop::option::of((0..INSTANCES.len(), 1u64..20, 0.0f64..1.0)),
    )
        .prop_map(|(content, signer, seen, importance, labels, vote)| RecordSpec {
            content,
            signer,
            seen,
            importance,
            labels,
            vote,
        })
}

fn build(spec: &RecordSpec) -> MemoryRecord {
    let signer = identity(spec.signer);
    let mut record = MemoryRecord::new_signed(
        &signer,
        CONTENTS[spec.content],
        MemoryType::Knowledge,
        1_000,
        CausalStamp::default(),
    );

    for &i in &spec.seen {
        record.meta.gossip.seen_by.insert(InstanceId::new(INSTANCES[i]));
    }
    if let Some((ts, who, value)) = spec.importance {
        record.meta.importance.set(value, ts, InstanceId::new(INSTANCES[who]));
    }
    for &(label, seq, who, remove) in &spec.labels {
        let label = LABELS[label].to_string();
        record.meta.labels.add(label.clone(), Tag::new(InstanceId::new(INSTANCES[who]), seq));
        if remove {
            record.meta.labels.remove(&label);
        }
    }
    if let Some((who, ts, confidence)) = spec.vote {
        let vote = ValidationVote::new(InstanceId::new(INSTANCES[who]), record.id(), confidence, ts).unwrap();
        record.meta.validation.record_vote(vote);
    }
    record
}

fn arb_record_set() -> impl Strategy<Value = RecordSet> {
    prop::collection::vec(arb_spec(), 0..6)
        .prop_map(|specs| specs.iter().map(build).collect::<RecordSet>())
}

fn arb_lww() -> impl Strategy<Value = LwwRegister<f64>> {
    (0.0f64..1.0, 0u64..5, 0..INSTANCES.len())
        .prop_map(|(v, ts, who)| LwwRegister::new(v, ts, InstanceId::new(INSTANCES[who])))
}

fn arb_orset() -> impl Strategy<Value = OrSet<String>> {
    prop::collection::vec((0..LABELS.len(), 0u64..6, 0..INSTANCES.len(), any::<bool>()), 0..6)
        .prop_map(|ops| {
            let mut set = OrSet::new();
            for (label, seq, who, remove) in ops {
                let label = LABELS[label].to_string();
                set.add(label.clone(), Tag::new(InstanceId::new(INSTANCES[who]), seq));
                if remove {
                    set.remove(&label);
                }
            }
            set
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Test: record sets satisfy all three merge laws
    #[test]
    fn test_record_set_merge_laws(a in arb_record_set(), b in arb_record_set(), c in arb_record_set()) {
        prop_assert!(check_merge_laws(&a, &b, &c).is_ok());
    }

    /// Test: replicas receiving the same records in different orders converge
    #[test]
    fn test_delivery_order_irrelevant(specs in prop::collection::vec(arb_spec(), 1..8)) {
        let records: Vec<MemoryRecord> = specs.iter().map(build).collect();

        let mut forward = RecordSet::new();
        for r in &records {
            forward.insert(r.clone());
        }

        let mut backward = RecordSet::new();
        for r in records.iter().rev() {
            backward.insert(r.clone());
        }

        // Redelivery of everything is harmless
        for r in &records {
            backward.insert(r.clone());
        }

        prop_assert_eq!(forward, backward);
    }

    /// Test: content never changes through merge
    #[test]
    fn test_merge_preserves_content(a in arb_record_set(), b in arb_record_set()) {
        let merged = a.merge(&b);
        for record in merged.iter() {
            prop_assert!(record.verify().is_ok());
        }
    }

    #[test]
    fn test_lww_merge_laws(a in arb_lww(), b in arb_lww(), c in arb_lww()) {
        prop_assert!(check_merge_laws(&a, &b, &c).is_ok());
    }

    #[test]
    fn test_orset_merge_laws(a in arb_orset(), b in arb_orset(), c in arb_orset()) {
        prop_assert!(check_merge_laws(&a, &b, &c).is_ok());
    }
}
