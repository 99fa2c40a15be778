//! Property tests for milestoned merge
//!
//! Each case drives a fresh in-process pipeline through a random sequence of
//! Store1 snapshots and checks the merge store after every firing.

mod common;

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use common::{customer, Harness, FORENSIC, LIVE};
use ydp_engine::merge::{MergeStore, VersionRecord};
use ydp_engine::records::Row;

/// Customer id to email variant
type Snapshot = BTreeMap<u8, u8>;

fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
    prop::collection::btree_map(0u8..6, 0u8..3, 0..6)
}

fn arb_history() -> impl Strategy<Value = Vec<Snapshot>> {
    prop::collection::vec(arb_snapshot(), 1..6)
}

fn rows(snapshot: &Snapshot) -> Vec<Row> {
    snapshot
        .iter()
        .map(|(id, email)| customer(&format!("c{}", id), &format!("e{}@x.com", email)))
        .collect()
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

async fn fire(h: &Harness, snapshot: &Snapshot) {
    h.source.set_rows("Store1", "customers", rows(snapshot));
    let outcome = h.pipeline.fire("Store1").await.unwrap();
    assert!(outcome.runs().iter().all(|r| r.is_committed()));
}

async fn live_rows(h: &Harness) -> BTreeMap<String, Row> {
    h.store
        .open_records(LIVE, "Store1", "customers")
        .await
        .unwrap()
        .into_iter()
        .map(|(key, record)| (key.0, record.row))
        .collect()
}

fn id_of(version: &VersionRecord) -> String {
    version.row.get("id").and_then(|v| v.canonical()).unwrap_or_default()
}

/// Check forensic history after `history[..=last]` has been merged
fn check_forensic(versions: &[VersionRecord], history: &[Snapshot]) -> Result<(), TestCaseError> {
    let present = |batch: i64, id: &str| -> bool {
        history[(batch - 1) as usize]
            .keys()
            .any(|k| format!("c{}", k) == id)
    };
    let current = history.len() as i64;

    let mut by_id: BTreeMap<String, Vec<&VersionRecord>> = BTreeMap::new();
    for v in versions {
        by_id.entry(id_of(v)).or_default().push(v);
    }

    for (id, mut chain) in by_id {
        chain.sort_by_key(|v| v.batch_in);

        let open = chain.iter().filter(|v| v.is_open()).count();
        let expected_open = usize::from(present(current, &id));
        prop_assert_eq!(open, expected_open, "open versions of {}", id);

        for pair in chain.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            prop_assert!(prev.batch_in < prev.batch_out);
            prop_assert!(prev.batch_out <= next.batch_in, "overlap for {}", id);
            if present(prev.batch_out, &id) {
                prop_assert_eq!(prev.batch_out, next.batch_in, "gap for {}", id);
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Live store after N snapshots equals the Nth snapshot applied alone
    #[test]
    fn live_store_equals_last_snapshot(history in arb_history()) {
        let (replayed, fresh) = block_on(async {
            let h = Harness::starter();
            for snapshot in &history {
                fire(&h, snapshot).await;
            }

            let only_last = Harness::starter();
            fire(&only_last, history.last().unwrap()).await;

            (live_rows(&h).await, live_rows(&only_last).await)
        });
        prop_assert_eq!(replayed, fresh);
    }

    /// One open version per present key; intervals never overlap and only
    /// break where the key was deleted
    #[test]
    fn forensic_history_is_contiguous(history in arb_history()) {
        let checks: Vec<Vec<VersionRecord>> = block_on(async {
            let h = Harness::starter();
            let mut after_each = Vec::new();
            for snapshot in &history {
                fire(&h, snapshot).await;
                after_each.push(h.versions(FORENSIC, "customers").await);
            }
            after_each
        });

        for (n, versions) in checks.iter().enumerate() {
            check_forensic(versions, &history[..=n])?;
        }
    }

    /// Re-delivering an identical capture adds nothing
    #[test]
    fn redelivery_is_idempotent(snapshot in arb_snapshot()) {
        let (before, after, unchanged) = block_on(async {
            let h = Harness::starter();
            fire(&h, &snapshot).await;
            let before = h.versions(FORENSIC, "customers").await;

            h.source.set_rows("Store1", "customers", rows(&snapshot));
            let outcome = h.pipeline.fire("Store1").await.unwrap();
            let unchanged: BTreeSet<u64> = outcome
                .runs()
                .iter()
                .map(|r| {
                    let totals = r.result.as_ref().unwrap().totals();
                    assert_eq!(totals.changed(), 0);
                    totals.unchanged
                })
                .collect();

            (before, h.versions(FORENSIC, "customers").await, unchanged)
        });

        prop_assert_eq!(before, after);
        prop_assert_eq!(unchanged, BTreeSet::from([snapshot.len() as u64]));
    }
}
