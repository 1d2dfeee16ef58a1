//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Conservation: Σ(inputs) == Σ(outputs) per asset, however work is batched
//! - Batching transparency: committing in batches yields the same volumes
//! - Chain integrity: altering any entry breaks verification at that entry

use chrono::Utc;
use ledger_core::{
    log::{MetadataSetPayload, TransactionCreatedPayload},
    volumes::{aggregate_deltas, aggregate_post_commit_volumes},
    verify_chain, AccountsAssetsVolumes, Address, Error, Log, LogPayload, MetadataTarget, NewLog,
    Posting, Transaction, TransactionData,
};
use num_bigint::BigInt;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

/// Strategy for account addresses
fn address_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("world".to_string()),
        "users:[0-9]{1,2}",
        "bank:[a-z]{1,3}:main",
    ]
}

/// Strategy for asset codes
fn asset_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("USD/2".to_string()), Just("EUR".to_string()), Just("COIN".to_string())]
}

/// Strategy for postings
fn posting_strategy() -> impl Strategy<Value = Posting> {
    (
        address_strategy(),
        address_strategy(),
        1u64..1_000_000u64,
        asset_strategy(),
    )
        .prop_map(|(source, destination, amount, asset)| {
            Posting::new(&source, &destination, amount, &asset).unwrap()
        })
}

/// Strategy for transaction batches: a list of batches of transactions
fn batches_strategy() -> impl Strategy<Value = Vec<Vec<TransactionData>>> {
    prop::collection::vec(
        prop::collection::vec(
            prop::collection::vec(posting_strategy(), 1..4).prop_map(TransactionData::new),
            1..5,
        ),
        1..6,
    )
}

fn commit_all(batches: &[Vec<TransactionData>]) -> (Vec<Transaction>, AccountsAssetsVolumes) {
    let mut running = AccountsAssetsVolumes::new();
    let mut committed = Vec::new();
    let mut next_id = 0u64;
    for batch in batches {
        for data in batch {
            committed.push(Transaction::commit(next_id, data.clone(), &mut running));
            next_id += 1;
        }
    }
    (committed, running)
}

fn chain_of(payloads: Vec<LogPayload>) -> Vec<Log> {
    let mut logs: Vec<Log> = Vec::new();
    for payload in payloads {
        let log = NewLog::new(payload).chain(logs.last());
        logs.push(log);
    }
    logs
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: per asset, the sum of all balances is zero
    #[test]
    fn prop_conservation(batches in batches_strategy()) {
        let (_, volumes) = commit_all(&batches);

        let mut per_asset: HashMap<String, BigInt> = HashMap::new();
        for (_, asset, v) in volumes.iter() {
            *per_asset.entry(asset.to_string()).or_default() += v.balance();
        }

        for (asset, total) in per_asset {
            prop_assert_eq!(total, BigInt::from(0), "asset {} not conserved", asset);
        }
    }

    /// Property: batch deltas applied at once equal per-transaction commits
    #[test]
    fn prop_batching_is_transparent(batches in batches_strategy()) {
        let (committed, sequential) = commit_all(&batches);

        let mut batched = AccountsAssetsVolumes::new();
        for batch in &batches {
            let deltas = aggregate_deltas(batch.iter().map(|t| t.postings.as_slice()));
            batched.merge(&deltas);
        }
        prop_assert_eq!(&batched, &sequential);

        // Latest post-commit snapshot of every touched pair is the final state
        prop_assert_eq!(aggregate_post_commit_volumes(&committed), sequential);
    }

    /// Property: post = pre + own postings for every transaction
    #[test]
    fn prop_pre_post_consistency(batches in batches_strategy()) {
        let (committed, _) = commit_all(&batches);

        for tx in &committed {
            let mut expected = tx.pre_commit_volumes.clone();
            expected.apply_postings(tx.postings());
            prop_assert_eq!(&expected, &tx.post_commit_volumes);
        }
    }

    /// Property: mutating one stored entry is reported at exactly that entry
    #[test]
    fn prop_chain_detects_tampering(
        batches in batches_strategy(),
        target in any::<prop::sample::Index>(),
    ) {
        let (committed, _) = commit_all(&batches);
        let alice = Address::new("alice").unwrap();

        let mut payloads = Vec::new();
        for tx in committed {
            payloads.push(LogPayload::TransactionCreated(TransactionCreatedPayload {
                transaction: tx,
                account_metadata: BTreeMap::new(),
            }));
            payloads.push(LogPayload::MetadataSet(MetadataSetPayload {
                target: MetadataTarget::Account(alice.clone()),
                metadata: [("seen", json!(true))].into_iter().collect(),
            }));
        }

        let mut logs = chain_of(payloads);
        prop_assert!(verify_chain(&logs, None).is_ok());

        let index = target.index(logs.len());
        logs[index].date = logs[index].date + chrono::Duration::microseconds(1);

        prop_assert_eq!(
            verify_chain(&logs, None),
            Err(Error::ChainBroken { id: index as u64 })
        );
    }
}

#[test]
fn test_empty_chain_verifies() {
    assert!(verify_chain(&[], None).is_ok());
    let first = NewLog::new(LogPayload::MetadataSet(MetadataSetPayload {
        target: MetadataTarget::Transaction(0),
        metadata: Default::default(),
    }))
    .chain(None);
    assert_eq!(first.id, 0);
    assert!(first.date <= Utc::now());
}
