//! Per-account, per-asset volume counters
//!
//! Volumes only ever grow: a posting adds its amount to the source's output
//! and to the destination's input. Balances are derived, never stored.

use crate::transaction::{Posting, Transaction};
use crate::types::{Address, Amount, Asset};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Input and output counters for one (account, asset) pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volumes {
    /// Total received
    pub input: Amount,
    /// Total sent
    pub output: Amount,
}

impl Volumes {
    /// Create from counters
    pub fn new(input: impl Into<Amount>, output: impl Into<Amount>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// `input - output`
    pub fn balance(&self) -> BigInt {
        self.input.to_bigint() - self.output.to_bigint()
    }

    /// Add to both counters
    pub fn merge(&mut self, other: &Volumes) {
        self.input += &other.input;
        self.output += &other.output;
    }
}

/// Volumes keyed by account then asset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountsAssetsVolumes(BTreeMap<Address, BTreeMap<Asset, Volumes>>);

impl AccountsAssetsVolumes {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Volumes for a pair, zero if unknown
    pub fn get(&self, account: &Address, asset: &Asset) -> Volumes {
        self.get_ref(account, asset).cloned().unwrap_or_default()
    }

    /// Volumes for a pair if present
    pub fn get_ref(&self, account: &Address, asset: &Asset) -> Option<&Volumes> {
        self.0.get(account)?.get(asset)
    }

    /// All assets of one account
    pub fn assets(&self, account: &Address) -> Option<&BTreeMap<Asset, Volumes>> {
        self.0.get(account)
    }

    /// Replace the volumes of a pair
    pub fn set(&mut self, account: Address, asset: Asset, volumes: Volumes) {
        self.0.entry(account).or_default().insert(asset, volumes);
    }

    fn entry(&mut self, account: &Address, asset: &Asset) -> &mut Volumes {
        self.0
            .entry(account.clone())
            .or_default()
            .entry(asset.clone())
            .or_default()
    }

    /// Apply the effect of postings: source output and destination input grow
    pub fn apply_postings(&mut self, postings: &[Posting]) {
        for posting in postings {
            self.entry(&posting.source, &posting.asset).output += &posting.amount;
            self.entry(&posting.destination, &posting.asset).input += &posting.amount;
        }
    }

    /// Sum `other` into `self`
    pub fn merge(&mut self, other: &AccountsAssetsVolumes) {
        for (account, asset, volumes) in other.iter() {
            self.entry(account, asset).merge(volumes);
        }
    }

    /// Copy only the pairs touched by `postings`, zero-filled when absent
    pub fn restrict_to(&self, postings: &[Posting]) -> AccountsAssetsVolumes {
        let mut subset = AccountsAssetsVolumes::new();
        for posting in postings {
            for account in [&posting.source, &posting.destination] {
                subset.set(
                    account.clone(),
                    posting.asset.clone(),
                    self.get(account, &posting.asset),
                );
            }
        }
        subset
    }

    /// Iterate over (account, asset, volumes) in key order
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Asset, &Volumes)> {
        self.0.iter().flat_map(|(account, assets)| {
            assets
                .iter()
                .map(move |(asset, volumes)| (account, asset, volumes))
        })
    }

    /// Every (account, asset) pair
    pub fn pairs(&self) -> Vec<(Address, Asset)> {
        self.iter()
            .map(|(account, asset, _)| (account.clone(), asset.clone()))
            .collect()
    }

    /// Number of accounts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no account is tracked
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Net volume deltas of a batch of postings
pub fn aggregate_deltas<'a>(postings: impl IntoIterator<Item = &'a [Posting]>) -> AccountsAssetsVolumes {
    let mut deltas = AccountsAssetsVolumes::new();
    for batch in postings {
        deltas.apply_postings(batch);
    }
    deltas
}

/// Latest post-commit volumes of every pair touched by `transactions`
///
/// Transactions are expected in commit order; the last occurrence wins.
pub fn aggregate_post_commit_volumes(transactions: &[Transaction]) -> AccountsAssetsVolumes {
    let mut aggregated = AccountsAssetsVolumes::new();
    for transaction in transactions {
        for (account, asset, volumes) in transaction.post_commit_volumes.iter() {
            aggregated.set(account.clone(), asset.clone(), volumes.clone());
        }
    }
    aggregated
}
