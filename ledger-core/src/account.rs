//! Accounts and account replay
//!
//! Accounts are created implicitly the first time they appear in a posting
//! or receive metadata.

use crate::log::{Log, LogPayload, MetadataTarget};
use crate::transaction::Transaction;
use crate::types::{Address, Asset, Metadata};
use crate::volumes::Volumes;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Account and its merged metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Address
    pub address: Address,
    /// Merged metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl Account {
    /// Account without metadata
    pub fn new(address: Address) -> Self {
        Self {
            address,
            metadata: Metadata::new(),
        }
    }
}

/// Account together with its volumes per asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountWithVolumes {
    /// Account
    #[serde(flatten)]
    pub account: Account,
    /// Volumes per asset
    #[serde(default)]
    pub volumes: BTreeMap<Asset, Volumes>,
}

impl AccountWithVolumes {
    /// Empty account state
    pub fn new(address: Address) -> Self {
        Self {
            account: Account::new(address),
            volumes: BTreeMap::new(),
        }
    }

    /// Address of the account
    pub fn address(&self) -> &Address {
        &self.account.address
    }

    /// `input - output` per asset
    pub fn balances(&self) -> BTreeMap<Asset, BigInt> {
        self.volumes
            .iter()
            .map(|(asset, volumes)| (asset.clone(), volumes.balance()))
            .collect()
    }

    fn apply_transaction(&mut self, transaction: &Transaction) {
        for posting in transaction.postings() {
            if posting.source == self.account.address {
                self.volumes
                    .entry(posting.asset.clone())
                    .or_default()
                    .output += &posting.amount;
            }
            if posting.destination == self.account.address {
                self.volumes
                    .entry(posting.asset.clone())
                    .or_default()
                    .input += &posting.amount;
            }
        }
    }

    /// Advance the state by one log entry
    ///
    /// Entries that do not concern this account are ignored, so a whole log
    /// tail can be folded over the account.
    pub fn apply(&mut self, log: &Log) {
        match &log.payload {
            LogPayload::TransactionCreated(p) => {
                self.apply_transaction(&p.transaction);
                if let Some(metadata) = p.account_metadata.get(&self.account.address) {
                    self.account.metadata.merge(metadata);
                }
            }
            LogPayload::TransactionReverted(p) => self.apply_transaction(&p.transaction),
            LogPayload::MetadataSet(p) => {
                if matches!(&p.target, MetadataTarget::Account(a) if a == &self.account.address) {
                    self.account.metadata.merge(&p.metadata);
                }
            }
            LogPayload::MetadataDeleted(p) => {
                if matches!(&p.target, MetadataTarget::Account(a) if a == &self.account.address) {
                    self.account.metadata.remove(&p.key);
                }
            }
        }
    }

    /// Whether replaying `log` would change this account
    pub fn is_touched_by(&self, log: &Log) -> bool {
        match &log.payload {
            LogPayload::TransactionCreated(p) => {
                p.transaction.involves(&self.account.address)
                    || p.account_metadata.contains_key(&self.account.address)
            }
            LogPayload::TransactionReverted(p) => p.transaction.involves(&self.account.address),
            LogPayload::MetadataSet(p) => {
                matches!(&p.target, MetadataTarget::Account(a) if a == &self.account.address)
            }
            LogPayload::MetadataDeleted(p) => {
                matches!(&p.target, MetadataTarget::Account(a) if a == &self.account.address)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MetadataDeletedPayload, MetadataSetPayload, NewLog, TransactionCreatedPayload};
    use crate::transaction::{Posting, TransactionData};
    use crate::volumes::AccountsAssetsVolumes;
    use serde_json::json;

    #[test]
    fn test_replay_log_tail() {
        let alice = Address::new("alice").unwrap();
        let usd = Asset::new("USD").unwrap();
        let mut running = AccountsAssetsVolumes::new();

        let t0 = Transaction::commit(
            0,
            TransactionData::new(vec![Posting::new("world", "alice", 100u64, "USD").unwrap()]),
            &mut running,
        );
        let t1 = Transaction::commit(
            1,
            TransactionData::new(vec![Posting::new("alice", "bob", 30u64, "USD").unwrap()]),
            &mut running,
        );

        let mut account_metadata = BTreeMap::new();
        account_metadata.insert(alice.clone(), [("kyc", json!(true))].into_iter().collect());

        let l0 = NewLog::new(LogPayload::TransactionCreated(TransactionCreatedPayload {
            transaction: t0,
            account_metadata,
        }))
        .chain(None);
        let l1 = NewLog::new(LogPayload::TransactionCreated(TransactionCreatedPayload {
            transaction: t1,
            account_metadata: BTreeMap::new(),
        }))
        .chain(Some(&l0));
        let l2 = NewLog::new(LogPayload::MetadataSet(MetadataSetPayload {
            target: MetadataTarget::Account(alice.clone()),
            metadata: [("tier", json!("gold"))].into_iter().collect(),
        }))
        .chain(Some(&l1));
        let l3 = NewLog::new(LogPayload::MetadataDeleted(MetadataDeletedPayload {
            target: MetadataTarget::Account(alice.clone()),
            key: "kyc".to_string(),
        }))
        .chain(Some(&l2));

        let mut account = AccountWithVolumes::new(alice.clone());
        for log in [&l0, &l1, &l2, &l3] {
            assert!(account.is_touched_by(log));
            account.apply(log);
        }

        assert_eq!(account.volumes[&usd], Volumes::new(100u64, 30u64));
        assert_eq!(account.balances()[&usd], BigInt::from(70));
        assert_eq!(account.account.metadata.get("tier"), Some(&json!("gold")));
        assert_eq!(account.account.metadata.get("kyc"), None);

        let mut carol = AccountWithVolumes::new(Address::new("carol").unwrap());
        assert!(!carol.is_touched_by(&l1));
        carol.apply(&l1);
        assert!(carol.volumes.is_empty());
    }
}
