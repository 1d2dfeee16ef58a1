//! Postings and transactions

use crate::types::{truncate_to_micros, Address, Amount, Asset, Metadata};
use crate::volumes::AccountsAssetsVolumes;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Movement of `amount` of `asset` from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Debited account
    pub source: Address,
    /// Credited account
    pub destination: Address,
    /// Amount moved
    pub amount: Amount,
    /// Asset code
    pub asset: Asset,
}

impl Posting {
    /// Build a posting from raw parts, validating each of them
    pub fn new(
        source: &str,
        destination: &str,
        amount: impl Into<Amount>,
        asset: &str,
    ) -> Result<Self> {
        Ok(Self {
            source: Address::new(source)?,
            destination: Address::new(destination)?,
            amount: amount.into(),
            asset: Asset::new(asset)?,
        })
    }

    /// Same movement in the opposite direction
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination.clone(),
            destination: self.source.clone(),
            amount: self.amount.clone(),
            asset: self.asset.clone(),
        }
    }
}

/// Transaction content as submitted, before an id is assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Ordered postings
    pub postings: Vec<Posting>,

    /// Effective date
    pub timestamp: DateTime<Utc>,

    /// Optional caller reference, unique per ledger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransactionData {
    /// New transaction dated now
    pub fn new(postings: Vec<Posting>) -> Self {
        Self {
            postings,
            timestamp: truncate_to_micros(Utc::now()),
            reference: None,
            metadata: Metadata::new(),
        }
    }

    /// Set the reference
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the effective date
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = truncate_to_micros(timestamp);
        self
    }

    /// Check structural validity
    pub fn validate(&self) -> Result<()> {
        if self.postings.is_empty() {
            return Err(Error::InvalidTransaction(
                "transaction has no postings".to_string(),
            ));
        }
        if matches!(&self.reference, Some(r) if r.is_empty()) {
            return Err(Error::InvalidTransaction(
                "reference must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Transaction that undoes this one, dated now
    pub fn reversal(&self) -> Self {
        Self::new(self.postings.iter().rev().map(Posting::reversed).collect())
    }
}

/// A transaction submission together with account metadata to merge
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Transaction content
    pub data: TransactionData,
    /// Metadata merged into the named accounts on commit
    #[serde(default)]
    pub account_metadata: BTreeMap<Address, Metadata>,
}

impl From<TransactionData> for NewTransaction {
    fn from(data: TransactionData) -> Self {
        Self {
            data,
            account_metadata: BTreeMap::new(),
        }
    }
}

impl Default for TransactionData {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Dense id starting at 0
    pub id: u64,

    /// Content
    #[serde(flatten)]
    pub data: TransactionData,

    /// Volumes of touched pairs just before this transaction
    pub pre_commit_volumes: AccountsAssetsVolumes,

    /// Volumes of touched pairs just after this transaction
    pub post_commit_volumes: AccountsAssetsVolumes,

    /// Set once a reversal has been committed
    #[serde(default)]
    pub reverted: bool,
}

impl Transaction {
    /// Assign `id` to `data` and advance `running` by its postings
    ///
    /// `running` must hold the current volumes of every pair the postings
    /// touch; pre and post commit volumes are captured around the update.
    pub fn commit(id: u64, data: TransactionData, running: &mut AccountsAssetsVolumes) -> Self {
        let pre_commit_volumes = running.restrict_to(&data.postings);
        running.apply_postings(&data.postings);
        let post_commit_volumes = running.restrict_to(&data.postings);
        Self {
            id,
            data,
            pre_commit_volumes,
            post_commit_volumes,
            reverted: false,
        }
    }

    /// Postings of the transaction
    pub fn postings(&self) -> &[Posting] {
        &self.data.postings
    }

    /// Whether the transaction moves value in or out of `account`
    pub fn involves(&self, account: &Address) -> bool {
        self.data
            .postings
            .iter()
            .any(|p| &p.source == account || &p.destination == account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volumes::Volumes;

    #[test]
    fn test_commit_captures_pre_and_post_volumes() {
        let mut running = AccountsAssetsVolumes::new();
        let data = TransactionData::new(vec![
            Posting::new("world", "alice", 100u64, "USD").unwrap(),
        ]);
        let first = Transaction::commit(0, data, &mut running);

        let data = TransactionData::new(vec![Posting::new("alice", "bob", 40u64, "USD").unwrap()]);
        let second = Transaction::commit(1, data, &mut running);

        let alice = Address::new("alice").unwrap();
        let bob = Address::new("bob").unwrap();
        let usd = Asset::new("USD").unwrap();

        assert_eq!(first.pre_commit_volumes.get(&alice, &usd), Volumes::default());
        assert_eq!(first.post_commit_volumes.get(&alice, &usd), Volumes::new(100u64, 0u64));
        assert_eq!(second.pre_commit_volumes.get(&alice, &usd), Volumes::new(100u64, 0u64));
        assert_eq!(second.post_commit_volumes.get(&alice, &usd), Volumes::new(100u64, 40u64));
        assert_eq!(second.post_commit_volumes.get(&bob, &usd), Volumes::new(40u64, 0u64));
        assert!(second.pre_commit_volumes.get_ref(&bob, &usd).is_some());
    }

    #[test]
    fn test_validate() {
        assert!(TransactionData::new(vec![]).validate().is_err());
        let data = TransactionData::new(vec![Posting::new("world", "a", 1u64, "USD").unwrap()]);
        assert!(data.clone().validate().is_ok());
        assert!(data.with_reference("").validate().is_err());
    }

    #[test]
    fn test_reversal() {
        let data = TransactionData::new(vec![
            Posting::new("world", "alice", 10u64, "USD").unwrap(),
            Posting::new("alice", "bob", 4u64, "USD").unwrap(),
        ]);
        let reversal = data.reversal();
        assert_eq!(reversal.postings[0], Posting::new("bob", "alice", 4u64, "USD").unwrap());
        assert_eq!(reversal.postings[1], Posting::new("alice", "world", 10u64, "USD").unwrap());
    }

    #[test]
    fn test_json_roundtrip_keeps_flattened_fields() {
        let mut running = AccountsAssetsVolumes::new();
        let data = TransactionData::new(vec![Posting::new("world", "alice", 1u64, "USD").unwrap()])
            .with_reference("ref-1");
        let tx = Transaction::commit(3, data, &mut running);

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["reference"], "ref-1");
        assert_eq!(json["postings"][0]["amount"], "1");

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
