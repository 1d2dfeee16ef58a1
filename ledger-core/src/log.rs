//! Hash-chained log entries
//!
//! Every state change of a ledger is recorded as a [`Log`]. Ids are dense and
//! start at 0. Each entry's hash is SHA-256 over the canonical form of its
//! predecessor (including the predecessor's hash) followed by its own
//! canonical form, so altering any stored entry breaks verification at that
//! entry.

use crate::canonical::CanonicalWriter;
use crate::transaction::Transaction;
use crate::types::{truncate_to_micros, Address, Metadata};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LogType {
    /// Metadata merged into an account or a transaction
    MetadataSet = 0,
    /// New transaction committed
    TransactionCreated = 1,
    /// Reversal of an earlier transaction committed
    TransactionReverted = 2,
    /// Metadata key removed from an account or a transaction
    MetadataDeleted = 3,
}

impl LogType {
    /// Storage code
    pub fn code(&self) -> i16 {
        *self as u8 as i16
    }

    /// Parse a storage code
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(LogType::MetadataSet),
            1 => Ok(LogType::TransactionCreated),
            2 => Ok(LogType::TransactionReverted),
            3 => Ok(LogType::MetadataDeleted),
            other => Err(Error::InvalidLog(format!("unknown log type code {}", other))),
        }
    }

    /// Human-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::MetadataSet => "METADATA_SET",
            LogType::TransactionCreated => "TRANSACTION_CREATED",
            LogType::TransactionReverted => "TRANSACTION_REVERTED",
            LogType::MetadataDeleted => "METADATA_DELETED",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity whose metadata is changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "targetType", content = "targetId", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataTarget {
    /// Account by address
    Account(Address),
    /// Transaction by id
    Transaction(u64),
}

impl MetadataTarget {
    fn write_canonical(&self, w: &mut CanonicalWriter) {
        match self {
            MetadataTarget::Account(address) => {
                w.write_u8(0);
                w.write_string(address.as_str());
            }
            MetadataTarget::Transaction(id) => {
                w.write_u8(1);
                w.write_u64(*id);
            }
        }
    }
}

/// Payload of a `transaction-created` log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreatedPayload {
    /// Committed transaction
    pub transaction: Transaction,
    /// Metadata merged into accounts alongside the transaction
    #[serde(default)]
    pub account_metadata: BTreeMap<Address, Metadata>,
}

/// Payload of a `metadata-set` log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSetPayload {
    /// Changed entity
    pub target: MetadataTarget,
    /// Merged keys
    pub metadata: Metadata,
}

/// Payload of a `transaction-reverted` log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRevertedPayload {
    /// Id of the transaction being undone
    pub reverted_transaction_id: u64,
    /// The compensating transaction
    pub transaction: Transaction,
}

/// Payload of a `metadata-deleted` log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDeletedPayload {
    /// Changed entity
    pub target: MetadataTarget,
    /// Removed key
    pub key: String,
}

/// Typed log payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// See [`TransactionCreatedPayload`]
    TransactionCreated(TransactionCreatedPayload),
    /// See [`MetadataSetPayload`]
    MetadataSet(MetadataSetPayload),
    /// See [`TransactionRevertedPayload`]
    TransactionReverted(TransactionRevertedPayload),
    /// See [`MetadataDeletedPayload`]
    MetadataDeleted(MetadataDeletedPayload),
}

impl LogPayload {
    /// Log type matching the payload
    pub fn log_type(&self) -> LogType {
        match self {
            LogPayload::TransactionCreated(_) => LogType::TransactionCreated,
            LogPayload::MetadataSet(_) => LogType::MetadataSet,
            LogPayload::TransactionReverted(_) => LogType::TransactionReverted,
            LogPayload::MetadataDeleted(_) => LogType::MetadataDeleted,
        }
    }

    /// Transaction carried by the payload, if any
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            LogPayload::TransactionCreated(p) => Some(&p.transaction),
            LogPayload::TransactionReverted(p) => Some(&p.transaction),
            _ => None,
        }
    }

    /// JSON form stored alongside the type code
    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            LogPayload::TransactionCreated(p) => serde_json::to_value(p)?,
            LogPayload::MetadataSet(p) => serde_json::to_value(p)?,
            LogPayload::TransactionReverted(p) => serde_json::to_value(p)?,
            LogPayload::MetadataDeleted(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Hydrate a payload using the stored type code
    pub fn from_json(log_type: LogType, value: Value) -> Result<Self> {
        let payload = match log_type {
            LogType::TransactionCreated => {
                LogPayload::TransactionCreated(serde_json::from_value(value)?)
            }
            LogType::MetadataSet => LogPayload::MetadataSet(serde_json::from_value(value)?),
            LogType::TransactionReverted => {
                LogPayload::TransactionReverted(serde_json::from_value(value)?)
            }
            LogType::MetadataDeleted => LogPayload::MetadataDeleted(serde_json::from_value(value)?),
        };
        Ok(payload)
    }

    fn write_canonical(&self, w: &mut CanonicalWriter) {
        match self {
            LogPayload::TransactionCreated(p) => {
                w.write_transaction(&p.transaction);
                w.write_accounts_metadata(&p.account_metadata);
            }
            LogPayload::MetadataSet(p) => {
                p.target.write_canonical(w);
                w.write_metadata(&p.metadata);
            }
            LogPayload::TransactionReverted(p) => {
                w.write_u64(p.reverted_transaction_id);
                w.write_transaction(&p.transaction);
            }
            LogPayload::MetadataDeleted(p) => {
                p.target.write_canonical(w);
                w.write_string(&p.key);
            }
        }
    }
}

/// Log entry not yet placed in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLog {
    /// Entry date
    pub date: DateTime<Utc>,
    /// Content
    pub payload: LogPayload,
    /// Optional unique reference
    pub reference: Option<String>,
}

impl NewLog {
    /// New entry dated now
    pub fn new(payload: LogPayload) -> Self {
        Self {
            date: truncate_to_micros(Utc::now()),
            payload,
            reference: None,
        }
    }

    /// Set the reference
    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    /// Assign the next id after `previous` and compute the chained hash
    pub fn chain(self, previous: Option<&Log>) -> Log {
        let mut log = Log {
            id: previous.map_or(0, |p| p.id + 1),
            date: truncate_to_micros(self.date),
            payload: self.payload,
            reference: self.reference,
            hash: [0u8; 32],
        };
        log.hash = log.compute_hash(previous);
        log
    }
}

/// Chained log entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LogRepr")]
pub struct Log {
    /// Dense id starting at 0
    pub id: u64,
    /// Entry date, microsecond precision
    pub date: DateTime<Utc>,
    /// Content
    pub payload: LogPayload,
    /// Optional unique reference
    pub reference: Option<String>,
    /// SHA-256 chaining hash
    pub hash: [u8; 32],
}

impl Log {
    /// Type of the entry
    pub fn log_type(&self) -> LogType {
        self.payload.log_type()
    }

    /// Hash as lowercase hex
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    fn write_body(&self, w: &mut CanonicalWriter) {
        w.write_u64(self.id);
        w.write_u8(self.log_type() as u8);
        w.write_i64(self.date.timestamp_micros());
        w.write_option_string(self.reference.as_deref());
        self.payload.write_canonical(w);
    }

    /// Recompute the hash of this entry given its predecessor
    pub fn compute_hash(&self, previous: Option<&Log>) -> [u8; 32] {
        let mut w = CanonicalWriter::new();
        match previous {
            Some(previous) => {
                w.write_u8(1);
                previous.write_body(&mut w);
                w.write_bytes(&previous.hash);
            }
            None => w.write_u8(0),
        }
        self.write_body(&mut w);
        w.hash()
    }

    /// Whether the stored hash matches the recomputation
    pub fn verify(&self, previous: Option<&Log>) -> bool {
        self.compute_hash(previous) == self.hash
    }
}

/// Verify that `logs` extend `previous` without gaps or altered entries
///
/// Returns the id of the first entry that fails.
pub fn verify_chain(logs: &[Log], previous: Option<&Log>) -> Result<()> {
    let mut previous = previous;
    for log in logs {
        let expected = previous.map_or(0, |p| p.id + 1);
        if log.id != expected || !log.verify(previous) {
            return Err(Error::ChainBroken { id: log.id });
        }
        previous = Some(log);
    }
    Ok(())
}

/// Wire form of a [`Log`]
#[derive(Debug, Serialize, Deserialize)]
struct LogRepr {
    id: u64,
    #[serde(rename = "type")]
    log_type: LogType,
    date: DateTime<Utc>,
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    hash: String,
}

impl TryFrom<LogRepr> for Log {
    type Error = Error;

    fn try_from(repr: LogRepr) -> Result<Self> {
        let bytes = hex::decode(&repr.hash)
            .map_err(|e| Error::InvalidLog(format!("log {} hash: {}", repr.id, e)))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidLog(format!("log {} hash must be 32 bytes", repr.id)))?;
        Ok(Log {
            id: repr.id,
            date: repr.date,
            payload: LogPayload::from_json(repr.log_type, repr.data)?,
            reference: repr.reference,
            hash,
        })
    }
}

impl Serialize for Log {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let data = self.payload.to_json().map_err(serde::ser::Error::custom)?;
        LogRepr {
            id: self.id,
            log_type: self.log_type(),
            date: self.date,
            data,
            reference: self.reference.clone(),
            hash: self.hash_hex(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Posting, TransactionData};
    use crate::volumes::AccountsAssetsVolumes;
    use serde_json::json;

    fn created(id: u64, amount: u64) -> LogPayload {
        let mut running = AccountsAssetsVolumes::new();
        let data = TransactionData::new(vec![Posting::new("world", "alice", amount, "USD").unwrap()]);
        LogPayload::TransactionCreated(TransactionCreatedPayload {
            transaction: Transaction::commit(id, data, &mut running),
            account_metadata: BTreeMap::new(),
        })
    }

    fn metadata_set(address: &str) -> LogPayload {
        LogPayload::MetadataSet(MetadataSetPayload {
            target: MetadataTarget::Account(Address::new(address).unwrap()),
            metadata: [("role", json!("admin"))].into_iter().collect(),
        })
    }

    fn build_chain(n: u64) -> Vec<Log> {
        let mut logs: Vec<Log> = Vec::new();
        for i in 0..n {
            let payload = if i % 2 == 0 { created(i, 10 + i) } else { metadata_set("alice") };
            let log = NewLog::new(payload).chain(logs.last());
            logs.push(log);
        }
        logs
    }

    #[test]
    fn test_ids_are_dense_from_zero() {
        let logs = build_chain(4);
        let ids: Vec<u64> = logs.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(verify_chain(&logs, None).is_ok());
    }

    #[test]
    fn test_tampering_is_detected_at_the_altered_entry() {
        let mut logs = build_chain(5);
        if let LogPayload::MetadataSet(p) = &mut logs[3].payload {
            p.metadata.insert("role", json!("root"));
        }
        assert_eq!(verify_chain(&logs, None), Err(Error::ChainBroken { id: 3 }));
    }

    #[test]
    fn test_gap_is_detected() {
        let mut logs = build_chain(3);
        logs.remove(1);
        assert_eq!(verify_chain(&logs, None), Err(Error::ChainBroken { id: 2 }));
    }

    #[test]
    fn test_chain_continues_from_previous() {
        let logs = build_chain(3);
        let next = NewLog::new(metadata_set("bob")).chain(logs.last());
        assert_eq!(next.id, 3);
        assert!(verify_chain(std::slice::from_ref(&next), logs.last()).is_ok());
        assert!(verify_chain(std::slice::from_ref(&next), None).is_err());
    }

    #[test]
    fn test_json_roundtrip_preserves_hash() {
        let logs = build_chain(2);
        for log in &logs {
            let json = serde_json::to_string(log).unwrap();
            let back: Log = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, log);
        }
        assert!(verify_chain(&logs, None).is_ok());

        let json = serde_json::to_value(&logs[1]).unwrap();
        assert_eq!(json["type"], "METADATA_SET");
        assert_eq!(json["data"]["target"]["targetType"], "ACCOUNT");
        assert_eq!(json["data"]["target"]["targetId"], "alice");
    }

    #[test]
    fn test_type_codes() {
        for t in [
            LogType::MetadataSet,
            LogType::TransactionCreated,
            LogType::TransactionReverted,
            LogType::MetadataDeleted,
        ] {
            assert_eq!(LogType::from_code(t.code()).unwrap(), t);
        }
        assert!(LogType::from_code(9).is_err());
    }
}
