//! Database rows and their conversion into domain types

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::{
    Account, AccountsAssetsVolumes, Address, Log, LogPayload, LogType, Metadata, Posting,
    Transaction, TransactionData,
};
use serde_json::Value;
use sqlx::FromRow;

/// Columns selected for [`LogRow`], logs aliased `l`
pub(crate) const LOG_COLUMNS: &str = "l.id, l.type, l.date, l.data, l.reference, l.hash";

/// Columns selected for [`TransactionRow`], transactions aliased `t`
pub(crate) const TRANSACTION_COLUMNS: &str = "t.id, t.timestamp, t.reference, t.metadata, \
     t.postings, t.pre_commit_volumes, t.post_commit_volumes, t.reverted";

/// Columns selected for [`AccountRow`], accounts aliased `a`
pub(crate) const ACCOUNT_COLUMNS: &str = "a.address, a.metadata";

/// Database ids are `bigint`
pub(crate) fn to_db_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| Error::InvalidQuery(format!("id {} out of range", id)))
}

pub(crate) fn from_db_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| Error::Serialization(format!("negative id {} in store", id)))
}

/// Row of the `logs` table
#[derive(Debug, FromRow)]
pub(crate) struct LogRow {
    id: i64,
    #[sqlx(rename = "type")]
    log_type: i16,
    date: DateTime<Utc>,
    data: Value,
    reference: Option<String>,
    hash: Vec<u8>,
}

impl TryFrom<LogRow> for Log {
    type Error = Error;

    fn try_from(row: LogRow) -> Result<Self> {
        let log_type = LogType::from_code(row.log_type)?;
        let hash = <[u8; 32]>::try_from(row.hash.as_slice()).map_err(|_| {
            Error::Serialization(format!(
                "log {} has a {}-byte hash",
                row.id,
                row.hash.len()
            ))
        })?;
        Ok(Log {
            id: from_db_id(row.id)?,
            date: row.date,
            payload: LogPayload::from_json(log_type, row.data)?,
            reference: row.reference,
            hash,
        })
    }
}

/// Row of the `transactions` table
#[derive(Debug, FromRow)]
pub(crate) struct TransactionRow {
    id: i64,
    timestamp: DateTime<Utc>,
    reference: Option<String>,
    metadata: Value,
    postings: Value,
    pre_commit_volumes: Value,
    post_commit_volumes: Value,
    reverted: bool,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let postings: Vec<Posting> = serde_json::from_value(row.postings)?;
        let metadata: Metadata = serde_json::from_value(row.metadata)?;
        let pre_commit_volumes: AccountsAssetsVolumes = serde_json::from_value(row.pre_commit_volumes)?;
        let post_commit_volumes: AccountsAssetsVolumes = serde_json::from_value(row.post_commit_volumes)?;

        Ok(Transaction {
            id: from_db_id(row.id)?,
            data: TransactionData {
                postings,
                timestamp: row.timestamp,
                reference: row.reference,
                metadata,
            },
            pre_commit_volumes,
            post_commit_volumes,
            reverted: row.reverted,
        })
    }
}

/// Row of the `accounts` table
#[derive(Debug, FromRow)]
pub(crate) struct AccountRow {
    address: String,
    metadata: Value,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            address: Address::new(row.address)?,
            metadata: serde_json::from_value(row.metadata)?,
        })
    }
}

/// Row of the `volumes` table; amounts are selected as text
#[derive(Debug, FromRow)]
pub(crate) struct VolumesRow {
    pub(crate) account: String,
    pub(crate) asset: String,
    pub(crate) input: String,
    pub(crate) output: String,
}

/// Convert fetched rows, failing on the first bad one
pub(crate) fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}
