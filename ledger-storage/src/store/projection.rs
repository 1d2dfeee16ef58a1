//! Projection of logs onto transactions, accounts and volumes
//!
//! The same code runs for freshly appended logs, inside the writer's
//! transaction, and for imported logs left unprojected.

use super::rows::{convert, to_db_id, LogRow, LOG_COLUMNS};
use crate::schema::Schema;
use crate::{Error, Result};
use ledger_core::{
    AccountsAssetsVolumes, Address, Log, LogPayload, Metadata, MetadataTarget, Transaction,
};
use sqlx::{Encode, PgConnection, Postgres, Type};
use std::collections::BTreeSet;
use tracing::debug;

/// Unprojected logs read per round
const PROJECTION_CHUNK: i64 = 1000;

/// Apply `logs`, in order, to the read tables
pub(crate) async fn project(conn: &mut PgConnection, schema: &Schema, logs: &[Log]) -> Result<()> {
    let addresses: BTreeSet<&Address> = logs
        .iter()
        .filter_map(|log| log.payload.transaction())
        .flat_map(|tx| tx.postings())
        .flat_map(|p| [&p.source, &p.destination])
        .collect();
    ensure_accounts(conn, schema, addresses).await?;

    let mut deltas = AccountsAssetsVolumes::new();
    for log in logs {
        match &log.payload {
            LogPayload::TransactionCreated(p) => {
                insert_transaction(conn, schema, &p.transaction).await?;
                for (address, metadata) in &p.account_metadata {
                    merge_account_metadata(conn, schema, address, metadata).await?;
                }
                deltas.apply_postings(p.transaction.postings());
            }
            LogPayload::TransactionReverted(p) => {
                insert_transaction(conn, schema, &p.transaction).await?;
                mark_reverted(conn, schema, p.reverted_transaction_id).await?;
                deltas.apply_postings(p.transaction.postings());
            }
            LogPayload::MetadataSet(p) => match &p.target {
                MetadataTarget::Account(address) => {
                    merge_account_metadata(conn, schema, address, &p.metadata).await?
                }
                MetadataTarget::Transaction(id) => {
                    let update = metadata_update(schema, MetadataChange::Merge);
                    let value = serde_json::to_value(&p.metadata)?;
                    expect_row(conn, &update, *id, value).await?;
                }
            },
            LogPayload::MetadataDeleted(p) => match &p.target {
                MetadataTarget::Account(address) => {
                    let update = format!(
                        "UPDATE {} SET metadata = metadata - $2::text WHERE address = $1",
                        schema.table("accounts")
                    );
                    sqlx::query(&update)
                        .bind(address.as_str())
                        .bind(&p.key)
                        .execute(&mut *conn)
                        .await?;
                }
                MetadataTarget::Transaction(id) => {
                    let update = metadata_update(schema, MetadataChange::Delete);
                    expect_row(conn, &update, *id, p.key.as_str()).await?;
                }
            },
        }
    }

    upsert_volumes(conn, schema, &deltas).await
}

/// Project every unprojected log in id order
///
/// Serialized per namespace with the writer, so the volumes the writer
/// reads always include imported history.
pub(crate) async fn project_unprojected(conn: &mut PgConnection, schema: &Schema) -> Result<u64> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("projection:{}", schema.name()))
        .execute(&mut *conn)
        .await?;

    let select = format!(
        "SELECT {} FROM {} l WHERE NOT l.projected ORDER BY l.id LIMIT $1",
        LOG_COLUMNS,
        schema.table("logs")
    );
    let mark = format!(
        "UPDATE {} SET projected = true WHERE id = ANY($1)",
        schema.table("logs")
    );

    let mut projected = 0u64;
    loop {
        let rows: Vec<LogRow> = sqlx::query_as(&select)
            .bind(PROJECTION_CHUNK)
            .fetch_all(&mut *conn)
            .await?;
        if rows.is_empty() {
            break;
        }
        let logs: Vec<Log> = convert(rows)?;
        project(conn, schema, &logs).await?;

        let ids = logs.iter().map(|log| to_db_id(log.id)).collect::<Result<Vec<_>>>()?;
        sqlx::query(&mark).bind(ids).execute(&mut *conn).await?;
        projected += logs.len() as u64;
    }

    if projected > 0 {
        debug!(ledger = schema.name(), projected, "Projected pending logs");
    }
    Ok(projected)
}

async fn ensure_accounts(
    conn: &mut PgConnection,
    schema: &Schema,
    addresses: BTreeSet<&Address>,
) -> Result<()> {
    if addresses.is_empty() {
        return Ok(());
    }
    let insert = format!(
        "INSERT INTO {} (address, address_array) \
         SELECT x, to_jsonb(string_to_array(x, ':')) FROM UNNEST($1::varchar[]) AS x \
         ON CONFLICT (address) DO NOTHING",
        schema.table("accounts")
    );
    let addresses: Vec<String> = addresses.into_iter().map(|a| a.to_string()).collect();
    sqlx::query(&insert).bind(addresses).execute(&mut *conn).await?;
    Ok(())
}

async fn merge_account_metadata(
    conn: &mut PgConnection,
    schema: &Schema,
    address: &Address,
    metadata: &Metadata,
) -> Result<()> {
    let upsert = format!(
        "INSERT INTO {} AS a (address, address_array, metadata) \
         VALUES ($1, to_jsonb(string_to_array($1, ':')), $2) \
         ON CONFLICT (address) DO UPDATE SET metadata = a.metadata || excluded.metadata",
        schema.table("accounts")
    );
    sqlx::query(&upsert)
        .bind(address.as_str())
        .bind(serde_json::to_value(metadata)?)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_transaction(
    conn: &mut PgConnection,
    schema: &Schema,
    transaction: &Transaction,
) -> Result<()> {
    let insert = format!(
        "INSERT INTO {} (id, timestamp, reference, metadata, postings, \
         pre_commit_volumes, post_commit_volumes, reverted) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, false)",
        schema.table("transactions")
    );
    let id = to_db_id(transaction.id)?;
    sqlx::query(&insert)
        .bind(id)
        .bind(transaction.data.timestamp)
        .bind(transaction.data.reference.as_deref())
        .bind(serde_json::to_value(&transaction.data.metadata)?)
        .bind(serde_json::to_value(&transaction.data.postings)?)
        .bind(serde_json::to_value(&transaction.pre_commit_volumes)?)
        .bind(serde_json::to_value(&transaction.post_commit_volumes)?)
        .execute(&mut *conn)
        .await?;

    let insert_posting = format!(
        "INSERT INTO {} (txid, posting_index, source, destination, source_array, \
         destination_array, asset, amount) \
         VALUES ($1, $2, $3, $4, to_jsonb(string_to_array($3, ':')), \
         to_jsonb(string_to_array($4, ':')), $5, $6::numeric)",
        schema.table("postings")
    );
    for (index, posting) in transaction.postings().iter().enumerate() {
        sqlx::query(&insert_posting)
            .bind(id)
            .bind(index as i32)
            .bind(posting.source.as_str())
            .bind(posting.destination.as_str())
            .bind(posting.asset.as_str())
            .bind(posting.amount.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn mark_reverted(conn: &mut PgConnection, schema: &Schema, id: u64) -> Result<()> {
    let update = format!(
        "UPDATE {} SET reverted = true WHERE id = $1 AND NOT reverted",
        schema.table("transactions")
    );
    let result = sqlx::query(&update)
        .bind(to_db_id(id)?)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::ConstraintViolation(format!(
            "transaction {} is unknown or already reverted",
            id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum MetadataChange {
    /// `$2` is a jsonb object merged into the metadata
    Merge,
    /// `$2` is the text key removed from the metadata
    Delete,
}

/// Metadata update of a transaction keyed by id (`$1`)
fn metadata_update(schema: &Schema, change: MetadataChange) -> String {
    let expression = match change {
        MetadataChange::Merge => "metadata || $2::jsonb",
        MetadataChange::Delete => "metadata - $2::text",
    };
    format!(
        "UPDATE {} SET metadata = {} WHERE id = $1",
        schema.table("transactions"),
        expression
    )
}

/// Run a metadata update keyed by transaction id, failing if no row matched
async fn expect_row<'q, T>(conn: &mut PgConnection, sql: &'q str, id: u64, value: T) -> Result<()>
where
    T: 'q + Send + Encode<'q, Postgres> + Type<Postgres>,
{
    let result = sqlx::query(sql)
        .bind(to_db_id(id)?)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("transaction {}", id)));
    }
    Ok(())
}

/// Add aggregated deltas to the volumes with one atomic upsert
async fn upsert_volumes(
    conn: &mut PgConnection,
    schema: &Schema,
    deltas: &AccountsAssetsVolumes,
) -> Result<()> {
    if deltas.is_empty() {
        return Ok(());
    }

    let mut accounts = Vec::with_capacity(deltas.len());
    let mut assets = Vec::with_capacity(deltas.len());
    let mut inputs = Vec::with_capacity(deltas.len());
    let mut outputs = Vec::with_capacity(deltas.len());
    for (account, asset, volumes) in deltas.iter() {
        accounts.push(account.to_string());
        assets.push(asset.to_string());
        inputs.push(volumes.input.to_string());
        outputs.push(volumes.output.to_string());
    }

    let upsert = format!(
        "INSERT INTO {} AS v (account, asset, input, output) \
         SELECT account, asset, input::numeric, output::numeric \
         FROM UNNEST($1::varchar[], $2::varchar[], $3::text[], $4::text[]) \
         AS d(account, asset, input, output) \
         ON CONFLICT (account, asset) DO UPDATE \
         SET input = v.input + excluded.input, output = v.output + excluded.output",
        schema.table("volumes")
    );
    sqlx::query(&upsert)
        .bind(accounts)
        .bind(assets)
        .bind(inputs)
        .bind(outputs)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn schema() -> Schema {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/ledger")
            .unwrap();
        Schema::new(pool, "main").unwrap()
    }

    #[tokio::test]
    async fn test_transaction_metadata_updates_bind_typed_values() {
        let schema = schema();
        assert_eq!(
            metadata_update(&schema, MetadataChange::Merge),
            "UPDATE \"main\".transactions SET metadata = metadata || $2::jsonb WHERE id = $1"
        );
        // A key must reach the `jsonb - text` operator, never `jsonb - jsonb`
        assert_eq!(
            metadata_update(&schema, MetadataChange::Delete),
            "UPDATE \"main\".transactions SET metadata = metadata - $2::text WHERE id = $1"
        );
    }
}
