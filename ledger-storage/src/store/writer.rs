//! The log writer
//!
//! Every mutation of a ledger becomes a [`LogModel`] submitted to the store's
//! [`WriteWorker`](crate::worker::WriteWorker). One batch is one database
//! transaction: the writer reads the chain head, turns each model into the
//! next chained log, projects the new logs and inserts them. Nothing of a
//! failed batch is visible.
//!
//! How the chain head is obtained depends on the [`WriterMode`] the store is
//! instantiated with.

use super::projection::{project, project_unprojected};
use super::rows::{from_db_id, to_db_id, LogRow, TransactionRow, LOG_COLUMNS, TRANSACTION_COLUMNS};
use crate::metrics::Metrics;
use crate::schema::Schema;
use crate::worker::BatchWriter;
use crate::{Error, Result};
use async_trait::async_trait;
use ledger_core::log::{
    MetadataDeletedPayload, MetadataSetPayload, TransactionCreatedPayload,
    TransactionRevertedPayload,
};
use ledger_core::{
    verify_chain, AccountsAssetsVolumes, Address, Amount, Asset, Log, LogPayload, Metadata,
    MetadataTarget, NewLog, NewTransaction, Posting, Transaction, TransactionData, Volumes,
};
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Unit of work for the log writer
#[derive(Debug, Clone)]
pub enum LogModel {
    /// Commit a transaction
    TransactionCreated(NewTransaction),
    /// Commit the reversal of a transaction
    TransactionReverted {
        /// Transaction to undo
        id: u64,
    },
    /// Merge metadata into an account or transaction
    MetadataSet {
        /// Changed entity
        target: MetadataTarget,
        /// Merged keys
        metadata: Metadata,
    },
    /// Remove one metadata key
    MetadataDeleted {
        /// Changed entity
        target: MetadataTarget,
        /// Removed key
        key: String,
    },
    /// Append an already chained log without projecting it
    Imported(Log),
}

/// Last log and next transaction id of a ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainHead {
    /// Most recent log
    pub last_log: Option<Log>,
    /// Id the next transaction receives
    pub next_transaction_id: u64,
}

impl ChainHead {
    /// Read the head from the store
    ///
    /// Transaction ids are taken from the transactions table, so pending logs
    /// must be projected first.
    pub async fn read(conn: &mut PgConnection, schema: &Schema) -> Result<Self> {
        let select = format!(
            "SELECT {} FROM {} l ORDER BY l.id DESC LIMIT 1",
            LOG_COLUMNS,
            schema.table("logs")
        );
        let last_log = sqlx::query_as::<_, LogRow>(&select)
            .fetch_optional(&mut *conn)
            .await?
            .map(Log::try_from)
            .transpose()?;

        let select = format!(
            "SELECT COALESCE(MAX(id) + 1, 0) FROM {}",
            schema.table("transactions")
        );
        let next: i64 = sqlx::query_scalar(&select).fetch_one(&mut *conn).await?;

        Ok(Self {
            last_log,
            next_transaction_id: from_db_id(next)?,
        })
    }

    fn advance(&mut self, log: &Log) {
        if let Some(transaction) = log.payload.transaction() {
            self.next_transaction_id = self.next_transaction_id.max(transaction.id + 1);
        }
        self.last_log = Some(log.clone());
    }

    fn chain(&mut self, new_log: NewLog) -> Log {
        let log = new_log.chain(self.last_log.as_ref());
        self.advance(&log);
        log
    }
}

/// How a store coordinates with other writers of the same namespace
#[async_trait]
pub trait WriterMode: Send + Sync + 'static {
    /// State kept by the writer between batches
    type Cache: Default + Send + Sync + 'static;

    /// Mode name for logs
    const NAME: &'static str;

    /// Exclude other writers for the rest of the database transaction
    async fn lock(conn: &mut PgConnection, schema: &Schema) -> Result<()>;

    /// Head to continue from, if known without reading the store
    fn cached(cache: &Self::Cache) -> Option<ChainHead>;

    /// Record the head once a batch committed
    fn committed(cache: &mut Self::Cache, head: &ChainHead);

    /// Forget the head after a failed batch
    ///
    /// A failed commit may still have reached the database, so the next
    /// batch has to read the head again.
    fn invalidate(cache: &mut Self::Cache);
}

/// This process is the only writer of the namespace; the chain head is
/// cached in memory between batches
#[derive(Debug, Clone, Copy, Default)]
pub struct Exclusive;

#[async_trait]
impl WriterMode for Exclusive {
    type Cache = Option<ChainHead>;

    const NAME: &'static str = "exclusive";

    async fn lock(_conn: &mut PgConnection, _schema: &Schema) -> Result<()> {
        Ok(())
    }

    fn cached(cache: &Self::Cache) -> Option<ChainHead> {
        cache.clone()
    }

    fn committed(cache: &mut Self::Cache, head: &ChainHead) {
        *cache = Some(head.clone());
    }

    fn invalidate(cache: &mut Self::Cache) {
        *cache = None;
    }
}

/// Other processes may write the namespace; every batch takes an advisory
/// lock and reads the chain head fresh
#[derive(Debug, Clone, Copy, Default)]
pub struct Shared;

#[async_trait]
impl WriterMode for Shared {
    type Cache = ();

    const NAME: &'static str = "shared";

    async fn lock(conn: &mut PgConnection, schema: &Schema) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("writer:{}", schema.name()))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    fn cached(_cache: &Self::Cache) -> Option<ChainHead> {
        None
    }

    fn committed(_cache: &mut Self::Cache, _head: &ChainHead) {}

    fn invalidate(_cache: &mut Self::Cache) {}
}

/// [`BatchWriter`] appending logs to one ledger
pub struct LogWriter<M: WriterMode> {
    schema: Schema,
    cache: M::Cache,
    metrics: Arc<Metrics>,
}

impl<M: WriterMode> fmt::Debug for LogWriter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("ledger", &self.schema.name())
            .field("mode", &M::NAME)
            .finish()
    }
}

impl<M: WriterMode> LogWriter<M> {
    /// Writer for `schema`
    pub fn new(schema: Schema, metrics: Arc<Metrics>) -> Self {
        Self {
            schema,
            cache: M::Cache::default(),
            metrics,
        }
    }
}

/// Batch-local state while models are turned into logs
struct Builder<'a> {
    schema: &'a Schema,
    head: ChainHead,
    running: AccountsAssetsVolumes,
    committed: HashMap<u64, Transaction>,
    reverted: HashSet<u64>,
}

impl<'a> Builder<'a> {
    fn new(schema: &'a Schema, head: ChainHead) -> Self {
        Self {
            schema,
            head,
            running: AccountsAssetsVolumes::new(),
            committed: HashMap::new(),
            reverted: HashSet::new(),
        }
    }

    /// Load the stored volumes of pairs not yet tracked in this run
    async fn load_volumes(&mut self, conn: &mut PgConnection, postings: &[Posting]) -> Result<()> {
        let mut accounts = Vec::new();
        let mut assets = Vec::new();
        for posting in postings {
            for account in [&posting.source, &posting.destination] {
                if self.running.get_ref(account, &posting.asset).is_none() {
                    accounts.push(account.to_string());
                    assets.push(posting.asset.to_string());
                }
            }
        }
        if accounts.is_empty() {
            return Ok(());
        }

        let select = format!(
            "SELECT v.account, v.asset, v.input::text AS input, v.output::text AS output \
             FROM {} v JOIN UNNEST($1::varchar[], $2::varchar[]) AS k(account, asset) \
             ON v.account = k.account AND v.asset = k.asset",
            self.schema.table("volumes")
        );
        let rows: Vec<super::rows::VolumesRow> = sqlx::query_as(&select)
            .bind(&accounts)
            .bind(&assets)
            .fetch_all(&mut *conn)
            .await?;
        for row in rows {
            let volumes = Volumes {
                input: row.input.parse::<Amount>()?,
                output: row.output.parse::<Amount>()?,
            };
            self.running
                .set(Address::new(row.account)?, Asset::new(row.asset)?, volumes);
        }

        // Pairs without a row start at zero
        for (account, asset) in accounts.into_iter().zip(assets) {
            let account = Address::new(account)?;
            let asset = Asset::new(asset)?;
            if self.running.get_ref(&account, &asset).is_none() {
                self.running.set(account, asset, Volumes::default());
            }
        }
        Ok(())
    }

    async fn original(&mut self, conn: &mut PgConnection, id: u64) -> Result<Transaction> {
        if let Some(transaction) = self.committed.get(&id) {
            return Ok(transaction.clone());
        }
        let select = format!(
            "SELECT {} FROM {} t WHERE t.id = $1",
            TRANSACTION_COLUMNS,
            self.schema.table("transactions")
        );
        let row: Option<TransactionRow> = sqlx::query_as(&select)
            .bind(to_db_id(id)?)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Transaction::try_from(row),
            None => Err(Error::NotFound(format!("transaction {}", id))),
        }
    }

    async fn commit_transaction(
        &mut self,
        conn: &mut PgConnection,
        data: TransactionData,
    ) -> Result<Transaction> {
        data.validate()?;
        self.load_volumes(conn, &data.postings).await?;
        let transaction = Transaction::commit(self.head.next_transaction_id, data, &mut self.running);
        self.committed.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn build(&mut self, conn: &mut PgConnection, model: LogModel) -> Result<Log> {
        let new_log = match model {
            LogModel::TransactionCreated(NewTransaction {
                data,
                account_metadata,
            }) => {
                let transaction = self.commit_transaction(conn, data).await?;
                let reference = transaction.data.reference.clone();
                NewLog::new(LogPayload::TransactionCreated(TransactionCreatedPayload {
                    transaction,
                    account_metadata,
                }))
                .with_reference(reference)
            }
            LogModel::TransactionReverted { id } => {
                let original = self.original(conn, id).await?;
                if original.reverted || self.reverted.contains(&id) {
                    return Err(Error::ConstraintViolation(format!(
                        "transaction {} already reverted",
                        id
                    )));
                }
                let transaction = self
                    .commit_transaction(conn, original.data.reversal())
                    .await?;
                self.reverted.insert(id);
                NewLog::new(LogPayload::TransactionReverted(TransactionRevertedPayload {
                    reverted_transaction_id: id,
                    transaction,
                }))
            }
            LogModel::MetadataSet { target, metadata } => {
                NewLog::new(LogPayload::MetadataSet(MetadataSetPayload { target, metadata }))
            }
            LogModel::MetadataDeleted { target, key } => {
                NewLog::new(LogPayload::MetadataDeleted(MetadataDeletedPayload { target, key }))
            }
            LogModel::Imported(_) => {
                return Err(Error::Concurrency(
                    "imported logs are not built by the writer".to_string(),
                ))
            }
        };
        Ok(self.head.chain(new_log))
    }
}

async fn insert_logs(
    conn: &mut PgConnection,
    schema: &Schema,
    logs: &[Log],
    projected: bool,
) -> Result<()> {
    let insert = format!(
        "INSERT INTO {} (id, type, date, data, reference, hash, projected) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        schema.table("logs")
    );
    for log in logs {
        sqlx::query(&insert)
            .bind(to_db_id(log.id)?)
            .bind(log.log_type().code())
            .bind(log.date)
            .bind(log.payload.to_json()?)
            .bind(log.reference.as_deref())
            .bind(log.hash.as_slice())
            .bind(projected)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Append `models` in one database transaction
///
/// Returns the appended logs and the head after the last of them.
async fn append_batch<M: WriterMode>(
    schema: &Schema,
    cache: &M::Cache,
    models: Vec<LogModel>,
) -> Result<(Vec<Log>, ChainHead)> {
    let mut tx = schema.pool().begin().await?;

    M::lock(&mut tx, schema).await?;
    project_unprojected(&mut tx, schema).await?;
    let head = match M::cached(cache) {
        Some(head) => head,
        None => ChainHead::read(&mut tx, schema).await?,
    };

    let mut builder = Builder::new(schema, head);
    let mut outputs = Vec::with_capacity(models.len());
    let mut built = Vec::new();
    let mut imported = Vec::new();

    for model in models {
        match model {
            LogModel::Imported(log) => {
                if !built.is_empty() {
                    project(&mut tx, schema, &built).await?;
                    insert_logs(&mut tx, schema, &built, true).await?;
                    outputs.append(&mut built);
                }
                verify_chain(std::slice::from_ref(&log), builder.head.last_log.as_ref())?;
                builder.head.advance(&log);
                imported.push(log);
            }
            model => {
                if !imported.is_empty() {
                    // Later models must see the effect of the imported history
                    insert_logs(&mut tx, schema, &imported, false).await?;
                    outputs.append(&mut imported);
                    project_unprojected(&mut tx, schema).await?;
                    builder.running = AccountsAssetsVolumes::new();
                }
                built.push(builder.build(&mut tx, model).await?);
            }
        }
    }
    if !built.is_empty() {
        project(&mut tx, schema, &built).await?;
        insert_logs(&mut tx, schema, &built, true).await?;
        outputs.append(&mut built);
    }
    if !imported.is_empty() {
        insert_logs(&mut tx, schema, &imported, false).await?;
        outputs.append(&mut imported);
    }

    tx.commit().await?;
    Ok((outputs, builder.head))
}

#[async_trait]
impl<M: WriterMode> BatchWriter for LogWriter<M> {
    type Model = LogModel;
    type Output = Log;

    async fn write(&mut self, models: Vec<LogModel>) -> Result<Vec<Log>> {
        match append_batch::<M>(&self.schema, &self.cache, models).await {
            Ok((outputs, head)) => {
                M::committed(&mut self.cache, &head);
                self.metrics.record_logs_appended(outputs.len());
                debug!(
                    ledger = self.schema.name(),
                    mode = M::NAME,
                    logs = outputs.len(),
                    last_id = head.last_log.as_ref().map(|l| l.id),
                    "Batch committed"
                );
                Ok(outputs)
            }
            Err(err) => {
                M::invalidate(&mut self.cache);
                debug!(
                    ledger = self.schema.name(),
                    mode = M::NAME,
                    "Chain head dropped after failed batch"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn log_at(head: &mut ChainHead, payload: LogPayload) -> Log {
        head.chain(NewLog::new(payload))
    }

    fn created(id: u64) -> LogPayload {
        let data = TransactionData::new(vec![Posting::new("world", "alice", 10u64, "USD").unwrap()]);
        let transaction = Transaction::commit(id, data, &mut AccountsAssetsVolumes::new());
        LogPayload::TransactionCreated(TransactionCreatedPayload {
            transaction,
            account_metadata: Default::default(),
        })
    }

    #[test]
    fn test_head_advances_ids_and_chain() {
        let mut head = ChainHead::default();

        let first = log_at(&mut head, created(0));
        assert_eq!(first.id, 0);
        assert_eq!(head.next_transaction_id, 1);

        let second = log_at(
            &mut head,
            LogPayload::MetadataSet(MetadataSetPayload {
                target: MetadataTarget::Transaction(0),
                metadata: [("k", "v")].into_iter().collect(),
            }),
        );
        assert_eq!(second.id, 1);
        assert_eq!(head.next_transaction_id, 1);
        assert!(verify_chain(&[first, second], None).is_ok());
    }

    #[test]
    fn test_imported_transaction_ids_move_the_head() {
        let mut source = ChainHead::default();
        let imported = log_at(&mut source, created(7));

        let mut head = ChainHead::default();
        head.advance(&imported);
        assert_eq!(head.next_transaction_id, 8);
        assert_eq!(head.last_log.as_ref().map(|l| l.id), Some(0));
    }

    #[test]
    fn test_exclusive_cache_only_changes_on_commit() {
        let mut cache = <Exclusive as WriterMode>::Cache::default();
        assert!(Exclusive::cached(&cache).is_none());

        let mut head = ChainHead::default();
        log_at(&mut head, created(0));
        Exclusive::committed(&mut cache, &head);
        assert_eq!(Exclusive::cached(&cache), Some(head));

        Shared::committed(&mut (), &ChainHead::default());
        assert!(Shared::cached(&()).is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_clears_cached_head() {
        // Nothing listens on port 1, so the batch fails before its commit
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://ledger@127.0.0.1:1/ledger")
            .unwrap();
        let schema = Schema::new(pool, "ledger").unwrap();
        let mut writer = LogWriter::<Exclusive>::new(schema, Arc::new(Metrics::default()));

        let mut head = ChainHead::default();
        log_at(&mut head, created(0));
        Exclusive::committed(&mut writer.cache, &head);

        let model = LogModel::MetadataSet {
            target: MetadataTarget::Transaction(0),
            metadata: [("k", "v")].into_iter().collect(),
        };
        assert!(writer.write(vec![model]).await.is_err());
        assert!(Exclusive::cached(&writer.cache).is_none());
        assert!(format!("{:?}", writer).contains("exclusive"));
    }
}
