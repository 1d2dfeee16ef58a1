//! Ledger store
//!
//! One [`Store`] serves one ledger namespace. Reads go straight to the pool;
//! every mutation is turned into a log model and funnelled through the
//! store's write worker, which gives the log its total order.
//!
//! The writer mode type parameter decides how the chain head is found:
//! [`Exclusive`] caches it, [`Shared`] locks and reads it for every batch.
//!
//! Reads of accounts and balances start from the projected tables and replay
//! any log not yet projected on top, inside one snapshot.

mod accounts;
mod balances;
mod idempotency;
mod logs;
mod projection;
mod rows;
mod transactions;
mod writer;

pub use balances::{AccountBalances, Balances};
pub use idempotency::hash_request;
pub use writer::{ChainHead, Exclusive, LogModel, LogWriter, Shared, WriterMode};

use crate::config::{Config, StoreConfig};
use crate::metrics::Metrics;
use crate::migrations::{bundled, MigrationRecord, Migrator};
use crate::pagination::clamp_page_size;
use crate::schema::Schema;
use crate::worker::WriteWorker;
use crate::{Error, Result};
use ledger_core::Log;
use rows::{convert, LogRow, LOG_COLUMNS};
use sqlx::{PgConnection, Postgres, Transaction as DbTransaction};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Storage for one ledger
pub struct Store<M: WriterMode = Shared> {
    schema: Schema,
    worker: WriteWorker<LogModel, Log>,
    migrator: Migrator,
    metrics: Arc<Metrics>,
    config: StoreConfig,
    initialized: AtomicBool,
    _mode: PhantomData<M>,
}

impl<M: WriterMode> fmt::Debug for Store<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("ledger", &self.schema.name())
            .field("mode", &M::NAME)
            .field("worker", &self.worker)
            .finish()
    }
}

impl<M: WriterMode> Store<M> {
    /// Open a store over `schema` and start its write worker
    ///
    /// The namespace is not touched; call [`migrate`](Self::migrate) before
    /// using a fresh one.
    pub fn new(schema: Schema, config: &Config, metrics: Arc<Metrics>) -> Self {
        let writer = LogWriter::<M>::new(schema.clone(), metrics.clone());
        let worker = WriteWorker::spawn(writer, config.batching.max_pending, metrics.clone());
        info!(ledger = schema.name(), mode = M::NAME, "Ledger store opened");

        Self {
            schema,
            worker,
            migrator: bundled::ledger_migrator(),
            metrics,
            config: config.store.clone(),
            initialized: AtomicBool::new(false),
            _mode: PhantomData,
        }
    }

    /// Ledger name
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Namespace of the ledger
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Apply pending ledger migrations; returns whether anything was applied
    pub async fn migrate(&self) -> Result<bool> {
        let _timer = self.metrics.start_timer("migrate");
        let modified = self.migrator.migrate(&self.schema).await.map_err(|err| {
            self.metrics.record_error("migrate", &err);
            error!(ledger = self.name(), error = %err, "Ledger migration failed");
            err
        })?;
        self.initialized.store(true, Ordering::Release);
        Ok(modified)
    }

    /// Migrations applied to the namespace, in version order
    pub async fn get_migrations(&self) -> Result<Vec<MigrationRecord>> {
        let _timer = self.metrics.start_timer("get_migrations");
        self.migrator.applied(&self.schema).await
    }

    /// Whether every known migration has been applied
    pub async fn is_initialized(&self) -> Result<bool> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(true);
        }
        let up_to_date = self.migrator.is_up_to_date(&self.schema).await?;
        if up_to_date {
            self.initialized.store(true, Ordering::Release);
        }
        Ok(up_to_date)
    }

    /// Stop the write worker after flushing pending submissions
    pub async fn close(&self) {
        self.worker.shutdown().await;
        info!(ledger = self.name(), "Ledger store closed");
    }

    /// Run one store operation: initialization check, timing, error logging
    async fn instrumented<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _timer = self.metrics.start_timer(operation);

        let result = match self.is_initialized().await {
            Ok(true) => fut.await,
            Ok(false) => Err(Error::StoreNotInitialized(format!(
                "ledger {} has pending migrations",
                self.name()
            ))),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            self.metrics.record_error(operation, err);
            if err.is_not_found() {
                debug!(ledger = self.name(), operation, error = %err, "Store operation found nothing");
            } else {
                error!(ledger = self.name(), operation, error = %err, "Store operation failed");
            }
        }
        result
    }

    /// Submit models to the writer and wait for their logs
    async fn append(&self, models: Vec<LogModel>) -> Result<Vec<Log>> {
        self.worker.write(models).await
    }

    /// Single-model variant of [`append`](Self::append)
    async fn append_one(&self, model: LogModel) -> Result<Log> {
        self.append(vec![model])
            .await?
            .pop()
            .ok_or_else(|| Error::Concurrency("writer returned no log".to_string()))
    }

    fn page_size(&self, requested: u64) -> u64 {
        clamp_page_size(Some(requested), &self.config)
    }

    /// Read-only transaction over one consistent snapshot
    async fn snapshot(&self) -> Result<DbTransaction<'static, Postgres>> {
        let mut tx = self.schema.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Logs not yet projected, in id order
    async fn unprojected(&self, conn: &mut PgConnection) -> Result<Vec<Log>> {
        let select = format!(
            "SELECT {} FROM {} l WHERE NOT l.projected ORDER BY l.id",
            LOG_COLUMNS,
            self.schema.table("logs")
        );
        let rows: Vec<LogRow> = sqlx::query_as(&select).fetch_all(&mut *conn).await?;
        convert(rows)
    }
}
