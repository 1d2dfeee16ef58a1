use super::projection::project_unprojected;
use super::rows::{convert, to_db_id, LogRow, LOG_COLUMNS};
use super::{LogModel, Store, WriterMode};
use crate::pagination::{ColumnPaginatedQuery, Cursor};
use crate::query::{Conditions, LogsFilters};
use crate::{Error, Result};
use ledger_core::{verify_chain, Log};
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};

/// Logs verified per round trip
const VERIFY_CHUNK: u64 = 1000;

impl<M: WriterMode> Store<M> {
    /// Page of logs ordered by id
    pub async fn get_logs(&self, mut query: ColumnPaginatedQuery<LogsFilters>) -> Result<Cursor<Log>> {
        self.instrumented("get_logs", async move {
            if query.column != "id" {
                return Err(Error::InvalidQuery(format!(
                    "logs cannot be paginated on {:?}",
                    query.column
                )));
            }
            query.page_size = self.page_size(query.page_size);
            let scan = query.scan();

            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {} FROM {} l",
                LOG_COLUMNS,
                self.schema.table("logs")
            ));
            let mut conditions = Conditions::new(&mut qb);
            query.filters.push_conditions(&mut conditions);
            if let Some((comparison, bound)) = scan.bound {
                conditions
                    .and()
                    .push("l.id ")
                    .push(comparison.as_sql())
                    .push(" ")
                    .push_bind(bound);
            }
            qb.push(" ORDER BY l.id ")
                .push(scan.order.as_sql())
                .push(" LIMIT ")
                .push_bind(scan.limit as i64);

            let rows: Vec<LogRow> = qb.build_query_as().fetch_all(self.schema.pool()).await?;
            let logs: Vec<Log> = convert(rows)?;
            query.page(logs, |log| log.id as i64)
        })
        .await
    }

    /// Most recent log, if any
    pub async fn get_last_log(&self) -> Result<Option<Log>> {
        self.instrumented("get_last_log", async {
            let select = format!(
                "SELECT {} FROM {} l ORDER BY l.id DESC LIMIT 1",
                LOG_COLUMNS,
                self.schema.table("logs")
            );
            let row: Option<LogRow> = sqlx::query_as(&select)
                .fetch_optional(self.schema.pool())
                .await?;
            row.map(Log::try_from).transpose()
        })
        .await
    }

    /// Up to `limit` logs with id `>= from`, ascending
    pub async fn read_logs_from(&self, from: u64, limit: u64) -> Result<Vec<Log>> {
        self.instrumented("read_logs_from", self.fetch_logs_from(from, limit))
            .await
    }

    async fn fetch_logs_from(&self, from: u64, limit: u64) -> Result<Vec<Log>> {
        let select = format!(
            "SELECT {} FROM {} l WHERE l.id >= $1 ORDER BY l.id LIMIT $2",
            LOG_COLUMNS,
            self.schema.table("logs")
        );
        let rows: Vec<LogRow> = sqlx::query_as(&select)
            .bind(to_db_id(from)?)
            .bind(to_db_id(limit)?)
            .fetch_all(self.schema.pool())
            .await?;
        convert(rows)
    }

    /// Logs with `min <= id < max`, ascending
    pub async fn read_logs_range(&self, min: u64, max: u64) -> Result<Vec<Log>> {
        self.instrumented("read_logs_range", async {
            let select = format!(
                "SELECT {} FROM {} l WHERE l.id >= $1 AND l.id < $2 ORDER BY l.id",
                LOG_COLUMNS,
                self.schema.table("logs")
            );
            let rows: Vec<LogRow> = sqlx::query_as(&select)
                .bind(to_db_id(min)?)
                .bind(to_db_id(max)?)
                .fetch_all(self.schema.pool())
                .await?;
            convert(rows)
        })
        .await
    }

    /// Log carrying `reference`
    pub async fn read_log_with_reference(&self, reference: &str) -> Result<Log> {
        self.instrumented("read_log_with_reference", async {
            let select = format!(
                "SELECT {} FROM {} l WHERE l.reference = $1",
                LOG_COLUMNS,
                self.schema.table("logs")
            );
            let row: Option<LogRow> = sqlx::query_as(&select)
                .bind(reference)
                .fetch_optional(self.schema.pool())
                .await?;
            row.map(Log::try_from)
                .transpose()?
                .ok_or_else(|| Error::NotFound(format!("log with reference {:?}", reference)))
        })
        .await
    }

    /// Replay the stored chain from id 0 and recompute every hash
    ///
    /// Returns the number of verified logs; a broken link fails with
    /// [`ledger_core::Error::ChainBroken`] naming the first bad entry.
    pub async fn verify_log_chain(&self) -> Result<u64> {
        self.instrumented("verify_log_chain", async {
            let mut previous: Option<Log> = None;
            let mut verified = 0u64;
            loop {
                let chunk = self.fetch_logs_from(verified, VERIFY_CHUNK).await?;
                let Some(last) = chunk.last().cloned() else {
                    break;
                };
                if let Err(err) = verify_chain(&chunk, previous.as_ref()) {
                    warn!(ledger = self.name(), error = %err, "Log chain verification failed");
                    return Err(err.into());
                }
                verified += chunk.len() as u64;
                previous = Some(last);
            }
            Ok(verified)
        })
        .await
    }

    /// Append logs chained elsewhere, then project them
    ///
    /// The first log must extend the current head of this ledger.
    pub async fn import_logs(&self, logs: Vec<Log>) -> Result<u64> {
        self.instrumented("import_logs", async move {
            if let Some((first, rest)) = logs.split_first() {
                verify_chain(rest, Some(first))?;
            }
            let count = logs.len();
            self.append(logs.into_iter().map(LogModel::Imported).collect())
                .await?;
            info!(ledger = self.name(), imported = count, "Logs imported");
            self.run_projection().await
        })
        .await
    }

    /// Project every log not yet applied to transactions, accounts and volumes
    pub async fn project_pending(&self) -> Result<u64> {
        self.instrumented("project_pending", self.run_projection())
            .await
    }

    async fn run_projection(&self) -> Result<u64> {
        let mut tx = self.schema.pool().begin().await?;
        let projected = project_unprojected(&mut tx, &self.schema).await?;
        tx.commit().await?;
        Ok(projected)
    }
}
