use super::rows::{convert, to_db_id, TransactionRow, TRANSACTION_COLUMNS};
use super::{LogModel, Store, WriterMode};
use crate::pagination::{ColumnPaginatedQuery, Cursor};
use crate::query::{Conditions, TransactionsFilters};
use crate::{Error, Result};
use ledger_core::{Log, LogPayload, Metadata, MetadataTarget, NewTransaction, Transaction};
use sqlx::{Postgres, QueryBuilder};

/// Only column transactions are paginated on
const PAGINATION_COLUMN: &str = "id";

fn transaction_of(log: Log) -> Result<Transaction> {
    match log.payload {
        LogPayload::TransactionCreated(p) => Ok(p.transaction),
        LogPayload::TransactionReverted(p) => Ok(p.transaction),
        other => Err(Error::Concurrency(format!(
            "writer returned a {} log for a transaction",
            other.log_type()
        ))),
    }
}

impl<M: WriterMode> Store<M> {
    /// Commit transactions atomically, in order
    ///
    /// Either every transaction is committed or none is. A duplicate
    /// reference fails with [`Error::ConstraintViolation`].
    pub async fn commit(&self, transactions: Vec<NewTransaction>) -> Result<Vec<Transaction>> {
        self.instrumented("commit", async move {
            for transaction in &transactions {
                transaction.data.validate()?;
            }
            let models = transactions
                .into_iter()
                .map(LogModel::TransactionCreated)
                .collect();
            self.append(models)
                .await?
                .into_iter()
                .map(transaction_of)
                .collect()
        })
        .await
    }

    /// Commit the reversal of transaction `id` and mark it reverted
    ///
    /// Returns the compensating transaction.
    pub async fn revert_transaction(&self, id: u64) -> Result<Transaction> {
        self.instrumented("revert_transaction", async move {
            let original = self.fetch_transaction(id).await?;
            if original.reverted {
                return Err(Error::ConstraintViolation(format!(
                    "transaction {} already reverted",
                    id
                )));
            }
            let log = self.append_one(LogModel::TransactionReverted { id }).await?;
            transaction_of(log)
        })
        .await
    }

    /// Transaction by id
    pub async fn get_transaction(&self, id: u64) -> Result<Transaction> {
        self.instrumented("get_transaction", self.fetch_transaction(id))
            .await
    }

    async fn fetch_transaction(&self, id: u64) -> Result<Transaction> {
        let select = format!(
            "SELECT {} FROM {} t WHERE t.id = $1",
            TRANSACTION_COLUMNS,
            self.schema.table("transactions")
        );
        let row: Option<TransactionRow> = sqlx::query_as(&select)
            .bind(to_db_id(id)?)
            .fetch_optional(self.schema.pool())
            .await?;
        row.map(Transaction::try_from)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", id)))
    }

    /// Most recent transaction, if any
    pub async fn get_last_transaction(&self) -> Result<Option<Transaction>> {
        self.instrumented("get_last_transaction", async {
            let select = format!(
                "SELECT {} FROM {} t ORDER BY t.id DESC LIMIT 1",
                TRANSACTION_COLUMNS,
                self.schema.table("transactions")
            );
            let row: Option<TransactionRow> = sqlx::query_as(&select)
                .fetch_optional(self.schema.pool())
                .await?;
            row.map(Transaction::try_from).transpose()
        })
        .await
    }

    /// Page of transactions ordered by id
    pub async fn get_transactions(
        &self,
        mut query: ColumnPaginatedQuery<TransactionsFilters>,
    ) -> Result<Cursor<Transaction>> {
        self.instrumented("get_transactions", async move {
            if query.column != PAGINATION_COLUMN {
                return Err(Error::InvalidQuery(format!(
                    "transactions cannot be paginated on {:?}",
                    query.column
                )));
            }
            query.page_size = self.page_size(query.page_size);
            let scan = query.scan();

            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {} FROM {} t",
                TRANSACTION_COLUMNS,
                self.schema.table("transactions")
            ));
            let mut conditions = Conditions::new(&mut qb);
            query
                .filters
                .push_conditions(&mut conditions, &self.schema.table("postings"));
            if let Some((comparison, bound)) = scan.bound {
                conditions
                    .and()
                    .push("t.id ")
                    .push(comparison.as_sql())
                    .push(" ")
                    .push_bind(bound);
            }
            qb.push(" ORDER BY t.id ")
                .push(scan.order.as_sql())
                .push(" LIMIT ")
                .push_bind(scan.limit as i64);

            let rows: Vec<TransactionRow> = qb.build_query_as().fetch_all(self.schema.pool()).await?;
            let transactions: Vec<Transaction> = convert(rows)?;
            query.page(transactions, |t| t.id as i64)
        })
        .await
    }

    /// Number of transactions matching `filters`
    pub async fn count_transactions(&self, filters: &TransactionsFilters) -> Result<u64> {
        self.instrumented("count_transactions", async {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT count(*) FROM {} t",
                self.schema.table("transactions")
            ));
            filters.push_conditions(&mut Conditions::new(&mut qb), &self.schema.table("postings"));
            let count: i64 = qb.build_query_scalar().fetch_one(self.schema.pool()).await?;
            Ok(count as u64)
        })
        .await
    }

    /// Merge metadata into transaction `id`
    pub async fn update_transaction_metadata(&self, id: u64, metadata: Metadata) -> Result<Log> {
        self.update_transactions_metadata(vec![(id, metadata)])
            .await?
            .pop()
            .ok_or_else(|| Error::Concurrency("writer returned no log".to_string()))
    }

    /// Merge metadata into several transactions in one batch
    pub async fn update_transactions_metadata(&self, updates: Vec<(u64, Metadata)>) -> Result<Vec<Log>> {
        self.instrumented("update_transactions_metadata", async move {
            for (id, _) in &updates {
                self.fetch_transaction(*id).await?;
            }
            let models = updates
                .into_iter()
                .map(|(id, metadata)| LogModel::MetadataSet {
                    target: MetadataTarget::Transaction(id),
                    metadata,
                })
                .collect();
            self.append(models).await
        })
        .await
    }

    /// Remove `key` from the metadata of transaction `id`
    pub async fn delete_transaction_metadata(&self, id: u64, key: &str) -> Result<Log> {
        self.instrumented("delete_transaction_metadata", async move {
            self.fetch_transaction(id).await?;
            self.append_one(LogModel::MetadataDeleted {
                target: MetadataTarget::Transaction(id),
                key: key.to_string(),
            })
            .await
        })
        .await
    }
}
