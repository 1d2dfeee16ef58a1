use super::rows::{convert, AccountRow, VolumesRow, ACCOUNT_COLUMNS};
use super::{LogModel, Store, WriterMode};
use crate::pagination::{Cursor, OffsetPaginatedQuery};
use crate::query::{AccountsFilters, Conditions};
use crate::{Error, Result};
use ledger_core::{
    Account, AccountWithVolumes, Address, Amount, Asset, Log, Metadata, MetadataTarget, Volumes,
};
use sqlx::{Postgres, QueryBuilder};

impl<M: WriterMode> Store<M> {
    /// Account by address, metadata included
    pub async fn get_account(&self, address: &Address) -> Result<Account> {
        self.instrumented("get_account", async {
            Ok(self.compute_account(address, false).await?.account)
        })
        .await
    }

    /// Account with its volumes per asset
    ///
    /// Starts from the projected account and volumes, then replays every
    /// unprojected log that touches the account.
    pub async fn get_account_with_volumes(&self, address: &Address) -> Result<AccountWithVolumes> {
        self.instrumented("get_account_with_volumes", self.compute_account(address, true))
            .await
    }

    async fn compute_account(&self, address: &Address, with_volumes: bool) -> Result<AccountWithVolumes> {
        let mut tx = self.snapshot().await?;

        let select = format!(
            "SELECT {} FROM {} a WHERE a.address = $1",
            ACCOUNT_COLUMNS,
            self.schema.table("accounts")
        );
        let row: Option<AccountRow> = sqlx::query_as(&select)
            .bind(address.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let stored = row.is_some();

        let mut account = AccountWithVolumes::new(address.clone());
        if let Some(row) = row {
            account.account = Account::try_from(row)?;
        }

        if stored && with_volumes {
            let select = format!(
                "SELECT v.account, v.asset, v.input::text AS input, v.output::text AS output \
                 FROM {} v WHERE v.account = $1",
                self.schema.table("volumes")
            );
            let rows: Vec<VolumesRow> = sqlx::query_as(&select)
                .bind(address.as_str())
                .fetch_all(&mut *tx)
                .await?;
            for row in rows {
                account.volumes.insert(
                    Asset::new(row.asset)?,
                    Volumes {
                        input: row.input.parse::<Amount>()?,
                        output: row.output.parse::<Amount>()?,
                    },
                );
            }
        }

        let tail = self.unprojected(&mut tx).await?;
        tx.commit().await?;

        let touched: Vec<&Log> = tail.iter().filter(|log| account.is_touched_by(log)).collect();
        if !stored && touched.is_empty() {
            return Err(Error::NotFound(format!("account {}", address)));
        }
        for log in touched {
            account.apply(log);
        }
        if !with_volumes {
            account.volumes.clear();
        }
        Ok(account)
    }

    /// Page of accounts ordered by address
    ///
    /// Filters are evaluated on the projected tables.
    pub async fn get_accounts(
        &self,
        mut query: OffsetPaginatedQuery<AccountsFilters>,
    ) -> Result<Cursor<Account>> {
        self.instrumented("get_accounts", async move {
            query.page_size = self.page_size(query.page_size);

            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {} FROM {} a",
                ACCOUNT_COLUMNS,
                self.schema.table("accounts")
            ));
            query
                .filters
                .push_conditions(&mut Conditions::new(&mut qb), &self.schema.table("volumes"));
            qb.push(" ORDER BY a.address ")
                .push(query.order.as_sql())
                .push(" LIMIT ")
                .push_bind(query.limit() as i64)
                .push(" OFFSET ")
                .push_bind(query.offset as i64);

            let rows: Vec<AccountRow> = qb.build_query_as().fetch_all(self.schema.pool()).await?;
            query.page(convert(rows)?)
        })
        .await
    }

    /// Number of accounts matching `filters`
    pub async fn count_accounts(&self, filters: &AccountsFilters) -> Result<u64> {
        self.instrumented("count_accounts", async {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT count(*) FROM {} a",
                self.schema.table("accounts")
            ));
            filters.push_conditions(&mut Conditions::new(&mut qb), &self.schema.table("volumes"));
            let count: i64 = qb.build_query_scalar().fetch_one(self.schema.pool()).await?;
            Ok(count as u64)
        })
        .await
    }

    /// Merge metadata into an account, creating it if needed
    pub async fn update_account_metadata(&self, address: &Address, metadata: Metadata) -> Result<Log> {
        self.instrumented("update_account_metadata", async move {
            self.append_one(LogModel::MetadataSet {
                target: MetadataTarget::Account(address.clone()),
                metadata,
            })
            .await
        })
        .await
    }

    /// Remove `key` from the metadata of an account
    ///
    /// [`Error::NotFound`] if the account is unknown.
    pub async fn delete_account_metadata(&self, address: &Address, key: &str) -> Result<Log> {
        self.instrumented("delete_account_metadata", async move {
            self.compute_account(address, false).await?;
            self.append_one(LogModel::MetadataDeleted {
                target: MetadataTarget::Account(address.clone()),
                key: key.to_string(),
            })
            .await
        })
        .await
    }
}
