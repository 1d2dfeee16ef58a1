use super::{Store, WriterMode};
use crate::pagination::{Cursor, OffsetPaginatedQuery};
use crate::query::{BalancesFilters, Conditions};
use crate::{Error, Result};
use ledger_core::{Address, Asset, Log};
use num_bigint::BigInt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;

/// Balance per asset
pub type Balances = BTreeMap<Asset, BigInt>;

/// Balances of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountBalances {
    /// Account
    pub address: Address,
    /// Balance per asset
    #[serde(serialize_with = "serialize_balances")]
    pub balances: Balances,
}

fn serialize_balances<S: Serializer>(
    balances: &Balances,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(balances.iter().map(|(asset, balance)| (asset, balance.to_string())))
}

fn parse_balance(value: &str) -> Result<BigInt> {
    value
        .parse()
        .map_err(|_| Error::Serialization(format!("invalid balance {:?}", value)))
}

/// Add the postings of `logs` that pass `filters` to `balances`
///
/// With `only_known` set, postings of accounts absent from `balances` are
/// ignored.
fn replay(
    balances: &mut BTreeMap<Address, Balances>,
    logs: &[Log],
    filters: &BalancesFilters,
    only_known: bool,
) {
    let postings = logs
        .iter()
        .filter_map(|log| log.payload.transaction())
        .flat_map(|tx| tx.postings());
    for posting in postings {
        let amount = posting.amount.to_bigint();
        for (account, delta) in [
            (&posting.source, -amount.clone()),
            (&posting.destination, amount.clone()),
        ] {
            if !filters.matches(account, posting.asset.as_str()) {
                continue;
            }
            if only_known && !balances.contains_key(account) {
                continue;
            }
            *balances
                .entry(account.clone())
                .or_default()
                .entry(posting.asset.clone())
                .or_default() += delta;
        }
    }
}

impl<M: WriterMode> Store<M> {
    /// Page of per-account balances, ordered by address
    ///
    /// Accounts are listed from the projection; their balances include the
    /// unprojected tail.
    pub async fn get_balances(
        &self,
        mut query: OffsetPaginatedQuery<BalancesFilters>,
    ) -> Result<Cursor<AccountBalances>> {
        self.instrumented("get_balances", async move {
            query.page_size = self.page_size(query.page_size);
            let mut tx = self.snapshot().await?;

            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT v.account, jsonb_object_agg(v.asset, (v.input - v.output)::text) AS balances \
                 FROM {} v JOIN {} a ON a.address = v.account",
                self.schema.table("volumes"),
                self.schema.table("accounts")
            ));
            query.filters.push_conditions(&mut Conditions::new(&mut qb));
            qb.push(" GROUP BY v.account ORDER BY v.account ")
                .push(query.order.as_sql())
                .push(" LIMIT ")
                .push_bind(query.limit() as i64)
                .push(" OFFSET ")
                .push_bind(query.offset as i64);

            let rows: Vec<(String, Value)> = qb.build_query_as().fetch_all(&mut *tx).await?;
            let tail = self.unprojected(&mut tx).await?;
            tx.commit().await?;

            let mut order = Vec::with_capacity(rows.len());
            let mut balances = BTreeMap::new();
            for (account, assets) in rows {
                let address = Address::new(account)?;
                let assets: BTreeMap<String, String> = serde_json::from_value(assets)?;
                let mut per_asset = Balances::new();
                for (asset, balance) in assets {
                    per_asset.insert(Asset::new(asset)?, parse_balance(&balance)?);
                }
                order.push(address.clone());
                balances.insert(address, per_asset);
            }
            replay(&mut balances, &tail, &query.filters, true);

            let page: Vec<AccountBalances> = order
                .into_iter()
                .map(|address| {
                    let balances = balances.remove(&address).unwrap_or_default();
                    AccountBalances { address, balances }
                })
                .collect();
            query.page(page)
        })
        .await
    }

    /// Sum of balances per asset over the accounts matching `filters`
    pub async fn get_balances_aggregated(&self, filters: &BalancesFilters) -> Result<Balances> {
        self.instrumented("get_balances_aggregated", async {
            let mut tx = self.snapshot().await?;

            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT v.asset, SUM(v.input - v.output)::text \
                 FROM {} v JOIN {} a ON a.address = v.account",
                self.schema.table("volumes"),
                self.schema.table("accounts")
            ));
            filters.push_conditions(&mut Conditions::new(&mut qb));
            qb.push(" GROUP BY v.asset");

            let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&mut *tx).await?;
            let tail = self.unprojected(&mut tx).await?;
            tx.commit().await?;

            let mut aggregated = Balances::new();
            for (asset, balance) in rows {
                aggregated.insert(Asset::new(asset)?, parse_balance(&balance)?);
            }

            let mut per_account = BTreeMap::new();
            replay(&mut per_account, &tail, filters, false);
            for balances in per_account.into_values() {
                for (asset, balance) in balances {
                    *aggregated.entry(asset).or_default() += balance;
                }
            }
            Ok(aggregated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AddressFilter;
    use ledger_core::log::TransactionCreatedPayload;
    use ledger_core::{AccountsAssetsVolumes, LogPayload, NewLog, Posting, Transaction, TransactionData};

    fn tail(postings: Vec<Posting>) -> Vec<Log> {
        let transaction = Transaction::commit(
            0,
            TransactionData::new(postings),
            &mut AccountsAssetsVolumes::new(),
        );
        vec![NewLog::new(LogPayload::TransactionCreated(TransactionCreatedPayload {
            transaction,
            account_metadata: Default::default(),
        }))
        .chain(None)]
    }

    fn address(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn usd() -> Asset {
        Asset::new("USD").unwrap()
    }

    #[test]
    fn test_replay_moves_balances_both_ways() {
        let logs = tail(vec![Posting::new("world", "users:1", 100u64, "USD").unwrap()]);
        let mut balances = BTreeMap::new();
        replay(&mut balances, &logs, &BalancesFilters::default(), false);

        assert_eq!(balances[&address("world")][&usd()], BigInt::from(-100));
        assert_eq!(balances[&address("users:1")][&usd()], BigInt::from(100));
    }

    #[test]
    fn test_replay_respects_filters_and_known_accounts() {
        let logs = tail(vec![
            Posting::new("world", "users:1", 100u64, "USD").unwrap(),
            Posting::new("world", "users:2", 5u64, "EUR").unwrap(),
        ]);
        let filters = BalancesFilters {
            address: Some(AddressFilter::new("users:*").unwrap()),
            asset: None,
        };

        let mut balances = BTreeMap::new();
        balances.insert(address("users:1"), Balances::from([(usd(), BigInt::from(7))]));
        replay(&mut balances, &logs, &filters, true);

        assert_eq!(balances.len(), 1);
        assert_eq!(balances[&address("users:1")][&usd()], BigInt::from(107));
    }

    #[test]
    fn test_balances_serialize_as_strings() {
        let balances = AccountBalances {
            address: address("world"),
            balances: Balances::from([(usd(), BigInt::from(-250))]),
        };
        let json = serde_json::to_value(&balances).unwrap();
        assert_eq!(json["balances"]["USD"], "-250");
        assert_eq!(json["address"], "world");
    }
}
