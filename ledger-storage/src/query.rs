//! Query filters
//!
//! Each listing has its own closed filter struct. Filters serialize into
//! continuation tokens and render themselves as SQL conditions through
//! [`sqlx::QueryBuilder`], always with bound parameters.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::{Address, Metadata};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Appends `WHERE` before the first condition and `AND` before the others
pub(crate) struct Conditions<'q, 'args> {
    qb: &'q mut QueryBuilder<'args, Postgres>,
    first: bool,
}

impl<'q, 'args> Conditions<'q, 'args> {
    pub(crate) fn new(qb: &'q mut QueryBuilder<'args, Postgres>) -> Self {
        Self { qb, first: true }
    }

    /// Start a new condition
    pub(crate) fn and(&mut self) -> &mut QueryBuilder<'args, Postgres> {
        self.qb.push(if self.first { " WHERE " } else { " AND " });
        self.first = false;
        self.qb
    }
}

/// Address pattern: `:`-separated segments where `*` or an empty segment
/// matches any single segment, e.g. `users:*:wallet`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressFilter(String);

impl AddressFilter {
    /// Parse a pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let valid = !pattern.is_empty()
            && pattern.split(':').all(|segment| {
                segment == "*"
                    || segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(Error::InvalidQuery(format!("invalid address filter: {:?}", pattern)));
        }
        Ok(Self(pattern))
    }

    /// Segments, `None` for wildcards
    pub fn segments(&self) -> Vec<Option<&str>> {
        self.0
            .split(':')
            .map(|segment| match segment {
                "" | "*" => None,
                literal => Some(literal),
            })
            .collect()
    }

    /// The pattern when it contains no wildcard
    pub fn exact(&self) -> Option<&str> {
        self.segments()
            .iter()
            .all(Option::is_some)
            .then_some(self.0.as_str())
    }

    /// Evaluate the pattern against an address
    pub fn matches(&self, address: &Address) -> bool {
        let segments = self.segments();
        let parts = address.segments();
        segments.len() == parts.len()
            && segments
                .iter()
                .zip(parts)
                .all(|(pattern, part)| pattern.map_or(true, |p| p == part))
    }

    /// Render as a condition on `column` (text) and `array_column` (jsonb array of segments)
    pub(crate) fn push_sql(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        column: &str,
        array_column: &str,
    ) {
        if let Some(exact) = self.exact() {
            qb.push(column).push(" = ").push_bind(exact.to_string());
            return;
        }

        let segments = self.segments();
        qb.push("(jsonb_array_length(")
            .push(array_column)
            .push(") = ")
            .push_bind(segments.len() as i32);
        for (index, segment) in segments.iter().enumerate() {
            if let Some(segment) = segment {
                qb.push(" AND ")
                    .push(array_column)
                    .push(format!("->>{} = ", index))
                    .push_bind(segment.to_string());
            }
        }
        qb.push(")");
    }
}

impl TryFrom<String> for AddressFilter {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AddressFilter> for String {
    fn from(filter: AddressFilter) -> Self {
        filter.0
    }
}

impl fmt::Display for AddressFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata equality on dotted keys, e.g. `customer.tier = gold`
///
/// Values compare as text: strings by content, other JSON values by their
/// JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(BTreeMap<String, String>);

impl MetadataFilter {
    /// Require `path` to equal `value`
    pub fn with(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(path.into(), value.into());
        self
    }

    /// Whether no condition is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate against metadata
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0.iter().all(|(path, expected)| {
            metadata.get_path(path).is_some_and(|value| match value {
                Value::String(s) => s == expected,
                other => &other.to_string() == expected,
            })
        })
    }

    pub(crate) fn push_sql(&self, conditions: &mut Conditions<'_, '_>, column: &str) {
        for (path, expected) in &self.0 {
            let path: Vec<String> = path.split('.').map(str::to_string).collect();
            conditions
                .and()
                .push(column)
                .push(" #>> ")
                .push_bind(path)
                .push(" = ")
                .push_bind(expected.clone());
        }
    }
}

/// Balance comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceOperator {
    /// `=`
    E,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `!=`
    Ne,
}

impl BalanceOperator {
    /// SQL operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            BalanceOperator::E => "=",
            BalanceOperator::Gt => ">",
            BalanceOperator::Gte => ">=",
            BalanceOperator::Lt => "<",
            BalanceOperator::Lte => "<=",
            BalanceOperator::Ne => "!=",
        }
    }

    /// Evaluate `balance <op> value`
    pub fn compare(&self, balance: &BigInt, value: &BigInt) -> bool {
        match self {
            BalanceOperator::E => balance == value,
            BalanceOperator::Gt => balance > value,
            BalanceOperator::Gte => balance >= value,
            BalanceOperator::Lt => balance < value,
            BalanceOperator::Lte => balance <= value,
            BalanceOperator::Ne => balance != value,
        }
    }
}

impl FromStr for BalanceOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "e" | "eq" => Ok(BalanceOperator::E),
            "gt" => Ok(BalanceOperator::Gt),
            "gte" => Ok(BalanceOperator::Gte),
            "lt" => Ok(BalanceOperator::Lt),
            "lte" => Ok(BalanceOperator::Lte),
            "ne" => Ok(BalanceOperator::Ne),
            other => Err(Error::InvalidQuery(format!("unknown balance operator {:?}", other))),
        }
    }
}

/// Restrict accounts by balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    /// Comparison
    pub operator: BalanceOperator,
    /// Right-hand side
    #[serde(with = "ledger_core::types::bigint_string")]
    pub value: BigInt,
    /// Only this asset; any asset when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
}

/// Filters for transaction listings and counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsFilters {
    /// Exact reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Source or destination of any posting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AddressFilter>,
    /// Source of any posting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AddressFilter>,
    /// Destination of any posting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<AddressFilter>,
    /// Inclusive lower bound on the timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Metadata equality
    #[serde(default, skip_serializing_if = "MetadataFilter::is_empty")]
    pub metadata: MetadataFilter,
}

impl TransactionsFilters {
    /// Render conditions on transactions aliased `t`
    pub(crate) fn push_conditions(&self, conditions: &mut Conditions<'_, '_>, postings_table: &str) {
        if let Some(reference) = &self.reference {
            conditions.and().push("t.reference = ").push_bind(reference.clone());
        }

        let posting_matches = [
            (&self.account, true, true),
            (&self.source, true, false),
            (&self.destination, false, true),
        ];
        for (filter, on_source, on_destination) in posting_matches {
            let Some(filter) = filter else { continue };
            let qb = conditions.and();
            qb.push("EXISTS (SELECT 1 FROM ")
                .push(postings_table)
                .push(" p WHERE p.txid = t.id AND (");
            if on_source {
                filter.push_sql(qb, "p.source", "p.source_array");
            }
            if on_source && on_destination {
                qb.push(" OR ");
            }
            if on_destination {
                filter.push_sql(qb, "p.destination", "p.destination_array");
            }
            qb.push("))");
        }

        if let Some(start) = self.start_time {
            conditions.and().push("t.timestamp >= ").push_bind(start);
        }
        if let Some(end) = self.end_time {
            conditions.and().push("t.timestamp < ").push_bind(end);
        }

        self.metadata.push_sql(conditions, "t.metadata");
    }
}

/// Filters for account listings and counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFilters {
    /// Address pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressFilter>,
    /// Metadata equality
    #[serde(default, skip_serializing_if = "MetadataFilter::is_empty")]
    pub metadata: MetadataFilter,
    /// Balance comparison
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalanceFilter>,
}

impl AccountsFilters {
    /// Render conditions on accounts aliased `a`
    pub(crate) fn push_conditions(&self, conditions: &mut Conditions<'_, '_>, volumes_table: &str) {
        if let Some(address) = &self.address {
            address.push_sql(conditions.and(), "a.address", "a.address_array");
        }

        self.metadata.push_sql(conditions, "a.metadata");

        if let Some(balance) = &self.balance {
            balance.push_sql(conditions.and(), volumes_table);
        }
    }
}

impl BalanceFilter {
    /// Render the comparison for the account aliased `a`
    ///
    /// A missing volumes row counts as a zero balance. Without an asset, an
    /// account matches if any of its assets matches, or if it has no volumes
    /// at all and zero matches.
    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>, volumes_table: &str) {
        match &self.asset {
            Some(asset) => {
                qb.push("COALESCE((SELECT v.input - v.output FROM ")
                    .push(volumes_table)
                    .push(" v WHERE v.account = a.address AND v.asset = ")
                    .push_bind(asset.clone())
                    .push("), 0) ");
                self.push_comparison(qb);
            }
            None => {
                qb.push("(EXISTS (SELECT 1 FROM ")
                    .push(volumes_table)
                    .push(" v WHERE v.account = a.address AND (v.input - v.output) ");
                self.push_comparison(qb);
                qb.push(") OR (NOT EXISTS (SELECT 1 FROM ")
                    .push(volumes_table)
                    .push(" v WHERE v.account = a.address) AND 0 ");
                self.push_comparison(qb);
                qb.push("))");
            }
        }
    }

    fn push_comparison(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(self.operator.as_sql())
            .push(" ")
            .push_bind(self.value.to_string())
            .push("::numeric");
    }
}

/// Filters for balance listings and aggregation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesFilters {
    /// Address pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressFilter>,
    /// Only this asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
}

impl BalancesFilters {
    /// Render conditions on volumes aliased `v` joined with accounts aliased `a`
    pub(crate) fn push_conditions(&self, conditions: &mut Conditions<'_, '_>) {
        if let Some(address) = &self.address {
            address.push_sql(conditions.and(), "a.address", "a.address_array");
        }
        if let Some(asset) = &self.asset {
            conditions.and().push("v.asset = ").push_bind(asset.clone());
        }
    }

    /// Whether a volume row passes the filters
    pub fn matches(&self, account: &Address, asset: &str) -> bool {
        self.address.as_ref().map_or(true, |f| f.matches(account))
            && self.asset.as_deref().map_or(true, |a| a == asset)
    }
}

/// Filters for log listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsFilters {
    /// Inclusive lower bound on the date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl LogsFilters {
    /// Render conditions on logs aliased `l`
    pub(crate) fn push_conditions(&self, conditions: &mut Conditions<'_, '_>) {
        if let Some(start) = self.start_time {
            conditions.and().push("l.date >= ").push_bind(start);
        }
        if let Some(end) = self.end_time {
            conditions.and().push("l.date < ").push_bind(end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn address(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_address_filter_matching() {
        let filter = AddressFilter::new("users:*:wallet").unwrap();
        assert!(filter.matches(&address("users:001:wallet")));
        assert!(!filter.matches(&address("users:001:savings")));
        assert!(!filter.matches(&address("users:001")));
        assert!(!filter.matches(&address("users:001:wallet:eur")));

        let empty_segment = AddressFilter::new("users:").unwrap();
        assert!(empty_segment.matches(&address("users:42")));
        assert!(!empty_segment.matches(&address("users")));

        assert!(AddressFilter::new("users:a b").is_err());
        assert_eq!(AddressFilter::new("world").unwrap().exact(), Some("world"));
        assert_eq!(filter.exact(), None);
    }

    #[test]
    fn test_address_filter_sql() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM accounts a WHERE ");
        AddressFilter::new("users:*:wallet")
            .unwrap()
            .push_sql(&mut qb, "a.address", "a.address_array");
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM accounts a WHERE (jsonb_array_length(a.address_array) = $1 \
             AND a.address_array->>0 = $2 AND a.address_array->>2 = $3)"
        );

        let mut qb = QueryBuilder::<Postgres>::new("");
        AddressFilter::new("world")
            .unwrap()
            .push_sql(&mut qb, "a.address", "a.address_array");
        assert_eq!(qb.sql(), "a.address = $1");
    }

    #[test]
    fn test_transactions_filters_sql() {
        let filters = TransactionsFilters {
            reference: Some("ref".to_string()),
            account: Some(AddressFilter::new("alice").unwrap()),
            start_time: Some(Utc::now()),
            metadata: MetadataFilter::default().with("customer.tier", "gold"),
            ..Default::default()
        };

        let mut qb = QueryBuilder::<Postgres>::new("SELECT t.id FROM \"l\".transactions t");
        filters.push_conditions(&mut Conditions::new(&mut qb), "\"l\".postings");

        assert_eq!(
            qb.sql(),
            "SELECT t.id FROM \"l\".transactions t WHERE t.reference = $1 \
             AND EXISTS (SELECT 1 FROM \"l\".postings p WHERE p.txid = t.id AND \
             (p.source = $2 OR p.destination = $3)) \
             AND t.timestamp >= $4 AND t.metadata #>> $5 = $6"
        );
    }

    #[test]
    fn test_no_filters_no_where() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM logs l");
        LogsFilters::default().push_conditions(&mut Conditions::new(&mut qb));
        assert_eq!(qb.sql(), "SELECT * FROM logs l");
    }

    #[test]
    fn test_accounts_balance_filter_sql() {
        let filters = AccountsFilters {
            balance: Some(BalanceFilter {
                operator: "lt".parse().unwrap(),
                value: BigInt::from(0),
                asset: Some("USD".to_string()),
            }),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT a.address FROM accounts a");
        filters.push_conditions(&mut Conditions::new(&mut qb), "volumes");
        assert_eq!(
            qb.sql(),
            "SELECT a.address FROM accounts a WHERE COALESCE((SELECT v.input - v.output \
             FROM volumes v WHERE v.account = a.address AND v.asset = $1), 0) < $2::numeric"
        );
    }

    #[test]
    fn test_accounts_balance_filter_without_asset_covers_empty_accounts() {
        let filters = AccountsFilters {
            balance: Some(BalanceFilter {
                operator: "e".parse().unwrap(),
                value: BigInt::from(0),
                asset: None,
            }),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT a.address FROM accounts a");
        filters.push_conditions(&mut Conditions::new(&mut qb), "volumes");
        assert_eq!(
            qb.sql(),
            "SELECT a.address FROM accounts a WHERE (EXISTS (SELECT 1 FROM volumes v \
             WHERE v.account = a.address AND (v.input - v.output) = $1::numeric) \
             OR (NOT EXISTS (SELECT 1 FROM volumes v WHERE v.account = a.address) \
             AND 0 = $2::numeric))"
        );
    }

    #[test]
    fn test_metadata_filter_matching() {
        let metadata: Metadata = [("tier", json!("gold")), ("level", json!(3)), ("nested", json!({"k": "v"}))]
            .into_iter()
            .collect();

        assert!(MetadataFilter::default().with("tier", "gold").matches(&metadata));
        assert!(MetadataFilter::default().with("level", "3").matches(&metadata));
        assert!(MetadataFilter::default().with("nested.k", "v").matches(&metadata));
        assert!(!MetadataFilter::default().with("tier", "silver").matches(&metadata));
        assert!(!MetadataFilter::default().with("missing", "x").matches(&metadata));
    }

    #[test]
    fn test_balance_operator() {
        let ten = BigInt::from(10);
        let zero = BigInt::from(0);
        assert!("gt".parse::<BalanceOperator>().unwrap().compare(&ten, &zero));
        assert!("ne".parse::<BalanceOperator>().unwrap().compare(&ten, &zero));
        assert!(!"lte".parse::<BalanceOperator>().unwrap().compare(&ten, &zero));
        assert!("bogus".parse::<BalanceOperator>().is_err());
    }

    #[test]
    fn test_filters_survive_cursor_encoding() {
        let filters = AccountsFilters {
            address: Some(AddressFilter::new("users:*").unwrap()),
            metadata: MetadataFilter::default().with("role", "admin"),
            balance: Some(BalanceFilter {
                operator: BalanceOperator::Gte,
                value: "-170141183460469231731687303715884105728".parse().unwrap(),
                asset: None,
            }),
        };
        let json = serde_json::to_string(&filters).unwrap();
        assert_eq!(serde_json::from_str::<AccountsFilters>(&json).unwrap(), filters);
    }
}
