//! Pagination engine
//!
//! Two strategies share one [`Cursor`] shape:
//!
//! - [`column`]: keyset pagination on one monotonic integer column, stable
//!   under concurrent inserts
//! - [`offset`]: offset pagination for grouped or aggregated queries
//!
//! Continuation tokens are the serialized query, JSON then URL-safe base64,
//! so a token carries its filters and position.

pub mod column;
pub mod offset;

pub use column::{ColumnPaginatedQuery, ColumnScan, Comparison};
pub use offset::OffsetPaginatedQuery;

use crate::config::StoreConfig;
use crate::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending
    Asc,
    /// Descending
    #[default]
    Desc,
}

impl Order {
    /// SQL keyword
    pub fn as_sql(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }

    /// Opposite direction
    pub fn reversed(&self) -> Self {
        match self {
            Order::Asc => Order::Desc,
            Order::Desc => Order::Asc,
        }
    }
}

/// One page of results with continuation tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor<T> {
    /// Requested page size
    pub page_size: u64,
    /// Whether rows exist past this page in scan direction
    pub has_more: bool,
    /// Token for the preceding page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    /// Token for the following page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Rows of this page
    pub data: Vec<T>,
}

impl<T> Cursor<T> {
    /// Page without rows or tokens
    pub fn empty(page_size: u64) -> Self {
        Self {
            page_size,
            has_more: false,
            previous: None,
            next: None,
            data: Vec::new(),
        }
    }

    /// Convert the rows, keeping the tokens
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Cursor<U> {
        Cursor {
            page_size: self.page_size,
            has_more: self.has_more,
            previous: self.previous,
            next: self.next,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

/// Encode a query as a continuation token
pub fn encode_cursor<Q: Serialize>(query: &Q) -> Result<String> {
    let json = serde_json::to_vec(query)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a continuation token back into its query
pub fn decode_cursor<Q: DeserializeOwned>(token: &str) -> Result<Q> {
    let json = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| Error::InvalidQuery(format!("malformed cursor: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| Error::InvalidQuery(format!("malformed cursor: {}", e)))
}

/// Resolve a requested page size against the store limits
///
/// An unset or zero size takes the configured default.
pub fn clamp_page_size(requested: Option<u64>, config: &StoreConfig) -> u64 {
    requested
        .filter(|size| *size > 0)
        .unwrap_or(config.default_page_size)
        .min(config.max_page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SampleQuery {
        offset: u64,
        account: Option<String>,
    }

    #[test]
    fn test_cursor_token_roundtrip() {
        let query = SampleQuery {
            offset: 30,
            account: Some("users:*".to_string()),
        };
        let token = encode_cursor(&query).unwrap();
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert_eq!(decode_cursor::<SampleQuery>(&token).unwrap(), query);
    }

    #[test]
    fn test_malformed_token_is_invalid_query() {
        assert!(matches!(
            decode_cursor::<SampleQuery>("%%%"),
            Err(Error::InvalidQuery(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"not json");
        assert!(matches!(
            decode_cursor::<SampleQuery>(&not_json),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_clamp_page_size() {
        let config = StoreConfig::default();
        assert_eq!(clamp_page_size(None, &config), 15);
        assert_eq!(clamp_page_size(Some(50), &config), 50);
        assert_eq!(clamp_page_size(Some(50_000), &config), 1000);
        assert_eq!(clamp_page_size(Some(0), &config), 15);
    }

    #[test]
    fn test_cursor_map_keeps_tokens() {
        let cursor = Cursor {
            page_size: 2,
            has_more: true,
            previous: Some("p".to_string()),
            next: Some("n".to_string()),
            data: vec![1, 2],
        };
        let mapped = cursor.map(|v| v.to_string());
        assert_eq!(mapped.data, vec!["1", "2"]);
        assert_eq!(mapped.next.as_deref(), Some("n"));
    }
}
