//! Offset pagination for grouped and aggregated queries

use super::{encode_cursor, Cursor, Order};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Offset-paginated query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetPaginatedQuery<F> {
    /// Rows per page
    pub page_size: u64,
    /// Rows skipped
    #[serde(default)]
    pub offset: u64,
    /// Sort direction
    pub order: Order,
    /// Query filters
    pub filters: F,
}

impl<F: Clone + Serialize> OffsetPaginatedQuery<F> {
    /// First page
    pub fn new(order: Order, page_size: u64, filters: F) -> Self {
        Self {
            page_size,
            offset: 0,
            order,
            filters,
        }
    }

    /// Rows to fetch, one more than the page size
    pub fn limit(&self) -> u64 {
        self.page_size + 1
    }

    fn at(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// Build the page from rows fetched with `LIMIT limit() OFFSET offset`
    pub fn page<T>(&self, mut rows: Vec<T>) -> Result<Cursor<T>> {
        if self.page_size == 0 {
            return Ok(Cursor::empty(0));
        }

        let has_more = rows.len() as u64 > self.page_size;
        if has_more {
            rows.truncate(self.page_size as usize);
        }

        let previous = (self.offset > 0)
            .then(|| self.at(self.offset.saturating_sub(self.page_size)));
        let next = has_more.then(|| self.at(self.offset + self.page_size));

        Ok(Cursor {
            page_size: self.page_size,
            has_more,
            previous: previous.as_ref().map(encode_cursor).transpose()?,
            next: next.as_ref().map(encode_cursor).transpose()?,
            data: rows,
        })
    }
}
