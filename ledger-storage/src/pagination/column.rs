//! Keyset pagination on a single integer column
//!
//! A query is turned into a [`ColumnScan`] (direction, bound, limit) that the
//! store renders as SQL. The fetched rows are turned back into a
//! [`Cursor`] by [`ColumnPaginatedQuery::page`].
//!
//! The scan always fetches one extra row to learn whether more rows exist.
//! Forward scans bound inclusively from the pagination id; reverse scans
//! (used to walk back) bound exclusively and run in the opposite direction.
//! `bottom` remembers the first value ever served, which tells whether a
//! previous page exists.

use super::{encode_cursor, Cursor, Order};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Comparison applied to the paginated column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `>=`
    Gte,
    /// `<=`
    Lte,
    /// `<`
    Lt,
    /// `>`
    Gt,
}

impl Comparison {
    /// Operator for a scan of the given declared order and direction
    pub fn for_scan(order: Order, reverse: bool) -> Self {
        match (order, reverse) {
            (Order::Asc, false) => Comparison::Gte,
            (Order::Desc, false) => Comparison::Lte,
            (Order::Asc, true) => Comparison::Lt,
            (Order::Desc, true) => Comparison::Gt,
        }
    }

    /// SQL operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
            Comparison::Lt => "<",
            Comparison::Gt => ">",
        }
    }

    /// Evaluate `value <op> bound`
    pub fn matches(&self, value: i64, bound: i64) -> bool {
        match self {
            Comparison::Gte => value >= bound,
            Comparison::Lte => value <= bound,
            Comparison::Lt => value < bound,
            Comparison::Gt => value > bound,
        }
    }
}

/// Physical scan derived from a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnScan {
    /// Direction to sort the column in
    pub order: Order,
    /// Optional `column <op> value` restriction
    pub bound: Option<(Comparison, i64)>,
    /// Rows to fetch, one more than the page size
    pub limit: u64,
}

/// Keyset-paginated query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnPaginatedQuery<F> {
    /// Rows per page
    pub page_size: u64,
    /// Paginated column
    pub column: String,
    /// Position to resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_id: Option<i64>,
    /// First value ever served by this pagination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<i64>,
    /// Declared order
    pub order: Order,
    /// Walking back towards `bottom`
    #[serde(default)]
    pub reverse: bool,
    /// Query filters
    pub filters: F,
}

impl<F: Clone + Serialize> ColumnPaginatedQuery<F> {
    /// First page of a pagination
    pub fn new(column: impl Into<String>, order: Order, page_size: u64, filters: F) -> Self {
        Self {
            page_size,
            column: column.into(),
            pagination_id: None,
            bottom: None,
            order,
            reverse: false,
            filters,
        }
    }

    /// Scan to run for this page
    pub fn scan(&self) -> ColumnScan {
        ColumnScan {
            order: if self.reverse {
                self.order.reversed()
            } else {
                self.order
            },
            bound: self
                .pagination_id
                .map(|id| (Comparison::for_scan(self.order, self.reverse), id)),
            limit: self.page_size + 1,
        }
    }

    fn continuation(&self, pagination_id: Option<i64>, bottom: Option<i64>, reverse: bool) -> Self {
        Self {
            pagination_id,
            bottom,
            reverse,
            ..self.clone()
        }
    }

    /// Build the page from rows fetched by [`scan`](Self::scan)
    ///
    /// `key` extracts the paginated column value of a row.
    pub fn page<T>(&self, mut rows: Vec<T>, key: impl Fn(&T) -> i64) -> Result<Cursor<T>> {
        if self.page_size == 0 {
            return Ok(Cursor::empty(0));
        }

        let ids: Vec<i64> = rows.iter().map(&key).collect();
        let has_more = ids.len() as u64 > self.page_size;
        let bottom = self.bottom.or_else(|| ids.first().copied());
        if has_more {
            rows.truncate(self.page_size as usize);
        }

        let mut previous = None;
        let mut next = None;

        if self.reverse {
            rows.reverse();
            if has_more {
                // Last kept row in scan order
                let resume = ids[ids.len() - 2];
                previous = Some(self.continuation(Some(resume), bottom, true));
            }
            next = Some(self.continuation(self.pagination_id, bottom, false));
        } else {
            if has_more {
                // The extra row starts the next page, the bound is inclusive
                let resume = ids[ids.len() - 1];
                next = Some(self.continuation(Some(resume), bottom, false));
            }
            if let (Some(id), Some(bottom)) = (self.pagination_id, bottom) {
                let past_bottom = match self.order {
                    Order::Asc => id > bottom,
                    Order::Desc => id < bottom,
                };
                if past_bottom {
                    previous = Some(self.continuation(Some(id), Some(bottom), true));
                }
            }
        }

        Ok(Cursor {
            page_size: self.page_size,
            has_more,
            previous: previous.as_ref().map(encode_cursor).transpose()?,
            next: next.as_ref().map(encode_cursor).transpose()?,
            data: rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::decode_cursor;
    use proptest::prelude::*;

    type Query = ColumnPaginatedQuery<()>;

    /// Executes a scan against an in-memory column the way the store's SQL does
    fn execute(scan: &ColumnScan, column: &[i64]) -> Vec<i64> {
        let mut rows: Vec<i64> = column
            .iter()
            .copied()
            .filter(|v| scan.bound.map_or(true, |(op, bound)| op.matches(*v, bound)))
            .collect();
        rows.sort_unstable();
        if scan.order == Order::Desc {
            rows.reverse();
        }
        rows.truncate(scan.limit as usize);
        rows
    }

    fn fetch(query: &Query, column: &[i64]) -> Cursor<i64> {
        query.page(execute(&query.scan(), column), |v| *v).unwrap()
    }

    fn follow(token: &Option<String>) -> Query {
        decode_cursor(token.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn test_scan_operators() {
        let mut query = Query::new("id", Order::Asc, 10, ());
        assert_eq!(query.scan().bound, None);
        assert_eq!(query.scan().limit, 11);

        query.pagination_id = Some(5);
        assert_eq!(query.scan().bound, Some((Comparison::Gte, 5)));
        assert_eq!(query.scan().order, Order::Asc);

        query.reverse = true;
        assert_eq!(query.scan().bound, Some((Comparison::Lt, 5)));
        assert_eq!(query.scan().order, Order::Desc);

        query.order = Order::Desc;
        assert_eq!(query.scan().bound, Some((Comparison::Gt, 5)));
        assert_eq!(query.scan().order, Order::Asc);

        query.reverse = false;
        assert_eq!(query.scan().bound, Some((Comparison::Lte, 5)));
    }

    #[test]
    fn test_forward_then_back_descending() {
        let column: Vec<i64> = (1..=10).collect();

        let first = fetch(&Query::new("id", Order::Desc, 3, ()), &column);
        assert_eq!(first.data, vec![10, 9, 8]);
        assert!(first.has_more);
        assert!(first.previous.is_none());

        let second = fetch(&follow(&first.next), &column);
        assert_eq!(second.data, vec![7, 6, 5]);

        let back = fetch(&follow(&second.previous), &column);
        assert_eq!(back.data, first.data);
        assert!(back.previous.is_none());

        let forward_again = fetch(&follow(&back.next), &column);
        assert_eq!(forward_again.data, second.data);
    }

    #[test]
    fn test_last_page_has_no_next() {
        let column: Vec<i64> = (0..6).collect();
        let first = fetch(&Query::new("id", Order::Asc, 3, ()), &column);
        assert_eq!(first.data, vec![0, 1, 2]);

        let second = fetch(&follow(&first.next), &column);
        assert_eq!(second.data, vec![3, 4, 5]);
        assert!(!second.has_more);
        assert!(second.next.is_none());
        assert!(second.previous.is_some());
    }

    #[test]
    fn test_inserts_do_not_shift_pages() {
        let mut column: Vec<i64> = (0..6).collect();
        let first = fetch(&Query::new("id", Order::Asc, 3, ()), &column);

        column.extend([6, 7]);
        let second = fetch(&follow(&first.next), &column);
        assert_eq!(second.data, vec![3, 4, 5]);
        assert!(second.has_more);
    }

    #[test]
    fn test_empty_and_zero_sized_pages() {
        let empty = fetch(&Query::new("id", Order::Desc, 5, ()), &[]);
        assert!(empty.data.is_empty());
        assert!(empty.next.is_none() && empty.previous.is_none());

        let zero = fetch(&Query::new("id", Order::Desc, 0, ()), &[1, 2, 3]);
        assert!(zero.data.is_empty());
        assert!(!zero.has_more);
    }

    #[test]
    fn test_tokens_carry_filters_and_bottom() {
        let column: Vec<i64> = (0..4).collect();
        let query = ColumnPaginatedQuery::new("id", Order::Asc, 2, "users:*".to_string());
        let page = query
            .page(execute(&query.scan(), &column), |v| *v)
            .unwrap();

        let next: ColumnPaginatedQuery<String> = decode_cursor(page.next.as_deref().unwrap()).unwrap();
        assert_eq!(next.filters, "users:*");
        assert_eq!(next.bottom, Some(0));
        assert_eq!(next.pagination_id, Some(2));
    }

    proptest! {
        /// Walking forward visits every row once in order; walking back
        /// reproduces the same pages
        #[test]
        fn prop_round_trip(
            len in 0usize..60,
            page_size in 1u64..8,
            ascending in any::<bool>(),
        ) {
            let column: Vec<i64> = (0..len as i64).map(|v| v * 3).collect();
            let order = if ascending { Order::Asc } else { Order::Desc };

            let mut pages = vec![fetch(&Query::new("id", order, page_size, ()), &column)];
            while let Some(next) = pages.last().and_then(|p| p.next.clone()) {
                pages.push(fetch(&follow(&Some(next)), &column));
            }

            let visited: Vec<i64> = pages.iter().flat_map(|p| p.data.clone()).collect();
            let mut expected = column.clone();
            if !ascending {
                expected.reverse();
            }
            prop_assert_eq!(visited, expected);

            let mut index = pages.len() - 1;
            let mut current = pages[index].clone();
            while let Some(previous) = current.previous.clone() {
                index -= 1;
                current = fetch(&follow(&Some(previous)), &column);
                prop_assert_eq!(&current.data, &pages[index].data);
            }
            prop_assert_eq!(index, 0);
        }
    }
}
