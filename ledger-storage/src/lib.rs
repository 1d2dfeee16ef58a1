//! Ledger Storage
//!
//! PostgreSQL storage engine for [`ledger_core`] ledgers.
//!
//! # Architecture
//!
//! - **Driver**: owns the connection pool, the `_system` catalog and one
//!   [`Store`] per opened ledger
//! - **Store**: one namespace (schema) per ledger; mutations are appended as
//!   hash-chained logs through a batching write worker
//! - **Projection**: logs are applied to transactions, accounts and volumes
//!   tables; reads replay whatever is not projected yet
//! - **Migrations**: versioned units embedded in the binary, applied under an
//!   advisory lock
//!
//! # Example
//!
//! ```rust,no_run
//! use ledger_core::{Posting, TransactionData};
//! use ledger_storage::{Config, Driver, Metrics, Shared};
//! use std::sync::Arc;
//!
//! # async fn run() -> ledger_storage::Result<()> {
//! let config = Config::from_env()?;
//! let metrics = Arc::new(Metrics::default());
//! let driver = Driver::<Shared>::connect(config, metrics).await?;
//! driver.initialize().await?;
//!
//! let store = driver.get_ledger_store("main", true).await?;
//! let posting = Posting::new("world", "users:1", 100u64, "USD")?;
//! store
//!     .commit(vec![TransactionData::new(vec![posting]).into()])
//!     .await?;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod migrations;
pub mod pagination;
pub mod query;
pub mod schema;
pub mod store;
pub mod system;
pub mod worker;

// Re-exports
pub use config::Config;
pub use driver::Driver;
pub use error::{Error, ErrorKind, Result};
pub use metrics::Metrics;
pub use migrations::MigrationRecord;
pub use pagination::{ColumnPaginatedQuery, Cursor, OffsetPaginatedQuery, Order};
pub use query::{
    AccountsFilters, AddressFilter, BalanceFilter, BalanceOperator, BalancesFilters, LogsFilters,
    MetadataFilter, TransactionsFilters,
};
pub use schema::Schema;
pub use store::{hash_request, AccountBalances, Balances, Exclusive, Shared, Store, WriterMode};
pub use system::{LedgerEntry, SystemStore};
