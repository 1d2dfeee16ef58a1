//! Ledger Core
//!
//! Domain model for a double-entry ledger backed by an append-only,
//! hash-chained log.
//!
//! # Architecture
//!
//! - **Postings**: Every movement of value is a posting from a source account
//!   to a destination account for one asset
//! - **Volumes**: Each (account, asset) pair accumulates an input and an output
//!   counter; the balance is `input - output`
//! - **Log**: Every state change is appended as a log entry whose hash commits
//!   to its predecessor
//!
//! # Invariants
//!
//! - Conservation: Σ(inputs) == Σ(outputs) per asset across all accounts
//! - Gapless ids: log and transaction ids are dense and start at 0
//! - Deterministic replay: the same logs always yield the same volumes

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod account;
pub mod canonical;
pub mod error;
pub mod log;
pub mod transaction;
pub mod types;
pub mod volumes;

// Re-exports
pub use account::{Account, AccountWithVolumes};
pub use error::{Error, Result};
pub use log::{verify_chain, Log, LogPayload, LogType, MetadataTarget, NewLog};
pub use transaction::{NewTransaction, Posting, Transaction, TransactionData};
pub use types::{Address, Amount, Asset, Metadata};
pub use volumes::{AccountsAssetsVolumes, Volumes};
