//! System catalog
//!
//! The reserved `_system` namespace records which ledgers exist and holds a
//! small key-value store of process-wide settings.

use crate::migrations::{bundled, Migrator};
use crate::schema::{Schema, SYSTEM_SCHEMA};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::info;

/// Catalog entry of a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Ledger name
    #[sqlx(rename = "ledger")]
    pub name: String,
    /// Registration date
    pub added_at: DateTime<Utc>,
}

/// Access to the system namespace
#[derive(Debug, Clone)]
pub struct SystemStore {
    schema: Schema,
    migrator: Migrator,
}

impl SystemStore {
    /// Catalog over `pool`
    pub fn new(pool: PgPool) -> Result<Self> {
        Ok(Self {
            schema: Schema::new(pool, SYSTEM_SCHEMA)?,
            migrator: bundled::system_migrator(),
        })
    }

    /// Create the system namespace and apply its migrations
    pub async fn migrate(&self) -> Result<bool> {
        self.schema.create().await?;
        let modified = self.migrator.migrate(&self.schema).await?;
        if modified {
            info!("System catalog migrated");
        }
        Ok(modified)
    }

    /// Add a ledger to the catalog; false if it was already there
    pub async fn register_ledger(&self, name: &str) -> Result<bool> {
        let insert = format!(
            "INSERT INTO {} (ledger) VALUES ($1) ON CONFLICT (ledger) DO NOTHING",
            self.schema.table("ledgers")
        );
        let result = sqlx::query(&insert)
            .bind(name)
            .execute(self.schema.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Registered ledgers by name
    pub async fn list_ledgers(&self) -> Result<Vec<LedgerEntry>> {
        let select = format!(
            "SELECT ledger, added_at FROM {} ORDER BY ledger",
            self.schema.table("ledgers")
        );
        let entries = sqlx::query_as(&select).fetch_all(self.schema.pool()).await?;
        Ok(entries)
    }

    /// Whether `name` is registered
    pub async fn ledger_exists(&self, name: &str) -> Result<bool> {
        let select = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE ledger = $1)",
            self.schema.table("ledgers")
        );
        let exists = sqlx::query_scalar(&select)
            .bind(name)
            .fetch_one(self.schema.pool())
            .await?;
        Ok(exists)
    }

    /// Remove `name` from the catalog
    pub async fn delete_ledger(&self, name: &str) -> Result<()> {
        let delete = format!("DELETE FROM {} WHERE ledger = $1", self.schema.table("ledgers"));
        let result = sqlx::query(&delete)
            .bind(name)
            .execute(self.schema.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("ledger {}", name)));
        }
        Ok(())
    }

    /// Setting stored under `key`
    pub async fn get_configuration(&self, key: &str) -> Result<String> {
        let select = format!(
            "SELECT value FROM {} WHERE key = $1",
            self.schema.table("configuration")
        );
        let value: Option<String> = sqlx::query_scalar(&select)
            .bind(key)
            .fetch_optional(self.schema.pool())
            .await?;
        value.ok_or_else(|| Error::NotFound(format!("configuration key {}", key)))
    }

    /// Store a setting; an existing key fails with [`Error::ConstraintViolation`]
    pub async fn insert_configuration(&self, key: &str, value: &str) -> Result<()> {
        let insert = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2)",
            self.schema.table("configuration")
        );
        sqlx::query(&insert)
            .bind(key)
            .bind(value)
            .execute(self.schema.pool())
            .await?;
        Ok(())
    }
}
