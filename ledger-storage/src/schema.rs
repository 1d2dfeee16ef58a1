//! Namespaces (PostgreSQL schemas)
//!
//! Every ledger lives in its own schema. Table references are always fully
//! qualified so one pool can serve all ledgers.

use crate::{Error, Result};
use sqlx::{Executor, PgPool};

/// Namespace reserved for the ledger catalog
pub const SYSTEM_SCHEMA: &str = "_system";

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Whether `name` can be used as a namespace: `^[0-9A-Za-z_-]{1,63}$`
pub fn is_valid_name(name: &str) -> bool {
    (1..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A namespace bound to a connection pool
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    pool: PgPool,
}

impl Schema {
    /// Bind a namespace name to a pool
    pub fn new(pool: PgPool, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(Error::InvalidQuery(format!("invalid namespace name: {:?}", name)));
        }
        Ok(Self { name, pool })
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fully qualified table name
    pub fn table(&self, table: &str) -> String {
        qualified(&self.name, table)
    }

    /// Create the namespace if absent
    pub async fn create(&self) -> Result<()> {
        let statement = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.name));
        self.pool.execute(statement.as_str()).await?;
        Ok(())
    }

    /// Drop the namespace and everything in it
    pub async fn drop_cascade(&self) -> Result<()> {
        if self.name == SYSTEM_SCHEMA {
            return Err(Error::InvalidQuery(
                "the system namespace cannot be dropped".to_string(),
            ));
        }
        let statement = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&self.name));
        self.pool.execute(statement.as_str()).await?;
        Ok(())
    }

    /// Whether the namespace exists in the catalog of the database
    pub async fn exists(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Fully qualified `"schema".table`
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), table)
}
