//! Driver: connection pool, system catalog and one store per ledger

use crate::config::Config;
use crate::metrics::Metrics;
use crate::schema::{is_valid_name, Schema, SYSTEM_SCHEMA};
use crate::store::{Store, WriterMode};
use crate::system::{LedgerEntry, SystemStore};
use crate::{Error, Result};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Entry point of the storage engine
///
/// Each ledger gets exactly one [`Store`] per driver, which makes the store
/// the single writer of its namespace within this process.
#[derive(Debug)]
pub struct Driver<M: WriterMode> {
    pool: PgPool,
    system: SystemStore,
    stores: DashMap<String, Arc<Store<M>>>,
    opening: Mutex<()>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl<M: WriterMode> Driver<M> {
    /// Connect a pool as configured
    pub async fn connect(config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        info!(
            max_connections = config.database.max_connections,
            "Connecting to database..."
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&config.database.url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("Database connection pool created successfully");

        Self::new(pool, config, metrics)
    }

    /// Driver over an existing pool
    pub fn new(pool: PgPool, config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        Ok(Self {
            system: SystemStore::new(pool.clone())?,
            pool,
            stores: DashMap::new(),
            opening: Mutex::new(()),
            config,
            metrics,
        })
    }

    /// Create the system namespace and run its migrations
    pub async fn initialize(&self) -> Result<()> {
        self.system.migrate().await?;
        Ok(())
    }

    /// System catalog
    pub fn system(&self) -> &SystemStore {
        &self.system
    }

    /// Connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn check_name(name: &str) -> Result<()> {
        if !is_valid_name(name) || name == SYSTEM_SCHEMA {
            return Err(Error::InvalidQuery(format!("invalid ledger name: {:?}", name)));
        }
        Ok(())
    }

    /// Store of ledger `name`
    ///
    /// Opening a ledger migrates its namespace and projects pending logs.
    /// With `create`, an unknown ledger is registered; otherwise it is
    /// [`Error::NotFound`].
    pub async fn get_ledger_store(&self, name: &str, create: bool) -> Result<Arc<Store<M>>> {
        Self::check_name(name)?;
        if let Some(store) = self.stores.get(name) {
            return Ok(store.value().clone());
        }

        let _opening = self.opening.lock().await;
        if let Some(store) = self.stores.get(name) {
            return Ok(store.value().clone());
        }

        if !self.system.ledger_exists(name).await? {
            if !create {
                return Err(Error::NotFound(format!("ledger {}", name)));
            }
            if self.system.register_ledger(name).await? {
                info!(ledger = name, "Ledger registered");
            }
        }

        let schema = Schema::new(self.pool.clone(), name)?;
        schema.create().await?;

        let store = Arc::new(Store::<M>::new(schema, &self.config, self.metrics.clone()));
        let opened = async {
            store.migrate().await?;
            store.project_pending().await
        };
        match opened.await {
            Ok(projected) => {
                info!(ledger = name, projected, "Ledger ready");
            }
            Err(err) => {
                store.close().await;
                return Err(err);
            }
        }

        self.stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Stop the ledger's store, drop its namespace and unregister it
    pub async fn delete_ledger(&self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let _opening = self.opening.lock().await;

        if let Some((_, store)) = self.stores.remove(name) {
            store.close().await;
        }
        Schema::new(self.pool.clone(), name)?.drop_cascade().await?;
        self.system.delete_ledger(name).await?;
        info!(ledger = name, "Ledger deleted");
        Ok(())
    }

    /// Registered ledgers
    pub async fn list_ledgers(&self) -> Result<Vec<LedgerEntry>> {
        self.system.list_ledgers().await
    }

    /// Open every registered ledger
    pub async fn open_all(&self) -> Result<Vec<Arc<Store<M>>>> {
        let mut stores = Vec::new();
        for entry in self.list_ledgers().await? {
            stores.push(self.get_ledger_store(&entry.name, false).await?);
        }
        Ok(stores)
    }

    /// Flush and stop every store, then close the pool
    pub async fn close(&self) {
        let stores: Vec<Arc<Store<M>>> = self.stores.iter().map(|e| e.value().clone()).collect();
        self.stores.clear();
        for store in stores {
            store.close().await;
        }
        self.pool.close().await;
        info!("Driver closed");
    }
}
