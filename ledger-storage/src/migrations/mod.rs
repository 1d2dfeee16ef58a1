//! Versioned schema migrations
//!
//! A [`MigrationUnit`] has a version, a name and an ordered list of handlers,
//! each targeting every backend ([`Target::Any`]) or one [`Flavor`]. For the
//! active flavor, `Any` handlers run first, then the flavor-specific ones.
//!
//! [`Migrator::migrate`] applies every unit not yet recorded in the
//! namespace's `migrations` table, in ascending version order, inside one
//! database transaction. A failing handler rolls the whole run back.
//!
//! Units come from two sources that can share a version:
//! - templated SQL files (`<version>-<name>/<flavor>.sql`) whose statements are
//!   separated by [`STATEMENT_DELIMITER`] and reference the namespace through
//!   [`NAMESPACE_PLACEHOLDER`]
//! - procedures registered in code for logic SQL cannot express

pub mod bundled;

use crate::schema::{quote_ident, Schema};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::{Executor, PgConnection, Row};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Placeholder replaced by the namespace name in templated statements
pub const NAMESPACE_PLACEHOLDER: &str = "VAR_LEDGER_NAME";

/// Line separating statements inside one template file
pub const STATEMENT_DELIMITER: &str = "--statement";

/// Storage backend dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// PostgreSQL
    Postgres,
    /// SQLite
    Sqlite,
}

impl Flavor {
    /// File stem used by templated units
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Postgres => "postgres",
            Flavor::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which flavors a handler runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every flavor, before flavor-specific handlers
    Any,
    /// One flavor only
    Only(Flavor),
}

impl Target {
    /// Parse a template file stem: `any`, `postgres` or `sqlite`
    pub fn parse(stem: &str) -> Option<Self> {
        match stem {
            "any" => Some(Target::Any),
            "postgres" => Some(Target::Only(Flavor::Postgres)),
            "sqlite" => Some(Target::Only(Flavor::Sqlite)),
            _ => None,
        }
    }
}

/// Code handler run inside the migration transaction
pub type Procedure =
    Arc<dyn for<'c> Fn(&'c mut PgConnection, &'c Schema) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// One step of a migration unit
#[derive(Clone)]
pub enum Handler {
    /// Templated SQL statement
    Statement(String),
    /// Procedural step
    Procedure(Procedure),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Statement(sql) => f.debug_tuple("Statement").field(sql).finish(),
            Handler::Procedure(_) => f.write_str("Procedure(..)"),
        }
    }
}

/// Versioned migration
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    /// Version, unique per namespace kind
    pub version: u64,
    /// Human-readable name
    pub name: String,
    handlers: Vec<(Target, Handler)>,
}

impl MigrationUnit {
    /// Unit without handlers
    pub fn new(version: u64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// Add one SQL statement
    pub fn statement(mut self, target: Target, sql: impl Into<String>) -> Self {
        self.handlers.push((target, Handler::Statement(sql.into())));
        self
    }

    /// Add every statement of a template
    pub fn template(mut self, target: Target, template: &str) -> Self {
        for statement in split_statements(template) {
            self.handlers.push((target, Handler::Statement(statement)));
        }
        self
    }

    /// Add a procedural step
    pub fn procedure<F>(mut self, target: Target, procedure: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection, &'c Schema) -> BoxFuture<'c, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .push((target, Handler::Procedure(Arc::new(procedure))));
        self
    }

    /// Handlers to run on `flavor`: `Any` first, then `Only(flavor)`,
    /// each group in registration order
    pub fn handlers_for(&self, flavor: Flavor) -> Vec<&Handler> {
        let any = self
            .handlers
            .iter()
            .filter(|(target, _)| *target == Target::Any);
        let specific = self
            .handlers
            .iter()
            .filter(move |(target, _)| *target == Target::Only(flavor));
        any.chain(specific).map(|(_, handler)| handler).collect()
    }

    fn absorb(&mut self, other: MigrationUnit) {
        if self.name.is_empty() {
            self.name = other.name;
        }
        self.handlers.extend(other.handlers);
    }
}

/// Applied migration as recorded in the namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Unit version
    pub version: u64,
    /// Unit name
    pub name: String,
    /// When the run that applied it committed
    pub applied_at: DateTime<Utc>,
}

/// Split a template on [`STATEMENT_DELIMITER`], dropping blank statements
pub fn split_statements(template: &str) -> Vec<String> {
    template
        .split(STATEMENT_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Substitute the namespace into a statement
pub fn render(statement: &str, namespace: &str) -> String {
    statement.replace(NAMESPACE_PLACEHOLDER, namespace)
}

/// Parse a unit directory name of the form `<version>-<name>`
pub fn parse_unit_dir_name(dir_name: &str) -> Result<(u64, String)> {
    let (version, name) = dir_name.split_once('-').unwrap_or((dir_name, ""));
    let version = version.parse::<u64>().map_err(|_| {
        Error::Config(format!(
            "migration directory {:?} must be named <version>-<name>",
            dir_name
        ))
    })?;
    Ok((version, name.to_string()))
}

/// Merge units sharing a version and sort by version
pub fn merge_units(units: impl IntoIterator<Item = MigrationUnit>) -> Vec<MigrationUnit> {
    let mut by_version: BTreeMap<u64, MigrationUnit> = BTreeMap::new();
    for unit in units {
        match by_version.get_mut(&unit.version) {
            Some(existing) => existing.absorb(unit),
            None => {
                by_version.insert(unit.version, unit);
            }
        }
    }
    by_version.into_values().collect()
}

/// Load templated units from `<root>/<version>-<name>/<flavor>.sql`
pub fn collect_from_dir(root: impl AsRef<Path>) -> Result<Vec<MigrationUnit>> {
    let mut units = Vec::new();

    for entry in std::fs::read_dir(root.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let (version, name) = parse_unit_dir_name(&dir_name)?;
        let mut unit = MigrationUnit::new(version, name);

        let mut files: Vec<_> = std::fs::read_dir(entry.path())?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|f| f.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
            .collect();
        files.sort();

        for file in files {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let target = Target::parse(&stem).ok_or_else(|| {
                Error::Config(format!("unknown migration flavor file {}", file.display()))
            })?;
            let template = std::fs::read_to_string(&file)?;
            unit = unit.template(target, &template);
        }

        units.push(unit);
    }

    Ok(merge_units(units))
}

/// Units not in `applied`, in ascending version order
pub fn pending<'a>(units: &'a [MigrationUnit], applied: &HashSet<u64>) -> Vec<&'a MigrationUnit> {
    let mut pending: Vec<&MigrationUnit> = units
        .iter()
        .filter(|unit| !applied.contains(&unit.version))
        .collect();
    pending.sort_by_key(|unit| unit.version);
    pending
}

/// Units already recorded in `applied`, in ascending version order
pub fn skipped<'a>(units: &'a [MigrationUnit], applied: &HashSet<u64>) -> Vec<&'a MigrationUnit> {
    let mut skipped: Vec<&MigrationUnit> = units
        .iter()
        .filter(|unit| applied.contains(&unit.version))
        .collect();
    skipped.sort_by_key(|unit| unit.version);
    skipped
}

/// Applies a fixed set of units to namespaces
#[derive(Debug, Clone)]
pub struct Migrator {
    flavor: Flavor,
    units: Arc<Vec<MigrationUnit>>,
}

impl Migrator {
    /// Create a migrator; units sharing a version are merged
    pub fn new(flavor: Flavor, units: Vec<MigrationUnit>) -> Self {
        Self {
            flavor,
            units: Arc::new(merge_units(units)),
        }
    }

    /// Known units in version order
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Highest known version
    pub fn latest_version(&self) -> Option<u64> {
        self.units.last().map(|unit| unit.version)
    }

    fn check_flavor(&self) -> Result<()> {
        match self.flavor {
            Flavor::Postgres => Ok(()),
            other => Err(Error::Config(format!(
                "flavor {} is not supported by this backend",
                other
            ))),
        }
    }

    async fn ensure_records_table(&self, schema: &Schema) -> Result<()> {
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version bigint PRIMARY KEY,
                name varchar NOT NULL,
                applied_at timestamptz NOT NULL DEFAULT now()
            )",
            schema.table("migrations")
        );
        schema.pool().execute(statement.as_str()).await?;
        Ok(())
    }

    /// Apply every pending unit; returns whether anything was applied
    pub async fn migrate(&self, schema: &Schema) -> Result<bool> {
        self.check_flavor()?;
        self.ensure_records_table(schema).await?;

        let records = schema.table("migrations");
        let mut tx = schema.pool().begin().await?;

        // Serialize concurrent migrators of the same namespace
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("migrations:{}", schema.name()))
            .execute(&mut *tx)
            .await?;
        let search_path = format!("SET LOCAL search_path TO {}", quote_ident(schema.name()));
        (&mut *tx).execute(search_path.as_str()).await?;

        let select = format!("SELECT version FROM {}", records);
        let applied: HashSet<u64> = sqlx::query_scalar::<_, i64>(&select)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|v| v as u64)
            .collect();

        for unit in skipped(&self.units, &applied) {
            debug!(
                namespace = schema.name(),
                version = unit.version,
                name = %unit.name,
                "Migration already applied, skipping"
            );
        }

        let pending = pending(&self.units, &applied);
        if pending.is_empty() {
            tx.commit().await?;
            debug!(namespace = schema.name(), "Migrations up to date");
            return Ok(false);
        }

        let insert = format!("INSERT INTO {} (version, name) VALUES ($1, $2)", records);
        for unit in &pending {
            info!(
                namespace = schema.name(),
                version = unit.version,
                name = %unit.name,
                "Applying migration"
            );

            for handler in unit.handlers_for(self.flavor) {
                let result = match handler {
                    Handler::Statement(sql) => {
                        let sql = render(sql, schema.name());
                        (&mut *tx)
                            .execute(sql.as_str())
                            .await
                            .map(|_| ())
                            .map_err(Error::from)
                    }
                    Handler::Procedure(procedure) => (**procedure)(&mut *tx, schema).await,
                };
                result.map_err(|e| Error::Migration {
                    version: unit.version,
                    message: e.to_string(),
                })?;
            }

            sqlx::query(&insert)
                .bind(unit.version as i64)
                .bind(&unit.name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            namespace = schema.name(),
            applied = pending.len(),
            "Migrations applied"
        );
        Ok(true)
    }

    /// Applied migrations in version order
    pub async fn applied(&self, schema: &Schema) -> Result<Vec<MigrationRecord>> {
        let select = format!(
            "SELECT version, name, applied_at FROM {} ORDER BY version",
            schema.table("migrations")
        );
        let rows = sqlx::query(&select).fetch_all(schema.pool()).await?;
        rows.into_iter()
            .map(|row| {
                Ok(MigrationRecord {
                    version: row.try_get::<i64, _>("version")? as u64,
                    name: row.try_get("name")?,
                    applied_at: row.try_get("applied_at")?,
                })
            })
            .collect()
    }

    /// Whether every known unit has been applied
    pub async fn is_up_to_date(&self, schema: &Schema) -> Result<bool> {
        let applied: HashSet<u64> = match self.applied(schema).await {
            Ok(records) => records.into_iter().map(|r| r.version).collect(),
            Err(Error::StoreNotInitialized(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(pending(&self.units, &applied).is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn statements(handlers: Vec<&Handler>) -> Vec<String> {
        handlers
            .into_iter()
            .map(|h| match h {
                Handler::Statement(sql) => sql.clone(),
                Handler::Procedure(_) => "<procedure>".to_string(),
            })
            .collect()
    }

    fn noop<'c>(_: &'c mut PgConnection, _: &'c Schema) -> BoxFuture<'c, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_split_statements() {
        let template = "CREATE TABLE a ();\n--statement\n\n--statement\nCREATE TABLE b ();\n";
        assert_eq!(
            split_statements(template),
            vec!["CREATE TABLE a ();", "CREATE TABLE b ();"]
        );
    }

    #[test]
    fn test_render_substitutes_namespace() {
        let sql = r#"CREATE TABLE "VAR_LEDGER_NAME".logs (id bigint); -- VAR_LEDGER_NAME"#;
        assert_eq!(
            render(sql, "books"),
            r#"CREATE TABLE "books".logs (id bigint); -- books"#
        );
    }

    #[test]
    fn test_any_handlers_run_before_flavor_specific() {
        let unit = MigrationUnit::new(1, "mixed")
            .statement(Target::Only(Flavor::Postgres), "pg-1")
            .statement(Target::Any, "any-1")
            .procedure(Target::Only(Flavor::Postgres), noop)
            .statement(Target::Only(Flavor::Sqlite), "lite-1")
            .statement(Target::Any, "any-2");

        assert_eq!(
            statements(unit.handlers_for(Flavor::Postgres)),
            vec!["any-1", "any-2", "pg-1", "<procedure>"]
        );
        assert_eq!(
            statements(unit.handlers_for(Flavor::Sqlite)),
            vec!["any-1", "any-2", "lite-1"]
        );
    }

    #[test]
    fn test_pending_is_ordered_and_skips_applied() {
        let units = merge_units(vec![
            MigrationUnit::new(2, "c"),
            MigrationUnit::new(0, "a"),
            MigrationUnit::new(1, "b"),
        ]);
        let applied: HashSet<u64> = [1].into_iter().collect();

        let versions: Vec<u64> = pending(&units, &applied).iter().map(|u| u.version).collect();
        assert_eq!(versions, vec![0, 2]);

        let skipped_versions: Vec<u64> =
            skipped(&units, &applied).iter().map(|u| u.version).collect();
        assert_eq!(skipped_versions, vec![1]);

        let all: HashSet<u64> = [0, 1, 2].into_iter().collect();
        assert!(pending(&units, &all).is_empty());
        assert_eq!(skipped(&units, &all).len(), 3);
    }

    #[test]
    fn test_templated_and_procedural_units_merge_by_version() {
        let templated = MigrationUnit::new(3, "segments").statement(Target::Any, "ALTER ...");
        let procedural = MigrationUnit::new(3, "").procedure(Target::Only(Flavor::Postgres), noop);

        let merged = merge_units(vec![templated, procedural]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "segments");
        assert_eq!(
            statements(merged[0].handlers_for(Flavor::Postgres)),
            vec!["ALTER ...", "<procedure>"]
        );
    }

    #[test]
    fn test_parse_unit_dir_name() {
        assert_eq!(parse_unit_dir_name("0-init-schema").unwrap(), (0, "init-schema".to_string()));
        assert_eq!(parse_unit_dir_name("12").unwrap(), (12, String::new()));
        assert!(parse_unit_dir_name("init").is_err());
    }

    #[test]
    fn test_collect_from_dir() {
        let root = tempfile::tempdir().unwrap();

        let first = root.path().join("0-init");
        fs::create_dir(&first).unwrap();
        fs::write(
            first.join("postgres.sql"),
            "CREATE TABLE \"VAR_LEDGER_NAME\".a ();\n--statement\nCREATE TABLE \"VAR_LEDGER_NAME\".b ();",
        )
        .unwrap();
        fs::write(first.join("any.sql"), "SELECT 1;").unwrap();
        fs::write(first.join("README.md"), "ignored").unwrap();

        let second = root.path().join("1-more");
        fs::create_dir(&second).unwrap();
        fs::write(second.join("sqlite.sql"), "SELECT 2;").unwrap();

        let units = collect_from_dir(root.path()).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].version, 0);
        assert_eq!(units[0].name, "init");
        assert_eq!(
            statements(units[0].handlers_for(Flavor::Postgres)),
            vec![
                "SELECT 1;",
                "CREATE TABLE \"VAR_LEDGER_NAME\".a ();",
                "CREATE TABLE \"VAR_LEDGER_NAME\".b ();"
            ]
        );
        assert!(units[1].handlers_for(Flavor::Postgres).is_empty());
        assert_eq!(statements(units[1].handlers_for(Flavor::Sqlite)), vec!["SELECT 2;"]);
    }

    #[test]
    fn test_collect_rejects_unknown_flavor() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("0-init");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("mysql.sql"), "SELECT 1;").unwrap();

        assert!(matches!(collect_from_dir(root.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_latest_version() {
        let migrator = Migrator::new(
            Flavor::Postgres,
            vec![MigrationUnit::new(4, "d"), MigrationUnit::new(1, "a")],
        );
        assert_eq!(migrator.latest_version(), Some(4));
        assert_eq!(migrator.units()[0].version, 1);
    }
}
