//! Migration units shipped with the binary
//!
//! Templates are embedded at compile time from `ledger-storage/migrations/`.

use super::{Flavor, MigrationUnit, Migrator, Target};
use crate::schema::Schema;
use crate::Result;
use futures::future::BoxFuture;
use ledger_core::Address;
use sqlx::{Executor, PgConnection};

/// (version, name, file stem, template)
type Template = (u64, &'static str, &'static str, &'static str);

const SYSTEM_TEMPLATES: &[Template] = &[(
    0,
    "init-catalog",
    "any",
    include_str!("../../migrations/system/0-init-catalog/any.sql"),
)];

const LEDGER_TEMPLATES: &[Template] = &[
    (
        0,
        "init-schema",
        "postgres",
        include_str!("../../migrations/ledger/0-init-schema/postgres.sql"),
    ),
    (
        1,
        "add-indexes",
        "any",
        include_str!("../../migrations/ledger/1-add-indexes/any.sql"),
    ),
    (
        1,
        "add-indexes",
        "postgres",
        include_str!("../../migrations/ledger/1-add-indexes/postgres.sql"),
    ),
    (
        2,
        "add-account-segments",
        "any",
        include_str!("../../migrations/ledger/2-add-account-segments/any.sql"),
    ),
];

fn from_templates(templates: &[Template]) -> Vec<MigrationUnit> {
    templates
        .iter()
        .filter_map(|(version, name, stem, template)| {
            Target::parse(stem).map(|target| MigrationUnit::new(*version, *name).template(target, template))
        })
        .collect()
}

/// Units for the system catalog namespace
pub fn system_units() -> Vec<MigrationUnit> {
    from_templates(SYSTEM_TEMPLATES)
}

/// Units for ledger namespaces
pub fn ledger_units() -> Vec<MigrationUnit> {
    let mut units = from_templates(LEDGER_TEMPLATES);
    units.push(
        MigrationUnit::new(2, "add-account-segments")
            .procedure(Target::Only(Flavor::Postgres), backfill_account_segments),
    );
    units
}

/// Migrator for the system catalog
pub fn system_migrator() -> Migrator {
    Migrator::new(Flavor::Postgres, system_units())
}

/// Migrator for ledger namespaces
pub fn ledger_migrator() -> Migrator {
    Migrator::new(Flavor::Postgres, ledger_units())
}

/// Fill `accounts.address_array` for rows created before the column existed
fn backfill_account_segments<'c>(
    conn: &'c mut PgConnection,
    schema: &'c Schema,
) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        let accounts = schema.table("accounts");

        let select = format!("SELECT address FROM {} WHERE address_array IS NULL", accounts);
        let addresses: Vec<String> = sqlx::query_scalar(&select).fetch_all(&mut *conn).await?;

        let update = format!("UPDATE {} SET address_array = $1 WHERE address = $2", accounts);
        for address in addresses {
            let segments = serde_json::to_value(Address::new(address.as_str())?.segments())?;
            sqlx::query(&update)
                .bind(segments)
                .bind(&address)
                .execute(&mut *conn)
                .await?;
        }

        let index = format!(
            "CREATE INDEX IF NOT EXISTS accounts_address_array ON {} USING gin (address_array jsonb_path_ops)",
            accounts
        );
        (&mut *conn).execute(index.as_str()).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::Handler;

    #[test]
    fn test_ledger_units_are_merged_in_order() {
        let migrator = ledger_migrator();
        let versions: Vec<u64> = migrator.units().iter().map(|u| u.version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
        assert_eq!(migrator.latest_version(), Some(2));

        // Column is added by the portable statement before the backfill runs
        let handlers = migrator.units()[2].handlers_for(Flavor::Postgres);
        assert_eq!(handlers.len(), 2);
        assert!(matches!(handlers[0], Handler::Statement(sql) if sql.contains("ADD COLUMN")));
        assert!(matches!(handlers[1], Handler::Procedure(_)));
    }

    #[test]
    fn test_templates_reference_the_placeholder() {
        for unit in ledger_units().iter().chain(system_units().iter()) {
            for handler in unit.handlers_for(Flavor::Postgres) {
                if let Handler::Statement(sql) = handler {
                    assert!(sql.contains("\"VAR_LEDGER_NAME\"."), "unqualified statement: {}", sql);
                }
            }
        }
    }

    #[test]
    fn test_init_schema_has_one_statement_per_table() {
        let units = ledger_migrator();
        let init = &units.units()[0];
        assert_eq!(init.name, "init-schema");
        assert_eq!(init.handlers_for(Flavor::Postgres).len(), 6);
        assert!(init.handlers_for(Flavor::Sqlite).is_empty());
    }
}
