//! Versioned schema migrations

use crate::error::StoreResult;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error, info};

/// Applies numbered migration scripts, recording each in `schema_version`.
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
    store: &'a str,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection, store: &'a str) -> Self {
        Self { conn, store }
    }

    /// Brings the schema up to the newest version in `migrations`. Returns the resulting version.
    pub fn migrate(&mut self, migrations: &[(i32, &str)]) -> StoreResult<i32> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        let mut current = self.current_version()?;
        debug!("{} schema at version {}", self.store, current);

        for (version, sql) in migrations {
            if *version <= current {
                continue;
            }
            info!("Applying {} migration {}", self.store, version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(sql) {
                error!("Failed to apply {} migration {}: {}", self.store, version, e);
                return Err(e.into());
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;
            current = *version;
        }

        Ok(current)
    }

    pub fn current_version(&self) -> StoreResult<i32> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))?)
    }

    pub fn has_migration_applied(&self, version: i32) -> StoreResult<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM schema_version WHERE version = ?1", [version], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{register_spatial_functions, PRIMARY_MIGRATIONS, SECONDARY_MIGRATIONS};

    #[test]
    fn test_primary_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        register_spatial_functions(&conn).unwrap();

        let mut manager = MigrationManager::new(&mut conn, "primary");
        assert_eq!(manager.migrate(PRIMARY_MIGRATIONS).unwrap(), 2);
        // re-running must not re-issue the ALTER TABLE statements
        assert_eq!(manager.migrate(PRIMARY_MIGRATIONS).unwrap(), 2);
        assert!(manager.has_migration_applied(2).unwrap());
    }

    #[test]
    fn test_secondary_stops_at_base_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut manager = MigrationManager::new(&mut conn, "secondary");
        assert_eq!(manager.migrate(SECONDARY_MIGRATIONS).unwrap(), 1);
        assert!(!manager.has_migration_applied(2).unwrap());
    }
}
