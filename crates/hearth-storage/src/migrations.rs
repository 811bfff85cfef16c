//! SQL-backed migration store.
//!
//! Migration scripts run inside the owning schema's database; which versions
//! were applied is recorded in a ledger table of the host database.
//!
//! The ledger change is written first and held uncommitted while the script
//! runs, so a ledger failure rolls the script back. The script commits before
//! the ledger; a failure between the two commits is logged as an error.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};

use hearth_core::extension::{Migration, MigrationStore, Result as ExtResult};

use crate::database::{guard_statement, open_pool, SqliteDatabaseProvider};
use crate::error::{Error, Result};

/// SQL for creating the ledger table
const CREATE_LEDGER_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _extension_migrations (
        extension TEXT NOT NULL,
        version TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (extension, version)
    );
"#;

pub struct SqliteMigrationStore {
    host: SqlitePool,
    databases: SqliteDatabaseProvider,
}

impl SqliteMigrationStore {
    /// Open the ledger at `path` (in memory when `None`).
    pub async fn open(path: Option<PathBuf>, databases: SqliteDatabaseProvider) -> Result<Self> {
        let host = open_pool(path.as_ref(), 1).await?;
        Self::with_pool(host, databases).await
    }

    pub async fn with_pool(host: SqlitePool, databases: SqliteDatabaseProvider) -> Result<Self> {
        sqlx::raw_sql(CREATE_LEDGER_TABLE).execute(&host).await?;
        Ok(Self { host, databases })
    }

    /// Every ledger entry as `(extension, version)`, oldest first.
    pub async fn ledger(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT extension, version FROM _extension_migrations ORDER BY applied_at, rowid",
        )
        .fetch_all(&self.host)
        .await?;
        Ok(rows)
    }

    /// Run `script` in `schema` while `ledger` holds the matching ledger change.
    async fn run_script(
        &self,
        schema: &str,
        script: &str,
        ledger: Transaction<'static, Sqlite>,
        migration: &Migration,
    ) -> Result<()> {
        guard_statement(script)?;
        let pool = self.databases.pool(schema).await?;
        let mut tx = pool.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(script)).await?;
        tx.commit().await?;

        ledger.commit().await.map_err(|e| {
            tracing::error!(
                extension = %migration.extension,
                version = %migration.version,
                schema = %schema,
                error = %e,
                "Migration script committed but the ledger was not updated"
            );
            Error::from(e)
        })
    }

    async fn apply_migration(&self, schema: &str, migration: &Migration) -> Result<()> {
        let mut ledger = self.host.begin().await?;
        sqlx::query(
            "INSERT INTO _extension_migrations (extension, version, description) VALUES (?, ?, ?)",
        )
        .bind(&migration.extension)
        .bind(&migration.version)
        .bind(&migration.description)
        .execute(&mut *ledger)
        .await?;
        self.run_script(schema, &migration.up, ledger, migration).await
    }

    async fn revert_migration(&self, schema: &str, migration: &Migration) -> Result<()> {
        if migration.down.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "migration {} has no down script",
                migration.version
            )));
        }
        let mut ledger = self.host.begin().await?;
        sqlx::query("DELETE FROM _extension_migrations WHERE extension = ? AND version = ?")
            .bind(&migration.extension)
            .bind(&migration.version)
            .execute(&mut *ledger)
            .await?;
        self.run_script(schema, &migration.down, ledger, migration).await
    }
}

#[async_trait]
impl MigrationStore for SqliteMigrationStore {
    async fn applied_versions(&self, extension: &str) -> ExtResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT version FROM _extension_migrations WHERE extension = ?")
                .bind(extension)
                .fetch_all(&self.host)
                .await
                .map_err(Error::from)?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    async fn apply(&self, schema: &str, migration: &Migration) -> ExtResult<()> {
        Ok(self.apply_migration(schema, migration).await?)
    }

    async fn revert(&self, schema: &str, migration: &Migration) -> ExtResult<()> {
        Ok(self.revert_migration(schema, migration).await?)
    }
}
