//! Schema-scoped SQLite databases.
//!
//! SQLite has no schemas inside one database, so every extension schema gets
//! a database of its own: `<data_dir>/ext_<schema>.db`, or a private
//! in-memory database when no directory is configured. Statements that would
//! reach another database (`ATTACH`, `DETACH`) are rejected.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::OnceCell;

use hearth_core::extension::{
    DatabaseProvider, ExtensionDatabase, Result as ExtResult, Row as JsonRow, Statement,
};

use crate::error::{Error, Result};

/// Default maximum connections per schema pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding one database file per schema. `None` keeps every
    /// schema in memory.
    pub data_dir: Option<PathBuf>,
    /// Maximum number of connections per schema pool.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DatabaseConfig {
    pub fn with_data_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(path.into()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// In-memory databases (useful for testing).
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            // An in-memory database lives as long as its single connection
            max_connections: 1,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    fn database_path(&self, schema: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("ext_{}.db", schema)))
    }
}

/// Open a SQLite pool for `path`, or an in-memory one.
pub(crate) async fn open_pool(path: Option<&PathBuf>, max_connections: u32) -> Result<SqlitePool> {
    let pool = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
                .journal_mode(SqliteJournalMode::Wal)
                .create_if_missing(true)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        }
        None => {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        }
    };
    Ok(pool)
}

struct ProviderInner {
    config: DatabaseConfig,
    pools: DashMap<String, Arc<OnceCell<SqlitePool>>>,
}

/// Hands out one lazily opened pool per schema. Cheap to clone.
#[derive(Clone)]
pub struct SqliteDatabaseProvider {
    inner: Arc<ProviderInner>,
}

impl SqliteDatabaseProvider {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                config,
                pools: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Pool of `schema`, opening it on first use.
    pub async fn pool(&self, schema: &str) -> Result<SqlitePool> {
        let cell = self.cell(schema);
        let config = &self.inner.config;
        let pool = cell
            .get_or_try_init(|| async {
                tracing::debug!(schema = %schema, "Opening schema database");
                open_pool(config.database_path(schema).as_ref(), config.max_connections).await
            })
            .await?;
        Ok(pool.clone())
    }

    /// Close every open pool.
    pub async fn close(&self) {
        let cells: Vec<_> = self.inner.pools.iter().map(|e| e.value().clone()).collect();
        for cell in cells {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
    }

    fn cell(&self, schema: &str) -> Arc<OnceCell<SqlitePool>> {
        self.inner
            .pools
            .entry(schema.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

impl DatabaseProvider for SqliteDatabaseProvider {
    fn for_schema(&self, schema: &str) -> Arc<dyn ExtensionDatabase> {
        Arc::new(SchemaDatabase {
            schema: schema.to_string(),
            provider: self.clone(),
        })
    }
}

/// Database handle of one extension schema.
pub struct SchemaDatabase {
    schema: String,
    provider: SqliteDatabaseProvider,
}

impl SchemaDatabase {
    async fn pool(&self) -> Result<SqlitePool> {
        self.provider.pool(&self.schema).await
    }
}

#[async_trait]
impl ExtensionDatabase for SchemaDatabase {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn query(&self, sql: &str, params: &[Value]) -> ExtResult<Vec<JsonRow>> {
        guard_statement(sql)?;
        let pool = self.pool().await?;
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&pool)
            .await
            .map_err(Error::from)?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> ExtResult<u64> {
        guard_statement(sql)?;
        let pool = self.pool().await?;
        let result = bind_all(sqlx::query(sql), params)
            .execute(&pool)
            .await
            .map_err(Error::from)?;
        Ok(result.rows_affected())
    }

    async fn transaction(&self, statements: Vec<Statement>) -> ExtResult<u64> {
        for statement in &statements {
            guard_statement(&statement.sql)?;
        }
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(Error::from)?;
        let mut affected = 0;
        for statement in &statements {
            let result = bind_all(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *tx)
                .await
                .map_err(Error::from)?;
            affected += result.rows_affected();
        }
        tx.commit().await.map_err(Error::from)?;
        Ok(affected)
    }
}

/// Reject statements that could reach outside the schema database.
pub(crate) fn guard_statement(sql: &str) -> Result<()> {
    let forbidden = sql
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word.eq_ignore_ascii_case("ATTACH") || word.eq_ignore_ascii_case("DETACH"));
    if forbidden {
        return Err(Error::Forbidden("ATTACH and DETACH are not allowed".to_string()));
    }
    Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_all<'q>(mut query: SqliteQuery<'q>, params: &[Value]) -> SqliteQuery<'q> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_json(row: &SqliteRow) -> JsonRow {
    let mut out = JsonRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(index) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let kind = raw.type_info().name().to_string();
                match kind.as_str() {
                    "INTEGER" => row.try_get::<i64, _>(index).map(Value::from).unwrap_or(Value::Null),
                    "REAL" => row.try_get::<f64, _>(index).map(Value::from).unwrap_or(Value::Null),
                    "BLOB" => row
                        .try_get::<Vec<u8>, _>(index)
                        .map(|b| Value::String(hex::encode(b)))
                        .unwrap_or(Value::Null),
                    _ => row.try_get::<String, _>(index).map(Value::String).unwrap_or(Value::Null),
                }
            }
            Err(_) => Value::Null,
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> SqliteDatabaseProvider {
        SqliteDatabaseProvider::new(DatabaseConfig::in_memory())
    }

    #[test]
    fn test_guard_statement() {
        assert!(guard_statement("SELECT * FROM events").is_ok());
        assert!(guard_statement("attach database 'x.db' as other").is_err());
        assert!(guard_statement("SELECT 1; DETACH other").is_err());
        assert!(guard_statement("SELECT attachment FROM files").is_ok());
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let db = provider().for_schema("analytics");
        db.exec("CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, score REAL)", &[])
            .await
            .unwrap();
        let inserted = db
            .exec(
                "INSERT INTO events (name, score) VALUES (?, ?)",
                &[json!("signup"), json!(1.5)],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = db
            .query("SELECT id, name, score FROM events WHERE name = ?", &[json!("signup")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("signup"));
        assert_eq!(rows[0]["score"], json!(1.5));
    }

    #[tokio::test]
    async fn test_schemas_are_isolated() {
        let provider = provider();
        let analytics = provider.for_schema("analytics");
        let products = provider.for_schema("products");

        analytics.exec("CREATE TABLE items (id INTEGER)", &[]).await.unwrap();
        assert!(products.query("SELECT * FROM items", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let db = provider().for_schema("products");
        db.exec("CREATE TABLE items (id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        let result = db
            .transaction(vec![
                Statement::new("INSERT INTO items (id) VALUES (?)", vec![json!(1)]),
                Statement::new("INSERT INTO items (id) VALUES (?)", vec![json!(1)]),
            ])
            .await;
        assert!(result.is_err());

        let rows = db.query("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap();
        assert_eq!(rows[0]["n"], json!(0));
    }
}
