//! Per-extension schema migrations.
//!
//! Each extension declares an ordered migration set for its own schema. A
//! migration is applied at most once per (extension, version). All versions
//! of one extension are ordered under a single [`VersionScheme`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{ExtensionError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub version: String,
    pub description: String,
    /// Owning extension. Filled in by the registry.
    #[serde(default)]
    pub extension: String,
    pub up: String,
    #[serde(default)]
    pub down: String,
}

impl Migration {
    pub fn new(version: impl Into<String>, description: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            extension: String::new(),
            up: up.into(),
            down: String::new(),
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = down.into();
        self
    }
}

/// How the versions of one extension's migration set are ordered.
///
/// Every version in a set must classify the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScheme {
    Semver,
    Integer,
    Lexical,
}

impl VersionScheme {
    pub fn of(version: &str) -> Self {
        if semver::Version::parse(version).is_ok() {
            Self::Semver
        } else if version.parse::<u64>().is_ok() {
            Self::Integer
        } else {
            Self::Lexical
        }
    }

    /// Order two versions of this scheme.
    ///
    /// Falls back to lexical order for a version that does not parse.
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Semver => match (semver::Version::parse(a), semver::Version::parse(b)) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            },
            Self::Integer => match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            },
            Self::Lexical => a.cmp(b),
        }
    }
}

/// Sort migrations ascending.
///
/// Rejects duplicate versions and sets that mix version schemes.
pub fn sort_migrations(extension: &str, mut migrations: Vec<Migration>) -> Result<Vec<Migration>> {
    let mut seen = HashSet::new();
    let mut scheme: Option<(VersionScheme, String)> = None;
    for m in &mut migrations {
        if !seen.insert(m.version.clone()) {
            return Err(ExtensionError::Registration {
                extension: extension.to_string(),
                message: format!("migration version {} declared twice", m.version),
            });
        }
        let this = VersionScheme::of(&m.version);
        match &scheme {
            None => scheme = Some((this, m.version.clone())),
            Some((first, first_version)) if *first != this => {
                return Err(ExtensionError::Registration {
                    extension: extension.to_string(),
                    message: format!(
                        "migration versions {} ({:?}) and {} ({:?}) use different schemes",
                        first_version, first, m.version, this
                    ),
                });
            }
            Some(_) => {}
        }
        m.extension = extension.to_string();
    }
    if let Some((scheme, _)) = scheme {
        migrations.sort_by(|a, b| scheme.compare(&a.version, &b.version));
    }
    Ok(migrations)
}

/// Migrations not yet recorded as applied, in application order.
pub fn pending_migrations(sorted: &[Migration], applied: &[String]) -> Vec<Migration> {
    let applied: HashSet<&str> = applied.iter().map(String::as_str).collect();
    sorted
        .iter()
        .filter(|m| !applied.contains(m.version.as_str()))
        .cloned()
        .collect()
}

/// Executes migrations and records which were applied.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn applied_versions(&self, extension: &str) -> Result<Vec<String>>;

    /// Run `up` inside `schema` and record the version.
    async fn apply(&self, schema: &str, migration: &Migration) -> Result<()>;

    /// Run `down` inside `schema` and forget the version.
    async fn revert(&self, schema: &str, migration: &Migration) -> Result<()>;
}

/// Ledger-only store for hosts without a database.
///
/// Records versions without executing any SQL.
#[derive(Default)]
pub struct MemoryMigrationStore {
    applied: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationStore for MemoryMigrationStore {
    async fn applied_versions(&self, extension: &str) -> Result<Vec<String>> {
        Ok(self.applied.lock().get(extension).cloned().unwrap_or_default())
    }

    async fn apply(&self, _schema: &str, migration: &Migration) -> Result<()> {
        self.applied
            .lock()
            .entry(migration.extension.clone())
            .or_default()
            .push(migration.version.clone());
        Ok(())
    }

    async fn revert(&self, _schema: &str, migration: &Migration) -> Result<()> {
        if let Some(versions) = self.applied.lock().get_mut(&migration.extension) {
            versions.retain(|v| v != &migration.version);
        }
        Ok(())
    }
}

/// Apply every pending migration in order, stopping at the first failure.
///
/// Returns the versions applied by this call.
pub async fn run_pending(
    store: &dyn MigrationStore,
    extension: &str,
    schema: &str,
    migrations: Vec<Migration>,
) -> Result<Vec<String>> {
    let sorted = sort_migrations(extension, migrations)?;
    if sorted.is_empty() {
        return Ok(Vec::new());
    }

    let applied = store
        .applied_versions(extension)
        .await
        .map_err(|e| ExtensionError::Migration {
            extension: extension.to_string(),
            version: String::new(),
            source: Box::new(e),
        })?;

    let mut newly_applied = Vec::new();
    for migration in pending_migrations(&sorted, &applied) {
        tracing::info!(
            extension = %extension,
            version = %migration.version,
            "Applying migration: {}",
            migration.description
        );
        store
            .apply(schema, &migration)
            .await
            .map_err(|e| ExtensionError::Migration {
                extension: extension.to_string(),
                version: migration.version.clone(),
                source: Box::new(e),
            })?;
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

/// Revert applied migrations newer than `target`, newest first.
///
/// `None` reverts everything.
pub async fn revert_to(
    store: &dyn MigrationStore,
    extension: &str,
    schema: &str,
    migrations: Vec<Migration>,
    target: Option<&str>,
) -> Result<Vec<String>> {
    let sorted = sort_migrations(extension, migrations)?;
    let keep = match target {
        Some(target) => {
            sorted
                .iter()
                .position(|m| m.version == target)
                .ok_or_else(|| {
                    ExtensionError::InvalidInput(format!(
                        "{} declares no migration {}",
                        extension, target
                    ))
                })?
                + 1
        }
        None => 0,
    };
    let applied: HashSet<String> = store.applied_versions(extension).await?.into_iter().collect();

    let mut reverted = Vec::new();
    for migration in sorted.into_iter().skip(keep).rev() {
        if !applied.contains(&migration.version) {
            continue;
        }
        tracing::info!(extension = %extension, version = %migration.version, "Reverting migration");
        store
            .revert(schema, &migration)
            .await
            .map_err(|e| ExtensionError::Migration {
                extension: extension.to_string(),
                version: migration.version.clone(),
                source: Box::new(e),
            })?;
        reverted.push(migration.version);
    }
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert_eq!(VersionScheme::of("1.2.0"), VersionScheme::Semver);
        assert_eq!(VersionScheme::of("10"), VersionScheme::Integer);
        assert_eq!(VersionScheme::of("001_init"), VersionScheme::Lexical);
        assert_eq!(VersionScheme::Semver.compare("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(VersionScheme::Integer.compare("2", "10"), Ordering::Less);
        assert_eq!(VersionScheme::Lexical.compare("001_init", "002_add"), Ordering::Less);
        assert_eq!(VersionScheme::Integer.compare("3", "3"), Ordering::Equal);
    }

    #[test]
    fn test_sort_rejects_mixed_schemes() {
        let migrations = vec![
            Migration::new("1.9.0", "a", "--"),
            Migration::new("1.10.0", "b", "--"),
            Migration::new("1.9", "c", "--"),
        ];
        let err = sort_migrations("x", migrations).unwrap_err();
        assert!(matches!(err, ExtensionError::Registration { .. }));
    }

    #[test]
    fn test_sort_semver_set() {
        let migrations = vec![
            Migration::new("1.10.0", "b", "--"),
            Migration::new("1.9.0", "a", "--"),
            Migration::new("2.0.0", "c", "--"),
        ];
        let sorted = sort_migrations("x", migrations).unwrap();
        let versions: Vec<&str> = sorted.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["1.9.0", "1.10.0", "2.0.0"]);
    }

    #[test]
    fn test_sort_rejects_duplicates() {
        let migrations = vec![
            Migration::new("1", "a", "CREATE TABLE a (id INTEGER)"),
            Migration::new("1", "b", "CREATE TABLE b (id INTEGER)"),
        ];
        assert!(sort_migrations("x", migrations).is_err());
    }

    #[tokio::test]
    async fn test_run_pending_is_idempotent() {
        let store = MemoryMigrationStore::new();
        let migrations = vec![
            Migration::new("10", "third", "--"),
            Migration::new("2", "second", "--"),
            Migration::new("1", "first", "--"),
        ];

        let applied = run_pending(&store, "x", "x", migrations.clone()).await.unwrap();
        assert_eq!(applied, vec!["1", "2", "10"]);

        let applied = run_pending(&store, "x", "x", migrations).await.unwrap();
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn test_revert_to_target() {
        let store = MemoryMigrationStore::new();
        let migrations = vec![
            Migration::new("1", "first", "--"),
            Migration::new("2", "second", "--"),
            Migration::new("3", "third", "--"),
        ];
        run_pending(&store, "x", "x", migrations.clone()).await.unwrap();

        let reverted = revert_to(&store, "x", "x", migrations, Some("1")).await.unwrap();
        assert_eq!(reverted, vec!["3", "2"]);
        assert_eq!(store.applied_versions("x").await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_revert_to_unknown_target() {
        let store = MemoryMigrationStore::new();
        let migrations = vec![Migration::new("1", "first", "--")];
        run_pending(&store, "x", "x", migrations.clone()).await.unwrap();

        let err = revert_to(&store, "x", "x", migrations, Some("7")).await.unwrap_err();
        assert!(matches!(err, ExtensionError::InvalidInput(_)));
        assert_eq!(store.applied_versions("x").await.unwrap(), vec!["1"]);
    }
}
