//! Tables of an extension schema.

use std::sync::Arc;

use async_trait::async_trait;

use hearth_core::extension::{
    CollectionInfo, CollectionsProvider, CollectionsService, Result as ExtResult,
};

use crate::database::SqliteDatabaseProvider;
use crate::error::Error;

const LIST_TABLES: &str = r#"
    SELECT name FROM sqlite_master
    WHERE type = 'table'
      AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
      AND name NOT LIKE '\_%' ESCAPE '\'
    ORDER BY name
"#;

#[derive(Clone)]
pub struct SqliteCollections {
    databases: SqliteDatabaseProvider,
}

impl SqliteCollections {
    pub fn new(databases: SqliteDatabaseProvider) -> Self {
        Self { databases }
    }
}

impl CollectionsProvider for SqliteCollections {
    fn for_schema(&self, schema: &str) -> Arc<dyn CollectionsService> {
        Arc::new(SchemaCollections {
            schema: schema.to_string(),
            databases: self.databases.clone(),
        })
    }
}

struct SchemaCollections {
    schema: String,
    databases: SqliteDatabaseProvider,
}

#[async_trait]
impl CollectionsService for SchemaCollections {
    async fn list(&self) -> ExtResult<Vec<CollectionInfo>> {
        let pool = self.databases.pool(&self.schema).await?;
        let rows: Vec<(String,)> = sqlx::query_as(LIST_TABLES)
            .fetch_all(&pool)
            .await
            .map_err(Error::from)?;
        Ok(rows
            .into_iter()
            .map(|(name,)| CollectionInfo {
                name,
                schema: self.schema.clone(),
            })
            .collect())
    }
}
