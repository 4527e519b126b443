//! Database connection pool, migrations, health check and schema probe.

pub mod index;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::model::SchemaVersion;
use crate::store::SchemaVersionProbe;
use crate::versioning::VersionedIndexStore;

/// Database handle. Owns the connection pool shared by every index
/// operation.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// An index store bound to the operations of the deployed schema.
    pub async fn index_store(&self) -> Result<VersionedIndexStore<PgPool>> {
        VersionedIndexStore::connect(self.pool.clone(), index::sql_operation_table(), self).await
    }
}

#[async_trait]
impl SchemaVersionProbe for Db {
    /// The newest schema version whose upgrade has completed.
    async fn current_version(&self) -> Result<SchemaVersion> {
        let (version,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_version WHERE status = 'completed'")
                .fetch_one(&self.pool)
                .await?;
        let version = version.ok_or_else(|| {
            Error::UnsupportedSchemaVersion("no completed schema version recorded".to_string())
        })?;
        u32::try_from(version)
            .map(SchemaVersion)
            .map_err(|_| Error::UnsupportedSchemaVersion(format!("invalid schema version {version}")))
    }
}
