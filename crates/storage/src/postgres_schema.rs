use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::schema::{MigrationState, SchemaDriver, SchemaSession};

pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Schema driver talking to the supervised PostgreSQL instance through sqlx.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresSchemaDriver;

#[async_trait::async_trait]
impl SchemaDriver for PostgresSchemaDriver {
    async fn connect(&self, url: &str) -> Result<Box<dyn SchemaSession>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .context("connect to postgres")?;
        Ok(Box::new(PostgresSchemaSession { pool }))
    }
}

struct PostgresSchemaSession {
    pool: PgPool,
}

impl PostgresSchemaSession {
    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT NOT NULL PRIMARY KEY,
                dirty BOOLEAN NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create schema_migrations table")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchemaSession for PostgresSchemaSession {
    async fn version(&mut self) -> Result<Option<MigrationState>> {
        let table: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(MIGRATIONS_TABLE)
            .fetch_one(&self.pool)
            .await
            .context("look up schema_migrations")?;
        if table.is_none() {
            return Ok(None);
        }

        let row = sqlx::query("SELECT version, dirty FROM schema_migrations LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("read schema_migrations")?;
        row.map(|r| {
            let version: i64 = r.get("version");
            Ok(MigrationState {
                version: u64::try_from(version).context("negative migration version")?,
                dirty: r.get("dirty"),
            })
        })
        .transpose()
    }

    async fn set_version(&mut self, state: Option<MigrationState>) -> Result<()> {
        self.ensure_table().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE schema_migrations")
            .execute(&mut *tx)
            .await
            .context("truncate schema_migrations")?;
        if let Some(state) = state {
            let version = i64::try_from(state.version).context("migration version out of range")?;
            sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)")
                .bind(version)
                .bind(state.dirty)
                .execute(&mut *tx)
                .await
                .context("record migration version")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply(&mut self, script: &str) -> Result<()> {
        sqlx::raw_sql(script).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
