use anyhow::Result;

/// One row of the `schema_migrations` tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationState {
    pub version: u64,
    /// A step started but never completed.
    pub dirty: bool,
}

impl MigrationState {
    pub fn clean(version: u64) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    pub fn dirty(version: u64) -> Self {
        Self {
            version,
            dirty: true,
        }
    }
}

/// Opens sessions against the database the migrations target.
#[async_trait::async_trait]
pub trait SchemaDriver: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SchemaSession>>;
}

/// Schema operations over one short-lived connection.
#[async_trait::async_trait]
pub trait SchemaSession: Send {
    /// Tracked state; `None` when the table is missing or empty.
    async fn version(&mut self) -> Result<Option<MigrationState>>;

    /// Replace the tracked state; `None` empties the table.
    async fn set_version(&mut self, state: Option<MigrationState>) -> Result<()>;

    /// Run one migration script, which may hold several statements.
    async fn apply(&mut self, script: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
