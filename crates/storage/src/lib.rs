//! Schema migrations, backups and backup archives for the supervised engine.

pub mod archive;
mod backup;
pub mod migrations;
mod migrator;
pub mod postgres_schema;
pub mod schema;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use archive::{Archiver, ARCHIVE_EXTENSION};
pub use backup::BackupManager;
pub use migrations::{Migration, MigrationSet};
pub use migrator::{Migrator, MigratorOptions, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY};
pub use postgres_schema::PostgresSchemaDriver;
pub use schema::{MigrationState, SchemaDriver, SchemaSession};
