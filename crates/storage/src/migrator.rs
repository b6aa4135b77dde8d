use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pg_launcher_core::{Cause, LauncherError};
use pg_launcher_process::ProcessManager;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::migrations::{MigrationSet, Step};
use crate::schema::{MigrationState, SchemaDriver, SchemaSession};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MigratorOptions {
    /// Directory holding this database's migration files.
    pub migrations_dir: PathBuf,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl MigratorOptions {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: DEFAULT_CONNECT_DELAY,
        }
    }
}

/// Applies versioned schema changes to the supervised instance.
///
/// The public API is blocking; schema drivers are async and run on a private
/// single-threaded runtime. Do not call from inside another Tokio runtime.
pub struct Migrator {
    process: Arc<ProcessManager>,
    driver: Arc<dyn SchemaDriver>,
    options: MigratorOptions,
    runtime: Runtime,
}

impl Migrator {
    pub fn new(
        process: Arc<ProcessManager>,
        driver: Arc<dyn SchemaDriver>,
        options: MigratorOptions,
    ) -> Result<Self, LauncherError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| LauncherError::Migration {
                operation: "start runtime",
                source: Cause::Driver(err.into()),
            })?;
        Ok(Self {
            process,
            driver,
            options,
            runtime,
        })
    }

    /// Apply every pending migration (`None`) or exactly `step` steps up or down.
    pub fn migrate_scheme(&self, step: Option<i32>) -> Result<(), LauncherError> {
        let _entered = self.process.span().enter();
        let set = self.load()?;
        self.process
            .with_running(|| self.runtime.block_on(self.migrate(&set, step)))
    }

    /// Version recorded in the tracking table; 0 when nothing was applied.
    pub fn current_migration_version(&self) -> Result<u64, LauncherError> {
        let _entered = self.process.span().enter();
        self.process.with_running(|| {
            self.runtime.block_on(async {
                let mut session = self.connect().await?;
                let state = session.version().await;
                self.close(session.as_mut()).await;
                match state.map_err(driver_error("read version"))? {
                    Some(MigrationState {
                        version,
                        dirty: true,
                    }) => Err(LauncherError::DirtyMigration { version }),
                    Some(state) => Ok(state.version),
                    None => Ok(0),
                }
            })
        })
    }

    /// Highest migration version this build ships; 0 without migrations.
    pub fn latest_available_version(&self) -> Result<u64, LauncherError> {
        Ok(self.load()?.latest_version())
    }

    fn load(&self) -> Result<MigrationSet, LauncherError> {
        MigrationSet::load(&self.options.migrations_dir).map_err(driver_error("read migrations"))
    }

    async fn migrate(&self, set: &MigrationSet, step: Option<i32>) -> Result<(), LauncherError> {
        let mut session = self.connect().await?;
        let outcome = self.run_steps(session.as_mut(), set, step).await;
        self.close(session.as_mut()).await;
        outcome
    }

    async fn run_steps(
        &self,
        session: &mut dyn SchemaSession,
        set: &MigrationSet,
        step: Option<i32>,
    ) -> Result<(), LauncherError> {
        let state = session.version().await.map_err(driver_error("read version"))?;
        let current = match state {
            Some(MigrationState {
                version,
                dirty: true,
            }) => return Err(LauncherError::DirtyMigration { version }),
            Some(state) => state.version,
            None => 0,
        };

        let plan = set.plan(current, step)?;
        if plan.is_empty() {
            info!(version = current, "migrate no change");
            return Ok(());
        }

        for step in &plan {
            let version = step.version();
            session
                .set_version(Some(MigrationState::dirty(version)))
                .await
                .map_err(driver_error("mark dirty"))?;
            match step {
                Step::Up(migration) => {
                    session
                        .apply(&migration.up)
                        .await
                        .map_err(driver_error("apply up migration"))?;
                    session
                        .set_version(Some(MigrationState::clean(version)))
                        .await
                        .map_err(driver_error("record version"))?;
                    info!(version, title = %migration.title, "migration applied");
                }
                Step::Down {
                    migration,
                    previous,
                } => {
                    let script = migration.down.as_deref().unwrap_or_default();
                    session
                        .apply(script)
                        .await
                        .map_err(driver_error("apply down migration"))?;
                    session
                        .set_version(previous.map(MigrationState::clean))
                        .await
                        .map_err(driver_error("record version"))?;
                    info!(version, title = %migration.title, "migration reverted");
                }
            }
        }
        info!("migrate success");
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn SchemaSession>, LauncherError> {
        let url = self
            .process
            .settings()
            .database_url(self.process.db().as_str());
        let mut attempts = self.options.connect_attempts.max(1);
        loop {
            match self.driver.connect(&url).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(LauncherError::Migration {
                            operation: "connect",
                            source: Cause::Driver(err),
                        });
                    }
                    info!(attempts_left = attempts, error = %err, "migrate trying to connect postgres");
                    tokio::time::sleep(self.options.connect_delay).await;
                }
            }
        }
    }

    async fn close(&self, session: &mut dyn SchemaSession) {
        if let Err(err) = session.close().await {
            warn!(error = %err, "failed to close migration session");
        }
    }
}

fn driver_error(operation: &'static str) -> impl Fn(anyhow::Error) -> LauncherError {
    move |err| LauncherError::Migration {
        operation,
        source: Cause::Driver(err),
    }
}

#[cfg(test)]
mod tests {
    use pg_launcher_core::DbName;

    use super::*;
    use crate::testing::{Workbench, FAILING_STATEMENT};

    fn bench(dir: &tempfile::TempDir) -> Workbench {
        let wb = Workbench::new(dir.path(), DbName::Phoenix).unwrap();
        wb.process.init_db(false).unwrap();
        wb.add_migration(1, "users", "CREATE TABLE users ();", Some("DROP TABLE users;"))
            .unwrap();
        wb.add_migration(2, "orders", "CREATE TABLE orders ();", Some("DROP TABLE orders;"))
            .unwrap();
        wb
    }

    #[test]
    fn fresh_database_reports_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        assert_eq!(wb.migrator.current_migration_version().unwrap(), 0);
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn migrating_up_applies_pending_in_order_and_stops_again() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);

        wb.migrator.migrate_scheme(None).unwrap();

        assert_eq!(
            wb.schema.applied(),
            vec!["CREATE TABLE users ();", "CREATE TABLE orders ();"]
        );
        assert_eq!(wb.migrator.current_migration_version().unwrap(), 2);
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn version_increases_with_each_batch() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);

        let mut seen = vec![wb.migrator.current_migration_version().unwrap()];
        wb.migrator.migrate_scheme(Some(1)).unwrap();
        seen.push(wb.migrator.current_migration_version().unwrap());
        wb.add_migration(5, "audit", "CREATE TABLE audit ();", None).unwrap();
        wb.migrator.migrate_scheme(None).unwrap();
        seen.push(wb.migrator.current_migration_version().unwrap());

        assert_eq!(seen, vec![0, 1, 5]);
    }

    #[test]
    fn up_to_date_schema_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.migrator.migrate_scheme(None).unwrap();
        wb.migrator.migrate_scheme(None).unwrap();
        assert_eq!(wb.schema.applied().len(), 2);
    }

    #[test]
    fn stepping_back_to_zero_empties_the_tracking_table() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.migrator.migrate_scheme(None).unwrap();

        wb.migrator.migrate_scheme(Some(-1)).unwrap();
        assert_eq!(wb.schema.tracked(), Some(MigrationState::clean(1)));
        wb.migrator.migrate_scheme(Some(-1)).unwrap();
        assert_eq!(wb.schema.tracked(), None);
        assert_eq!(wb.migrator.current_migration_version().unwrap(), 0);

        let err = wb.migrator.migrate_scheme(Some(-1)).unwrap_err();
        assert!(matches!(err, LauncherError::MigrationStep { .. }));
    }

    #[test]
    fn dirty_database_blocks_migration_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.schema.set_tracked(Some(MigrationState::dirty(1)));

        let err = wb.migrator.migrate_scheme(None).unwrap_err();
        assert!(matches!(err, LauncherError::DirtyMigration { version: 1 }));
        let err = wb.migrator.current_migration_version().unwrap_err();
        assert!(matches!(err, LauncherError::DirtyMigration { version: 1 }));
        assert!(wb.schema.applied().is_empty());
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn failed_script_leaves_the_version_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.add_migration(3, "broken", FAILING_STATEMENT, None).unwrap();

        let err = wb.migrator.migrate_scheme(None).unwrap_err();

        assert!(matches!(
            err,
            LauncherError::Migration {
                operation: "apply up migration",
                ..
            }
        ));
        assert_eq!(wb.schema.tracked(), Some(MigrationState::dirty(3)));
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn running_engine_is_left_running() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.process.start_db().unwrap();

        wb.migrator.migrate_scheme(None).unwrap();

        assert!(wb.engine.is_running());
        assert_eq!(wb.engine.starts(), 2);
    }

    #[test]
    fn latest_available_version_reads_the_source_only() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        assert_eq!(wb.migrator.latest_available_version().unwrap(), 2);
        assert_eq!(wb.schema.connects(), 0);
    }
}
