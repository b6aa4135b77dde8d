//! Fakes for exercising migrations, backups and archives without PostgreSQL.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use pg_launcher_core::{Clock, DbName};
use pg_launcher_process::testing::{FakeEngine, FakePlatform};
use pg_launcher_process::{Executor, Layout, ProcessManager, ProcessOptions, ServerSettings};
use tracing::Span;

use crate::archive::Archiver;
use crate::backup::BackupManager;
use crate::migrator::{Migrator, MigratorOptions};
use crate::schema::{MigrationState, SchemaDriver, SchemaSession};

/// Script text that makes [`FakeSchemaDriver`] fail the statement.
pub const FAILING_STATEMENT: &str = "SELECT fail();";

#[derive(Debug, Default)]
struct SchemaState {
    tracked: Option<MigrationState>,
    applied: Vec<String>,
    connects: usize,
}

/// Keeps the tracking row in memory; refuses connections while the fake
/// engine is stopped.
#[derive(Debug, Clone)]
pub struct FakeSchemaDriver {
    engine: Arc<FakeEngine>,
    state: Arc<Mutex<SchemaState>>,
}

impl FakeSchemaDriver {
    pub fn new(engine: Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            state: Arc::default(),
        })
    }

    pub fn tracked(&self) -> Option<MigrationState> {
        self.state.lock().tracked
    }

    pub fn set_tracked(&self, state: Option<MigrationState>) {
        self.state.lock().tracked = state;
    }

    /// Every script applied so far, in order.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }
}

#[async_trait::async_trait]
impl SchemaDriver for FakeSchemaDriver {
    async fn connect(&self, _url: &str) -> Result<Box<dyn SchemaSession>> {
        self.state.lock().connects += 1;
        if !self.engine.is_running() {
            bail!("connection refused");
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl SchemaSession for FakeSchemaDriver {
    async fn version(&mut self) -> Result<Option<MigrationState>> {
        Ok(self.tracked())
    }

    async fn set_version(&mut self, state: Option<MigrationState>) -> Result<()> {
        self.set_tracked(state);
        Ok(())
    }

    async fn apply(&mut self, script: &str) -> Result<()> {
        if script.contains(FAILING_STATEMENT) {
            bail!("ERROR: function fail() does not exist");
        }
        self.state.lock().applied.push(script.to_owned());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Clock that advances one second on every reading.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<NaiveDateTime>,
}

impl SteppingClock {
    pub fn starting_at(start: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(start),
        })
    }
}

impl Default for SteppingClock {
    fn default() -> Self {
        let start = NaiveDate::from_ymd_opt(2026, 1, 2)
            .and_then(|day| day.and_hms_opt(3, 4, 5))
            .unwrap_or_default();
        Self {
            next: Mutex::new(start),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> NaiveDateTime {
        let mut next = self.next.lock();
        let now = *next;
        *next += chrono::Duration::seconds(1);
        now
    }
}

/// A complete process/migration/backup stack over fakes in a temporary directory.
pub struct Workbench {
    pub root: PathBuf,
    pub engine: Arc<FakeEngine>,
    pub platform: Arc<FakePlatform>,
    pub schema: Arc<FakeSchemaDriver>,
    pub process: Arc<ProcessManager>,
    pub migrator: Arc<Migrator>,
    pub backups: Arc<BackupManager>,
    pub archiver: Archiver,
}

impl Workbench {
    /// `root` must exist; state goes to `root/data`, `root/db_backup` and
    /// migrations are read from `root/migrations/<db>`.
    pub fn new(root: &Path, db: DbName) -> Result<Self> {
        let socket_dir = root.join("sock");
        fs::create_dir_all(&socket_dir)?;
        let layout = Layout {
            app_root: root.join("app"),
            vendor: "pg-launcher".into(),
        };
        let backup_root = layout.backup_root();

        let engine = FakeEngine::new();
        let platform = FakePlatform::new(Some(socket_dir));
        let schema = FakeSchemaDriver::new(Arc::clone(&engine));
        let executor = Executor::new(engine.clone(), None, false);
        let process = Arc::new(ProcessManager::new(
            ProcessOptions {
                db,
                layout,
                settings: ServerSettings::default(),
                password_dir: root.to_path_buf(),
            },
            executor,
            platform.clone(),
            Span::none(),
        ));
        let mut options = MigratorOptions::new(Self::migrations_dir_in(root, db));
        options.connect_attempts = 2;
        options.connect_delay = Duration::from_millis(1);
        let migrator = Arc::new(Migrator::new(Arc::clone(&process), schema.clone(), options)?);
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&process),
            Arc::clone(&migrator),
            Arc::new(SteppingClock::default()),
            backup_root,
        ));
        let archiver = Archiver::new(Arc::clone(&backups));
        Ok(Self {
            root: root.to_path_buf(),
            engine,
            platform,
            schema,
            process,
            migrator,
            backups,
            archiver,
        })
    }

    pub fn migrations_dir_in(root: &Path, db: DbName) -> PathBuf {
        root.join("migrations").join(db.as_str())
    }

    /// Write `<version>_<title>.up.sql` (and a down script) for this database.
    pub fn add_migration(&self, version: u64, title: &str, up: &str, down: Option<&str>) -> Result<()> {
        let dir = Self::migrations_dir_in(&self.root, self.process.db());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{version}_{title}.up.sql")), up)?;
        if let Some(down) = down {
            fs::write(dir.join(format!("{version}_{title}.down.sql")), down)?;
        }
        Ok(())
    }
}
