use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pg_launcher_core::{Backup, BackupRequest, Cause, Clock, DbName, LauncherError, SystemClock};
use pg_launcher_process::settings::{DEFAULT_LISTEN_ADDRESS, DEFAULT_PASSWORD, DEFAULT_PORT};
use pg_launcher_process::{
    platform, CommandRunner, Executor, Layout, Platform, ProcessManager, ProcessOptions,
    ServerSettings, SystemCommandRunner,
};
use pg_launcher_storage::{
    Archiver, BackupManager, Migrator, MigratorOptions, PostgresSchemaDriver, SchemaDriver,
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY,
};
use serde::Serialize;
use tracing::{info, info_span, Span};

pub const DEFAULT_VENDOR: &str = "pg-launcher";

/// Everything needed to supervise one database identity.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Identity name; must be one of the recognized databases.
    pub db: String,
    pub listen_address: String,
    pub port: u16,
    pub password: String,
    /// Directory holding the engine binaries; `PATH` lookup when unset.
    pub binary_root: Option<PathBuf>,
    pub verbose: bool,
    pub enable_log: bool,
    /// Directory of the application binary. Defaults to the current executable's directory.
    pub app_root: Option<PathBuf>,
    /// Parent of the per-database migration directories. Defaults to `<app_root>/migrations`.
    pub migrations_root: Option<PathBuf>,
    /// Where the one-time password file goes. Defaults to the working directory.
    pub password_dir: Option<PathBuf>,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub vendor: String,
}

impl LauncherConfig {
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            ..Self::default()
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            db: String::new(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_owned(),
            port: DEFAULT_PORT,
            password: DEFAULT_PASSWORD.to_owned(),
            binary_root: None,
            verbose: false,
            enable_log: false,
            app_root: None,
            migrations_root: None,
            password_dir: None,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: DEFAULT_CONNECT_DELAY,
            vendor: DEFAULT_VENDOR.to_owned(),
        }
    }
}

/// Collaborators that replace the real OS, engine and database seams.
#[derive(Default)]
pub struct LauncherDeps {
    pub runner: Option<Arc<dyn CommandRunner>>,
    pub platform: Option<Arc<dyn Platform>>,
    pub schema_driver: Option<Arc<dyn SchemaDriver>>,
    pub clock: Option<Arc<dyn Clock>>,
    /// Span every event of this launcher is recorded in.
    pub span: Option<Span>,
}

/// Point-in-time view of the supervised instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub db: DbName,
    pub initialized: bool,
    pub running: bool,
    pub data_dir: PathBuf,
    pub socket_path: Option<PathBuf>,
}

/// Process control, migrations, backups and archives for one database identity.
pub struct Launcher {
    process: Arc<ProcessManager>,
    migrator: Arc<Migrator>,
    backups: Arc<BackupManager>,
    archiver: Archiver,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Result<Self, LauncherError> {
        Self::with_deps(config, LauncherDeps::default())
    }

    pub fn with_deps(config: LauncherConfig, deps: LauncherDeps) -> Result<Self, LauncherError> {
        let db: DbName = config.db.parse()?;
        let app_root = match config.app_root {
            Some(root) => root,
            None => executable_dir()?,
        };
        let password_dir = match config.password_dir {
            Some(dir) => dir,
            None => env::current_dir().map_err(|err| LauncherError::Config {
                reason: format!("cannot resolve working directory: {err}"),
            })?,
        };
        let migrations_dir = config
            .migrations_root
            .unwrap_or_else(|| app_root.join("migrations"))
            .join(db.as_str());

        let platform = deps.platform.unwrap_or_else(platform::detect);
        let runner = deps
            .runner
            .unwrap_or_else(|| Arc::new(SystemCommandRunner::new(Arc::clone(&platform))));
        let driver = deps
            .schema_driver
            .unwrap_or_else(|| Arc::new(PostgresSchemaDriver));
        let clock = deps.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let span = deps
            .span
            .unwrap_or_else(|| info_span!("pg_launcher", db = %db));

        let layout = Layout {
            app_root,
            vendor: config.vendor,
        };
        let backup_root = layout.backup_root();
        fs::create_dir_all(&backup_root).map_err(|err| LauncherError::Backup {
            operation: "create backup root",
            source: Cause::io("create", &backup_root, err),
        })?;

        let settings = ServerSettings::new(
            &config.listen_address,
            config.port,
            config.password,
            config.enable_log,
        );
        let executor = Executor::new(runner, config.binary_root, config.verbose);
        let process = Arc::new(ProcessManager::new(
            ProcessOptions {
                db,
                layout,
                settings,
                password_dir,
            },
            executor,
            platform,
            span,
        ));
        let migrator = Arc::new(Migrator::new(
            Arc::clone(&process),
            driver,
            MigratorOptions {
                migrations_dir,
                connect_attempts: config.connect_attempts,
                connect_delay: config.connect_delay,
            },
        )?);
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&process),
            Arc::clone(&migrator),
            clock,
            backup_root,
        ));
        let archiver = Archiver::new(Arc::clone(&backups));

        {
            let _entered = process.span().enter();
            info!(data_dir = %process.data_dir().display(), "launcher ready");
        }
        Ok(Self {
            process,
            migrator,
            backups,
            archiver,
        })
    }

    pub fn db(&self) -> DbName {
        self.process.db()
    }

    pub fn span(&self) -> &Span {
        self.process.span()
    }

    pub fn process(&self) -> &ProcessManager {
        &self.process
    }

    pub fn backup_root(&self) -> &Path {
        self.backups.backup_root()
    }

    /// Initialize the cluster when missing, otherwise start it; then apply
    /// every pending migration. The engine is left running.
    pub fn ensure(&self) -> Result<(), LauncherError> {
        if self.process.database_already_exists() {
            self.process.start_db()?;
        } else {
            self.process.init_db(true)?;
        }
        self.migrator.migrate_scheme(None)
    }

    pub fn status(&self) -> Result<Status, LauncherError> {
        let running = self.process.is_running()?;
        Ok(Status {
            db: self.db(),
            initialized: self.process.database_already_exists(),
            running,
            data_dir: self.process.data_dir().to_path_buf(),
            socket_path: self.process.get_socket_path(),
        })
    }

    pub fn init_data_dir(&self) -> Result<(), LauncherError> {
        self.process.init_data_dir()
    }

    pub fn init_db(&self, start: bool) -> Result<(), LauncherError> {
        self.process.init_db(start)
    }

    pub fn start_db(&self) -> Result<(), LauncherError> {
        self.process.start_db()
    }

    pub fn stop_db(&self) -> Result<(), LauncherError> {
        self.process.stop_db()
    }

    pub fn is_running(&self) -> Result<bool, LauncherError> {
        self.process.is_running()
    }

    pub fn clear_db(&self) -> Result<(), LauncherError> {
        self.process.clear_db()
    }

    pub fn database_already_exists(&self) -> bool {
        self.process.database_already_exists()
    }

    pub fn get_data_path(&self) -> Result<PathBuf, LauncherError> {
        self.process.get_data_path()
    }

    pub fn get_socket_path(&self) -> Option<PathBuf> {
        self.process.get_socket_path()
    }

    pub fn run_exporter(&self) -> Result<(), LauncherError> {
        self.process.run_exporter()
    }

    pub fn migrate_scheme(&self, step: Option<i32>) -> Result<(), LauncherError> {
        self.migrator.migrate_scheme(step)
    }

    pub fn current_migration_version(&self) -> Result<u64, LauncherError> {
        self.migrator.current_migration_version()
    }

    pub fn latest_available_version(&self) -> Result<u64, LauncherError> {
        self.migrator.latest_available_version()
    }

    pub fn backup(&self, auto: bool, request: BackupRequest) -> Result<Backup, LauncherError> {
        self.backups.backup(auto, request)
    }

    pub fn list_backups(&self) -> Result<Vec<Backup>, LauncherError> {
        self.backups.list_backups()
    }

    pub fn delete_backup(&self, name: &str) -> Result<(), LauncherError> {
        self.backups.delete_backup(name)
    }

    pub fn restore_database(&self, name: &str) -> Result<(), LauncherError> {
        self.backups.restore_database(name)
    }

    pub fn zip(&self, archive_path: &Path, source_dir: &Path) -> Result<(), LauncherError> {
        self.archiver.zip(archive_path, source_dir)
    }

    pub fn load_backup_archive_file(&self, archive_path: &Path) -> Result<Backup, LauncherError> {
        self.archiver.load_backup_archive_file(archive_path)
    }
}

fn executable_dir() -> Result<PathBuf, LauncherError> {
    let exe = env::current_exe().map_err(|err| LauncherError::Config {
        reason: format!("cannot locate the running executable: {err}"),
    })?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| LauncherError::Config {
            reason: format!("executable {} has no parent directory", exe.display()),
        })
}
