use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pg_launcher_core::{Cause, DbName, LauncherError};
use tracing::{info, warn, Span};

use crate::platform::{Layout, Platform};
use crate::runner::BackgroundProcess;
use crate::settings::{ServerSettings, MAINTENANCE_DB, SUPERUSER};
use crate::socket::discover_socket_directory;
use crate::tools::{Executor, Tool};

/// One-time password file handed to `initdb`.
pub const PASSWORD_FILE: &str = "pwfile";
/// Main configuration file of a cluster; its presence means the cluster exists.
pub const CONFIG_FILE: &str = "postgresql.conf";
pub const LOG_FILE: &str = "postgres.log";

/// Marker `pg_ctl status` prints only while a postmaster is alive.
const LIVENESS_MARKER: &str = "PID";

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub db: DbName,
    pub layout: Layout,
    pub settings: ServerSettings,
    /// Directory the one-time password file is written to.
    pub password_dir: PathBuf,
}

#[derive(Debug, Default)]
struct ProcessState {
    socket_path: Option<PathBuf>,
    exporter: Option<Box<dyn BackgroundProcess>>,
    /// Open [`RunningSession`]s.
    sessions: usize,
    /// A session started the engine and nobody has claimed it since.
    session_started: bool,
}

/// Owns the data directory and the running/stopped state of the engine.
///
/// Process state is never cached: every query asks `pg_ctl status`. All
/// transitions serialize on one mutex.
pub struct ProcessManager {
    db: DbName,
    executor: Executor,
    platform: Arc<dyn Platform>,
    settings: ServerSettings,
    data_dir: PathBuf,
    password_dir: PathBuf,
    span: Span,
    state: Mutex<ProcessState>,
}

impl ProcessManager {
    pub fn new(options: ProcessOptions, executor: Executor, platform: Arc<dyn Platform>, span: Span) -> Self {
        let data_dir = platform.data_dir(&options.layout, options.db);
        Self {
            db: options.db,
            executor,
            platform,
            settings: options.settings,
            data_dir,
            password_dir: options.password_dir,
            span,
            state: Mutex::new(ProcessState::default()),
        }
    }

    pub fn db(&self) -> DbName {
        self.db
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Data directory path without creating it.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Data directory path, creating it (owner-only, handed to the service account) on first use.
    pub fn get_data_path(&self) -> Result<PathBuf, LauncherError> {
        self.prepare_data_dir().map_err(|source| LauncherError::Process {
            operation: "prepare data directory",
            source,
        })?;
        Ok(self.data_dir.clone())
    }

    pub fn get_socket_path(&self) -> Option<PathBuf> {
        self.state.lock().socket_path.clone()
    }

    /// Cheapest existence probe: the cluster's main config file is on disk.
    pub fn database_already_exists(&self) -> bool {
        self.data_dir.join(CONFIG_FILE).is_file()
    }

    /// Create the data directory and run `initdb` against it.
    pub fn init_data_dir(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let _state = self.state.lock();

        self.prepare_data_dir().map_err(|source| LauncherError::Init {
            operation: "create data directory",
            source,
        })?;
        let pwfile = PasswordFile::write(&self.password_dir, self.settings.password(), &*self.platform)
            .map_err(|source| LauncherError::Init {
                operation: "write password file",
                source,
            })?;

        info!(data_dir = %self.data_dir.display(), "initializing database...");
        let invocation = self.executor.invocation(
            Tool::InitDb,
            [
                "-D".to_owned(),
                self.data_dir_arg(),
                "-U".to_owned(),
                SUPERUSER.to_owned(),
                "-E".to_owned(),
                "UTF8".to_owned(),
                "--no-locale".to_owned(),
                format!("--pwfile={}", pwfile.path().display()),
            ],
        );
        let outcome = self.executor.run(invocation);
        drop(pwfile);
        outcome.map_err(|source| LauncherError::Init {
            operation: "initdb",
            source,
        })?;
        info!("database initialized");
        Ok(())
    }

    /// Initialize the cluster, create the identity's database, and leave the
    /// engine running only when `start` is set. Earlier steps are not rolled back.
    pub fn init_db(&self, start: bool) -> Result<(), LauncherError> {
        self.init_data_dir()?;
        self.start_db()?;
        self.create_database()?;
        if !start {
            self.stop_db()?;
        }
        Ok(())
    }

    pub fn start_db(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        // The caller now owns the running state; sessions must not stop it.
        state.session_started = false;
        if self.running_locked(&mut state)? {
            info!("database already running");
            return Ok(());
        }
        self.start_locked(&mut state)
    }

    pub fn stop_db(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if !self.running_locked(&mut state)? {
            info!("database already stopped");
            return Ok(());
        }
        self.stop_locked(&mut state)
    }

    pub fn is_running(&self) -> Result<bool, LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        self.running_locked(&mut state)
    }

    /// Stop if running, then remove the data directory entirely.
    pub fn clear_db(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if self.running_locked(&mut state)? {
            self.stop_locked(&mut state)?;
        }
        match fs::remove_dir_all(&self.data_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(LauncherError::Process {
                    operation: "clear data directory",
                    source: Cause::io("remove", &self.data_dir, err),
                })
            }
        }
        info!(data_dir = %self.data_dir.display(), "data directory cleared");
        Ok(())
    }

    /// Best-effort launch of the metrics exporter against this instance.
    pub fn run_exporter(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if state.exporter.is_some() {
            info!("exporter already running");
            return Ok(());
        }
        let invocation = self
            .executor
            .invocation(Tool::Exporter, ["--log.level=error"])
            .env(
                "DATA_SOURCE_URI",
                format!("{}/{MAINTENANCE_DB}?sslmode=disable", self.settings.host_port()),
            )
            .env("DATA_SOURCE_USER", SUPERUSER)
            .env("DATA_SOURCE_PASS", self.settings.password());
        let child = self
            .executor
            .spawn(invocation)
            .map_err(|source| LauncherError::Process {
                operation: "start exporter",
                source,
            })?;
        info!(pid = child.id(), "exporter started");
        state.exporter = Some(child);
        Ok(())
    }

    /// Ensure the engine runs until the returned session is finished.
    ///
    /// Sessions are reference counted: the engine is stopped when the last one
    /// finishes, and only if a session was what started it.
    pub fn session(&self) -> Result<RunningSession<'_>, LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        if !self.running_locked(&mut state)? {
            self.start_locked(&mut state)?;
            state.session_started = true;
        }
        state.sessions += 1;
        Ok(RunningSession {
            manager: self,
            finished: false,
        })
    }

    /// Run `op` inside a [`RunningSession`]. The operation's error wins over a
    /// failure to stop afterwards.
    pub fn with_running<T>(
        &self,
        op: impl FnOnce() -> Result<T, LauncherError>,
    ) -> Result<T, LauncherError> {
        let session = self.session()?;
        let outcome = op();
        let released = session.finish();
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(stop_err)) => {
                let _entered = self.span.enter();
                warn!(error = %stop_err, "failed to stop database after failed operation");
                Err(err)
            }
        }
    }

    fn release_session(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        let mut state = self.state.lock();
        state.sessions = state.sessions.saturating_sub(1);
        if state.sessions > 0 || !state.session_started {
            return Ok(());
        }
        state.session_started = false;
        if self.running_locked(&mut state)? {
            self.stop_locked(&mut state)?;
        }
        Ok(())
    }

    fn running_locked(&self, state: &mut ProcessState) -> Result<bool, LauncherError> {
        let output = self
            .executor
            .probe(Tool::PgCtl, ["-D".to_owned(), self.data_dir_arg(), "status".to_owned()])
            .map_err(|source| LauncherError::Process {
                operation: "status",
                source,
            })?;
        if output.stdout.contains(LIVENESS_MARKER) {
            state.socket_path = discover_socket_directory(&output.stdout);
            Ok(true)
        } else {
            state.socket_path = None;
            Ok(false)
        }
    }

    fn start_locked(&self, state: &mut ProcessState) -> Result<(), LauncherError> {
        self.prepare_data_dir().map_err(|source| LauncherError::Process {
            operation: "prepare data directory",
            source,
        })?;
        let opts = self.server_options();
        let mut args = vec!["-D".to_owned(), self.data_dir_arg(), "-o".to_owned(), opts.clone()];
        args.extend(self.log_args());
        args.extend(["-s", "-w", "start"].map(str::to_owned));

        info!("starting database...");
        self.executor
            .run(self.executor.invocation(Tool::PgCtl, args))
            .map_err(|source| LauncherError::Process {
                operation: "start",
                source,
            })?;
        state.socket_path = discover_socket_directory(&opts);
        info!(socket = ?state.socket_path, "database started");
        Ok(())
    }

    fn stop_locked(&self, state: &mut ProcessState) -> Result<(), LauncherError> {
        if let Some(mut exporter) = state.exporter.take() {
            info!(pid = exporter.id(), "stopping exporter...");
            if let Err(err) = exporter.terminate() {
                warn!(error = %err, "failed to signal exporter");
            }
        }

        let mut args = vec![
            "-D".to_owned(),
            self.data_dir_arg(),
            "-o".to_owned(),
            self.server_options(),
        ];
        args.extend(self.log_args());
        args.extend(["-w", "stop"].map(str::to_owned));

        info!("stopping database...");
        self.executor
            .run(self.executor.invocation(Tool::PgCtl, args))
            .map_err(|source| LauncherError::Process {
                operation: "stop",
                source,
            })?;
        state.socket_path = None;
        info!("database stopped");
        Ok(())
    }

    fn create_database(&self) -> Result<(), LauncherError> {
        let _entered = self.span.enter();
        info!("creating database...");
        let invocation = self
            .executor
            .invocation(
                Tool::Psql,
                [
                    "-U".to_owned(),
                    SUPERUSER.to_owned(),
                    "-h".to_owned(),
                    self.settings.host().to_owned(),
                    "-p".to_owned(),
                    self.settings.port().to_string(),
                    "-c".to_owned(),
                    format!("CREATE DATABASE {}", self.db),
                ],
            )
            .env("PGPASSWORD", self.settings.password());
        self.executor
            .run(invocation)
            .map_err(|source| LauncherError::Init {
                operation: "create database",
                source,
            })?;
        info!("database created");
        Ok(())
    }

    fn prepare_data_dir(&self) -> Result<(), Cause> {
        self.platform
            .create_private_dir(&self.data_dir)
            .map_err(|err| Cause::io("create", &self.data_dir, err))
    }

    fn server_options(&self) -> String {
        let socket_dir = self.platform.socket_directory();
        self.settings.server_options(socket_dir.as_deref())
    }

    fn log_args(&self) -> Vec<String> {
        if self.settings.enable_log() {
            vec!["-l".to_owned(), self.data_dir.join(LOG_FILE).display().to_string()]
        } else {
            Vec::new()
        }
    }

    fn data_dir_arg(&self) -> String {
        self.data_dir.display().to_string()
    }
}

/// Keeps the engine running while held; see [`ProcessManager::session`].
#[must_use = "dropping a session immediately releases it"]
pub struct RunningSession<'a> {
    manager: &'a ProcessManager,
    finished: bool,
}

impl RunningSession<'_> {
    pub fn finish(mut self) -> Result<(), LauncherError> {
        self.finished = true;
        self.manager.release_session()
    }
}

impl Drop for RunningSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.manager.release_session() {
            let _entered = self.manager.span.enter();
            warn!(error = %err, "failed to release database session");
        }
    }
}

/// Password file that disappears when dropped, whatever happened in between.
struct PasswordFile {
    path: PathBuf,
}

impl PasswordFile {
    fn write(dir: &Path, password: &str, platform: &dyn Platform) -> Result<Self, Cause> {
        let path = dir.join(PASSWORD_FILE);
        fs::write(&path, format!("{password}\n")).map_err(|err| Cause::io("write", &path, err))?;
        let file = Self { path };
        platform
            .set_mode(&file.path, 0o600)
            .and_then(|()| platform.hand_over(&file.path))
            .map_err(|err| Cause::io("secure", &file.path, err))?;
        Ok(file)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PasswordFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove password file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakePlatform};

    struct Fixture {
        root: tempfile::TempDir,
        socket_dir: PathBuf,
        engine: Arc<FakeEngine>,
        manager: ProcessManager,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let socket_dir = root.path().join("sock");
        fs::create_dir_all(&socket_dir).unwrap();
        let engine = FakeEngine::new();
        let options = ProcessOptions {
            db: DbName::Mojave,
            layout: Layout {
                app_root: root.path().join("app"),
                vendor: "test".into(),
            },
            settings: ServerSettings::default(),
            password_dir: root.path().to_path_buf(),
        };
        let executor = Executor::new(engine.clone(), None, false);
        let platform = FakePlatform::new(Some(socket_dir.clone()));
        let manager = ProcessManager::new(options, executor, platform, Span::none());
        Fixture {
            root,
            socket_dir,
            engine,
            manager,
        }
    }

    #[test]
    fn init_without_start_leaves_a_stopped_cluster() {
        let fx = fixture();
        assert!(!fx.manager.database_already_exists());

        fx.manager.init_db(false).unwrap();

        assert!(fx.manager.database_already_exists());
        assert!(!fx.manager.is_running().unwrap());
        assert!(fx.engine.databases().contains("mojave"));
        assert_eq!(fx.engine.passwords(), vec!["password".to_owned()]);
        assert!(!fx.root.path().join(PASSWORD_FILE).exists());
    }

    #[test]
    fn password_file_is_removed_when_initdb_fails() {
        let fx = fixture();
        fx.engine.fail_next(Tool::InitDb, 1);

        let err = fx.manager.init_data_dir().unwrap_err();

        assert!(matches!(err, LauncherError::Init { operation: "initdb", .. }));
        assert!(!fx.root.path().join(PASSWORD_FILE).exists());
        assert!(!fx.manager.database_already_exists());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let fx = fixture();
        fx.manager.init_db(true).unwrap();
        fx.manager.start_db().unwrap();
        assert_eq!(fx.engine.starts(), 1);
        assert_eq!(fx.manager.get_socket_path(), Some(fx.socket_dir.clone()));

        fx.manager.stop_db().unwrap();
        fx.manager.stop_db().unwrap();
        assert_eq!(fx.engine.stops(), 1);
        assert_eq!(fx.manager.get_socket_path(), None);
    }

    #[test]
    fn status_rediscovers_socket_and_notices_a_crash() {
        let fx = fixture();
        fx.manager.init_db(true).unwrap();
        assert!(fx.manager.is_running().unwrap());
        assert_eq!(fx.manager.get_socket_path(), Some(fx.socket_dir.clone()));

        fx.engine.crash();
        assert!(!fx.manager.is_running().unwrap());
        assert_eq!(fx.manager.get_socket_path(), None);
    }

    #[test]
    fn socket_path_is_dropped_once_status_no_longer_shows_it() {
        let fx = fixture();
        fx.manager.init_db(true).unwrap();
        assert_eq!(fx.manager.get_socket_path(), Some(fx.socket_dir.clone()));

        fs::remove_dir_all(&fx.socket_dir).unwrap();

        assert!(fx.manager.is_running().unwrap());
        assert_eq!(fx.manager.get_socket_path(), None);
    }

    #[test]
    fn start_fails_without_a_cluster() {
        let fx = fixture();
        let err = fx.manager.start_db().unwrap_err();
        assert!(matches!(err, LauncherError::Process { operation: "start", .. }));
        assert!(err.to_string().contains("not a database cluster directory"));
    }

    #[test]
    fn session_stops_only_what_it_started() {
        let fx = fixture();
        fx.manager.init_data_dir().unwrap();

        fx.manager
            .with_running(|| {
                assert!(fx.engine.is_running());
                Ok(())
            })
            .unwrap();
        assert!(!fx.engine.is_running());

        fx.manager.start_db().unwrap();
        fx.manager.with_running(|| Ok(())).unwrap();
        assert!(fx.engine.is_running());
    }

    #[test]
    fn overlapping_sessions_keep_the_engine_up_until_the_last_finishes() {
        let fx = fixture();
        fx.manager.init_data_dir().unwrap();

        let first = fx.manager.session().unwrap();
        let second = fx.manager.session().unwrap();
        drop(first);
        assert!(fx.engine.is_running());
        second.finish().unwrap();
        assert!(!fx.engine.is_running());
        assert_eq!(fx.engine.starts(), 1);
    }

    #[test]
    fn explicit_start_inside_a_session_keeps_the_engine_running() {
        let fx = fixture();
        fx.manager.init_data_dir().unwrap();

        let session = fx.manager.session().unwrap();
        fx.manager.start_db().unwrap();
        session.finish().unwrap();
        assert!(fx.engine.is_running());
    }

    #[test]
    fn failed_operation_still_stops_the_engine() {
        let fx = fixture();
        fx.manager.init_data_dir().unwrap();

        let err = fx
            .manager
            .with_running::<()>(|| Err(LauncherError::NotFound { name: "x".into() }))
            .unwrap_err();

        assert!(matches!(err, LauncherError::NotFound { .. }));
        assert!(!fx.engine.is_running());
    }

    #[test]
    fn stop_terminates_the_exporter_first() {
        let fx = fixture();
        fx.manager.init_db(true).unwrap();
        fx.manager.run_exporter().unwrap();
        fx.manager.run_exporter().unwrap();
        assert_eq!(fx.engine.spawned_exporters().len(), 1);

        let spawned = fx.engine.invocations_of(Tool::Exporter);
        assert!(spawned[0].envs.contains(&(
            "DATA_SOURCE_URI".to_owned(),
            "localhost:5432/postgres?sslmode=disable".to_owned()
        )));

        fx.manager.stop_db().unwrap();
        assert_eq!(fx.engine.terminated_exporters(), fx.engine.spawned_exporters());
    }

    #[test]
    fn clear_stops_and_removes_the_data_directory() {
        let fx = fixture();
        fx.manager.init_db(true).unwrap();

        fx.manager.clear_db().unwrap();

        assert!(!fx.engine.is_running());
        assert!(!fx.manager.data_dir().exists());
        assert!(!fx.manager.database_already_exists());
        fx.manager.clear_db().unwrap();
    }

    #[test]
    fn data_path_is_created_on_first_use() {
        let fx = fixture();
        assert!(!fx.manager.data_dir().exists());
        let path = fx.manager.get_data_path().unwrap();
        assert!(path.is_dir());
    }
}
