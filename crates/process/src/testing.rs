//! In-memory stand-ins for the engine tools and the OS adapter.
//!
//! [`FakeEngine`] answers `initdb`, `pg_ctl`, `psql`, `pg_dump`, `pg_restore`
//! and the exporter the way the real programs would at the level the launcher
//! observes: exit codes, `pg_ctl status` text and files on disk.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use pg_launcher_core::DbName;

use crate::platform::{Layout, Platform};
use crate::runner::{BackgroundProcess, CommandOutput, CommandRunner, Invocation};
use crate::tools::Tool;

/// File `pg_dump` leaves in every dump directory.
pub const DUMP_TOC: &str = "toc.dat";
pub const DUMP_DATA: &str = "3001.dat.gz";

#[derive(Debug, Default)]
struct EngineState {
    running: bool,
    next_pid: u32,
    options: String,
    starts: usize,
    stops: usize,
    databases: BTreeSet<String>,
    passwords: Vec<String>,
    restored: Vec<String>,
    failures: HashMap<Tool, usize>,
    invocations: Vec<Invocation>,
    payload: String,
    exporters: Vec<u32>,
}

/// Simulated engine shared by every tool invocation of one test.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    terminated: Arc<Mutex<Vec<u32>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let engine = Self::default();
        engine.state.lock().next_pid = 4242;
        Arc::new(engine)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn databases(&self) -> BTreeSet<String> {
        self.state.lock().databases.clone()
    }

    /// Passwords `initdb` read from its password file.
    pub fn passwords(&self) -> Vec<String> {
        self.state.lock().passwords.clone()
    }

    /// Contents of every dump `pg_restore` loaded, in order.
    pub fn restored(&self) -> Vec<String> {
        self.state.lock().restored.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    pub fn invocations_of(&self, tool: Tool) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| Tool::from_binary_name(&invocation.program_name()) == Some(tool))
            .collect()
    }

    /// Make the next `times` runs of `tool` exit with status 1.
    pub fn fail_next(&self, tool: Tool, times: usize) {
        self.state.lock().failures.insert(tool, times);
    }

    /// Text `pg_dump` writes into the next dumps.
    pub fn set_payload(&self, payload: impl Into<String>) {
        self.state.lock().payload = payload.into();
    }

    /// The server dies without `pg_ctl stop`.
    pub fn crash(&self) {
        self.state.lock().running = false;
    }

    pub fn spawned_exporters(&self) -> Vec<u32> {
        self.state.lock().exporters.clone()
    }

    pub fn terminated_exporters(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }

    fn answer(&self, tool: Tool, invocation: &Invocation) -> io::Result<CommandOutput> {
        let mut state = self.state.lock();
        state.invocations.push(invocation.clone());
        if let Some(remaining) = state.failures.get_mut(&tool) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(CommandOutput::exited(1, "", format!("{}: injected failure", tool.binary_name())));
            }
        }
        match tool {
            Tool::InitDb => initdb(&mut state, invocation),
            Tool::PgCtl => pg_ctl(&mut state, invocation),
            Tool::Psql => psql(&mut state, invocation),
            Tool::PgDump => pg_dump(&state, invocation),
            Tool::PgRestore => pg_restore(&mut state, invocation),
            Tool::Exporter => Ok(CommandOutput::exited(1, "", "exporter does not run to completion")),
        }
    }
}

impl CommandRunner for FakeEngine {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let tool = Tool::from_binary_name(&invocation.program_name())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such program"))?;
        self.answer(tool, invocation)
    }

    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn BackgroundProcess>> {
        if Tool::from_binary_name(&invocation.program_name()) != Some(Tool::Exporter) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "only the exporter is spawned"));
        }
        let mut state = self.state.lock();
        state.invocations.push(invocation.clone());
        if let Some(remaining) = state.failures.get_mut(&Tool::Exporter) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(io::ErrorKind::NotFound, "postgres_exporter not installed"));
            }
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.exporters.push(pid);
        Ok(Box::new(FakeExporter {
            pid,
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

#[derive(Debug)]
struct FakeExporter {
    pid: u32,
    terminated: Arc<Mutex<Vec<u32>>>,
}

impl BackgroundProcess for FakeExporter {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminated.lock().push(self.pid);
        Ok(())
    }
}

fn ok() -> io::Result<CommandOutput> {
    Ok(CommandOutput::exited(0, "", ""))
}

fn fail(code: i32, stderr: &str) -> io::Result<CommandOutput> {
    Ok(CommandOutput::exited(code, "", stderr))
}

fn initdb(state: &mut EngineState, invocation: &Invocation) -> io::Result<CommandOutput> {
    let Some(data) = invocation.flag_value("-D").map(PathBuf::from) else {
        return fail(1, "initdb: no data directory specified");
    };
    let Some(pwfile) = invocation
        .args
        .iter()
        .find_map(|arg| arg.strip_prefix("--pwfile="))
    else {
        return fail(1, "initdb: no password file");
    };
    let Ok(password) = fs::read_to_string(pwfile) else {
        return fail(1, "initdb: could not open password file");
    };
    if fs::read_dir(&data).map(|mut entries| entries.next().is_some()).unwrap_or(false) {
        return fail(1, "initdb: directory exists but is not empty");
    }
    fs::create_dir_all(&data)?;
    fs::write(data.join("postgresql.conf"), "# fake cluster\n")?;
    fs::write(data.join("PG_VERSION"), "16\n")?;
    state.passwords.push(password.trim_end().to_owned());
    state.databases = BTreeSet::from(["postgres".to_owned()]);
    ok()
}

fn pg_ctl(state: &mut EngineState, invocation: &Invocation) -> io::Result<CommandOutput> {
    let data = invocation.flag_value("-D").unwrap_or_default().to_owned();
    match invocation.args.last().map(String::as_str) {
        Some("status") if state.running => {
            let quoted: Vec<String> = state
                .options
                .split_whitespace()
                .map(|word| format!("\"{word}\""))
                .collect();
            Ok(CommandOutput::exited(
                0,
                format!(
                    "pg_ctl: server is running (PID: {})\n/usr/lib/postgresql/bin/postgres \"-D\" \"{data}\" {}\n",
                    state.next_pid,
                    quoted.join(" ")
                ),
                "",
            ))
        }
        Some("status") => Ok(CommandOutput::exited(3, "pg_ctl: no server running\n", "")),
        Some("start") if state.running => fail(1, "pg_ctl: another server might be running"),
        Some("start") => {
            if !Path::new(&data).join("postgresql.conf").is_file() {
                return fail(1, "pg_ctl: directory is not a database cluster directory");
            }
            state.running = true;
            state.next_pid += 1;
            state.options = invocation.flag_value("-o").unwrap_or_default().to_owned();
            state.starts += 1;
            ok()
        }
        Some("stop") if state.running => {
            state.running = false;
            state.stops += 1;
            ok()
        }
        Some("stop") => fail(1, "pg_ctl: PID file does not exist"),
        _ => fail(1, "pg_ctl: unrecognized operation mode"),
    }
}

fn psql(state: &mut EngineState, invocation: &Invocation) -> io::Result<CommandOutput> {
    if !state.running {
        return fail(2, "psql: error: connection refused");
    }
    match invocation
        .flag_value("-c")
        .and_then(|sql| sql.strip_prefix("CREATE DATABASE "))
    {
        Some(name) if !state.databases.insert(name.trim().to_owned()) => {
            fail(1, "ERROR:  database already exists")
        }
        Some(_) => Ok(CommandOutput::exited(0, "CREATE DATABASE\n", "")),
        None => ok(),
    }
}

fn pg_dump(state: &EngineState, invocation: &Invocation) -> io::Result<CommandOutput> {
    if !state.running {
        return fail(1, "pg_dump: error: connection refused");
    }
    let Some(target) = invocation.flag_value("-f").map(PathBuf::from) else {
        return fail(1, "pg_dump: no output directory");
    };
    let db = invocation.args.last().cloned().unwrap_or_default();
    if fs::read_dir(&target).map(|mut entries| entries.next().is_some()).unwrap_or(false) {
        return fail(1, "pg_dump: could not create directory: File exists");
    }
    fs::create_dir_all(&target)?;
    fs::write(target.join(DUMP_TOC), format!("dump of {db}\n{}", state.payload))?;
    fs::write(target.join(DUMP_DATA), [0x1f, 0x8b, 0x08, 0x00])?;
    ok()
}

fn pg_restore(state: &mut EngineState, invocation: &Invocation) -> io::Result<CommandOutput> {
    if !state.running {
        return fail(1, "pg_restore: error: connection refused");
    }
    let Some(source) = invocation.args.last().map(PathBuf::from) else {
        return fail(1, "pg_restore: no input");
    };
    let Ok(toc) = fs::read_to_string(source.join(DUMP_TOC)) else {
        return fail(1, "pg_restore: could not open input file");
    };
    if !invocation.args.iter().any(|arg| arg == "-C") {
        return fail(1, "pg_restore: database does not exist");
    }
    if let Some(db) = toc.lines().next().and_then(|line| line.strip_prefix("dump of ")) {
        state.databases.insert(db.to_owned());
    }
    state.restored.push(toc);
    ok()
}

/// Platform adapter that keeps everything under the test's own directories.
#[derive(Debug)]
pub struct FakePlatform {
    socket_dir: Option<PathBuf>,
    handed_over: Mutex<Vec<PathBuf>>,
}

impl FakePlatform {
    pub fn new(socket_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            socket_dir,
            handed_over: Mutex::new(Vec::new()),
        })
    }

    pub fn handed_over(&self) -> Vec<PathBuf> {
        self.handed_over.lock().clone()
    }
}

impl Platform for FakePlatform {
    fn os_tag(&self) -> &'static str {
        "test"
    }

    fn data_dir(&self, layout: &Layout, db: DbName) -> PathBuf {
        layout
            .state_root()
            .join("data")
            .join(format!("postgres-{}-{db}", self.os_tag()))
    }

    fn socket_directory(&self) -> Option<PathBuf> {
        self.socket_dir.clone()
    }

    fn create_private_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)?;
        self.set_mode(path, 0o700)?;
        self.hand_over(path)
    }

    fn hand_over(&self, path: &Path) -> io::Result<()> {
        self.handed_over.lock().push(path.to_path_buf());
        Ok(())
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn prepare_command(&self, _command: &mut Command, _reduced_privilege: bool) {}

    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}
