use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use crate::platform::Platform;

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Inherit the launcher's own stdout/stderr.
    Stream,
    /// Collect both streams into the returned [`CommandOutput`].
    Capture,
    /// Send both streams to the null device.
    Discard,
}

/// A fully described external program execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub reduced_privilege: bool,
    pub output: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            reduced_privilege: false,
            output: OutputMode::Capture,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn reduced_privilege(mut self, reduced: bool) -> Self {
        self.reduced_privilege = reduced;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Bare file name of the program, used in logs and error messages.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Value following `flag` in the argument list, e.g. `-D <dir>`.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

/// Completion report of a finished program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Human readable exit status, e.g. `exit status: 1`.
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: code == 0,
            code: Some(code),
            status: format!("exit status: {code}"),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// A long-lived child started with [`CommandRunner::spawn`].
pub trait BackgroundProcess: Send + fmt::Debug {
    fn id(&self) -> u32;

    /// Ask the process to shut down gracefully.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Executes external programs on behalf of the lifecycle manager.
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported in the output, not as `Err`.
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;

    /// Start without waiting.
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn BackgroundProcess>>;
}

/// Runs programs as real OS processes, dropping privileges through the platform adapter.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    platform: Arc<dyn Platform>,
}

impl SystemCommandRunner {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        command.envs(invocation.envs.iter().map(|(k, v)| (k, v)));
        self.platform
            .prepare_command(&mut command, invocation.reduced_privilege);
        command
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let mut command = self.command(invocation);
        command.stdin(Stdio::null());
        let (status, stdout, stderr) = match invocation.output {
            OutputMode::Capture => {
                let output = command.output()?;
                (
                    output.status,
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                )
            }
            OutputMode::Stream => (command.status()?, String::new(), String::new()),
            OutputMode::Discard => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
                (command.status()?, String::new(), String::new())
            }
        };
        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            status: status.to_string(),
            stdout,
            stderr,
        })
    }

    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn BackgroundProcess>> {
        let mut command = self.command(invocation);
        command.stdin(Stdio::null());
        if invocation.output != OutputMode::Stream {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = command.spawn()?;
        Ok(Box::new(SystemChild {
            child,
            platform: Arc::clone(&self.platform),
        }))
    }
}

#[derive(Debug)]
struct SystemChild {
    child: Child,
    platform: Arc<dyn Platform>,
}

impl BackgroundProcess for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.platform.terminate(self.child.id())?;
        // Reap it if it already went away; otherwise leave it to finish on its own.
        self.child.try_wait()?;
        Ok(())
    }
}
