use std::path::PathBuf;
use std::sync::Arc;

use pg_launcher_core::Cause;
use tracing::debug;

use crate::runner::{BackgroundProcess, CommandOutput, CommandRunner, Invocation, OutputMode};

/// Engine programs the launcher drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    InitDb,
    Psql,
    PgCtl,
    PgDump,
    PgRestore,
    Exporter,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::InitDb,
        Tool::Psql,
        Tool::PgCtl,
        Tool::PgDump,
        Tool::PgRestore,
        Tool::Exporter,
    ];

    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::InitDb => "initdb",
            Tool::Psql => "psql",
            Tool::PgCtl => "pg_ctl",
            Tool::PgDump => "pg_dump",
            Tool::PgRestore => "pg_restore",
            Tool::Exporter => "postgres_exporter",
        }
    }

    pub fn from_binary_name(name: &str) -> Option<Tool> {
        let stem = name.strip_suffix(".exe").unwrap_or(name);
        Tool::ALL.into_iter().find(|tool| tool.binary_name() == stem)
    }
}

/// Resolves tools and runs them through the injected [`CommandRunner`].
///
/// Engine tools always run with reduced privilege. Output is streamed when
/// verbose and captured otherwise, so failures can quote the tool's stderr.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    binary_root: Option<PathBuf>,
    verbose: bool,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, binary_root: Option<PathBuf>, verbose: bool) -> Self {
        Self {
            runner,
            binary_root,
            verbose,
        }
    }

    pub fn program(&self, tool: Tool) -> PathBuf {
        match &self.binary_root {
            Some(root) => root.join(tool.binary_name()),
            None => PathBuf::from(tool.binary_name()),
        }
    }

    pub fn invocation<I, S>(&self, tool: Tool, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = if self.verbose {
            OutputMode::Stream
        } else {
            OutputMode::Capture
        };
        Invocation::new(self.program(tool))
            .args(args)
            .reduced_privilege(true)
            .output(output)
    }

    /// Run to completion; a non-zero exit becomes [`Cause::Exit`].
    pub fn run(&self, invocation: Invocation) -> Result<CommandOutput, Cause> {
        let output = self.launch(&invocation)?;
        if output.success {
            Ok(output)
        } else {
            Err(Cause::Exit {
                program: invocation.program_name(),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    /// Run with captured output and no judgement on the exit status.
    pub fn probe<I, S>(&self, tool: Tool, args: I) -> Result<CommandOutput, Cause>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = self.invocation(tool, args).output(OutputMode::Capture);
        self.launch(&invocation)
    }

    pub fn spawn(&self, invocation: Invocation) -> Result<Box<dyn BackgroundProcess>, Cause> {
        debug!(program = %invocation.program.display(), args = ?invocation.args, "spawning");
        self.runner
            .spawn(&invocation)
            .map_err(|source| Cause::Launch {
                program: invocation.program_name(),
                source,
            })
    }

    fn launch(&self, invocation: &Invocation) -> Result<CommandOutput, Cause> {
        debug!(program = %invocation.program.display(), args = ?invocation.args, "running");
        self.runner
            .run(invocation)
            .map_err(|source| Cause::Launch {
                program: invocation.program_name(),
                source,
            })
    }
}
