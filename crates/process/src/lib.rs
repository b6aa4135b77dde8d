//! Process-level control of an embedded PostgreSQL engine: running the
//! engine's command-line tools, owning the data directory, and tracking
//! whether the server is up.

pub mod manager;
pub mod platform;
pub mod runner;
pub mod settings;
pub mod socket;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use manager::{ProcessManager, ProcessOptions, RunningSession};
pub use platform::{Layout, Platform, SERVICE_ACCOUNT};
pub use runner::{
    BackgroundProcess, CommandOutput, CommandRunner, Invocation, OutputMode, SystemCommandRunner,
};
pub use settings::ServerSettings;
pub use tools::{Executor, Tool};
