//! Operating-system specific conventions behind one interface: data directory
//! naming, ownership hand-over to the database service account, privilege
//! dropping for child processes, and process signalling.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use pg_launcher_core::DbName;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

/// Name of the OS account the database engine runs under.
pub const SERVICE_ACCOUNT: &str = "postgres";

/// Where launcher-owned state lives relative to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Directory of the application binary; state lives beside it.
    pub app_root: PathBuf,
    /// Vendor folder used where state goes to a system-wide location.
    pub vendor: String,
}

impl Layout {
    /// `<app-root>/..`, the directory holding `data/` and `db_backup/`.
    pub fn state_root(&self) -> &Path {
        self.app_root.parent().unwrap_or(&self.app_root)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.state_root().join("db_backup")
    }
}

pub trait Platform: Send + Sync + fmt::Debug {
    /// Suffix of the data directory name, e.g. `linux` or `darwin`.
    fn os_tag(&self) -> &'static str;

    fn data_dir(&self, layout: &Layout, db: DbName) -> PathBuf;

    /// Directory passed as `unix_socket_directories`, if the platform has Unix sockets.
    fn socket_directory(&self) -> Option<PathBuf>;

    /// Create `path` (and parents) readable only by its owner, then hand it over.
    fn create_private_dir(&self, path: &Path) -> io::Result<()>;

    /// Give the service account ownership of `path`, when one is in effect.
    fn hand_over(&self, path: &Path) -> io::Result<()>;

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn prepare_command(&self, command: &mut Command, reduced_privilege: bool);

    /// Ask process `pid` to shut down gracefully.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// The adapter for the platform this binary was built for.
#[cfg(unix)]
pub fn detect() -> Arc<dyn Platform> {
    Arc::new(UnixPlatform::detect())
}

/// The adapter for the platform this binary was built for.
#[cfg(windows)]
pub fn detect() -> Arc<dyn Platform> {
    Arc::new(WindowsPlatform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_lives_beside_the_application_directory() {
        let layout = Layout {
            app_root: PathBuf::from("/opt/phoenix/bin"),
            vendor: "pg-launcher".into(),
        };
        assert_eq!(layout.state_root(), Path::new("/opt/phoenix"));
        assert_eq!(layout.backup_root(), PathBuf::from("/opt/phoenix/db_backup"));
    }
}
