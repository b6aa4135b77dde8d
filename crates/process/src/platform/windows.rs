use std::env;
use std::fs;
use std::io;
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use pg_launcher_core::DbName;

use super::{Layout, Platform};

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Windows: state under `%ProgramData%\<vendor>\<db>`, no privilege dropping,
/// child consoles hidden.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn os_tag(&self) -> &'static str {
        "windows"
    }

    fn data_dir(&self, layout: &Layout, db: DbName) -> PathBuf {
        let program_data = env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
        program_data
            .join(&layout.vendor)
            .join(db.as_str())
            .join("data")
            .join("postgres")
    }

    fn socket_directory(&self) -> Option<PathBuf> {
        None
    }

    fn create_private_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn hand_over(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(mode & 0o200 == 0);
        fs::set_permissions(path, permissions)
    }

    fn prepare_command(&self, command: &mut Command, _reduced_privilege: bool) {
        command.creation_flags(CREATE_NO_WINDOW);
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}
