use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, geteuid, Gid, Pid, Uid, User};
use pg_launcher_core::DbName;
use tracing::debug;

use super::{Layout, Platform, SERVICE_ACCOUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAccount {
    pub uid: u32,
    pub gid: u32,
}

/// Linux and macOS: state beside the application, privileges dropped to the
/// `postgres` account when the launcher itself runs as root.
#[derive(Debug, Clone, Default)]
pub struct UnixPlatform {
    account: Option<ServiceAccount>,
}

impl UnixPlatform {
    pub fn detect() -> Self {
        if !geteuid().is_root() {
            return Self::default();
        }
        let account = match User::from_name(SERVICE_ACCOUNT) {
            Ok(Some(user)) => Some(ServiceAccount {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            }),
            Ok(None) => None,
            Err(errno) => {
                debug!(%errno, "service account lookup failed");
                None
            }
        };
        Self { account }
    }

    pub fn with_account(account: Option<ServiceAccount>) -> Self {
        Self { account }
    }

    pub fn account(&self) -> Option<ServiceAccount> {
        self.account
    }
}

impl Platform for UnixPlatform {
    fn os_tag(&self) -> &'static str {
        if cfg!(target_os = "macos") {
            "darwin"
        } else {
            std::env::consts::OS
        }
    }

    fn data_dir(&self, layout: &Layout, _db: DbName) -> PathBuf {
        layout
            .state_root()
            .join("data")
            .join(format!("postgres-{}", self.os_tag()))
    }

    fn socket_directory(&self) -> Option<PathBuf> {
        Some(std::env::temp_dir())
    }

    fn create_private_dir(&self, path: &Path) -> io::Result<()> {
        // Only the leaf is private; the service account must traverse the parents.
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match DirBuilder::new().mode(0o700).create(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(err) => return Err(err),
        }
        self.hand_over(path)
    }

    fn hand_over(&self, path: &Path) -> io::Result<()> {
        let Some(account) = self.account else {
            return Ok(());
        };
        chown(
            path,
            Some(Uid::from_raw(account.uid)),
            Some(Gid::from_raw(account.gid)),
        )
        .map_err(io::Error::from)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
    }

    fn prepare_command(&self, command: &mut Command, reduced_privilege: bool) {
        if !reduced_privilege {
            return;
        }
        if let Some(account) = self.account {
            command.uid(account.uid).gid(account.gid);
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout {
            app_root: PathBuf::from("/srv/app/bin"),
            vendor: "pg-launcher".into(),
        }
    }

    #[test]
    fn data_dir_is_platform_suffixed_and_shared_by_identities() {
        let platform = UnixPlatform::default();
        let tag = platform.os_tag();
        let expected = PathBuf::from(format!("/srv/app/data/postgres-{tag}"));
        for db in DbName::ALL {
            assert_eq!(platform.data_dir(&layout(), db), expected);
        }
        assert_ne!(tag, "macos");
    }

    #[test]
    fn private_dir_is_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a/b");
        UnixPlatform::default().create_private_dir(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn parents_of_a_private_dir_stay_traversable() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout {
            app_root: tmp.path().join("app"),
            vendor: "pg-launcher".into(),
        };
        let platform = UnixPlatform::default();
        let data_dir = platform.data_dir(&layout, DbName::Mojave);

        platform.create_private_dir(&data_dir).unwrap();
        platform.create_private_dir(&data_dir).unwrap();

        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&data_dir), 0o700);
        let plain = tmp.path().join("plain");
        fs::create_dir(&plain).unwrap();
        assert_eq!(mode(data_dir.parent().unwrap()), mode(&plain));
    }

    #[test]
    fn hand_over_without_account_is_a_no_op() {
        let platform = UnixPlatform::with_account(None);
        let tmp = tempfile::tempdir().unwrap();
        platform.hand_over(tmp.path()).unwrap();
        assert!(platform.account().is_none());
    }
}
