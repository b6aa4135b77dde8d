use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why an external tool or filesystem step failed.
#[derive(Debug, Error)]
pub enum Cause {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}{}", stderr_suffix(.stderr))]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{action} '{path}': {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl Cause {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Cause::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

/// Reasons an archive is refused or could not be produced.
#[derive(Debug, Error)]
pub enum ArchiveFault {
    #[error("backup '{name}' already exists")]
    DuplicateBackup { name: String },
    #[error("archive belongs to database '{found}', expected '{expected}'")]
    IdentityMismatch { expected: String, found: String },
    #[error("archive contains directory entry '{entry}'")]
    DirectoryEntry { entry: String },
    #[error("archive contains unsupported entry '{entry}'")]
    UnsupportedEntry { entry: String },
    #[error("archive has no backup metadata")]
    MissingMetadata,
    #[error("archive has more than one backup metadata file")]
    MultipleMetadata,
    #[error("archive names an invalid backup '{name}'")]
    InvalidName { name: String },
    #[error("archive metadata has unreadable backup_time '{value}'")]
    InvalidTimestamp { value: String },
    #[error(transparent)]
    Io(Cause),
}

/// Every failure the lifecycle manager reports.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("unknown database '{name}'")]
    UnknownDatabase { name: String },
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
    #[error("init failed during {operation}: {source}")]
    Init {
        operation: &'static str,
        #[source]
        source: Cause,
    },
    #[error("process control failed during {operation}: {source}")]
    Process {
        operation: &'static str,
        #[source]
        source: Cause,
    },
    #[error("migration failed during {operation}: {source}")]
    Migration {
        operation: &'static str,
        #[source]
        source: Cause,
    },
    #[error("database is dirty at migration version {version}; fix the schema_migrations row manually")]
    DirtyMigration { version: u64 },
    #[error("cannot move {requested} migration steps: {applied} applied, {available} available")]
    MigrationStep {
        requested: i32,
        applied: usize,
        available: usize,
    },
    #[error("backup failed during {operation}: {source}")]
    Backup {
        operation: &'static str,
        #[source]
        source: Cause,
    },
    #[error("restore failed during {operation}: {source}")]
    Restore {
        operation: &'static str,
        #[source]
        source: Cause,
    },
    #[error("archive '{path}' rejected: {reason}")]
    Archive {
        path: PathBuf,
        #[source]
        reason: ArchiveFault,
    },
    #[error("backup migration {backup} is newer than the supported migration {current}")]
    VersionSkew { backup: u64, current: u64 },
    #[error("backup '{name}' not found")]
    NotFound { name: String },
}

impl LauncherError {
    pub fn is_duplicate_backup(&self) -> bool {
        matches!(
            self,
            LauncherError::Archive {
                reason: ArchiveFault::DuplicateBackup { .. },
                ..
            }
        )
    }

    pub fn is_identity_mismatch(&self) -> bool {
        matches!(
            self,
            LauncherError::Archive {
                reason: ArchiveFault::IdentityMismatch { .. },
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_message_carries_trimmed_stderr() {
        let err = LauncherError::Process {
            operation: "start",
            source: Cause::Exit {
                program: "pg_ctl".into(),
                status: "exit status: 1".into(),
                stderr: "  pg_ctl: could not start server\n".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "process control failed during start: pg_ctl exited with exit status: 1: pg_ctl: could not start server"
        );
    }

    #[test]
    fn exit_message_without_stderr() {
        let cause = Cause::Exit {
            program: "pg_dump".into(),
            status: "exit status: 2".into(),
            stderr: String::new(),
        };
        assert_eq!(cause.to_string(), "pg_dump exited with exit status: 2");
    }

    #[test]
    fn archive_sub_reasons_are_distinguishable() {
        let dup = LauncherError::Archive {
            path: "a.tar.zst".into(),
            reason: ArchiveFault::DuplicateBackup { name: "x".into() },
        };
        let other = LauncherError::Archive {
            path: "a.tar.zst".into(),
            reason: ArchiveFault::IdentityMismatch {
                expected: "mojave".into(),
                found: "ventura".into(),
            },
        };
        assert!(dup.is_duplicate_backup());
        assert!(!dup.is_identity_mismatch());
        assert!(other.is_identity_mismatch());
    }
}
