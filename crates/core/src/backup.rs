use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::identity::DbName;

/// File name of the metadata document inside every backup directory.
pub const META_FILE: &str = ".meta";

/// `YYYYMMDDHHMMSS`, used both in backup names and in `backup_time`.
pub const TIMESTAMP_LAYOUT: &str = "%Y%m%d%H%M%S";

/// Caller-supplied free text stored alongside a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub note: String,
    pub version: String,
}

/// One completed dump found in the backup root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub name: String,
    pub path: PathBuf,
    /// Schema migration version of the source database when the dump was taken.
    pub migration_version: u64,
    /// Local wall-clock time recorded in `backup_time`.
    pub created_at: NaiveDateTime,
    #[serde(flatten)]
    pub request: BackupRequest,
}

impl Backup {
    pub fn is_auto(&self, db: DbName) -> bool {
        is_auto_backup_name(db, &self.name)
    }
}

/// On-disk shape of `.meta`. Field order is part of the format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub db_name: String,
    pub name: String,
    pub note: String,
    pub version: String,
    pub migration: u64,
    pub backup_time: String,
}

impl BackupMeta {
    pub fn new(
        db: DbName,
        auto: bool,
        taken_at: NaiveDateTime,
        migration: u64,
        request: &BackupRequest,
    ) -> Self {
        Self {
            db_name: db.as_str().to_owned(),
            name: backup_name(db, auto, taken_at),
            note: request.note.clone(),
            version: request.version.clone(),
            migration,
            backup_time: format_timestamp(taken_at),
        }
    }

    pub fn belongs_to(&self, db: DbName) -> bool {
        self.db_name == db.as_str()
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.backup_time)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Builds the listing record, or `None` when `backup_time` is unreadable.
    pub fn into_backup(self, path: PathBuf) -> Option<Backup> {
        let created_at = self.created_at()?;
        Some(Backup {
            name: self.name,
            path,
            migration_version: self.migration,
            created_at,
            request: BackupRequest {
                note: self.note,
                version: self.version,
            },
        })
    }
}

pub fn backup_name(db: DbName, auto: bool, taken_at: NaiveDateTime) -> String {
    let stamp = format_timestamp(taken_at);
    if auto {
        format!("{db}-auto-{stamp}")
    } else {
        format!("{db}-{stamp}")
    }
}

pub fn is_auto_backup_name(db: DbName, name: &str) -> bool {
    name.starts_with(&format!("{db}-auto-"))
}

/// A backup name must be usable as a single directory component.
pub fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_LAYOUT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_LAYOUT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 13)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn names_mark_automatic_backups() {
        assert_eq!(backup_name(DbName::Mojave, false, at(1, 2, 3)), "mojave-20260213010203");
        assert_eq!(
            backup_name(DbName::Mojave, true, at(1, 2, 3)),
            "mojave-auto-20260213010203"
        );
        assert!(is_auto_backup_name(DbName::Mojave, "mojave-auto-20260213010203"));
        assert!(!is_auto_backup_name(DbName::Mojave, "mojave-20260213010203"));
        assert!(!is_auto_backup_name(DbName::Ventura, "mojave-auto-20260213010203"));
    }

    #[test]
    fn meta_serializes_in_on_disk_field_order() {
        let request = BackupRequest {
            note: "before upgrade".into(),
            version: "1.4.0".into(),
        };
        let meta = BackupMeta::new(DbName::Phoenix, false, at(10, 0, 0), 7, &request);
        let raw = String::from_utf8(meta.to_bytes().unwrap()).unwrap();
        assert_eq!(
            raw,
            r#"{"db_name":"phoenix","name":"phoenix-20260213100000","note":"before upgrade","version":"1.4.0","migration":7,"backup_time":"20260213100000"}"#
        );
        assert_eq!(BackupMeta::from_bytes(raw.as_bytes()).unwrap(), meta);
    }

    #[test]
    fn unreadable_backup_time_yields_no_record() {
        let mut meta = BackupMeta::new(DbName::Phoenix, false, at(10, 0, 0), 1, &BackupRequest::default());
        meta.backup_time = "2026-02-13".into();
        assert!(meta.into_backup(PathBuf::from("/tmp/x")).is_none());
    }

    #[test]
    fn backup_names_are_single_path_components() {
        assert!(is_valid_backup_name("mojave-20260213010203"));
        for bad in ["", ".", "..", "../x", "a/b", "a\\b"] {
            assert!(!is_valid_backup_name(bad), "{bad:?}");
        }
    }
}
