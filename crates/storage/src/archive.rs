use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pg_launcher_core::{is_valid_backup_name, ArchiveFault, Backup, BackupMeta, Cause, LauncherError, META_FILE};
use pg_launcher_process::Platform;
use tar::{Archive, Builder as TarBuilder};
use tracing::{info, warn};
use walkdir::WalkDir;
use zstd::stream::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

use crate::backup::BackupManager;

/// Conventional extension of backup archives.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const COMPRESSION_LEVEL: i32 = 3;

type ArchiveReader = Archive<ZstdDecoder<'static, BufReader<File>>>;

/// Moves backups in and out of the backup root as single `.tar.zst` files.
pub struct Archiver {
    backups: Arc<BackupManager>,
}

impl Archiver {
    pub fn new(backups: Arc<BackupManager>) -> Self {
        Self { backups }
    }

    /// Pack every regular file under `source_dir` into `archive_path`, named
    /// `<source-dir-name>/<relative path>`. A partially written archive is removed.
    pub fn zip(&self, archive_path: &Path, source_dir: &Path) -> Result<(), LauncherError> {
        let _entered = self.backups.process().span().enter();
        let reject = |reason| LauncherError::Archive {
            path: archive_path.to_path_buf(),
            reason,
        };
        match fs::metadata(source_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(reject(ArchiveFault::Io(Cause::io(
                    "archive",
                    source_dir,
                    io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                ))))
            }
            Err(err) => return Err(reject(ArchiveFault::Io(Cause::io("read", source_dir, err)))),
        }

        match write_archive(archive_path, source_dir) {
            Ok(files) => {
                info!(archive = %archive_path.display(), files, "archive written");
                Ok(())
            }
            Err(cause) => {
                if let Err(err) = fs::remove_file(archive_path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(archive = %archive_path.display(), error = %err, "failed to remove partial archive");
                    }
                }
                Err(reject(ArchiveFault::Io(cause)))
            }
        }
    }

    /// Validate an archive and unpack it as a new backup.
    ///
    /// Nothing is written unless the archive holds exactly one `.meta` for
    /// this database naming a backup that does not exist yet, and only
    /// regular files.
    pub fn load_backup_archive_file(&self, archive_path: &Path) -> Result<Backup, LauncherError> {
        let _entered = self.backups.process().span().enter();
        let reject = |reason| LauncherError::Archive {
            path: archive_path.to_path_buf(),
            reason,
        };

        let meta = inspect(archive_path).map_err(reject)?;
        let db = self.backups.db();
        if !meta.belongs_to(db) {
            return Err(reject(ArchiveFault::IdentityMismatch {
                expected: db.to_string(),
                found: meta.db_name,
            }));
        }
        if !is_valid_backup_name(&meta.name) {
            return Err(reject(ArchiveFault::InvalidName { name: meta.name }));
        }
        if meta.created_at().is_none() {
            return Err(reject(ArchiveFault::InvalidTimestamp {
                value: meta.backup_time,
            }));
        }

        let _catalog = self.backups.lock_catalog();
        let target = self.backups.backup_root().join(&meta.name);
        let listed = self
            .backups
            .list_locked()?
            .iter()
            .any(|backup| backup.name == meta.name);
        if listed || target.exists() {
            return Err(reject(ArchiveFault::DuplicateBackup { name: meta.name }));
        }

        self.backups
            .create_backup_dir(&target)
            .map_err(|err| reject(ArchiveFault::Io(Cause::io("create", &target, err))))?;
        let platform = self.backups.process().platform();
        if let Err(cause) = extract(archive_path, &target, &**platform) {
            if let Err(err) = fs::remove_dir_all(&target) {
                warn!(path = %target.display(), error = %err, "failed to remove partially loaded backup");
            }
            return Err(reject(ArchiveFault::Io(cause)));
        }

        info!(archive = %archive_path.display(), backup = %meta.name, "backup archive loaded");
        let backup_time = meta.backup_time.clone();
        meta.into_backup(target)
            .ok_or_else(|| reject(ArchiveFault::InvalidTimestamp { value: backup_time }))
    }
}

fn write_archive(archive_path: &Path, source_dir: &Path) -> Result<usize, Cause> {
    let root = source_dir.parent().unwrap_or_else(|| Path::new(""));
    let file = File::create(archive_path).map_err(|err| Cause::io("create", archive_path, err))?;
    let encoder = ZstdEncoder::new(file, COMPRESSION_LEVEL)
        .map_err(|err| Cause::io("compress", archive_path, err))?;
    let mut builder = TarBuilder::new(encoder);

    let mut files = 0;
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| Cause::io("walk", source_dir, err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        builder
            .append_path_with_name(path, entry_name(relative))
            .map_err(|err| Cause::io("add", path, err))?;
        files += 1;
    }

    builder
        .into_inner()
        .and_then(ZstdEncoder::finish)
        .map_err(|err| Cause::io("finish", archive_path, err))?;
    Ok(files)
}

/// Forward-slash name of an archive entry regardless of host separator.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn open_archive(path: &Path) -> Result<ArchiveReader, Cause> {
    let file = File::open(path).map_err(|err| Cause::io("open", path, err))?;
    let decoder = ZstdDecoder::new(file).map_err(|err| Cause::io("decompress", path, err))?;
    Ok(Archive::new(decoder))
}

/// Bare file name an entry is unpacked to, or `None` for names like `..`.
fn unpacked_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
}

/// Walk every entry without writing anything and return the backup metadata.
fn inspect(archive_path: &Path) -> Result<BackupMeta, ArchiveFault> {
    let read_fault = |err| ArchiveFault::Io(Cause::io("read", archive_path, err));
    let mut archive = open_archive(archive_path).map_err(ArchiveFault::Io)?;
    let mut meta = None;
    let mut seen = HashSet::new();

    for entry in archive.entries().map_err(read_fault)? {
        let mut entry = entry.map_err(read_fault)?;
        let path: PathBuf = entry.path().map_err(read_fault)?.into_owned();
        let shown = path.display().to_string();
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            return Err(ArchiveFault::DirectoryEntry { entry: shown });
        }
        if !kind.is_file() {
            return Err(ArchiveFault::UnsupportedEntry { entry: shown });
        }
        let Some(name) = unpacked_name(&path) else {
            return Err(ArchiveFault::UnsupportedEntry { entry: shown });
        };
        if name == META_FILE && meta.is_some() {
            return Err(ArchiveFault::MultipleMetadata);
        }
        if !seen.insert(name.clone()) {
            return Err(ArchiveFault::UnsupportedEntry { entry: shown });
        }
        if name == META_FILE {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw).map_err(read_fault)?;
            meta = Some(BackupMeta::from_bytes(&raw).map_err(|err| ArchiveFault::Io(Cause::Json(err)))?);
        }
    }
    meta.ok_or(ArchiveFault::MissingMetadata)
}

/// Copy every entry into `target`, streaming and keeping each file's mode.
fn extract(archive_path: &Path, target: &Path, platform: &dyn Platform) -> Result<(), Cause> {
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|err| Cause::io("read", archive_path, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| Cause::io("read", archive_path, err))?;
        let path = entry
            .path()
            .map_err(|err| Cause::io("read", archive_path, err))?
            .into_owned();
        let Some(name) = unpacked_name(&path) else {
            continue;
        };
        let dest = target.join(name);
        let mode = entry
            .header()
            .mode()
            .map_err(|err| Cause::io("read", archive_path, err))?;

        let mut out = File::create(&dest).map_err(|err| Cause::io("create", &dest, err))?;
        io::copy(&mut entry, &mut out).map_err(|err| Cause::io("write", &dest, err))?;
        drop(out);
        platform
            .set_mode(&dest, mode)
            .and_then(|()| platform.hand_over(&dest))
            .map_err(|err| Cause::io("secure", &dest, err))?;
    }
    Ok(())
}
