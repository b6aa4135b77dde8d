use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Timelike;
use parking_lot::{Mutex, MutexGuard};
use pg_launcher_core::{
    backup_name, Backup, BackupMeta, BackupRequest, Cause, Clock, DbName, LauncherError, META_FILE,
};
use pg_launcher_process::settings::{MAINTENANCE_DB, SUPERUSER};
use pg_launcher_process::{ProcessManager, Tool};
use tracing::{debug, info, warn};

use crate::migrator::Migrator;

/// Produces, lists, deletes and restores directory-format dumps under the backup root.
///
/// Backup, delete, restore and archive import hold the catalog lock for their
/// whole duration, so the set of backups only changes under it.
pub struct BackupManager {
    process: Arc<ProcessManager>,
    migrator: Arc<Migrator>,
    clock: Arc<dyn Clock>,
    backup_root: PathBuf,
    catalog: Mutex<()>,
}

impl BackupManager {
    pub fn new(
        process: Arc<ProcessManager>,
        migrator: Arc<Migrator>,
        clock: Arc<dyn Clock>,
        backup_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            process,
            migrator,
            clock,
            backup_root: backup_root.into(),
            catalog: Mutex::new(()),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn db(&self) -> DbName {
        self.process.db()
    }

    pub(crate) fn process(&self) -> &ProcessManager {
        &self.process
    }

    pub(crate) fn lock_catalog(&self) -> MutexGuard<'_, ()> {
        self.catalog.lock()
    }

    /// Dump the database into a new backup directory. With `auto`, every
    /// earlier automatic backup of this database is deleted first.
    pub fn backup(&self, auto: bool, request: BackupRequest) -> Result<Backup, LauncherError> {
        let _entered = self.process.span().enter();
        let _catalog = self.lock_catalog();
        self.process.with_running(|| {
            let db = self.db();
            let taken_at = self.clock.now().with_nanosecond(0).unwrap_or_else(|| self.clock.now());
            let name = backup_name(db, auto, taken_at);
            if auto {
                self.delete_auto_backups()?;
            }
            let migration = self.migrator.current_migration_version()?;

            let path = self.backup_root.join(&name);
            self.create_backup_dir(&path)
                .map_err(|err| LauncherError::Backup {
                    operation: "create backup directory",
                    source: Cause::io("create", &path, err),
                })?;

            info!(backup = %name, "dumping database...");
            let settings = self.process.settings();
            let executor = self.process.executor();
            let invocation = executor
                .invocation(
                    Tool::PgDump,
                    [
                        "-Fd".to_owned(),
                        "-f".to_owned(),
                        path.display().to_string(),
                        "-p".to_owned(),
                        settings.port().to_string(),
                        "-h".to_owned(),
                        settings.host().to_owned(),
                        "-U".to_owned(),
                        SUPERUSER.to_owned(),
                        db.to_string(),
                    ],
                )
                .env("PGPASSWORD", settings.password());
            executor
                .run(invocation)
                .map_err(|source| LauncherError::Backup {
                    operation: "dump",
                    source,
                })?;

            let meta = BackupMeta::new(db, auto, taken_at, migration, &request);
            self.write_meta(&path, &meta)?;
            info!(backup = %name, migration, "backup created");
            Ok(Backup {
                name,
                path,
                migration_version: migration,
                created_at: taken_at,
                request,
            })
        })
    }

    /// Valid backups of this database, oldest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>, LauncherError> {
        let _catalog = self.lock_catalog();
        self.list_locked()
    }

    pub fn delete_backup(&self, name: &str) -> Result<(), LauncherError> {
        let _entered = self.process.span().enter();
        let _catalog = self.lock_catalog();
        let backup = self.find_locked(name)?;
        remove_backup_dir(&backup)?;
        info!(backup = %name, "backup deleted");
        Ok(())
    }

    /// Replace the cluster with the contents of backup `name`.
    ///
    /// Refused with [`LauncherError::VersionSkew`] when the backup was taken at
    /// a newer migration than this build ships. The engine is left stopped.
    pub fn restore_database(&self, name: &str) -> Result<(), LauncherError> {
        let _entered = self.process.span().enter();
        let _catalog = self.lock_catalog();
        let backup = self.find_locked(name)?;
        let current = self.migrator.latest_available_version()?;
        if backup.migration_version > current {
            return Err(LauncherError::VersionSkew {
                backup: backup.migration_version,
                current,
            });
        }

        info!(backup = %name, "restoring database...");
        self.process.clear_db().map_err(restore_step("clear data directory"))?;
        self.process.init_data_dir().map_err(restore_step("init data directory"))?;
        self.process.start_db().map_err(restore_step("start"))?;

        let outcome = self.run_restore(&backup);
        let stopped = self.process.stop_db();
        match (outcome, stopped) {
            (Ok(()), Ok(())) => {
                info!(backup = %name, "database restored");
                Ok(())
            }
            (Ok(()), Err(err)) => Err(restore_step("stop")(err)),
            (Err(err), stopped) => {
                if let Err(stop_err) = stopped {
                    warn!(error = %stop_err, "failed to stop database after failed restore");
                }
                Err(err)
            }
        }
    }

    fn run_restore(&self, backup: &Backup) -> Result<(), LauncherError> {
        let settings = self.process.settings();
        let executor = self.process.executor();
        let invocation = executor
            .invocation(
                Tool::PgRestore,
                [
                    "-U".to_owned(),
                    SUPERUSER.to_owned(),
                    "-h".to_owned(),
                    settings.host().to_owned(),
                    "-p".to_owned(),
                    settings.port().to_string(),
                    "-C".to_owned(),
                    "-d".to_owned(),
                    MAINTENANCE_DB.to_owned(),
                    backup.path.display().to_string(),
                ],
            )
            .env("PGPASSWORD", settings.password());
        executor
            .run(invocation)
            .map_err(|source| LauncherError::Restore {
                operation: "pg_restore",
                source,
            })?;
        Ok(())
    }

    pub(crate) fn list_locked(&self) -> Result<Vec<Backup>, LauncherError> {
        let db = self.db();
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(LauncherError::Backup {
                    operation: "list",
                    source: Cause::io("read", &self.backup_root, err),
                })
            }
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let meta = match read_meta(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping directory without valid metadata");
                    continue;
                }
            };
            if !meta.belongs_to(db) {
                debug!(path = %path.display(), owner = %meta.db_name, "skipping backup of another database");
                continue;
            }
            match meta.into_backup(path.clone()) {
                Some(backup) => backups.push(backup),
                None => debug!(path = %path.display(), "skipping backup with unreadable backup_time"),
            }
        }
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(backups)
    }

    pub(crate) fn find_locked(&self, name: &str) -> Result<Backup, LauncherError> {
        self.list_locked()?
            .into_iter()
            .find(|backup| backup.name == name)
            .ok_or_else(|| LauncherError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Create `path` as a fresh directory owned by the service account.
    /// An existing directory of that name is a collision.
    pub(crate) fn create_backup_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.backup_root)?;
        fs::create_dir(path)?;
        self.process.platform().hand_over(path)
    }

    fn delete_auto_backups(&self) -> Result<(), LauncherError> {
        let db = self.db();
        for backup in self.list_locked()?.into_iter().filter(|b| b.is_auto(db)) {
            remove_backup_dir(&backup)?;
            info!(backup = %backup.name, "previous automatic backup removed");
        }
        Ok(())
    }

    fn write_meta(&self, dir: &Path, meta: &BackupMeta) -> Result<(), LauncherError> {
        let path = dir.join(META_FILE);
        let wrap = |source| LauncherError::Backup {
            operation: "write metadata",
            source,
        };
        let bytes = meta.to_bytes().map_err(|err| wrap(Cause::Json(err)))?;
        fs::write(&path, bytes)
            .and_then(|()| self.process.platform().set_mode(&path, 0o600))
            .map_err(|err| wrap(Cause::io("write", &path, err)))
    }
}

pub(crate) fn read_meta(dir: &Path) -> anyhow::Result<BackupMeta> {
    let raw = fs::read(dir.join(META_FILE))?;
    Ok(BackupMeta::from_bytes(&raw)?)
}

fn remove_backup_dir(backup: &Backup) -> Result<(), LauncherError> {
    fs::remove_dir_all(&backup.path).map_err(|err| LauncherError::Backup {
        operation: "delete",
        source: Cause::io("remove", &backup.path, err),
    })
}

fn restore_step(operation: &'static str) -> impl Fn(LauncherError) -> LauncherError {
    move |err| LauncherError::Restore {
        operation,
        source: Cause::Driver(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use pg_launcher_core::BackupRequest;
    use pg_launcher_process::testing::DUMP_TOC;

    use super::*;
    use crate::testing::Workbench;

    fn bench(dir: &tempfile::TempDir) -> Workbench {
        let wb = Workbench::new(dir.path(), DbName::Mojave).unwrap();
        wb.process.init_db(false).unwrap();
        wb.add_migration(1, "users", "CREATE TABLE users ();", None).unwrap();
        wb.migrator.migrate_scheme(None).unwrap();
        wb
    }

    fn request(note: &str) -> BackupRequest {
        BackupRequest {
            note: note.into(),
            version: "2.3.1".into(),
        }
    }

    fn rewrite_migration(backup: &Backup, migration: u64) {
        let mut meta = read_meta(&backup.path).unwrap();
        meta.migration = migration;
        fs::write(backup.path.join(META_FILE), meta.to_bytes().unwrap()).unwrap();
    }

    #[test]
    fn backup_is_listed_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.engine.set_payload("rows: 3");

        let created = wb.backups.backup(false, request("before upgrade")).unwrap();

        let listed = wb.backups.list_backups().unwrap();
        assert_eq!(listed, vec![created.clone()]);
        assert_eq!(listed[0].request, request("before upgrade"));
        assert_eq!(listed[0].migration_version, 1);
        assert!(!listed[0].is_auto(DbName::Mojave));
        assert!(listed[0].path.join(DUMP_TOC).is_file());
        assert!(!wb.engine.is_running());

        wb.backups.restore_database(&created.name).unwrap();

        assert_eq!(wb.engine.restored(), vec!["dump of mojave\nrows: 3".to_owned()]);
        assert!(wb.process.database_already_exists());
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn directory_and_metadata_share_one_name() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let created = wb.backups.backup(true, BackupRequest::default()).unwrap();
        let meta = read_meta(&created.path).unwrap();
        assert_eq!(created.path.file_name().unwrap().to_str(), Some(meta.name.as_str()));
        assert!(meta.name.starts_with("mojave-auto-"));
    }

    #[test]
    fn newer_backup_is_refused_without_touching_the_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let created = wb.backups.backup(false, request("x")).unwrap();
        rewrite_migration(&created, 9);
        let stops = wb.engine.stops();

        let err = wb.backups.restore_database(&created.name).unwrap_err();

        assert!(matches!(err, LauncherError::VersionSkew { backup: 9, current: 1 }));
        assert!(wb.process.database_already_exists());
        assert_eq!(wb.engine.stops(), stops);
        assert!(wb.engine.restored().is_empty());
    }

    #[test]
    fn automatic_backups_keep_a_single_slot() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);

        let first_auto = wb.backups.backup(true, BackupRequest::default()).unwrap();
        let manual = wb.backups.backup(false, request("keep me")).unwrap();
        let second_auto = wb.backups.backup(true, BackupRequest::default()).unwrap();

        let names: Vec<String> = wb
            .backups
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|backup| backup.name)
            .collect();
        assert_eq!(names, vec![manual.name, second_auto.name]);
        assert!(!first_auto.path.exists());
    }

    #[test]
    fn listing_skips_foreign_and_broken_directories() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let ours = wb.backups.backup(false, request("ours")).unwrap();

        let root = wb.backups.backup_root();
        fs::create_dir_all(root.join("no-meta")).unwrap();
        fs::create_dir_all(root.join("garbage")).unwrap();
        fs::write(root.join("garbage").join(META_FILE), b"{not json").unwrap();
        let foreign = BackupMeta::new(DbName::Ventura, false, ours.created_at, 1, &request("theirs"));
        fs::create_dir_all(root.join(&foreign.name)).unwrap();
        fs::write(root.join(&foreign.name).join(META_FILE), foreign.to_bytes().unwrap()).unwrap();
        fs::write(root.join("stray-file"), b"x").unwrap();

        let listed = wb.backups.list_backups().unwrap();
        assert_eq!(listed, vec![ours]);
    }

    #[test]
    fn listing_an_absent_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wb = Workbench::new(dir.path(), DbName::Mojave).unwrap();
        assert!(wb.backups.list_backups().unwrap().is_empty());
    }

    #[test]
    fn delete_removes_only_the_named_backup() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let a = wb.backups.backup(false, request("a")).unwrap();
        let b = wb.backups.backup(false, request("b")).unwrap();

        wb.backups.delete_backup(&a.name).unwrap();

        assert!(!a.path.exists());
        assert_eq!(wb.backups.list_backups().unwrap(), vec![b]);
        let err = wb.backups.delete_backup(&a.name).unwrap_err();
        assert!(matches!(err, LauncherError::NotFound { .. }));
    }

    #[test]
    fn restoring_an_unknown_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        assert!(matches!(
            wb.backups.restore_database("mojave-19990101000000").unwrap_err(),
            LauncherError::NotFound { .. }
        ));
        assert!(matches!(
            wb.backups.restore_database("").unwrap_err(),
            LauncherError::NotFound { .. }
        ));
    }

    #[test]
    fn failed_dump_leaves_an_unlisted_directory() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.engine.fail_next(Tool::PgDump, 1);

        let err = wb.backups.backup(false, request("x")).unwrap_err();

        assert!(matches!(err, LauncherError::Backup { operation: "dump", .. }));
        assert!(wb.backups.list_backups().unwrap().is_empty());
        let leftovers = fs::read_dir(wb.backups.backup_root()).unwrap().count();
        assert_eq!(leftovers, 1);
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn failed_restore_still_stops_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let created = wb.backups.backup(false, request("x")).unwrap();
        wb.engine.fail_next(Tool::PgRestore, 1);

        let err = wb.backups.restore_database(&created.name).unwrap_err();

        assert!(matches!(err, LauncherError::Restore { operation: "pg_restore", .. }));
        assert!(!wb.engine.is_running());
    }

    #[test]
    fn backup_of_a_running_database_leaves_it_running() {
        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        wb.process.start_db().unwrap();
        wb.backups.backup(false, request("live")).unwrap();
        assert!(wb.engine.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn metadata_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let wb = bench(&dir);
        let created = wb.backups.backup(false, request("x")).unwrap();
        let mode = fs::metadata(created.path.join(META_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
