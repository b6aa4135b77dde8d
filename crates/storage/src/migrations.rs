use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use pg_launcher_core::LauncherError;
use regex::Regex;

static MIGRATION_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+)_(.*)\.(up|down)\.sql$").expect("migration file pattern is valid")
});

/// One versioned schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub title: String,
    pub up: String,
    pub down: Option<String>,
}

/// A planned step against the tracked version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<'a> {
    Up(&'a Migration),
    Down {
        migration: &'a Migration,
        /// Version that becomes current once this one is reverted.
        previous: Option<u64>,
    },
}

impl Step<'_> {
    pub fn version(&self) -> u64 {
        match self {
            Step::Up(migration) | Step::Down { migration, .. } => migration.version,
        }
    }
}

/// Ordered migrations of one database, read from
/// `<version>_<title>.up.sql` / `<version>_<title>.down.sql` files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Read `dir`. A missing directory is an empty set; files not following
    /// the naming convention are ignored.
    pub fn load(dir: &Path) -> Result<Self> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("read migrations dir {}", dir.display()))
            }
        };

        let mut files: BTreeMap<u64, (String, Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read migrations dir {}", dir.display()))?;
            let file_name = entry.file_name();
            let Some(caps) = file_name.to_str().and_then(|name| MIGRATION_FILE.captures(name)) else {
                continue;
            };
            let version: u64 = caps[1]
                .parse()
                .with_context(|| format!("migration version in {:?}", file_name))?;
            if version == 0 {
                bail!("migration {:?} has version 0; versions start at 1", file_name);
            }
            let slot = files
                .entry(version)
                .or_insert_with(|| (caps[2].to_owned(), None, None));
            if slot.0 != caps[2] {
                bail!("migration {version} has conflicting titles {:?} and {:?}", slot.0, &caps[2]);
            }
            let target = if &caps[3] == "up" { &mut slot.1 } else { &mut slot.2 };
            if target.replace(entry.path()).is_some() {
                bail!("duplicate migration file {:?}", file_name);
            }
        }

        let mut migrations = Vec::with_capacity(files.len());
        for (version, (title, up, down)) in files {
            let up = up.ok_or_else(|| anyhow!("migration {version}_{title} has no up script"))?;
            migrations.push(Migration {
                version,
                up: read_script(&up)?,
                down: down.as_deref().map(read_script).transpose()?,
                title,
            });
        }
        Ok(Self { migrations })
    }

    pub fn from_migrations(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|migration| migration.version);
        Self { migrations }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Highest version available; 0 when there are none.
    pub fn latest_version(&self) -> u64 {
        self.migrations.last().map_or(0, |migration| migration.version)
    }

    /// Steps that move `current` by `step` (all pending when `None`).
    ///
    /// Rejects the whole request up front when it reaches past either end or
    /// needs a down script that does not exist.
    pub fn plan(&self, current: u64, step: Option<i32>) -> Result<Vec<Step<'_>>, LauncherError> {
        let applied = self.applied_count(current)?;
        let pending = self.migrations.len() - applied;
        let out_of_range = |requested: i32| LauncherError::MigrationStep {
            requested,
            applied,
            available: pending,
        };

        match step {
            None => Ok(self.migrations[applied..].iter().map(Step::Up).collect()),
            Some(n) if n >= 0 => {
                let n = n as usize;
                if n > pending {
                    return Err(out_of_range(n as i32));
                }
                Ok(self.migrations[applied..applied + n].iter().map(Step::Up).collect())
            }
            Some(n) => {
                let back = n.unsigned_abs() as usize;
                if back > applied {
                    return Err(out_of_range(n));
                }
                (0..back)
                    .map(|offset| {
                        let idx = applied - 1 - offset;
                        let migration = &self.migrations[idx];
                        if migration.down.is_none() {
                            return Err(plan_error(anyhow!(
                                "migration {}_{} has no down script",
                                migration.version,
                                migration.title
                            )));
                        }
                        let previous = idx.checked_sub(1).map(|prev| self.migrations[prev].version);
                        Ok(Step::Down {
                            migration,
                            previous,
                        })
                    })
                    .collect()
            }
        }
    }

    fn applied_count(&self, current: u64) -> Result<usize, LauncherError> {
        if current == 0 {
            return Ok(0);
        }
        self.migrations
            .iter()
            .position(|migration| migration.version == current)
            .map(|idx| idx + 1)
            .ok_or_else(|| plan_error(anyhow!("no migration found for version {current}")))
    }
}

fn plan_error(err: anyhow::Error) -> LauncherError {
    LauncherError::Migration {
        operation: "plan",
        source: err.into(),
    }
}

fn read_script(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read migration {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn sample() -> MigrationSet {
        MigrationSet::from_migrations(
            [(3, false), (1, true), (2, true)]
                .into_iter()
                .map(|(version, down)| Migration {
                    version,
                    title: format!("m{version}"),
                    up: format!("up {version}"),
                    down: down.then(|| format!("down {version}")),
                })
                .collect(),
        )
    }

    fn versions(steps: &[Step<'_>]) -> Vec<u64> {
        steps.iter().map(Step::version).collect()
    }

    #[test]
    fn loads_paired_files_in_version_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10_add_orders.up.sql", "CREATE TABLE orders ();");
        write(dir.path(), "10_add_orders.down.sql", "DROP TABLE orders;");
        write(dir.path(), "2_init.up.sql", "CREATE TABLE users ();");
        write(dir.path(), "README.md", "ignored");

        let set = MigrationSet::load(dir.path()).unwrap();

        let loaded: Vec<_> = set.migrations().iter().map(|m| (m.version, m.title.as_str())).collect();
        assert_eq!(loaded, vec![(2, "init"), (10, "add_orders")]);
        assert_eq!(set.migrations()[1].down.as_deref(), Some("DROP TABLE orders;"));
        assert_eq!(set.migrations()[0].down, None);
        assert_eq!(set.latest_version(), 10);
    }

    #[test]
    fn missing_directory_is_an_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let set = MigrationSet::load(&dir.path().join("absent")).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.latest_version(), 0);
    }

    #[test]
    fn down_without_up_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_init.down.sql", "DROP TABLE users;");
        let err = MigrationSet::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no up script"));
    }

    #[test]
    fn plans_everything_pending_without_a_step() {
        let set = sample();
        assert_eq!(versions(&set.plan(0, None).unwrap()), vec![1, 2, 3]);
        assert_eq!(versions(&set.plan(2, None).unwrap()), vec![3]);
        assert!(set.plan(3, None).unwrap().is_empty());
    }

    #[test]
    fn forward_steps_are_bounded_by_pending() {
        let set = sample();
        assert_eq!(versions(&set.plan(1, Some(1)).unwrap()), vec![2]);
        let err = set.plan(1, Some(3)).unwrap_err();
        assert!(matches!(
            err,
            LauncherError::MigrationStep {
                requested: 3,
                applied: 1,
                available: 2
            }
        ));
    }

    #[test]
    fn backward_steps_never_go_below_zero() {
        let set = sample();
        let steps = set.plan(2, Some(-2)).unwrap();
        assert_eq!(
            steps
                .iter()
                .map(|step| match step {
                    Step::Down { previous, .. } => *previous,
                    Step::Up(_) => unreachable!(),
                })
                .collect::<Vec<_>>(),
            vec![Some(1), None]
        );
        assert!(matches!(
            set.plan(1, Some(-2)).unwrap_err(),
            LauncherError::MigrationStep { requested: -2, .. }
        ));
    }

    #[test]
    fn reverting_without_a_down_script_fails_before_any_step() {
        let set = sample();
        let err = set.plan(3, Some(-1)).unwrap_err();
        assert!(matches!(err, LauncherError::Migration { operation: "plan", .. }));
    }

    #[test]
    fn unknown_current_version_is_reported() {
        let set = sample();
        let err = set.plan(7, None).unwrap_err();
        assert!(err.to_string().contains("no migration found for version 7"));
    }
}
