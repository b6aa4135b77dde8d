use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use pg_launcher::config::{self, Config};
use pg_launcher::Launcher;
use pg_launcher_core::BackupRequest;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Ensure,
    Init { start: bool },
    Start,
    Stop,
    Status,
    Clear,
    Migrate { step: Option<i32> },
    Version,
    Backup { auto: bool, request: BackupRequest },
    List,
    Delete { name: String },
    Restore { name: String },
    Zip { archive: PathBuf, source: PathBuf },
    Load { archive: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, command) = parse_args(env::args().skip(1).collect())?;
    let launcher_config = cfg.launcher_config(|key| env::var(key).ok())?;
    let launcher = Launcher::new(launcher_config).context("constructing launcher")?;

    run(&launcher, command)
}

fn run(launcher: &Launcher, command: Command) -> Result<()> {
    match command {
        Command::Ensure => launcher.ensure()?,
        Command::Init { start } => launcher.init_db(start)?,
        Command::Start => launcher.start_db()?,
        Command::Stop => launcher.stop_db()?,
        Command::Status => print_json(&launcher.status()?)?,
        Command::Clear => launcher.clear_db()?,
        Command::Migrate { step } => launcher.migrate_scheme(step)?,
        Command::Version => {
            let current = launcher.current_migration_version()?;
            let latest = launcher.latest_available_version()?;
            println!("{current} (latest {latest})");
        }
        Command::Backup { auto, request } => {
            let backup = launcher.backup(auto, request)?;
            info!(name = %backup.name, "backup created");
            print_json(&backup)?;
        }
        Command::List => print_json(&launcher.list_backups()?)?,
        Command::Delete { name } => launcher.delete_backup(&name)?,
        Command::Restore { name } => launcher.restore_database(&name)?,
        Command::Zip { archive, source } => launcher
            .zip(&archive, &source)
            .with_context(|| format!("archiving {source:?} into {archive:?}"))?,
        Command::Load { archive } => {
            let backup = launcher
                .load_backup_archive_file(&archive)
                .with_context(|| format!("loading archive {archive:?}"))?;
            print_json(&backup)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse CLI args, returning the loaded config and the command to run.
fn parse_args(args: Vec<String>) -> Result<(Config, Command)> {
    let mut config_path: Option<PathBuf> = None;
    let mut words: Vec<String> = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => words.push(other.to_owned()),
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, parse_command(&words)?))
}

fn parse_command(words: &[String]) -> Result<Command> {
    let Some((name, rest)) = words.split_first() else {
        return Ok(Command::Ensure);
    };
    let command = match name.as_str() {
        "ensure" => Command::Ensure,
        "init" => Command::Init {
            start: flag(rest, "--start"),
        },
        "start" => Command::Start,
        "stop" => Command::Stop,
        "status" => Command::Status,
        "clear" => Command::Clear,
        "migrate" => Command::Migrate {
            step: option(rest, "--step")?
                .map(|raw| raw.parse().with_context(|| format!("invalid --step {raw:?}")))
                .transpose()?,
        },
        "version" => Command::Version,
        "backup" => Command::Backup {
            auto: flag(rest, "--auto"),
            request: BackupRequest {
                note: option(rest, "--note")?.unwrap_or_default(),
                version: option(rest, "--app-version")?.unwrap_or_default(),
            },
        },
        "list" => Command::List,
        "delete" => Command::Delete {
            name: positional(rest, 0, "delete NAME")?,
        },
        "restore" => Command::Restore {
            name: positional(rest, 0, "restore NAME")?,
        },
        "zip" => Command::Zip {
            archive: positional(rest, 0, "zip ARCHIVE SOURCE_DIR")?.into(),
            source: positional(rest, 1, "zip ARCHIVE SOURCE_DIR")?.into(),
        },
        "load" => Command::Load {
            archive: positional(rest, 0, "load ARCHIVE")?.into(),
        },
        other => bail!("unknown command {other:?}"),
    };
    Ok(command)
}

fn flag(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| arg == name)
}

fn option(args: &[String], name: &str) -> Result<Option<String>> {
    match args.iter().position(|arg| arg == name) {
        Some(at) => match args.get(at + 1) {
            Some(value) => Ok(Some(value.clone())),
            None => bail!("{name} requires a value"),
        },
        None => Ok(None),
    }
}

fn positional(args: &[String], index: usize, usage: &str) -> Result<String> {
    args.iter()
        .filter(|arg| !arg.starts_with("--"))
        .nth(index)
        .cloned()
        .with_context(|| format!("usage: pg-launcher {usage}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|w| (*w).to_owned()).collect()
    }

    #[test]
    fn no_command_means_ensure() {
        let (_, command) = parse_args(vec![]).unwrap();
        assert_eq!(command, Command::Ensure);
    }

    #[test]
    fn parses_backup_options() {
        let command = parse_command(&words(&["backup", "--auto", "--note", "nightly", "--app-version", "2.1"])).unwrap();
        assert_eq!(
            command,
            Command::Backup {
                auto: true,
                request: BackupRequest {
                    note: "nightly".into(),
                    version: "2.1".into(),
                },
            }
        );
    }

    #[test]
    fn parses_negative_steps() {
        let command = parse_command(&words(&["migrate", "--step", "-2"])).unwrap();
        assert_eq!(command, Command::Migrate { step: Some(-2) });
    }

    #[test]
    fn zip_needs_two_paths() {
        let err = parse_command(&words(&["zip", "out.tar.zst"])).unwrap_err();
        assert!(err.to_string().contains("zip ARCHIVE SOURCE_DIR"));
    }

    #[test]
    fn rejects_unknown_commands_and_dangling_config() {
        assert!(parse_command(&words(&["explode"])).is_err());
        assert!(parse_args(words(&["--config"])).is_err());
    }
}
