use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::launcher::LauncherConfig;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub migrate: MigrateConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub enable_log: Option<bool>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    pub bin: Option<String>,
    pub app_root: Option<String>,
    pub migrations: Option<String>,
    pub password_dir: Option<String>,
    pub vendor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MigrateConfig {
    pub connect_attempts: Option<u32>,
    pub connect_delay_ms: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

impl Config {
    /// Merge file settings under the `PG_LAUNCHER_*` variables returned by `env`.
    pub fn launcher_config(&self, env: impl Fn(&str) -> Option<String>) -> Result<LauncherConfig> {
        let mut out = LauncherConfig::default();

        out.db = env("PG_LAUNCHER_DB")
            .or_else(|| self.database.name.clone())
            .unwrap_or_default();
        if let Some(listen) = env("PG_LAUNCHER_LISTEN").or_else(|| self.server.listen.clone()) {
            out.listen_address = listen;
        }
        if let Some(raw) = env("PG_LAUNCHER_PORT") {
            out.port = raw
                .parse()
                .with_context(|| format!("invalid PG_LAUNCHER_PORT {raw:?}"))?;
        } else if let Some(port) = self.server.port {
            out.port = port;
        }
        if let Some(password) = env("PG_LAUNCHER_PASSWORD").or_else(|| self.database.password.clone()) {
            out.password = password;
        }
        out.binary_root = env("PG_LAUNCHER_BIN")
            .or_else(|| self.paths.bin.clone())
            .map(PathBuf::from);
        out.app_root = env("PG_LAUNCHER_APP_ROOT")
            .or_else(|| self.paths.app_root.clone())
            .map(PathBuf::from);
        out.migrations_root = env("PG_LAUNCHER_MIGRATIONS")
            .or_else(|| self.paths.migrations.clone())
            .map(PathBuf::from);
        out.password_dir = self.paths.password_dir.clone().map(PathBuf::from);
        if let Some(vendor) = self.paths.vendor.clone() {
            out.vendor = vendor;
        }

        out.verbose = self.server.verbose.unwrap_or(false);
        out.enable_log = self.server.enable_log.unwrap_or(false);
        if let Some(attempts) = self.migrate.connect_attempts {
            out.connect_attempts = attempts;
        }
        if let Some(ms) = self.migrate.connect_delay_ms {
            out.connect_delay = Duration::from_millis(ms);
        }
        Ok(out)
    }
}
