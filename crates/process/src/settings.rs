use std::net::IpAddr;
use std::path::Path;

use tracing::warn;

/// Cluster superuser every tool connects as.
pub const SUPERUSER: &str = "postgres";
/// Database the restore tool connects to before creating the target.
pub const MAINTENANCE_DB: &str = "postgres";
pub const DEFAULT_LISTEN_ADDRESS: &str = "*";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_PASSWORD: &str = "password";

const LOCALHOST: &str = "localhost";

const TUNING: [&str; 11] = [
    "shared_buffers=512MB",
    "effective_cache_size=1536MB",
    "maintenance_work_mem=128MB",
    "checkpoint_completion_target=0.9",
    "wal_buffers=16MB",
    "default_statistics_target=100",
    "random_page_cost=1.1",
    "work_mem=3276kB",
    "huge_pages=off",
    "min_wal_size=1GB",
    "max_wal_size=4GB",
];

/// How the supervised server listens and how clients reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    listen_address: String,
    port: u16,
    password: String,
    enable_log: bool,
}

impl ServerSettings {
    pub fn new(listen_address: &str, port: u16, password: impl Into<String>, enable_log: bool) -> Self {
        Self {
            listen_address: sanitize_listen_address(listen_address),
            port,
            password: password.into(),
            enable_log,
        }
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    /// Host clients dial; the wildcard listen address is reached via `localhost`.
    pub fn host(&self) -> &str {
        if self.listen_address == DEFAULT_LISTEN_ADDRESS {
            LOCALHOST
        } else {
            &self.listen_address
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn enable_log(&self) -> bool {
        self.enable_log
    }

    pub fn host_port(&self) -> String {
        let host = self.host();
        if host.contains(':') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }

    pub fn database_url(&self, database: &str) -> String {
        format!(
            "postgres://{SUPERUSER}:{}@{}/{database}?sslmode=disable",
            self.password,
            self.host_port()
        )
    }

    /// The `-o` string handed to `pg_ctl`: tuning, listen address, socket directory, port.
    pub fn server_options(&self, socket_dir: Option<&Path>) -> String {
        let mut opts: Vec<String> = TUNING.iter().map(|flag| format!("-c {flag}")).collect();
        opts.push(format!("-c listen_addresses={}", self.listen_address));
        if let Some(dir) = socket_dir {
            opts.push(format!("-c unix_socket_directories={}", dir.display()));
        }
        opts.push(format!("-p {}", self.port));
        opts.iter().map(|opt| format!(" {opt}")).collect()
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_PORT, DEFAULT_PASSWORD, false)
    }
}

/// Only the wildcard and loopback literals are accepted; anything else is
/// narrowed to `localhost`.
pub fn sanitize_listen_address(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() || raw == DEFAULT_LISTEN_ADDRESS {
        return DEFAULT_LISTEN_ADDRESS.to_owned();
    }
    match raw.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => raw.to_owned(),
        _ => {
            warn!(listen = raw, "host is not loopback, set to localhost");
            LOCALHOST.to_owned()
        }
    }
}
