//! Socket discovery by scraping `unix_socket_directories=<path>` assignments.
//!
//! The assignment shows up unquoted in the `-o` string composed for `pg_ctl
//! start` and quoted (`"unix_socket_directories=/tmp"`) in the command line
//! `pg_ctl status` echoes back. Both forms are recognised.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

static SOCKET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s"'])unix_socket_directories=([^\s"']+)"#)
        .expect("socket assignment pattern is valid")
});

/// First assigned socket directory in `text`, without touching the filesystem.
pub fn scan_socket_directory(text: &str) -> Option<PathBuf> {
    SOCKET_ASSIGNMENT
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|value| PathBuf::from(value.as_str()))
}

/// Like [`scan_socket_directory`] but only yields a directory that exists.
pub fn discover_socket_directory(text: &str) -> Option<PathBuf> {
    scan_socket_directory(text)
        .filter(|path| path.exists())
        .map(|path| clean(&path))
}

fn clean(path: &Path) -> PathBuf {
    path.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_unquoted_assignment_in_option_string() {
        let opts = " -c listen_addresses=* -c unix_socket_directories=/var/run/pg -p 5432";
        assert_eq!(scan_socket_directory(opts), Some(PathBuf::from("/var/run/pg")));
    }

    #[test]
    fn finds_quoted_assignment_in_status_output() {
        let status = "pg_ctl: server is running (PID: 812)\n\
            /usr/lib/postgresql/17/bin/postgres \"-D\" \"/srv/data/postgres-linux\" \
            \"-c\" \"shared_buffers=512MB\" \"-c\" \"unix_socket_directories=/tmp\" \"-p\" \"5432\"\n";
        assert_eq!(scan_socket_directory(status), Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn missing_assignment_yields_nothing() {
        assert_eq!(scan_socket_directory("pg_ctl: no server running"), None);
        assert_eq!(scan_socket_directory(""), None);
        assert_eq!(scan_socket_directory("-c my_unix_socket_directories=/tmp"), None);
    }

    #[test]
    fn vanished_directory_is_not_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let present = format!("-c unix_socket_directories={}", tmp.path().display());
        assert_eq!(discover_socket_directory(&present), Some(tmp.path().to_path_buf()));

        let gone = tmp.path().join("gone");
        let absent = format!("-c unix_socket_directories={}", gone.display());
        assert_eq!(discover_socket_directory(&absent), None);
    }

    #[test]
    fn reported_directory_is_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("\"unix_socket_directories={}/./\"", tmp.path().display());
        assert_eq!(discover_socket_directory(&text), Some(tmp.path().to_path_buf()));
    }
}
