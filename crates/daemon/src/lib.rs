pub mod config;
mod launcher;

pub use launcher::{Launcher, LauncherConfig, LauncherDeps, Status, DEFAULT_VENDOR};
