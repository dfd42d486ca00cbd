// src/config.rs

//! Restore options and external tool locations
//!
//! There is no configuration file; the binary fills these from its command
//! line and session profiles carry the restore flags.

use crate::hooks::DEFAULT_RPMDB_BACKUP_SCRIPT;
use std::path::{Path, PathBuf};

/// Flags controlling what a restore run does
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Reconfigure the boot loader after files are restored
    pub run_bootloader: bool,
    /// Restore the package database from the archive; `None` = not decided
    pub restore_rpmdb: Option<bool>,
    /// Restore every package regardless of the selection
    pub complete_restoration: bool,
    /// Walk the selection without extracting anything
    pub dry_run: bool,
    /// Edit a configuration for another machine: the local package
    /// database is not consulted and the installed roster is empty
    pub config_only: bool,
}

impl RestoreOptions {
    pub fn restore_rpmdb(&self) -> bool {
        self.restore_rpmdb == Some(true)
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            run_bootloader: true,
            restore_rpmdb: None,
            complete_restoration: false,
            dry_run: false,
            config_only: false,
        }
    }
}

/// Locations of the external programs the engine drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub tar: PathBuf,
    pub star: PathBuf,
    pub rpmdb_backup_script: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            tar: PathBuf::from("/bin/tar"),
            star: PathBuf::from("/usr/bin/star"),
            rpmdb_backup_script: PathBuf::from(DEFAULT_RPMDB_BACKUP_SCRIPT),
        }
    }
}

/// Whether `program` can be executed: an existing file for paths, a `PATH`
/// lookup for bare names
pub fn program_exists(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    which::which(program).is_ok()
}
