// src/hooks.rs

//! External actions invoked around extraction
//!
//! The engine does not know how to reconfigure a boot loader or install a
//! package; it calls these collaborators and records their outcome.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{error, info, warn};

/// Script backing up the existing package database before it is overwritten
pub const DEFAULT_RPMDB_BACKUP_SCRIPT: &str = "/etc/cron.daily/suse.de-backup-rpmdb";

/// Boot loader reconfiguration, run once after files are restored
pub trait Bootloader {
    /// Returns true when the boot loader was written successfully
    fn reconfigure(&mut self) -> bool;
}

/// Installs a missing extraction tool on demand
pub trait ToolInstaller {
    /// Offer to install `package`; true once it is installed
    fn install(&mut self, package: &str) -> bool;
}

/// Receives progress while archives are written out
pub trait ProgressSink {
    /// Extraction of a package is about to start (`name` is empty for the
    /// no-package bucket)
    fn package_started(&mut self, _index: usize, _total: usize, _name: &str) {}

    /// Boot loader reconfiguration is about to start
    fn bootloader_started(&mut self) {}

    /// A problem the user should see
    fn error(&mut self, _message: &str) {}
}

/// An external command run with fixed arguments
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandHook {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the command; `None` if it could not be started or was killed
    pub fn run_with(&self, extra: &[&str]) -> Option<i32> {
        info!("Running {} {:?} {:?}", self.program.display(), self.args, extra);
        match Command::new(&self.program).args(&self.args).args(extra).status() {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Failed to execute '{}': {}", self.program.display(), e);
                None
            }
        }
    }
}

impl Bootloader for CommandHook {
    fn reconfigure(&mut self) -> bool {
        let code = self.run_with(&[]);
        info!("Boot loader activated: {:?}", code);
        if code != Some(0) {
            error!("Boot loader configuration failed");
        }
        code == Some(0)
    }
}

/// Installs packages with a package-manager command, e.g. `zypper -n install`
impl ToolInstaller for CommandHook {
    fn install(&mut self, package: &str) -> bool {
        let code = self.run_with(&[package]);
        if code != Some(0) {
            error!("Installation of {} failed: {:?}", package, code);
        }
        code == Some(0)
    }
}

/// Never installs anything
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineInstall;

impl ToolInstaller for DeclineInstall {
    fn install(&mut self, package: &str) -> bool {
        warn!("Not installing {}: automatic installation is disabled", package);
        false
    }
}

/// Backs up the current package database when the script exists
pub fn backup_package_database(script: &Path) {
    let present = std::fs::metadata(script).map(|m| m.len() > 0).unwrap_or(false);
    if !present {
        warn!(
            "RPM DB backup script ({}) was not found, DB was not backed up!",
            script.display()
        );
        return;
    }

    info!("Starting RPM backup script ({})", script.display());
    let code = CommandHook::new(script).run_with(&[]);
    info!("RPM backup exit value: {:?}", code);
}
