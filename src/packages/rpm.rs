// src/packages/rpm.rs

//! RPM package database queries

use crate::error::{Error, Result};
use crate::packages::traits::{PackageDatabase, Roster};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Query format producing one `name version release` line per package
const QUERY_FORMAT: &str = "%{NAME} %{VERSION} %{RELEASE}\\n";

/// Installed-package database backed by the `rpm` command
#[derive(Debug, Clone)]
pub struct RpmDatabase {
    rpm_program: PathBuf,
    root: Option<PathBuf>,
}

impl RpmDatabase {
    pub fn new(rpm_program: impl Into<PathBuf>) -> Self {
        Self {
            rpm_program: rpm_program.into(),
            root: None,
        }
    }

    /// Query the database of an alternative root instead of `/`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.rpm_program);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd
    }

    /// Parse `rpm -qa` output in [`QUERY_FORMAT`]
    pub fn parse_query_output(output: &str) -> Roster {
        let mut roster = Roster::new();

        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else {
                continue;
            };
            let version = fields.next().unwrap_or("");
            let release = fields.next().unwrap_or("");
            roster.insert(name.to_string(), format!("{}-{}", version, release));
        }

        roster
    }
}

impl Default for RpmDatabase {
    fn default() -> Self {
        Self::new("rpm")
    }
}

impl PackageDatabase for RpmDatabase {
    fn installed_packages(&self) -> Result<Roster> {
        let output = self
            .command()
            .args(["-qa", "--qf", QUERY_FORMAT])
            .output()
            .map_err(|source| Error::Command {
                program: self.rpm_program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::Validation(format!(
                "Failed to query installed packages ({})",
                output.status
            )));
        }

        let roster = Self::parse_query_output(&String::from_utf8_lossy(&output.stdout));
        debug!("Read {} installed packages", roster.len());
        Ok(roster)
    }

    fn summary(&self, name: &str) -> Option<String> {
        let output = self
            .command()
            .args(["-q", "--qf", "%{SUMMARY}", name])
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Some(summary)
    }
}
