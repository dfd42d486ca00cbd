// src/packages/traits.rs

//! Common traits for the installed-package database

use crate::error::Result;
use std::collections::BTreeMap;

/// Installed packages, name -> `version-release`
pub type Roster = BTreeMap<String, String>;

/// Query interface to the system's package database
pub trait PackageDatabase {
    /// Read the packages currently installed on the system
    fn installed_packages(&self) -> Result<Roster>;

    /// Get the package summary/description
    ///
    /// Returns `None` when the package is unknown or the lookup fails.
    fn summary(&self, name: &str) -> Option<String>;
}

/// Fixed, in-memory package database
///
/// Stands in for the local system in configuration-only sessions and in
/// tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDatabase {
    pub installed: Roster,
    pub summaries: BTreeMap<String, String>,
}

impl StaticDatabase {
    pub fn new(installed: Roster) -> Self {
        Self {
            installed,
            summaries: BTreeMap::new(),
        }
    }

    pub fn with_summary(mut self, name: &str, summary: &str) -> Self {
        self.summaries.insert(name.to_string(), summary.to_string());
        self
    }
}

impl PackageDatabase for StaticDatabase {
    fn installed_packages(&self) -> Result<Roster> {
        Ok(self.installed.clone())
    }

    fn summary(&self, name: &str) -> Option<String> {
        self.summaries.get(name).cloned()
    }
}
