// src/archive/pkginfo.rs

//! Package-info blob conversion
//!
//! `info/packages_info` maps every backed-up package to the files stored in
//! its subarchive. Converters turn the raw blob into a name -> info map; the
//! no-package bucket is keyed by the empty string.

use super::split_package_version;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Version and file list of one backed-up package
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageInfo {
    #[serde(rename = "vers", default)]
    pub version: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Converted package info, keyed by package name ("" = no package)
pub type PackageInfoMap = BTreeMap<String, PackageInfo>;

/// Turns the (already decompressed) package-info blob into a structured map
pub trait PackageInfoConverter {
    fn convert(&self, blob_path: &Path) -> Result<PackageInfoMap>;
}

/// Built-in parser for the plain-text package-info format:
///
/// ```text
/// Package: bash-5.1-3
/// /bin/bash
/// /etc/bash.bashrc
/// Nopackage:
/// /etc/hosts
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TextConverter;

impl TextConverter {
    pub fn parse(content: &str) -> Result<PackageInfoMap> {
        let mut packages = PackageInfoMap::new();
        let mut current: Option<String> = None;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }

            if let Some(full) = line.strip_prefix("Package:") {
                let full = full.trim();
                let (name, version) = split_package_version(full).unwrap_or((full, ""));
                packages.entry(name.to_string()).or_insert_with(|| PackageInfo {
                    version: version.to_string(),
                    files: Vec::new(),
                });
                current = Some(name.to_string());
            } else if line.starts_with("Nopackage:") {
                packages.entry(String::new()).or_default();
                current = Some(String::new());
            } else {
                let Some(name) = current.as_ref() else {
                    return Err(Error::Validation(format!(
                        "Package info line {} lists a file outside any package",
                        lineno + 1
                    )));
                };
                if let Some(info) = packages.get_mut(name) {
                    info.files.push(line.to_string());
                }
            }
        }

        Ok(packages)
    }
}

impl PackageInfoConverter for TextConverter {
    fn convert(&self, blob_path: &Path) -> Result<PackageInfoMap> {
        let content = std::fs::read_to_string(blob_path)?;
        let packages = Self::parse(&content)?;
        info!("Read {} packages", packages.len());
        Ok(packages)
    }
}

/// External converter: reads the blob on stdin and prints a JSON object
/// `{"name": {"vers": "...", "files": [...]}}` on stdout
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: PathBuf,
}

impl CommandConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PackageInfoConverter for CommandConverter {
    fn convert(&self, blob_path: &Path) -> Result<PackageInfoMap> {
        debug!("Converting package info with {}", self.program.display());

        let input = File::open(blob_path)?;
        let output = Command::new(&self.program)
            .stdin(Stdio::from(input))
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| Error::Command {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::Validation(format!(
                "Package info converter {} failed ({})",
                self.program.display(),
                output.status
            )));
        }

        let packages: PackageInfoMap = serde_json::from_slice(&output.stdout)?;
        info!("Read {} packages", packages.len());
        Ok(packages)
    }
}
