// src/archive/mod.rs

//! Backup archive model
//!
//! A backup archive is a plain tar container holding a small manifest under
//! `info/` and one compressed subarchive per package. This module holds the
//! in-memory model; reading lives in [`manifest`], multi-volume staging in
//! [`volume`].

pub mod locator;
pub mod manifest;
pub mod pkginfo;
pub mod volume;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use locator::{Locator, Scheme};
pub use manifest::ManifestReader;
pub use volume::{VolumeAssembler, VolumeStatus};

/// Token used at API boundaries (profiles, selection calls) for the
/// no-package bucket, whose internal name is the empty string.
pub const NO_PACKAGE_ID: &str = "_NoPackage_";

/// Subarchive name prefix for files not owned by any package
pub const NO_PACKAGE_ARCHIVE: &str = "NOPACKAGE";

/// Prefix of the package database inside the no-package bucket
pub const RPMDB_PREFIX: &str = "/var/lib/rpm/";

/// Package name the backup roster carries for imported signing keys
pub const SIGNING_KEY_PACKAGE: &str = "gpg-pubkey";

/// Fixed manifest entry names
pub mod entries {
    pub const DATE: &str = "info/date";
    pub const COMMENT: &str = "info/comment";
    pub const HOSTNAME: &str = "info/hostname";
    pub const FILES: &str = "info/files";
    pub const INSTALLED_PACKAGES: &str = "info/installed_packages";
    pub const PACKAGES_INFO: &str = "info/packages_info";
    pub const PACKAGES_INFO_GZ: &str = "info/packages_info.gz";
    pub const COMPLETE_BACKUP: &str = "info/complete_backup";
}

/// Map the external bucket token to the internal (empty) name
pub fn internal_name(name: &str) -> &str {
    if name == NO_PACKAGE_ID { "" } else { name }
}

/// Map an internal package name to the form used in profiles
pub fn external_name(name: &str) -> &str {
    if name.is_empty() { NO_PACKAGE_ID } else { name }
}

/// Descriptive metadata stored with the archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub date: String,
    pub hostname: String,
    pub comment: String,
}

/// One package (or the no-package bucket) captured in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifestEntry {
    /// Empty for the no-package bucket
    pub name: String,
    pub backup_version: String,
    pub description: String,
    pub member_files: Vec<String>,
    pub in_complete_backup: bool,
}

impl PackageManifestEntry {
    pub fn is_no_package(&self) -> bool {
        self.name.is_empty()
    }

    /// `name-version` as written in the complete-backup list
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.backup_version)
    }

    /// Leading part of this package's subarchive name
    pub fn subarchive_stem(&self) -> String {
        if self.is_no_package() {
            NO_PACKAGE_ARCHIVE.to_string()
        } else {
            self.full_name()
        }
    }
}

/// A backup archive opened by the manifest reader
#[derive(Debug, Clone, Default)]
pub struct Archive {
    /// Locator as entered by the caller
    pub input_locator: String,
    /// Local file the container is read from
    pub local_path: PathBuf,
    /// Staged multi-volume parts, in volume order
    pub volume_parts: Vec<PathBuf>,
    pub info: ArchiveInfo,
    /// Container member names from `info/files`
    pub file_list: Vec<String>,
    /// Installed packages at backup time, name -> version
    pub backup_roster: BTreeMap<String, String>,
    /// `name-version` of packages whose whole file set was captured
    pub complete_backup: Vec<String>,
    /// Packages in manifest order
    pub packages: Vec<PackageManifestEntry>,
}

impl Archive {
    pub fn is_multi_volume(&self) -> bool {
        !self.volume_parts.is_empty()
    }

    /// Find a manifest entry by internal or external name
    pub fn package(&self, name: &str) -> Option<&PackageManifestEntry> {
        let name = internal_name(name);
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn no_package_bucket(&self) -> Option<&PackageManifestEntry> {
        self.package("")
    }

    /// Locate the subarchive holding `entry`
    pub fn find_subarchive(&self, entry: &PackageManifestEntry) -> Option<&str> {
        let stem = entry.subarchive_stem();
        self.file_list
            .iter()
            .rev()
            .find(|f| is_subarchive_of(f, &stem))
            .map(String::as_str)
    }
}

/// Check `file` against `{stem}-{8 chars}-{1 char}.{tar|star}...`
pub fn is_subarchive_of(file: &str, stem: &str) -> bool {
    let Some(rest) = file.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('-') else {
        return false;
    };

    let chars: Vec<char> = rest.chars().collect();
    if chars.len() < 11 || chars[8] != '-' || chars[10] != '.' {
        return false;
    }
    if chars[..8].contains(&'-') {
        return false;
    }

    let ext: String = chars[11..].iter().collect();
    ext.starts_with("tar") || ext.starts_with("star")
}

/// Split `name-version-release` into name and `version-release`
pub fn split_package_version(full: &str) -> Option<(&str, &str)> {
    let release_dash = full.rfind('-')?;
    let version_dash = full[..release_dash].rfind('-')?;
    if version_dash == 0 {
        return None;
    }
    Some((&full[..version_dash], &full[version_dash + 1..]))
}
