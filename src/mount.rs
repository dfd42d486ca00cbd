// src/mount.rs

//! Locating and mounting archive sources
//!
//! Only one mount point is active per session; the session releases it
//! before acquiring another one.

use crate::archive::{Locator, Scheme};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{error, info, warn};

/// A locator resolved to a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSource {
    /// Archive file on the local file system
    pub file: PathBuf,
    /// Mount point to release when the source is no longer needed
    pub mount_point: Option<PathBuf>,
}

/// Locate-and-mount capability
pub trait SourceLocator {
    /// Make the archive behind `locator` reachable as a local file.
    ///
    /// `work_dir` is a private directory for mount points.
    fn locate(&mut self, locator: &Locator, work_dir: &Path) -> Result<LocatedSource>;

    /// Release a mount point returned by [`locate`](Self::locate)
    fn release(&mut self, mount_point: &Path);
}

/// Mounts sources read-only with the system `mount`/`umount` commands
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mount_program: PathBuf,
    umount_program: PathBuf,
}

impl SystemMounter {
    pub fn new(mount_program: impl Into<PathBuf>, umount_program: impl Into<PathBuf>) -> Self {
        Self {
            mount_program: mount_program.into(),
            umount_program: umount_program.into(),
        }
    }

    fn mount(&self, source: &str, mount_point: &Path, options: &[&str]) -> Result<()> {
        fs::create_dir_all(mount_point)?;

        let status = Command::new(&self.mount_program)
            .args(options)
            .arg(source)
            .arg(mount_point)
            .status()
            .map_err(|source| Error::Command {
                program: self.mount_program.display().to_string(),
                source,
            })?;

        if !status.success() {
            error!("Mounting {} on {} failed: {}", source, mount_point.display(), status);
            return Err(Error::SourceUnavailable(source.to_string()));
        }
        Ok(())
    }

    /// Mount `device` on `work_dir/<dir>` and return the file inside it
    fn mount_device(
        &self,
        locator: &Locator,
        device: &str,
        work_dir: &Path,
        dir: &str,
    ) -> Result<LocatedSource> {
        let mount_point = work_dir.join(dir);
        self.mount(device, &mount_point, &["-o", "ro"])
            .map_err(|_| Error::SourceUnavailable(locator.to_string()))?;

        Ok(LocatedSource {
            file: mount_point.join(locator.path.trim_start_matches('/')),
            mount_point: Some(mount_point),
        })
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new("mount", "umount")
    }
}

impl SourceLocator for SystemMounter {
    fn locate(&mut self, locator: &Locator, work_dir: &Path) -> Result<LocatedSource> {
        info!("Locating source {}", locator);

        match locator.scheme {
            Scheme::File => Ok(LocatedSource {
                file: PathBuf::from(&locator.path),
                mount_point: None,
            }),
            Scheme::Nfs => {
                let (dir, file) = match locator.path.rsplit_once('/') {
                    Some((dir, file)) => (if dir.is_empty() { "/" } else { dir }, file),
                    None => return Err(Error::SourceUnavailable(locator.to_string())),
                };
                info!("NFS source - server: {}  file: {}", locator.host, locator.path);

                let mount_point = work_dir.join("nfs");
                let options = match locator.port {
                    Some(port) => format!("ro,nolock,port={}", port),
                    None => "ro,nolock".to_string(),
                };
                self.mount(
                    &format!("{}:{}", locator.host, dir),
                    &mount_point,
                    &["-t", "nfs", "-o", &options],
                )
                .map_err(|_| Error::SourceUnavailable(locator.to_string()))?;

                Ok(LocatedSource {
                    file: mount_point.join(file),
                    mount_point: Some(mount_point),
                })
            }
            Scheme::Device => {
                let device = locator
                    .device()
                    .ok_or_else(|| Error::SourceUnavailable(locator.to_string()))?;
                self.mount_device(locator, &device, work_dir, "mount")
            }
            Scheme::Cd(index) => {
                self.mount_device(locator, &format!("/dev/sr{}", index), work_dir, "cd")
            }
            Scheme::Floppy(index) => {
                self.mount_device(locator, &format!("/dev/fd{}", index), work_dir, "fd")
            }
        }
    }

    fn release(&mut self, mount_point: &Path) {
        info!("Unmounting {}", mount_point.display());
        match Command::new(&self.umount_program).arg(mount_point).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Unmounting {} failed: {}", mount_point.display(), status),
            Err(e) => warn!("Failed to run {}: {}", self.umount_program.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_locator_needs_no_mount() {
        let work = tempfile::tempdir().unwrap();
        let mut mounter = SystemMounter::default();
        let loc: Locator = "file:///backup/archive.tar".parse().unwrap();

        let located = mounter.locate(&loc, work.path()).unwrap();
        assert_eq!(located.file, PathBuf::from("/backup/archive.tar"));
        assert_eq!(located.mount_point, None);
    }

    #[test]
    fn test_failed_mount_is_source_unavailable() {
        let work = tempfile::tempdir().unwrap();
        let mut mounter = SystemMounter::new("/nonexistent/mount", "/nonexistent/umount");
        let loc: Locator = "cd1://archive.tar".parse().unwrap();

        let result = mounter.locate(&loc, work.path());
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }
}
