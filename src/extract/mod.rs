// src/extract/mod.rs

//! Writing selected packages back to disk
//!
//! For every selected package the engine unpacks its subarchive from the
//! backup container into the staging directory, then runs the matching
//! [`ArchiveBackend`] on it. Packages are processed one at a time and the
//! caller's abort predicate is polled while a tool runs.

pub mod backend;
pub mod process;

pub use backend::{ArchiveBackend, Compression, ExtractRequest, StarBackend, TarBackend, backend_for};
pub use process::{CapturedStreams, Job, JobOutcome};

use crate::archive::{Archive, PackageManifestEntry};
use crate::config::{RestoreOptions, ToolPaths};
use crate::error::{Error, Result};
use crate::hooks::{Bootloader, DeclineInstall, ProgressSink, ToolInstaller, backup_package_database};
use crate::rpmdb::widen_for_database;
use crate::selection::{SelectionModel, SelectionState};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Aggregated outcome of one write run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionResult {
    /// Files reported by the tools, minus everything that also failed
    pub restored_files: BTreeSet<String>,
    pub failed_files: BTreeSet<String>,
    /// Packages not classified as completely failed
    pub restored_packages: usize,
    /// The abort predicate fired; remaining packages were skipped
    pub aborted: bool,
    /// Boot loader outcome; `None` when it was not run
    pub bootloader: Option<bool>,
}

impl ExtractionResult {
    pub fn succeeded(&self) -> bool {
        self.failed_files.is_empty()
    }
}

/// What happened to one package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageOutcome {
    Restored,
    Failed,
    Skipped,
    Aborted,
}

/// A null progress sink
struct Silent;

impl ProgressSink for Silent {}

/// Extracts the selected packages of an archive into a target directory
pub struct ExtractionEngine<'a> {
    archive: &'a Archive,
    selection: SelectionModel,
    options: RestoreOptions,
    tools: ToolPaths,
    staging_dir: PathBuf,
    installer: Option<&'a mut dyn ToolInstaller>,
    bootloader: Option<&'a mut dyn Bootloader>,
}

impl<'a> ExtractionEngine<'a> {
    /// `selection` is a snapshot; later changes by the caller do not affect
    /// the run
    pub fn new(archive: &'a Archive, selection: SelectionModel, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive,
            selection,
            options: RestoreOptions::default(),
            tools: ToolPaths::default(),
            staging_dir: staging_dir.into(),
            installer: None,
            bootloader: None,
        }
    }

    pub fn options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    pub fn installer(mut self, installer: &'a mut dyn ToolInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn bootloader(mut self, bootloader: &'a mut dyn Bootloader) -> Self {
        self.bootloader = Some(bootloader);
        self
    }

    /// Selection actually used for the run
    pub fn effective_selection(&self) -> SelectionModel {
        let mut selection = if self.options.complete_restoration {
            SelectionModel::from_states(
                self.archive
                    .packages
                    .iter()
                    .map(|p| (p.name.clone(), SelectionState::All)),
            )
        } else {
            self.selection.clone()
        };

        if self.options.restore_rpmdb() {
            let added = widen_for_database(&mut selection, self.archive);
            debug!("Added {} RPM DB files to the selection", added);
        }
        selection
    }

    /// Restore every selected package below `target_dir`.
    ///
    /// Fails only for a bad target directory or when a required extraction
    /// tool is missing and could not be installed; per-file problems are
    /// collected in the result.
    pub fn write(
        &mut self,
        abort: &mut dyn FnMut() -> bool,
        progress: Option<&mut dyn ProgressSink>,
        target_dir: &Path,
    ) -> Result<ExtractionResult> {
        let mut silent = Silent;
        let progress: &mut dyn ProgressSink = match progress {
            Some(p) => p,
            None => &mut silent,
        };

        if target_dir.as_os_str().is_empty() || target_dir.is_relative() {
            return Err(Error::Validation(format!(
                "Target directory '{}' is not an absolute path",
                target_dir.display()
            )));
        }

        if let Err(e) = fs::create_dir_all(target_dir) {
            let message = format!("Cannot create directory {}: {}", target_dir.display(), e);
            error!("{}", message);
            progress.error(&message);
        }

        if self.options.restore_rpmdb() && !self.options.dry_run {
            backup_package_database(&self.tools.rpmdb_backup_script);
        }
        let selection = self.effective_selection();

        let archive = self.archive;
        let selected: Vec<(&PackageManifestEntry, SelectionState)> = archive
            .packages
            .iter()
            .filter_map(|p| {
                let state = selection.get(&p.name)?;
                state.is_selected().then(|| (p, state.clone()))
            })
            .collect();
        info!(
            "Restoring {} packages ({} files) into {}",
            selected.len(),
            selection.total_files(archive),
            target_dir.display()
        );

        let mut result = ExtractionResult::default();
        let total = selected.len();

        for (index, (entry, state)) in selected.iter().enumerate() {
            progress.package_started(index, total, &entry.name);

            if self.options.dry_run {
                debug!("Dry run: skipping extraction of '{}'", entry.name);
                continue;
            }

            match self.extract_package(entry, state, target_dir, abort, progress, &mut result)? {
                PackageOutcome::Restored => result.restored_packages += 1,
                PackageOutcome::Failed => {
                    warn!("Package '{}' could not be restored", entry.name);
                }
                PackageOutcome::Skipped => {}
                PackageOutcome::Aborted => {
                    result.aborted = true;
                    break;
                }
            }
        }

        // a file restored by one package may be reported failed by another
        let failed = &result.failed_files;
        result.restored_files.retain(|f| !failed.contains(f));

        if self.options.run_bootloader && !self.options.dry_run && !result.aborted {
            match self.bootloader.as_deref_mut() {
                Some(bootloader) => {
                    progress.bootloader_started();
                    result.bootloader = Some(bootloader.reconfigure());
                }
                None => warn!("No boot loader configured, skipping reconfiguration"),
            }
        }

        info!(
            "Restored {} files from {} packages, {} failed{}",
            result.restored_files.len(),
            result.restored_packages,
            result.failed_files.len(),
            if result.aborted { " (aborted)" } else { "" }
        );
        Ok(result)
    }

    fn extract_package(
        &mut self,
        entry: &PackageManifestEntry,
        state: &SelectionState,
        target_dir: &Path,
        abort: &mut dyn FnMut() -> bool,
        progress: &mut dyn ProgressSink,
        result: &mut ExtractionResult,
    ) -> Result<PackageOutcome> {
        let label = if entry.is_no_package() {
            "files not owned by any package".to_string()
        } else {
            entry.name.clone()
        };

        let archive = self.archive;
        let Some(subarchive) = archive.find_subarchive(entry) else {
            let message = format!("Archive for package {} was not found", label);
            error!("{}", message);
            progress.error(&message);
            return Ok(PackageOutcome::Skipped);
        };
        let Some(backend) = backend_for(subarchive, &self.tools) else {
            let message = format!("Unknown archive type: {}", subarchive);
            error!("{}", message);
            progress.error(&message);
            return Ok(PackageOutcome::Skipped);
        };
        self.ensure_available(backend.as_ref())?;

        let filter = match state {
            SelectionState::Partial(files) => Some(
                files
                    .iter()
                    .map(|f| f.trim_start_matches('/').to_string())
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        let attempted: Vec<String> = filter.clone().unwrap_or_else(|| {
            entry
                .member_files
                .iter()
                .map(|f| f.trim_start_matches('/').to_string())
                .collect()
        });

        // take the subarchive out of the container
        debug!("Unpacking {} for {}", subarchive, label);
        let (cmd, input) =
            backend::unpack_member_command(&self.tools.tar, archive, subarchive, &self.staging_dir);
        let unpacked = match Job::start(cmd, &self.staging_dir, input) {
            Ok(mut job) => match job.wait_polling(abort)? {
                JobOutcome::Killed => return Ok(PackageOutcome::Aborted),
                JobOutcome::Finished(status) if status.success() => true,
                JobOutcome::Finished(status) => {
                    error!("Unpacking {} failed: {}", subarchive, status);
                    false
                }
            },
            Err(e) => {
                error!("{}", e);
                false
            }
        };
        if !unpacked {
            progress.error(&format!("Cannot read archive of package {}", label));
            result.failed_files.extend(attempted);
            return Ok(PackageOutcome::Failed);
        }

        let staged = self.staging_dir.join(subarchive);
        let request = ExtractRequest {
            subarchive: &staged,
            target_dir,
            files: filter,
            exclude_rpmdb: !self.options.restore_rpmdb(),
        };

        let outcome = match Job::start(backend.extract_command(&request), &self.staging_dir, None) {
            Ok(mut job) => {
                let outcome = job.wait_polling(abort)?;
                let streams = job.captured()?;
                Some((outcome, streams))
            }
            Err(e) => {
                error!("{}", e);
                None
            }
        };
        if let Err(e) = fs::remove_file(&staged) {
            debug!("Cannot remove {}: {}", staged.display(), e);
        }

        let Some((outcome, streams)) = outcome else {
            result.failed_files.extend(attempted);
            return Ok(PackageOutcome::Failed);
        };

        let restored = backend.restored_files(&streams.stdout);
        let failed: BTreeSet<String> = streams
            .stderr
            .lines()
            .filter_map(|line| backend.failed_file(line))
            .collect();
        debug!(
            "{}: {} files restored, {} failed",
            label,
            restored.len(),
            failed.len()
        );

        let fully_failed =
            !failed.is_empty() && attempted.iter().chain(&restored).all(|f| failed.contains(f));

        result.restored_files.extend(restored);
        result.failed_files.extend(failed);

        Ok(match outcome {
            JobOutcome::Killed => PackageOutcome::Aborted,
            JobOutcome::Finished(_) if fully_failed => PackageOutcome::Failed,
            JobOutcome::Finished(_) => PackageOutcome::Restored,
        })
    }

    /// Offer to install the tool's package when its program is missing
    fn ensure_available(&mut self, backend: &dyn ArchiveBackend) -> Result<()> {
        if backend.is_available() {
            return Ok(());
        }

        warn!("{} is not installed", backend.program().display());
        let mut decline = DeclineInstall;
        let installer: &mut dyn ToolInstaller = match self.installer.as_deref_mut() {
            Some(installer) => installer,
            None => &mut decline,
        };

        if installer.install(backend.package()) && backend.is_available() {
            info!("Installed {}", backend.package());
            Ok(())
        } else {
            Err(Error::ExtractionToolMissing(backend.package().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str, files: &[&str]) -> PackageManifestEntry {
        PackageManifestEntry {
            name: name.to_string(),
            backup_version: version.to_string(),
            description: String::new(),
            member_files: files.iter().map(|f| f.to_string()).collect(),
            in_complete_backup: false,
        }
    }

    fn archive() -> Archive {
        Archive {
            local_path: PathBuf::from("/nonexistent/backup.tar"),
            file_list: vec![
                "NOPACKAGE-20020509-0.tar.gz".to_string(),
                "a-1-1-20020509-0.tar.gz".to_string(),
                "b-2-1-20020509-0.star.gz".to_string(),
            ],
            packages: vec![
                entry("", "", &["/etc/hosts", "/var/lib/rpm/Packages"]),
                entry("a", "1-1", &["/usr/bin/a", "/etc/a.conf"]),
                entry("b", "2-1", &["/usr/bin/b"]),
                entry("c", "3-1", &["/usr/bin/c"]),
            ],
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: Vec<(usize, usize, String)>,
        errors: Vec<String>,
        bootloader: bool,
    }

    impl ProgressSink for Recorder {
        fn package_started(&mut self, index: usize, total: usize, name: &str) {
            self.started.push((index, total, name.to_string()));
        }

        fn bootloader_started(&mut self) {
            self.bootloader = true;
        }

        fn error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    struct FixedBootloader(bool);

    impl Bootloader for FixedBootloader {
        fn reconfigure(&mut self) -> bool {
            self.0
        }
    }

    fn never() -> impl FnMut() -> bool {
        || false
    }

    #[test]
    fn test_relative_target_is_rejected() {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let mut engine = ExtractionEngine::new(&archive, SelectionModel::new(), staging.path());

        for target in ["", "restore/here"] {
            let result = engine.write(&mut never(), None, Path::new(target));
            assert!(matches!(result, Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_dry_run_walks_selected_packages() {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let selection = SelectionModel::from_states([
            (String::new(), SelectionState::All),
            ("a".to_string(), SelectionState::partial(["/etc/a.conf"])),
            ("b".to_string(), SelectionState::None),
            ("c".to_string(), SelectionState::All),
        ]);
        let mut bootloader = FixedBootloader(true);
        let mut recorder = Recorder::default();

        let result = ExtractionEngine::new(&archive, selection, staging.path())
            .options(RestoreOptions {
                dry_run: true,
                ..Default::default()
            })
            .bootloader(&mut bootloader)
            .write(&mut never(), Some(&mut recorder), target.path())
            .unwrap();

        assert_eq!(
            recorder.started,
            vec![
                (0, 3, String::new()),
                (1, 3, "a".to_string()),
                (2, 3, "c".to_string())
            ]
        );
        assert_eq!(result, ExtractionResult::default());
        assert!(!recorder.bootloader);
    }

    #[test]
    fn test_complete_restoration_overrides_selection() {
        let archive = archive();
        let engine = ExtractionEngine::new(&archive, SelectionModel::new(), "/tmp").options(
            RestoreOptions {
                complete_restoration: true,
                ..Default::default()
            },
        );

        let selection = engine.effective_selection();
        assert_eq!(selection.total_packages(), 4);
        assert_eq!(selection.get("c"), Some(&SelectionState::All));
    }

    #[test]
    fn test_rpmdb_restoration_widens_bucket() {
        let archive = archive();
        let selection = SelectionModel::from_states([(String::new(), SelectionState::None)]);
        let engine = ExtractionEngine::new(&archive, selection, "/tmp").options(RestoreOptions {
            restore_rpmdb: Some(true),
            ..Default::default()
        });

        assert_eq!(
            engine.effective_selection().get(""),
            Some(&SelectionState::partial(["/var/lib/rpm/Packages"]))
        );
    }

    #[test]
    fn test_missing_subarchive_is_skipped() {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let selection = SelectionModel::from_states([("c".to_string(), SelectionState::All)]);
        let mut bootloader = FixedBootloader(false);
        let mut recorder = Recorder::default();

        let result = ExtractionEngine::new(&archive, selection, staging.path())
            .bootloader(&mut bootloader)
            .write(&mut never(), Some(&mut recorder), target.path())
            .unwrap();

        assert_eq!(recorder.errors.len(), 1);
        assert!(result.restored_files.is_empty());
        assert!(result.failed_files.is_empty());
        assert_eq!(result.restored_packages, 0);
        assert_eq!(result.bootloader, Some(false));
        assert!(recorder.bootloader);
    }

    #[test]
    fn test_unreadable_container_fails_attempted_files() {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let selection = SelectionModel::from_states([(
            "a".to_string(),
            SelectionState::partial(["/etc/a.conf"]),
        )]);
        let tools = ToolPaths {
            tar: PathBuf::from("false"),
            ..Default::default()
        };

        let result = ExtractionEngine::new(&archive, selection, staging.path())
            .tools(tools)
            .options(RestoreOptions {
                run_bootloader: false,
                ..Default::default()
            })
            .write(&mut never(), None, target.path())
            .unwrap();

        assert_eq!(
            result.failed_files,
            BTreeSet::from(["etc/a.conf".to_string()])
        );
        assert_eq!(result.restored_packages, 0);
        assert!(!result.succeeded());
        assert_eq!(result.bootloader, None);
    }

    /// Archiver stand-in: unpacking creates the requested member, extracting
    /// reports `failures` on stderr
    fn stub_tar(dir: &Path, failures: &[&str]) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let errors: String = failures
            .iter()
            .map(|f| format!("echo 'tar: {}: Cannot open: Permission denied' >&2\n", f))
            .collect();
        let script = format!(
            "#!/bin/sh\n\
             case \" $* \" in\n\
             *\" -v \"*)\n{}exit 2 ;;\n\
             esac\n\
             for member; do :; done\n\
             : > \"$2/$member\"\n",
            errors
        );

        let path = dir.join("tar");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn restore_with_failures(failures: &[&str]) -> ExtractionResult {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let selection = SelectionModel::from_states([("a".to_string(), SelectionState::All)]);
        let tools = ToolPaths {
            tar: stub_tar(bin.path(), failures),
            ..Default::default()
        };

        ExtractionEngine::new(&archive, selection, staging.path())
            .tools(tools)
            .options(RestoreOptions {
                run_bootloader: false,
                ..Default::default()
            })
            .write(&mut never(), None, target.path())
            .unwrap()
    }

    #[test]
    fn test_package_with_some_failed_files_counts_as_restored() {
        let result = restore_with_failures(&["etc/a.conf"]);

        assert_eq!(result.failed_files, BTreeSet::from(["etc/a.conf".to_string()]));
        assert_eq!(result.restored_packages, 1);
        assert!(!result.succeeded());
    }

    #[test]
    fn test_package_with_every_file_failed_is_not_counted() {
        let result = restore_with_failures(&["usr/bin/a", "etc/a.conf"]);

        assert_eq!(result.failed_files.len(), 2);
        assert_eq!(result.restored_packages, 0);
    }

    #[test]
    fn test_missing_star_without_installer() {
        let archive = archive();
        let staging = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let selection = SelectionModel::from_states([("b".to_string(), SelectionState::All)]);
        let tools = ToolPaths {
            star: PathBuf::from("/nonexistent/star"),
            ..Default::default()
        };

        let result = ExtractionEngine::new(&archive, selection, staging.path())
            .tools(tools)
            .write(&mut never(), None, target.path());

        assert!(matches!(result, Err(Error::ExtractionToolMissing(tool)) if tool == "star"));
    }
}
