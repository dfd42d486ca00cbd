// src/session.rs

//! One restore session
//!
//! `RestoreSession` owns everything a restore needs between reading an
//! archive and writing it out: the collaborators, the staging directory,
//! the active mount, the archive model and the selection. There is no
//! global state; callers hold the session and drive it step by step.

use crate::archive::pkginfo::{PackageInfoConverter, TextConverter};
use crate::archive::{Archive, Locator, ManifestReader, VolumeAssembler, VolumeStatus, external_name};
use crate::config::{RestoreOptions, ToolPaths};
use crate::error::{Error, Result};
use crate::extract::{ExtractionEngine, ExtractionResult};
use crate::hooks::{Bootloader, DeclineInstall, ProgressSink, ToolInstaller};
use crate::mount::{SourceLocator, SystemMounter};
use crate::packages::{PackageDatabase, Roster, RpmDatabase};
use crate::reconcile::{MismatchedPackage, PackageReconciler, RosterEntry, selected_packages};
use crate::rpmdb::{self, Proposal};
use crate::selection::{SelectionModel, SelectionState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// External capabilities the session drives
pub struct Collaborators {
    pub source: Box<dyn SourceLocator>,
    pub database: Box<dyn PackageDatabase>,
    pub converter: Box<dyn PackageInfoConverter>,
    pub bootloader: Option<Box<dyn Bootloader>>,
    pub installer: Box<dyn ToolInstaller>,
}

impl Default for Collaborators {
    /// System mounts, the RPM database and the built-in package-info parser;
    /// no boot loader and no automatic tool installation
    fn default() -> Self {
        Self {
            source: Box::new(SystemMounter::default()),
            database: Box::new(RpmDatabase::default()),
            converter: Box::new(TextConverter),
            bootloader: None,
            installer: Box::new(DeclineInstall),
        }
    }
}

/// Selection kind as stored in profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    All,
    None,
    Partial,
}

/// Selection of one package in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSelection {
    pub sel_type: SelectionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sel_files: Vec<String>,
}

impl From<&SelectionState> for ProfileSelection {
    fn from(state: &SelectionState) -> Self {
        match state {
            SelectionState::None => Self {
                sel_type: SelectionKind::None,
                sel_files: Vec::new(),
            },
            SelectionState::All => Self {
                sel_type: SelectionKind::All,
                sel_files: Vec::new(),
            },
            SelectionState::Partial(files) => Self {
                sel_type: SelectionKind::Partial,
                sel_files: files.iter().cloned().collect(),
            },
        }
    }
}

impl From<ProfileSelection> for SelectionState {
    fn from(selection: ProfileSelection) -> Self {
        match selection.sel_type {
            SelectionKind::None => SelectionState::None,
            SelectionKind::All => SelectionState::All,
            SelectionKind::Partial => SelectionState::partial(selection.sel_files),
        }
    }
}

/// Saved restore configuration, replayed by a later session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionProfile {
    /// Primary archive locator followed by the extra volumes
    pub archives: Vec<String>,
    pub run_bootloader: bool,
    #[serde(rename = "restoreRPMdb")]
    pub restore_rpmdb: Option<bool>,
    pub complete_restoration: bool,
    /// Keyed by package name, `_NoPackage_` for the no-package bucket
    pub selection: BTreeMap<String, ProfileSelection>,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            archives: Vec::new(),
            run_bootloader: true,
            restore_rpmdb: None,
            complete_restoration: false,
            selection: BTreeMap::new(),
        }
    }
}

impl SessionProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Overview of the session state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub archive: String,
    pub date: String,
    pub hostname: String,
    pub comment: String,
    pub volumes: usize,
    pub packages: usize,
    pub selected_packages: usize,
    pub selected_files: usize,
    pub run_bootloader: bool,
    pub restore_rpmdb: Option<bool>,
    pub complete_restoration: bool,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Archive:    {}", self.archive)?;
        writeln!(f, "Date:       {}", self.date)?;
        writeln!(f, "Hostname:   {}", self.hostname)?;
        if !self.comment.is_empty() {
            writeln!(f, "Comment:    {}", self.comment)?;
        }
        if self.volumes > 0 {
            writeln!(f, "Volumes:    {}", self.volumes)?;
        }
        writeln!(
            f,
            "Selected:   {} of {} packages, {} files",
            self.selected_packages, self.packages, self.selected_files
        )?;
        if self.complete_restoration {
            writeln!(f, "Complete restoration: all packages are restored")?;
        }
        let rpmdb = match self.restore_rpmdb {
            Some(true) => "yes",
            Some(false) => "no",
            None => "not decided",
        };
        writeln!(f, "Restore RPM database: {}", rpmdb)?;
        write!(
            f,
            "Activate boot loader: {}",
            if self.run_bootloader { "yes" } else { "no" }
        )
    }
}

/// State of one restore from reading the archive to writing it out
pub struct RestoreSession {
    options: RestoreOptions,
    tools: ToolPaths,
    source: Box<dyn SourceLocator>,
    reconciler: PackageReconciler,
    converter: Box<dyn PackageInfoConverter>,
    bootloader: Option<Box<dyn Bootloader>>,
    installer: Box<dyn ToolInstaller>,
    staging: TempDir,
    /// Files staged by the read that produced `archive`
    workspace: Option<TempDir>,
    volumes: VolumeAssembler,
    mount_point: Option<PathBuf>,
    archive: Option<Archive>,
    selection: SelectionModel,
    /// Selection loaded from a profile, applied when the archive is read
    replay_selection: Option<SelectionModel>,
    /// Primary locator followed by the extra volume locators
    locators: Vec<String>,
    modified: bool,
}

impl RestoreSession {
    pub fn new(collaborators: Collaborators) -> Result<Self> {
        Self::with_tools(collaborators, ToolPaths::default())
    }

    pub fn with_tools(collaborators: Collaborators, tools: ToolPaths) -> Result<Self> {
        let staging = tempfile::Builder::new().prefix("restore-").tempdir()?;
        debug!("Staging directory: {}", staging.path().display());
        let volumes = VolumeAssembler::new(staging.path().join("volumes"), &tools.tar);

        Ok(Self {
            options: RestoreOptions::default(),
            tools,
            source: collaborators.source,
            reconciler: PackageReconciler::new(collaborators.database),
            converter: collaborators.converter,
            bootloader: collaborators.bootloader,
            installer: collaborators.installer,
            staging,
            workspace: None,
            volumes,
            mount_point: None,
            archive: None,
            selection: SelectionModel::new(),
            replay_selection: None,
            locators: Vec::new(),
            modified: false,
        })
    }

    pub fn options(&self) -> &RestoreOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RestoreOptions) {
        self.reconciler.set_config_only(options.config_only);
        self.options = options;
        self.modified = true;
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    // Reading

    /// Read the archive behind `input` and initialise the selection.
    ///
    /// A selection loaded from a profile is applied instead of the defaults.
    /// On failure the previous archive, its staged volumes and the selection
    /// are kept.
    pub fn read(&mut self, input: &str) -> Result<()> {
        self.release_mount();

        let mount_dir = self.staging.path().join("mnt");
        let reconciler = &self.reconciler;
        let mut describe = |name: &str| reconciler.description(name);
        let outcome = ManifestReader::new(
            self.source.as_mut(),
            self.converter.as_ref(),
            &self.tools.tar,
            self.staging.path(),
            &mount_dir,
        )
        .read(input, &mut describe)?;

        self.mount_point = outcome.mount_point;
        self.volumes = outcome.volumes;
        self.workspace = Some(outcome.workspace);
        let archive = outcome.archive;

        self.selection = match &self.replay_selection {
            Some(replay) => replay_onto(&archive, replay),
            None => {
                let installed = match self.reconciler.installed() {
                    Ok(roster) => roster.clone(),
                    Err(e) => {
                        warn!("Cannot read installed packages: {}", e);
                        Roster::new()
                    }
                };
                SelectionModel::with_defaults(&archive, &installed)
            }
        };

        self.locators = vec![input.to_string()];
        self.archive = Some(archive);
        Ok(())
    }

    /// Locate the next volume of a multi-volume archive and stage it
    pub fn read_next_volume(&mut self, input: &str) -> Result<VolumeStatus> {
        self.release_mount();

        let locator: Locator = input
            .parse()
            .map_err(|_| Error::SourceUnavailable(input.to_string()))?;
        let mount_dir = self.staging.path().join("mnt");
        let located = self.source.locate(&locator, &mount_dir)?;
        self.mount_point = located.mount_point;

        let status = self.add_volume(&located.file);
        if status.success {
            self.locators.push(input.to_string());
        }
        Ok(status)
    }

    /// Stage a local file as the next volume
    pub fn add_volume(&mut self, path: &Path) -> VolumeStatus {
        let status = self.volumes.add_volume(path);
        if status.success {
            if let Some(archive) = self.archive.as_mut() {
                archive.volume_parts = self.volumes.parts().to_vec();
            }
        }
        status
    }

    pub fn test_all_volumes(&self) -> bool {
        self.volumes.test_all_volumes()
    }

    /// Release the active mount point, if any
    pub fn release_mount(&mut self) {
        if let Some(mount_point) = self.mount_point.take() {
            self.source.release(&mount_point);
        }
    }

    /// Forget the archive and its selection
    pub fn reset_archive(&mut self) {
        info!("Resetting archive");
        self.release_mount();
        self.volumes = VolumeAssembler::new(self.staging.path().join("volumes"), &self.tools.tar);
        self.archive = None;
        self.workspace = None;
        self.selection = SelectionModel::new();
        self.locators.clear();
    }

    /// Forget everything, including options and a loaded profile
    pub fn reset_all(&mut self) {
        self.reset_archive();
        self.options = RestoreOptions::default();
        self.reconciler.set_config_only(false);
        self.reconciler.invalidate();
        self.replay_selection = None;
        self.modified = false;
    }

    // Selection

    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    /// Change one package's selection; `_NoPackage_` names the bucket
    pub fn set_selection(&mut self, name: &str, state: SelectionState) -> bool {
        let applied = self.selection.set(name, state);
        self.modified |= applied;
        applied
    }

    /// Select every package, optionally leaving out missing and mismatched
    /// packages
    pub fn select_all(&mut self, exclude_missing: bool, exclude_mismatched: bool) -> Result<()> {
        let mut excluded = BTreeSet::new();
        if exclude_missing {
            excluded.extend(self.missing_packages()?.into_keys());
        }
        if exclude_mismatched {
            excluded.extend(self.mismatched_packages()?.into_keys());
        }
        debug!("Excluded from selection: {:?}", excluded);

        self.selection.select_all(&excluded);
        self.modified = true;
        Ok(())
    }

    pub fn deselect_all(&mut self) {
        self.selection.deselect_all();
        self.modified = true;
    }

    pub fn total_packages(&self) -> usize {
        self.selection.total_packages()
    }

    pub fn total_files(&self) -> usize {
        self.archive
            .as_ref()
            .map_or(0, |archive| self.selection.total_files(archive))
    }

    // Reconciliation

    fn backup_roster(&self) -> Roster {
        self.archive
            .as_ref()
            .map(|a| a.backup_roster.clone())
            .unwrap_or_default()
    }

    pub fn installed_packages(&mut self) -> Result<Roster> {
        Ok(self.reconciler.installed()?.clone())
    }

    /// Re-read the installed packages on next access
    pub fn invalidate_installed(&mut self) {
        self.reconciler.invalidate();
    }

    pub fn missing_packages(&mut self) -> Result<BTreeMap<String, RosterEntry>> {
        let backup = self.backup_roster();
        self.reconciler.missing(&backup)
    }

    pub fn extra_packages(&mut self) -> Result<BTreeMap<String, RosterEntry>> {
        let backup = self.backup_roster();
        self.reconciler.extra(&backup)
    }

    pub fn mismatched_packages(&mut self) -> Result<BTreeMap<String, MismatchedPackage>> {
        let backup = self.backup_roster();
        self.reconciler.mismatched(&backup)
    }

    /// Selected packages with their backup version
    pub fn selected_packages(&self) -> BTreeMap<String, String> {
        self.archive
            .as_ref()
            .map(|archive| selected_packages(archive, &self.selection))
            .unwrap_or_default()
    }

    // Package database

    pub fn propose_rpmdb_restoration(&mut self) -> Result<Proposal> {
        let archive = self.archive.as_ref().ok_or_else(no_archive)?;
        let sets = self.reconciler.reconcile(archive, &self.selection)?;
        let proposal = rpmdb::propose(archive, &sets);
        info!("RPM DB restoration proposal: {:?}", proposal);
        Ok(proposal)
    }

    pub fn rpmdb_restorable(&self) -> bool {
        self.archive.as_ref().is_some_and(rpmdb::rpmdb_restorable)
    }

    // Writing

    /// Restore the selection below `target_dir`
    pub fn write(
        &mut self,
        abort: &mut dyn FnMut() -> bool,
        progress: Option<&mut dyn ProgressSink>,
        target_dir: &Path,
    ) -> Result<ExtractionResult> {
        let archive = self.archive.as_ref().ok_or_else(no_archive)?;

        let mut engine = ExtractionEngine::new(archive, self.selection.clone(), self.staging.path())
            .options(self.options.clone())
            .tools(self.tools.clone())
            .installer(self.installer.as_mut());
        if let Some(bootloader) = self.bootloader.as_deref_mut() {
            engine = engine.bootloader(bootloader);
        }

        engine.write(abort, progress, target_dir)
    }

    // Profiles

    /// Current configuration as a replayable profile
    pub fn export(&self) -> SessionProfile {
        SessionProfile {
            archives: self.locators.clone(),
            run_bootloader: self.options.run_bootloader,
            restore_rpmdb: self.options.restore_rpmdb,
            complete_restoration: self.options.complete_restoration,
            selection: self
                .selection
                .iter()
                .map(|(name, state)| (external_name(name).to_string(), state.into()))
                .collect(),
        }
    }

    /// Load a profile for replay.
    ///
    /// The selection is applied as is; reading the archive later restricts
    /// it to the packages the archive contains. The installed packages are
    /// still read from the local system unless the options ask for a
    /// configuration-only session.
    pub fn import(&mut self, profile: SessionProfile) {
        info!(
            "Importing profile for {} ({} packages)",
            profile.archives.first().map_or("no archive", String::as_str),
            profile.selection.len()
        );

        self.options.run_bootloader = profile.run_bootloader;
        self.options.restore_rpmdb = profile.restore_rpmdb;
        self.options.complete_restoration = profile.complete_restoration;

        let selection = SelectionModel::from_states(
            profile
                .selection
                .into_iter()
                .map(|(name, selection)| (name, selection.into())),
        );
        self.replay_selection = Some(selection.clone());
        self.selection = selection;
        self.locators = profile.archives;
        self.modified = false;
    }

    /// Archive locators recorded in the session, primary first
    pub fn archive_locators(&self) -> &[String] {
        &self.locators
    }

    // State

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    pub fn archive(&self) -> Option<&Archive> {
        self.archive.as_ref()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            run_bootloader: self.options.run_bootloader,
            restore_rpmdb: self.options.restore_rpmdb,
            complete_restoration: self.options.complete_restoration,
            selected_packages: self.total_packages(),
            selected_files: self.total_files(),
            ..Default::default()
        };
        if let Some(archive) = &self.archive {
            summary.archive = archive.input_locator.clone();
            summary.date = archive.info.date.clone();
            summary.hostname = archive.info.hostname.clone();
            summary.comment = archive.info.comment.clone();
            summary.volumes = archive.volume_parts.len();
            summary.packages = archive.packages.len();
        }
        summary
    }

    // Archive accessors

    pub fn archive_date(&self) -> &str {
        self.archive.as_ref().map_or("", |a| a.info.date.as_str())
    }

    pub fn archive_hostname(&self) -> &str {
        self.archive.as_ref().map_or("", |a| a.info.hostname.as_str())
    }

    pub fn archive_comment(&self) -> &str {
        self.archive.as_ref().map_or("", |a| a.info.comment.as_str())
    }

    /// Local file the archive is read from
    pub fn archive_name(&self) -> Option<&Path> {
        self.archive.as_ref().map(|a| a.local_path.as_path())
    }

    /// Locator the archive was read from
    pub fn input_name(&self) -> &str {
        self.archive.as_ref().map_or("", |a| a.input_locator.as_str())
    }

    pub fn archive_files(&self) -> &[String] {
        self.archive.as_ref().map_or(&[], |a| a.file_list.as_slice())
    }

    pub fn archive_backup_roster(&self) -> Option<&Roster> {
        self.archive.as_ref().map(|a| &a.backup_roster)
    }
}

impl Drop for RestoreSession {
    fn drop(&mut self) {
        self.release_mount();
    }
}

fn no_archive() -> Error {
    Error::Validation("No archive has been read".to_string())
}

/// Restrict a replayed selection to the packages of `archive`
fn replay_onto(archive: &Archive, replay: &SelectionModel) -> SelectionModel {
    for (name, _) in replay.iter() {
        if archive.package(name).is_none() {
            warn!("Package {} is not in archive, cannot be restored!", external_name(name));
        }
    }

    SelectionModel::from_states(archive.packages.iter().map(|p| {
        let state = replay.get(&p.name).cloned().unwrap_or_default();
        (p.name.clone(), state)
    }))
}
