// src/selection.rs

//! Per-package restore selection
//!
//! Every package of the archive (and the no-package bucket, stored under
//! the empty name) has exactly one [`SelectionState`].

use crate::archive::{Archive, internal_name};
use crate::packages::Roster;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Restore intent for one package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectionState {
    /// Do not restore this package
    #[default]
    None,
    /// Restore every file of the package
    All,
    /// Restore only these files (absolute paths)
    Partial(BTreeSet<String>),
}

impl SelectionState {
    pub fn is_selected(&self) -> bool {
        !matches!(self, SelectionState::None)
    }

    /// Build a partial selection from any list of paths
    pub fn partial<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SelectionState::Partial(files.into_iter().map(Into::into).collect())
    }
}

/// Selection state of every package in the archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionModel {
    entries: BTreeMap<String, SelectionState>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default selection: the no-package bucket and every package that is
    /// currently installed are restored completely, the rest is skipped.
    pub fn with_defaults(archive: &Archive, installed: &Roster) -> Self {
        let entries = archive
            .packages
            .iter()
            .map(|p| {
                let state = if p.is_no_package() || installed.contains_key(&p.name) {
                    SelectionState::All
                } else {
                    SelectionState::None
                };
                (p.name.clone(), state)
            })
            .collect();

        Self { entries }
    }

    /// Seed the model from explicit states, without an archive to check
    /// the names against
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = (String, SelectionState)>,
    {
        let entries = states
            .into_iter()
            .map(|(name, state)| (internal_name(&name).to_string(), state))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&SelectionState> {
        self.entries.get(internal_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(internal_name(name))
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.get(name).is_some_and(SelectionState::is_selected)
    }

    /// Change the selection of one package.
    ///
    /// Unknown packages are ignored with a warning; returns whether the
    /// selection was applied.
    pub fn set(&mut self, name: &str, state: SelectionState) -> bool {
        let name = internal_name(name);
        match self.entries.get_mut(name) {
            Some(current) => {
                debug!("Setting selection of '{}' to {:?}", name, state);
                *current = state;
                true
            }
            None => {
                warn!("Package {} is not in archive, cannot be restored!", name);
                false
            }
        }
    }

    /// Select every package completely, except those in `excluded`, which
    /// are deselected
    pub fn select_all(&mut self, excluded: &BTreeSet<String>) {
        for (name, state) in self.entries.iter_mut() {
            *state = if excluded.contains(name) {
                SelectionState::None
            } else {
                SelectionState::All
            };
        }
    }

    pub fn deselect_all(&mut self) {
        for state in self.entries.values_mut() {
            *state = SelectionState::None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SelectionState)> {
        self.entries.iter().map(|(name, state)| (name.as_str(), state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of packages selected at least partially
    pub fn total_packages(&self) -> usize {
        self.entries.values().filter(|s| s.is_selected()).count()
    }

    /// Number of files that will be unpacked from `archive`
    pub fn total_files(&self, archive: &Archive) -> usize {
        self.entries
            .iter()
            .map(|(name, state)| match state {
                SelectionState::None => 0,
                SelectionState::All => archive
                    .package(name)
                    .map_or(0, |p| p.member_files.len()),
                SelectionState::Partial(files) => files.len(),
            })
            .sum()
    }
}
