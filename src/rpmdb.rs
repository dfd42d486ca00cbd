// src/rpmdb.rs

//! Package-database restoration advice
//!
//! The backup carries the RPM database in the no-package bucket. Restoring
//! it only keeps the system consistent when the restored files and the
//! restored database describe the same set of packages.

use crate::archive::{Archive, RPMDB_PREFIX};
use crate::reconcile::{ReconciliationSets, RosterEntry};
use crate::selection::{SelectionModel, SelectionState};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Files whose presence means the archive holds a restorable database
const RPMDB_MARKERS: [&str; 2] = ["/var/lib/rpm/Packages", "/var/lib/rpm/rpmdb.sqlite"];

/// Details for the caller when neither choice keeps the system consistent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conflicts {
    /// Selected packages installed in another version, name -> `name-installed_version`
    pub mismatched: BTreeMap<String, String>,
    pub missing: BTreeMap<String, RosterEntry>,
    pub extra: BTreeMap<String, RosterEntry>,
}

/// Recommendation for restoring the package database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Restore,
    DoNotRestore,
    Ambiguous(Conflicts),
}

/// The four facts the recommendation is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionInputs {
    pub extra_empty: bool,
    pub all_complete_selected: bool,
    pub missing_subset_of_complete: bool,
    pub selected_consistent_with_roster: bool,
}

/// Outcome of the decision table, before conflict details are attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Restore,
    DoNotRestore,
    Ambiguous,
}

impl DecisionInputs {
    pub fn evaluate(archive: &Archive, sets: &ReconciliationSets) -> Self {
        let complete: BTreeSet<&str> = archive.complete_backup.iter().map(String::as_str).collect();
        let selected: BTreeSet<String> = sets
            .selected
            .iter()
            .map(|(name, version)| format!("{}-{}", name, version))
            .collect();

        let inputs = Self {
            extra_empty: sets.extra.is_empty(),
            all_complete_selected: complete.iter().all(|full| selected.contains(*full)),
            missing_subset_of_complete: sets.missing.iter().all(|(name, entry)| {
                complete.contains(format!("{}-{}", name, entry.version).as_str())
            }),
            selected_consistent_with_roster: sets.selected.keys().all(|name| {
                !sets.missing.contains_key(name) && !sets.mismatched.contains_key(name)
            }),
        };
        debug!("RPM DB decision inputs: {:?}", inputs);
        inputs
    }

    pub fn decide(&self) -> Decision {
        match (
            self.extra_empty,
            self.all_complete_selected,
            self.missing_subset_of_complete,
            self.selected_consistent_with_roster,
        ) {
            (true, true, true, _) => Decision::Restore,
            (_, _, _, true) => Decision::DoNotRestore,
            (_, _, _, false) => Decision::Ambiguous,
        }
    }
}

/// Recommend whether the package database should be restored
pub fn propose(archive: &Archive, sets: &ReconciliationSets) -> Proposal {
    match DecisionInputs::evaluate(archive, sets).decide() {
        Decision::Restore => Proposal::Restore,
        Decision::DoNotRestore => Proposal::DoNotRestore,
        Decision::Ambiguous => {
            let mismatched = sets
                .mismatched
                .iter()
                .filter(|(name, _)| sets.selected.contains_key(*name))
                .map(|(name, p)| (name.clone(), format!("{}-{}", name, p.installed_version)))
                .collect();

            Proposal::Ambiguous(Conflicts {
                mismatched,
                missing: sets.missing.clone(),
                extra: sets.extra.clone(),
            })
        }
    }
}

/// Whether the archive carries a package database
pub fn rpmdb_restorable(archive: &Archive) -> bool {
    archive.no_package_bucket().is_some_and(|bucket| {
        bucket
            .member_files
            .iter()
            .any(|f| RPMDB_MARKERS.contains(&f.as_str()))
    })
}

/// Make sure the database files of the no-package bucket get restored.
///
/// A deselected bucket becomes a partial selection of exactly the database
/// files; a partial bucket gains them. Returns how many files were added.
pub fn widen_for_database(selection: &mut SelectionModel, archive: &Archive) -> usize {
    let Some(bucket) = archive.no_package_bucket() else {
        return 0;
    };
    let db_files: Vec<&String> = bucket
        .member_files
        .iter()
        .filter(|f| f.starts_with(RPMDB_PREFIX))
        .collect();
    debug!("Found RPM DB files: {:?}", db_files);

    let (state, added) = match selection.get("") {
        Some(SelectionState::All) => return 0,
        Some(SelectionState::Partial(current)) => {
            let mut widened = current.clone();
            let before = widened.len();
            widened.extend(db_files.into_iter().cloned());
            let added = widened.len() - before;
            (SelectionState::Partial(widened), added)
        }
        Some(SelectionState::None) | None => {
            let files: BTreeSet<String> = db_files.into_iter().cloned().collect();
            let added = files.len();
            (SelectionState::Partial(files), added)
        }
    };

    if selection.contains("") {
        selection.set("", state);
    } else {
        let mut entries: Vec<(String, SelectionState)> = selection
            .iter()
            .map(|(n, s)| (n.to_string(), s.clone()))
            .collect();
        entries.push((String::new(), state));
        *selection = SelectionModel::from_states(entries);
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackageManifestEntry;
    use crate::reconcile::MismatchedPackage;

    fn entry(name: &str, version: &str, files: &[&str]) -> PackageManifestEntry {
        PackageManifestEntry {
            name: name.to_string(),
            backup_version: version.to_string(),
            description: String::new(),
            member_files: files.iter().map(|f| f.to_string()).collect(),
            in_complete_backup: false,
        }
    }

    fn roster_entry(version: &str) -> RosterEntry {
        RosterEntry {
            version: version.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_decision_table() {
        let row = |e, a, m, s| DecisionInputs {
            extra_empty: e,
            all_complete_selected: a,
            missing_subset_of_complete: m,
            selected_consistent_with_roster: s,
        };

        assert_eq!(row(true, true, true, false).decide(), Decision::Restore);
        assert_eq!(row(true, true, true, true).decide(), Decision::Restore);
        assert_eq!(row(false, true, true, true).decide(), Decision::DoNotRestore);
        assert_eq!(row(true, false, true, true).decide(), Decision::DoNotRestore);
        assert_eq!(row(true, true, false, false).decide(), Decision::Ambiguous);
        assert_eq!(row(false, false, false, false).decide(), Decision::Ambiguous);
    }

    #[test]
    fn test_restore_when_complete_set_selected() {
        let archive = Archive {
            complete_backup: vec!["a-1".to_string(), "b-1".to_string()],
            ..Default::default()
        };
        let sets = ReconciliationSets {
            missing: BTreeMap::from([("b".to_string(), roster_entry("1"))]),
            selected: BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        };

        assert_eq!(propose(&archive, &sets), Proposal::Restore);
    }

    #[test]
    fn test_missing_selected_with_extra_is_ambiguous() {
        // A installed and selected, B missing and selected, C extra
        let archive = Archive::default();
        let sets = ReconciliationSets {
            missing: BTreeMap::from([("B".to_string(), roster_entry("1"))]),
            extra: BTreeMap::from([("C".to_string(), roster_entry("1"))]),
            selected: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        };

        match propose(&archive, &sets) {
            Proposal::Ambiguous(conflicts) => {
                assert!(conflicts.missing.contains_key("B"));
                assert!(conflicts.extra.contains_key("C"));
            }
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_do_not_restore_when_only_installed_selected() {
        let archive = Archive::default();
        let sets = ReconciliationSets {
            extra: BTreeMap::from([("C".to_string(), roster_entry("1"))]),
            mismatched: BTreeMap::from([(
                "D".to_string(),
                MismatchedPackage {
                    backup_version: "1".to_string(),
                    installed_version: "2".to_string(),
                    description: None,
                },
            )]),
            selected: BTreeMap::from([("A".to_string(), "1".to_string())]),
            ..Default::default()
        };

        assert_eq!(propose(&archive, &sets), Proposal::DoNotRestore);
    }

    #[test]
    fn test_ambiguous_lists_selected_mismatches_only() {
        let archive = Archive::default();
        let mismatch = |inst: &str| MismatchedPackage {
            backup_version: "1".to_string(),
            installed_version: inst.to_string(),
            description: None,
        };
        let sets = ReconciliationSets {
            extra: BTreeMap::from([("C".to_string(), roster_entry("1"))]),
            mismatched: BTreeMap::from([
                ("D".to_string(), mismatch("2")),
                ("E".to_string(), mismatch("3")),
            ]),
            selected: BTreeMap::from([("D".to_string(), "1".to_string())]),
            ..Default::default()
        };

        let Proposal::Ambiguous(conflicts) = propose(&archive, &sets) else {
            panic!("expected Ambiguous");
        };
        assert_eq!(
            conflicts.mismatched,
            BTreeMap::from([("D".to_string(), "D-2".to_string())])
        );
    }

    #[test]
    fn test_widen_for_database() {
        let archive = Archive {
            packages: vec![
                entry("", "", &["/etc/hosts", "/var/lib/rpm/Packages", "/var/lib/rpm/Name"]),
                entry("a", "1", &["/f1"]),
            ],
            ..Default::default()
        };
        assert!(rpmdb_restorable(&archive));

        let mut selection = SelectionModel::from_states([
            (String::new(), SelectionState::None),
            ("a".to_string(), SelectionState::All),
        ]);
        assert_eq!(widen_for_database(&mut selection, &archive), 2);
        assert_eq!(
            selection.get(""),
            Some(&SelectionState::partial(["/var/lib/rpm/Name", "/var/lib/rpm/Packages"]))
        );
        assert_eq!(selection.get("a"), Some(&SelectionState::All));

        let mut partial = SelectionModel::from_states([(
            String::new(),
            SelectionState::partial(["/etc/hosts", "/var/lib/rpm/Name"]),
        )]);
        assert_eq!(widen_for_database(&mut partial, &archive), 1);

        let mut all = SelectionModel::from_states([(String::new(), SelectionState::All)]);
        assert_eq!(widen_for_database(&mut all, &archive), 0);
        assert_eq!(all.get(""), Some(&SelectionState::All));
    }
}
