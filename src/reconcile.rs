// src/reconcile.rs

//! Backup-time vs. installed package rosters
//!
//! Missing packages were installed at backup time but are not installed now,
//! extra packages are installed now but were not at backup time, and
//! mismatched packages are installed in a different version.

use crate::archive::{Archive, SIGNING_KEY_PACKAGE};
use crate::error::Result;
use crate::packages::{PackageDatabase, Roster};
use crate::selection::SelectionModel;
use std::collections::BTreeMap;
use tracing::debug;

/// A package present in only one of the rosters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub version: String,
    pub description: Option<String>,
}

/// A package installed in a different version than at backup time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchedPackage {
    pub backup_version: String,
    pub installed_version: String,
    pub description: Option<String>,
}

/// All reconciliation results for one archive and selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationSets {
    pub missing: BTreeMap<String, RosterEntry>,
    pub extra: BTreeMap<String, RosterEntry>,
    pub mismatched: BTreeMap<String, MismatchedPackage>,
    /// Selected packages (internal names) with their backup version
    pub selected: BTreeMap<String, String>,
}

/// Compares rosters, caching the installed one
pub struct PackageReconciler {
    db: Box<dyn PackageDatabase>,
    cache: Option<Roster>,
    config_only: bool,
}

impl PackageReconciler {
    pub fn new(db: Box<dyn PackageDatabase>) -> Self {
        Self {
            db,
            cache: None,
            config_only: false,
        }
    }

    /// In a configuration-only session the local system is not consulted
    /// and the installed roster is empty
    pub fn set_config_only(&mut self, config_only: bool) {
        if self.config_only != config_only {
            self.config_only = config_only;
            self.invalidate();
        }
    }

    /// Package summary from the database; empty when unknown
    pub fn description(&self, name: &str) -> String {
        self.db.summary(name).unwrap_or_default()
    }

    /// Installed packages; read once and cached until [`invalidate`](Self::invalidate)
    pub fn installed(&mut self) -> Result<&Roster> {
        if self.cache.is_none() {
            let roster = if self.config_only {
                Roster::new()
            } else {
                self.db.installed_packages()?
            };
            debug!("Installed packages: {}", roster.len());
            self.cache = Some(roster);
        }
        Ok(self.cache.get_or_insert_with(Roster::new))
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Installed at backup time but not now (signing keys ignored)
    pub fn missing(&mut self, backup: &Roster) -> Result<BTreeMap<String, RosterEntry>> {
        let installed = self.installed()?.clone();
        Ok(backup
            .iter()
            .filter(|(name, _)| !installed.contains_key(*name) && *name != SIGNING_KEY_PACKAGE)
            .map(|(name, version)| (name.clone(), self.entry(name, version)))
            .collect())
    }

    /// Installed now but not at backup time
    pub fn extra(&mut self, backup: &Roster) -> Result<BTreeMap<String, RosterEntry>> {
        let installed = self.installed()?.clone();
        Ok(installed
            .iter()
            .filter(|(name, _)| !backup.contains_key(*name))
            .map(|(name, version)| (name.clone(), self.entry(name, version)))
            .collect())
    }

    /// Installed in both rosters with different versions
    pub fn mismatched(&mut self, backup: &Roster) -> Result<BTreeMap<String, MismatchedPackage>> {
        let installed = self.installed()?.clone();
        Ok(installed
            .iter()
            .filter_map(|(name, installed_version)| {
                let backup_version = backup.get(name)?;
                (backup_version != installed_version).then(|| {
                    (
                        name.clone(),
                        MismatchedPackage {
                            backup_version: backup_version.clone(),
                            installed_version: installed_version.clone(),
                            description: self.db.summary(name),
                        },
                    )
                })
            })
            .collect())
    }

    /// Compute every set for `archive` under `selection`
    pub fn reconcile(
        &mut self,
        archive: &Archive,
        selection: &SelectionModel,
    ) -> Result<ReconciliationSets> {
        Ok(ReconciliationSets {
            missing: self.missing(&archive.backup_roster)?,
            extra: self.extra(&archive.backup_roster)?,
            mismatched: self.mismatched(&archive.backup_roster)?,
            selected: selected_packages(archive, selection),
        })
    }

    fn entry(&self, name: &str, version: &str) -> RosterEntry {
        RosterEntry {
            version: version.to_string(),
            description: self.db.summary(name),
        }
    }
}

/// Manifest entries whose selection is not `None`, name -> backup version
pub fn selected_packages(archive: &Archive, selection: &SelectionModel) -> BTreeMap<String, String> {
    archive
        .packages
        .iter()
        .filter(|p| selection.is_selected(&p.name))
        .map(|p| (p.name.clone(), p.backup_version.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::StaticDatabase;
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    fn roster(items: &[(&str, &str)]) -> Roster {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn reconciler(installed: Roster) -> PackageReconciler {
        let db = StaticDatabase::new(installed).with_summary("lprng", "LPRng Print Spooler");
        PackageReconciler::new(Box::new(db))
    }

    #[test]
    fn test_missing_extra_mismatched() {
        let backup = roster(&[
            ("netcfg", "2002.3.20-0"),
            ("lprng", "3.8.5-49"),
            ("gnome-applets", "1.4.0.5-98"),
            ("gpg-pubkey", "3dbdc284-53674dd4"),
        ]);
        let mut rec = reconciler(roster(&[
            ("netcfg", "2002.3.20-0"),
            ("lprng", "3.8.5-50"),
            ("aterm", "0.4.0"),
        ]));

        let missing = rec.missing(&backup).unwrap();
        let extra = rec.extra(&backup).unwrap();
        let mismatched = rec.mismatched(&backup).unwrap();

        assert_eq!(missing.keys().collect::<Vec<_>>(), vec!["gnome-applets"]);
        assert_eq!(extra.keys().collect::<Vec<_>>(), vec!["aterm"]);
        assert_eq!(mismatched["lprng"].backup_version, "3.8.5-49");
        assert_eq!(mismatched["lprng"].installed_version, "3.8.5-50");
        assert_eq!(
            mismatched["lprng"].description.as_deref(),
            Some("LPRng Print Spooler")
        );
    }

    #[test]
    fn test_sets_cover_exactly_the_differences() {
        let backup = roster(&[("a", "1"), ("b", "1"), ("c", "1"), ("d", "2")]);
        let installed = roster(&[("a", "1"), ("c", "2"), ("e", "1"), ("d", "2")]);
        let mut rec = reconciler(installed.clone());

        let missing: BTreeSet<_> = rec.missing(&backup).unwrap().into_keys().collect();
        let extra: BTreeSet<_> = rec.extra(&backup).unwrap().into_keys().collect();
        let mismatched: BTreeSet<_> = rec.mismatched(&backup).unwrap().into_keys().collect();

        assert!(missing.is_disjoint(&extra));

        let differing: BTreeSet<String> = backup
            .keys()
            .chain(installed.keys())
            .filter(|n| backup.get(*n) != installed.get(*n))
            .cloned()
            .collect();
        let union: BTreeSet<String> = missing
            .union(&extra)
            .cloned()
            .collect::<BTreeSet<_>>()
            .union(&mismatched)
            .cloned()
            .collect();
        assert_eq!(union, differing);
    }

    struct CountingDatabase {
        reads: Rc<Cell<usize>>,
    }

    impl PackageDatabase for CountingDatabase {
        fn installed_packages(&self) -> Result<Roster> {
            self.reads.set(self.reads.get() + 1);
            Ok(Roster::new())
        }

        fn summary(&self, _name: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_installed_roster_is_cached() {
        let reads = Rc::new(Cell::new(0));
        let mut rec = PackageReconciler::new(Box::new(CountingDatabase {
            reads: reads.clone(),
        }));

        rec.installed().unwrap();
        rec.installed().unwrap();
        assert_eq!(reads.get(), 1);

        rec.invalidate();
        rec.installed().unwrap();
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn test_config_only_has_empty_roster() {
        let mut rec = reconciler(roster(&[("a", "1")]));
        rec.set_config_only(true);
        assert!(rec.installed().unwrap().is_empty());

        rec.set_config_only(false);
        assert_eq!(rec.installed().unwrap().len(), 1);
    }
}
