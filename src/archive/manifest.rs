// src/archive/manifest.rs

//! Reading the manifest of a backup container
//!
//! The container is listed in-process with the `tar` crate. Only the
//! `info/` entries are kept in memory; package subarchives are unpacked
//! later by the extraction engine.
//!
//! Everything a read stages lands in a fresh workspace that the caller
//! adopts only when the read succeeds.

use super::pkginfo::PackageInfoConverter;
use super::volume::{VolumeAssembler, copy_verified, has_volume_header, open_past_label};
use super::{Archive, ArchiveInfo, Locator, PackageManifestEntry, entries, split_package_version};
use crate::error::{Error, Result};
use crate::mount::SourceLocator;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// Description of the no-package bucket
pub const NO_PACKAGE_DESCRIPTION: &str = "Files not owned by any package";

/// Name of the local copy of a container read from removable media
const STAGED_CONTAINER: &str = "0.tar";

/// GNU volume label and multi-volume continuation headers
const SKIPPED_ENTRY_TYPES: [u8; 2] = [b'V', b'M'];

/// Member names and `info/` contents of a container
#[derive(Debug, Default)]
struct Contents {
    members: Vec<String>,
    info: BTreeMap<String, Vec<u8>>,
}

impl Contents {
    fn text(&self, name: &str) -> String {
        self.info
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end().to_string())
            .unwrap_or_default()
    }

    fn lines(&self, name: &str) -> Vec<String> {
        self.text(name)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// A manifest read together with the files and mount it depends on
#[derive(Debug)]
pub struct ReadOutcome {
    pub archive: Archive,
    /// Active mount point, released by the session later
    pub mount_point: Option<PathBuf>,
    /// Assembler holding the staged volumes; empty for single containers
    pub volumes: VolumeAssembler,
    /// Staged container copy, volumes and package info of this read
    pub workspace: TempDir,
}

/// Opens backup containers and parses their manifest
pub struct ManifestReader<'a> {
    source: &'a mut dyn SourceLocator,
    converter: &'a dyn PackageInfoConverter,
    tar_program: &'a Path,
    staging_dir: &'a Path,
    mount_dir: &'a Path,
}

impl<'a> ManifestReader<'a> {
    pub fn new(
        source: &'a mut dyn SourceLocator,
        converter: &'a dyn PackageInfoConverter,
        tar_program: &'a Path,
        staging_dir: &'a Path,
        mount_dir: &'a Path,
    ) -> Self {
        Self {
            source,
            converter,
            tar_program,
            staging_dir,
            mount_dir,
        }
    }

    /// Locate `input`, list it and parse the manifest.
    ///
    /// `describe` supplies package summaries. A container that cannot be
    /// listed is retried as the first volume of a multi-volume set.
    pub fn read(&mut self, input: &str, describe: &mut dyn FnMut(&str) -> String) -> Result<ReadOutcome> {
        let locator: Locator = input.parse().map_err(|e| {
            error!("{}", e);
            Error::SourceUnavailable(input.to_string())
        })?;

        let workspace = tempfile::Builder::new()
            .prefix("read-")
            .tempdir_in(self.staging_dir)?;
        let mut volumes = VolumeAssembler::new(workspace.path().join("volumes"), self.tar_program);

        let located = self.source.locate(&locator, self.mount_dir).map_err(|e| {
            error!("Cannot locate {}: {}", input, e);
            Error::SourceUnavailable(input.to_string())
        })?;
        debug!("Archive file: {}", located.file.display());

        let mut mount_point = located.mount_point;
        let result = self.open(
            &locator,
            &located.file,
            &mut mount_point,
            workspace.path(),
            &mut volumes,
            describe,
        );
        if result.is_err() {
            if let Some(mp) = mount_point.take() {
                self.source.release(&mp);
            }
        }

        let archive = result?;
        info!(
            "Archive {} contains {} packages",
            input,
            archive.packages.len()
        );
        Ok(ReadOutcome {
            archive,
            mount_point,
            volumes,
            workspace,
        })
    }

    fn open(
        &mut self,
        locator: &Locator,
        file: &Path,
        mount_point: &mut Option<PathBuf>,
        workspace: &Path,
        volumes: &mut VolumeAssembler,
        describe: &mut dyn FnMut(&str) -> String,
    ) -> Result<Archive> {
        let scanned = if has_volume_header(file) {
            Err(Error::Validation(format!("{} is a labelled volume", file.display())))
        } else {
            scan(file, false)
        };

        let (local_path, contents) = match scanned {
            Ok(contents) if locator.is_persistent() => (file.to_path_buf(), contents),
            Ok(contents) => {
                // removable media: work on a local copy so the medium can go
                let copy = workspace.join(STAGED_CONTAINER);
                copy_verified(file, &copy).map_err(|e| {
                    Error::Validation(format!("Cannot copy archive {}: {}", locator, e))
                })?;
                if let Some(mp) = mount_point.take() {
                    self.source.release(&mp);
                }
                (copy, contents)
            }
            Err(e) => {
                debug!("Listing {} failed ({}), trying first volume", file.display(), e);
                let status = volumes.add_volume(file);
                let first = match volumes.parts().first() {
                    Some(first) if status.success => first.clone(),
                    _ => {
                        return Err(Error::Validation(format!(
                            "{} is not a backup archive",
                            locator
                        )));
                    }
                };
                let contents = scan(&first, true)?;
                (first, contents)
            }
        };

        let mut archive = self.parse(contents, workspace, describe)?;
        archive.input_locator = locator.to_string();
        archive.local_path = local_path;
        archive.volume_parts = volumes.parts().to_vec();
        Ok(archive)
    }

    fn parse(
        &self,
        contents: Contents,
        workspace: &Path,
        describe: &mut dyn FnMut(&str) -> String,
    ) -> Result<Archive> {
        for required in [entries::FILES, entries::INSTALLED_PACKAGES] {
            if !contents.info.contains_key(required) {
                return Err(Error::Validation(format!("Missing {} in archive", required)));
            }
        }
        let blob = match (
            contents.info.get(entries::PACKAGES_INFO_GZ),
            contents.info.get(entries::PACKAGES_INFO),
        ) {
            (Some(gz), _) => gunzip(gz)?,
            (None, Some(plain)) => plain.clone(),
            (None, None) => {
                return Err(Error::Validation(format!(
                    "Missing {} in archive",
                    entries::PACKAGES_INFO
                )));
            }
        };

        let blob_path = workspace.join("packages_info");
        fs::write(&blob_path, &blob)?;
        let info = self.converter.convert(&blob_path)?;

        let mut backup_roster = BTreeMap::new();
        for line in contents.lines(entries::INSTALLED_PACKAGES) {
            match split_package_version(&line) {
                Some((name, version)) => {
                    backup_roster.insert(name.to_string(), version.to_string());
                }
                None => warn!("Ignoring installed package entry '{}'", line),
            }
        }

        let complete_backup: Vec<String> = contents
            .text(entries::COMPLETE_BACKUP)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let complete: BTreeSet<&str> = complete_backup.iter().map(String::as_str).collect();

        let packages = info
            .into_iter()
            .map(|(name, package)| {
                let description = if name.is_empty() {
                    NO_PACKAGE_DESCRIPTION.to_string()
                } else {
                    describe(&name)
                };
                let in_complete_backup =
                    complete.contains(format!("{}-{}", name, package.version).as_str());
                PackageManifestEntry {
                    name,
                    backup_version: package.version,
                    description,
                    member_files: package.files,
                    in_complete_backup,
                }
            })
            .collect();

        debug!("Container members: {}", contents.members.len());
        Ok(Archive {
            info: ArchiveInfo {
                date: contents.text(entries::DATE),
                hostname: contents.text(entries::HOSTNAME),
                comment: contents.text(entries::COMMENT),
            },
            file_list: contents.lines(entries::FILES),
            backup_roster,
            complete_backup,
            packages,
            ..Default::default()
        })
    }
}

/// List `path`, keeping the contents of manifest entries.
///
/// A volume label is skipped. A tolerant scan stops quietly at the first
/// unreadable entry, which is how the first volume of a multi-volume set
/// ends.
fn scan(path: &Path, tolerant: bool) -> Result<Contents> {
    let file = open_past_label(path)?;
    let mut archive = tar::Archive::new(file);
    let mut contents = Contents::default();

    let entries = archive
        .entries()
        .map_err(|e| Error::Validation(format!("Cannot list {}: {}", path.display(), e)))?;

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if tolerant => {
                debug!("End of readable entries in {}: {}", path.display(), e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if SKIPPED_ENTRY_TYPES.contains(&entry.header().entry_type().as_byte()) {
            continue;
        }

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = raw.trim_start_matches("./").to_string();

        if name.starts_with("info/") {
            let mut data = Vec::new();
            if let Err(e) = entry.read_to_end(&mut data) {
                if tolerant {
                    debug!("Entry {} is truncated: {}", name, e);
                    break;
                }
                return Err(e.into());
            }
            contents.info.insert(name.clone(), data);
        }
        contents.members.push(name);
    }

    if contents.members.is_empty() {
        return Err(Error::Validation(format!("{} has no entries", path.display())));
    }
    Ok(contents)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e: io::Error| Error::Validation(format!("Cannot decompress package info: {}", e)))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::pkginfo::TextConverter;
    use crate::archive::volume::tests::{gnu_tar_available, noise, split_volumes};
    use crate::mount::SystemMounter;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::io::Write;
    use tar::{Builder, Header};

    const PACKAGES_INFO: &str = "\
Package: netcfg-2002.3.20-0
/etc/hosts
/etc/HOSTNAME
Nopackage:
/etc/motd
/var/lib/rpm/Packages
Package: lprng-3.8.5-49
/etc/printcap
";

    fn append(builder: &mut Builder<File>, name: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn write_backup(path: &Path, skip: Option<&str>, gzip_info: bool) {
        let mut builder = Builder::new(File::create(path).unwrap());
        let files = "NOPACKAGE-20020509-0.tar.gz\nnetcfg-2002.3.20-0-20020509-0.tar.gz\n\n";
        let mut members: Vec<(&str, Vec<u8>)> = vec![
            (entries::DATE, b"20020509\n".to_vec()),
            (entries::HOSTNAME, b"linux.local\n".to_vec()),
            (entries::COMMENT, b"weekly backup\n".to_vec()),
            (entries::FILES, files.as_bytes().to_vec()),
            (
                entries::INSTALLED_PACKAGES,
                b"netcfg-2002.3.20-0\nlprng-3.8.5-49\ngpg-pubkey-3dbdc284-53674dd4\n".to_vec(),
            ),
            (entries::COMPLETE_BACKUP, b"netcfg-2002.3.20-0\n".to_vec()),
        ];
        if gzip_info {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(PACKAGES_INFO.as_bytes()).unwrap();
            members.push((entries::PACKAGES_INFO_GZ, encoder.finish().unwrap()));
        } else {
            members.push((entries::PACKAGES_INFO, PACKAGES_INFO.as_bytes().to_vec()));
        }
        members.push(("netcfg-2002.3.20-0-20020509-0.tar.gz", vec![0u8; 100]));

        for (name, data) in members {
            if Some(name) != skip {
                append(&mut builder, name, &data);
            }
        }
        builder.finish().unwrap();
    }

    fn read_in(path: &Path, work: &Path) -> Result<ReadOutcome> {
        let mut mounter = SystemMounter::default();
        let converter = TextConverter;
        let mut reader =
            ManifestReader::new(&mut mounter, &converter, Path::new("tar"), work, work);
        reader.read(path.to_str().unwrap(), &mut |name: &str| format!("{} summary", name))
    }

    fn read(path: &Path) -> Result<ReadOutcome> {
        let work = tempfile::tempdir().unwrap();
        read_in(path, work.path())
    }

    #[test]
    fn test_read_backup_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tar");
        write_backup(&path, None, false);

        let outcome = read(&path).unwrap();
        let archive = outcome.archive;

        assert!(outcome.mount_point.is_none());
        assert_eq!(archive.local_path, path);
        assert!(!archive.is_multi_volume());
        assert_eq!(archive.info.date, "20020509");
        assert_eq!(archive.info.hostname, "linux.local");
        assert_eq!(archive.info.comment, "weekly backup");
        assert_eq!(archive.file_list.len(), 2);
        assert_eq!(archive.backup_roster["lprng"], "3.8.5-49");
        assert_eq!(archive.backup_roster["gpg-pubkey"], "3dbdc284-53674dd4");

        let names: Vec<&str> = archive.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["", "lprng", "netcfg"]);

        let bucket = archive.no_package_bucket().unwrap();
        assert_eq!(bucket.description, NO_PACKAGE_DESCRIPTION);
        assert_eq!(bucket.member_files, vec!["/etc/motd", "/var/lib/rpm/Packages"]);

        let netcfg = archive.package("netcfg").unwrap();
        assert_eq!(netcfg.backup_version, "2002.3.20-0");
        assert_eq!(netcfg.description, "netcfg summary");
        assert!(netcfg.in_complete_backup);
        assert!(!archive.package("lprng").unwrap().in_complete_backup);
    }

    #[test]
    fn test_read_gzipped_package_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tar");
        write_backup(&path, Some(entries::PACKAGES_INFO), true);

        let archive = read(&path).unwrap().archive;
        assert_eq!(archive.packages.len(), 3);
        assert_eq!(archive.package("lprng").unwrap().member_files, vec!["/etc/printcap"]);
    }

    #[test]
    fn test_missing_required_entries() {
        let dir = tempfile::tempdir().unwrap();
        for missing in [entries::FILES, entries::INSTALLED_PACKAGES, entries::PACKAGES_INFO] {
            let path = dir.path().join("backup.tar");
            write_backup(&path, Some(missing), false);
            assert!(
                matches!(read(&path), Err(Error::Validation(_))),
                "accepted archive without {}",
                missing
            );
        }
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "just some text that is not a tar container").unwrap();

        assert!(matches!(read(&path), Err(Error::Validation(_))));
        assert!(matches!(
            read(Path::new("/nonexistent/backup.tar")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_scheme_is_unavailable() {
        let work = tempfile::tempdir().unwrap();
        let mut mounter = SystemMounter::default();
        let converter = TextConverter;
        let tar = Path::new("tar");
        let mut reader = ManifestReader::new(&mut mounter, &converter, tar, work.path(), work.path());

        let result = reader.read("smb://server/share/backup.tar", &mut |_: &str| String::new());
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }

    #[test]
    fn test_failed_read_leaves_no_staged_files() {
        let work = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "not a tar container").unwrap();

        assert!(read_in(&path, work.path()).is_err());
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_first_volume_of_multi_volume_set() {
        if !gnu_tar_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("info")).unwrap();
        fs::write(src.join(entries::FILES), "netcfg-2002.3.20-0-20020509-0.tar.gz\n").unwrap();
        fs::write(src.join(entries::INSTALLED_PACKAGES), "netcfg-2002.3.20-0\n").unwrap();
        fs::write(src.join(entries::PACKAGES_INFO), PACKAGES_INFO).unwrap();
        fs::write(src.join("netcfg-2002.3.20-0-20020509-0.tar.gz"), noise(40_000)).unwrap();

        let volumes = split_volumes(
            &src,
            &[
                entries::FILES,
                entries::INSTALLED_PACKAGES,
                entries::PACKAGES_INFO,
                "netcfg-2002.3.20-0-20020509-0.tar.gz",
            ],
            dir.path(),
            12,
        );
        assert!(volumes.len() >= 2);

        let work = tempfile::tempdir().unwrap();
        let outcome = read_in(&volumes[0], work.path()).unwrap();
        let archive = outcome.archive;
        assert!(archive.is_multi_volume());
        assert_eq!(archive.volume_parts.len(), 1);
        assert_eq!(archive.local_path, archive.volume_parts[0]);
        assert!(archive.local_path.starts_with(outcome.workspace.path()));
        assert_eq!(outcome.volumes.expected_volume(), 2);
        assert_eq!(archive.packages.len(), 3);
        assert_eq!(archive.file_list.len(), 1);
    }
}
