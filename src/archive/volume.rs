// src/archive/volume.rs

//! Multi-volume archive staging
//!
//! Every volume starts with a GNU volume-label header
//! (`"<VOLUME_LABEL> <n>"`). The `tar` crate cannot read that header, so
//! volumes are identified from the archiver's verbose listing. Volumes are
//! only accepted in order and are copied into the staging directory so that
//! removable media can be swapped.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

/// Label prefix written by the backup tool into each volume header
pub const VOLUME_LABEL: &str = "YaST2 backup: Volume";

/// GNU tar entry type of a volume header
const VOLUME_HEADER_TYPE: u8 = b'V';

const BLOCK_SIZE: usize = 512;

/// Offset of the entry type in a tar header block
const TYPEFLAG_OFFSET: usize = 156;

/// Result of offering a volume to the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStatus {
    pub success: bool,
    /// No further volume is expected after this one
    pub last_volume: bool,
}

/// Validates and stages the parts of a multi-volume archive
#[derive(Debug)]
pub struct VolumeAssembler {
    staging_dir: PathBuf,
    tar_program: PathBuf,
    parts: Vec<PathBuf>,
}

impl VolumeAssembler {
    pub fn new(staging_dir: impl Into<PathBuf>, tar_program: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            tar_program: tar_program.into(),
            parts: Vec::new(),
        }
    }

    /// Staged parts, volume 1 first
    pub fn parts(&self) -> &[PathBuf] {
        &self.parts
    }

    /// Sequence number the next accepted volume must carry
    pub fn expected_volume(&self) -> usize {
        self.parts.len() + 1
    }

    /// Probe `path` for the next volume label and stage it on success
    pub fn add_volume(&mut self, path: &Path) -> VolumeStatus {
        match self.try_add_volume(path) {
            Ok(last_volume) => VolumeStatus {
                success: true,
                last_volume,
            },
            Err(e) => {
                warn!("Volume {} rejected: {}", path.display(), e);
                VolumeStatus {
                    success: false,
                    last_volume: true,
                }
            }
        }
    }

    /// Like [`add_volume`](Self::add_volume) but reports why a volume was rejected
    pub fn try_add_volume(&mut self, path: &Path) -> Result<bool> {
        let expected = self.expected_volume();
        let last_volume = probe_volume(&self.tar_program, path, expected)?;
        debug!(
            "Volume {} found in {} (last volume: {})",
            expected,
            path.display(),
            last_volume
        );

        let staged = self.staging_dir.join(format!("{}.tar", expected));
        copy_verified(path, &staged)?;

        info!("Staged volume {} as {}", expected, staged.display());
        self.parts.push(staged);
        Ok(last_volume)
    }

    /// List all staged volumes together; false if any part is missing or broken
    pub fn test_all_volumes(&self) -> bool {
        if self.parts.is_empty() {
            return false;
        }

        let mut cmd = Command::new(&self.tar_program);
        cmd.arg("-t").arg("-M");
        for part in &self.parts {
            cmd.arg("-f").arg(part);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start {}: {}", self.tar_program.display(), e);
                return false;
            }
        };

        // answer "quit" if tar asks for another volume
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n") {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    warn!("Failed to answer volume prompt: {}", e);
                }
            }
        }

        match child.wait() {
            Ok(status) => {
                info!("Volume test result: {}", status);
                status.success()
            }
            Err(e) => {
                error!("Failed to wait for volume test: {}", e);
                false
            }
        }
    }
}

/// Check that `path` starts with the label of volume `expected`.
///
/// Returns whether `tar` could list the whole file, which is false when it
/// ends in the middle of an entry continued on a later volume.
pub fn probe_volume(tar: &Path, path: &Path, expected: usize) -> Result<bool> {
    let output = Command::new(tar)
        .arg("-v")
        .arg("-t")
        .arg("-f")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| Error::Command {
            program: tar.display().to_string(),
            source,
        })?;

    let listing = String::from_utf8_lossy(&output.stdout);
    let first = listing.lines().next().unwrap_or_default();
    debug!("First entry of {}: {}", path.display(), first);

    if !listing_matches(first, expected) {
        return Err(Error::VolumeMismatch {
            expected,
            path: path.display().to_string(),
        });
    }
    Ok(output.status.success())
}

/// Match a verbose listing line such as
/// `V--------- 0/0 0 2024-01-01 10:00 YaST2 backup: Volume 1--Volume Header--`
fn listing_matches(line: &str, volume: usize) -> bool {
    line.starts_with(VOLUME_HEADER_TYPE as char)
        && line.contains(&format!(" {} {}--", VOLUME_LABEL, volume))
}

/// Whether `path` begins with a GNU volume-label header
pub fn has_volume_header(path: &Path) -> bool {
    let mut block = [0u8; BLOCK_SIZE];
    match File::open(path).and_then(|mut file| file.read_exact(&mut block)) {
        Ok(()) => block[TYPEFLAG_OFFSET] == VOLUME_HEADER_TYPE,
        Err(_) => false,
    }
}

/// Open `path` positioned after its volume-label header, if it has one
pub fn open_past_label(path: &Path) -> Result<File> {
    let mut file = File::open(path)?;
    if has_volume_header(path) {
        file.seek(SeekFrom::Start(BLOCK_SIZE as u64))?;
    }
    Ok(file)
}

/// Copy `src` to `dest` and compare digests of both files
pub fn copy_verified(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;

    if sha256_file(src)? != sha256_file(dest)? {
        error!("Copy of {} is corrupt", src.display());
        if let Err(e) = fs::remove_file(dest) {
            warn!("Cannot remove {}: {}", dest.display(), e);
        }
        return Err(Error::Validation(format!(
            "Copy of {} to {} does not match the source",
            src.display(),
            dest.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
