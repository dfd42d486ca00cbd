// src/extract/backend.rs

//! Subarchive extraction tools
//!
//! Package subarchives are either GNU tar archives (`.tar`, `.tar.gz`,
//! `.tar.bz2`) or star archives (`.star`, `.star.gz`, `.star.bz2`). Each tool
//! implements `ArchiveBackend`; [`backend_for`] picks one by file suffix.

use crate::archive::Archive;
use crate::config::{ToolPaths, program_exists};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Directory of the package database, relative to the archive root
pub const RPMDB_DIR: &str = "var/lib/rpm";

/// Compression flag passed to tar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

/// What to extract and where
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub subarchive: &'a Path,
    pub target_dir: &'a Path,
    /// Explicit member list; `None` extracts everything
    pub files: Option<Vec<String>>,
    pub exclude_rpmdb: bool,
}

/// An external tool able to unpack one kind of subarchive
pub trait ArchiveBackend {
    /// Package providing the tool, offered for installation when missing
    fn package(&self) -> &str;

    fn program(&self) -> &Path;

    fn is_available(&self) -> bool {
        program_exists(self.program())
    }

    /// Verbose extraction command; file names go to stdout, errors to stderr
    fn extract_command(&self, request: &ExtractRequest<'_>) -> Command;

    /// Restored file names from the tool's stdout
    fn restored_files(&self, stdout: &str) -> Vec<String>;

    /// The file an stderr line reports as failed, if any
    fn failed_file(&self, line: &str) -> Option<String>;
}

/// GNU tar with an explicit decompression flag
#[derive(Debug, Clone)]
pub struct TarBackend {
    program: PathBuf,
    compression: Compression,
}

impl TarBackend {
    pub fn new(program: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            program: program.into(),
            compression,
        }
    }
}

impl ArchiveBackend for TarBackend {
    fn package(&self) -> &str {
        "tar"
    }

    fn program(&self) -> &Path {
        &self.program
    }

    fn extract_command(&self, request: &ExtractRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-C").arg(request.target_dir);
        match self.compression {
            Compression::Gzip => {
                cmd.arg("-z");
            }
            Compression::Bzip2 => {
                cmd.arg("-j");
            }
            Compression::None => {}
        }
        cmd.args(["-x", "-v", "-f"]).arg(request.subarchive);
        if request.exclude_rpmdb {
            cmd.args(["--exclude", RPMDB_DIR]);
        }
        if let Some(files) = &request.files {
            cmd.args(files);
        }
        cmd
    }

    fn restored_files(&self, stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn failed_file(&self, line: &str) -> Option<String> {
        let message = tool_message(line)?;
        if message.starts_with("Exiting with failure status")
            || message.starts_with("Error is not recoverable")
            || message.starts_with("Removing leading")
        {
            return None;
        }
        Some(message_path(message))
    }
}

/// star: detects compression itself and replaces existing files (`-U`)
#[derive(Debug, Clone)]
pub struct StarBackend {
    program: PathBuf,
}

impl StarBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ArchiveBackend for StarBackend {
    fn package(&self) -> &str {
        "star"
    }

    fn program(&self) -> &Path {
        &self.program
    }

    fn extract_command(&self, request: &ExtractRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-C")
            .arg(request.target_dir)
            .args(["-x", "-v", "-U", "-f"])
            .arg(request.subarchive);
        if request.exclude_rpmdb {
            cmd.args(["-not", &format!("pat={}", RPMDB_DIR)]);
        }
        if let Some(files) = &request.files {
            cmd.args(files);
        }
        cmd
    }

    /// star prints `x <path> <n> bytes, <m> tape blocks`
    fn restored_files(&self, stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter_map(|line| {
                let rest = line.strip_prefix("x ")?;
                if !rest.ends_with("tape blocks") {
                    return None;
                }
                let (head, _) = rest.rsplit_once(" bytes, ")?;
                let (path, _size) = head.rsplit_once(' ')?;
                Some(path.to_string())
            })
            .collect()
    }

    fn failed_file(&self, line: &str) -> Option<String> {
        let message = tool_message(line)?;
        // final summary: "<n> blocks + <n> bytes (total of <n> bytes = <n>k)."
        if message.starts_with("WARNING:")
            || (message.contains(" blocks + ") && message.contains("(total of "))
        {
            return None;
        }
        Some(message_path(message))
    }
}

/// Text after the `tar: ` / `star: ` prefix of a diagnostic line
fn tool_message(line: &str) -> Option<&str> {
    let pos = line.find("tar: ")?;
    let message = line[pos + "tar: ".len()..].trim();
    (!message.is_empty()).then_some(message)
}

/// `path: reason` -> `path`
fn message_path(message: &str) -> String {
    message
        .split_once(": ")
        .map_or(message, |(path, _)| path)
        .to_string()
}

/// Pick the tool for a subarchive by its suffix
pub fn backend_for(file_name: &str, tools: &ToolPaths) -> Option<Box<dyn ArchiveBackend>> {
    if file_name.ends_with(".tar.gz") {
        Some(Box::new(TarBackend::new(&tools.tar, Compression::Gzip)))
    } else if file_name.ends_with(".tar.bz2") {
        Some(Box::new(TarBackend::new(&tools.tar, Compression::Bzip2)))
    } else if file_name.ends_with(".star")
        || file_name.ends_with(".star.gz")
        || file_name.ends_with(".star.bz2")
    {
        Some(Box::new(StarBackend::new(&tools.star)))
    } else if file_name.ends_with(".tar") {
        Some(Box::new(TarBackend::new(&tools.tar, Compression::None)))
    } else {
        None
    }
}

/// Command unpacking container member `member` into `dest`, plus the stdin
/// to feed it (multi-volume reads quit instead of prompting for a volume)
pub fn unpack_member_command(
    tar: &Path,
    archive: &Archive,
    member: &str,
    dest: &Path,
) -> (Command, Option<&'static [u8]>) {
    let mut cmd = Command::new(tar);
    cmd.arg("-C").arg(dest).arg("-x");

    if archive.is_multi_volume() {
        cmd.arg("-M");
        for part in &archive.volume_parts {
            cmd.arg("-f").arg(part);
        }
        cmd.arg(member);
        (cmd, Some(b"q\n"))
    } else {
        cmd.arg("-f").arg(&archive.local_path).arg(member);
        (cmd, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a: &OsStr| a.to_string_lossy().into_owned())
            .collect()
    }

    fn tools() -> ToolPaths {
        ToolPaths {
            tar: PathBuf::from("/bin/tar"),
            star: PathBuf::from("/usr/bin/star"),
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_dispatch() {
        let tools = tools();
        assert_eq!(backend_for("a-1-20020509-0.tar.gz", &tools).unwrap().package(), "tar");
        assert_eq!(backend_for("a-1-20020509-0.tar.bz2", &tools).unwrap().package(), "tar");
        assert_eq!(backend_for("a-1-20020509-0.star.bz2", &tools).unwrap().package(), "star");
        assert_eq!(backend_for("a-1-20020509-0.star", &tools).unwrap().package(), "star");
        assert!(backend_for("a-1-20020509-0.zip", &tools).is_none());
    }

    #[test]
    fn test_tar_command_partial_without_rpmdb() {
        let backend = TarBackend::new("/bin/tar", Compression::Gzip);
        let request = ExtractRequest {
            subarchive: Path::new("/tmp/stage/a.tar.gz"),
            target_dir: Path::new("/"),
            files: Some(vec!["etc/hosts".to_string()]),
            exclude_rpmdb: true,
        };

        assert_eq!(
            args(&backend.extract_command(&request)),
            vec![
                "-C", "/", "-z", "-x", "-v", "-f", "/tmp/stage/a.tar.gz",
                "--exclude", "var/lib/rpm", "etc/hosts"
            ]
        );
    }

    #[test]
    fn test_star_command_full() {
        let backend = StarBackend::new("/usr/bin/star");
        let request = ExtractRequest {
            subarchive: Path::new("/tmp/stage/a.star.gz"),
            target_dir: Path::new("/mnt"),
            files: None,
            exclude_rpmdb: true,
        };

        assert_eq!(
            args(&backend.extract_command(&request)),
            vec![
                "-C", "/mnt", "-x", "-v", "-U", "-f", "/tmp/stage/a.star.gz",
                "-not", "pat=var/lib/rpm"
            ]
        );
    }

    #[test]
    fn test_star_stdout_parsing() {
        let backend = StarBackend::new("star");
        let stdout = "x etc/hosts 120 bytes, 1 tape blocks\n\
                      x etc/my file.conf 2048 bytes, 4 tape blocks\n\
                      x etc/ directory\n";
        assert_eq!(
            backend.restored_files(stdout),
            vec!["etc/hosts", "etc/my file.conf"]
        );
    }

    #[test]
    fn test_failed_file_classification() {
        let tar = TarBackend::new("tar", Compression::None);
        assert_eq!(
            tar.failed_file("tar: etc/shadow: Cannot open: Permission denied"),
            Some("etc/shadow".to_string())
        );
        assert_eq!(
            tar.failed_file("/bin/tar: etc/missing: Not found in archive"),
            Some("etc/missing".to_string())
        );
        assert_eq!(
            tar.failed_file("tar: Exiting with failure status due to previous errors"),
            None
        );
        assert_eq!(tar.failed_file("some unrelated line"), None);

        let star = StarBackend::new("star");
        assert_eq!(
            star.failed_file("star: 3 blocks + 0 bytes (total of 30720 bytes = 30.00k)."),
            None
        );
        assert_eq!(star.failed_file("star: WARNING: Archive is 'gzip' compressed."), None);
        assert_eq!(
            star.failed_file("star: Cannot open 'etc/shadow'."),
            Some("Cannot open 'etc/shadow'.".to_string())
        );
    }

    #[test]
    fn test_unpack_member_multi_volume() {
        let archive = Archive {
            local_path: PathBuf::from("/stage/1.tar"),
            volume_parts: vec![PathBuf::from("/stage/1.tar"), PathBuf::from("/stage/2.tar")],
            ..Default::default()
        };
        let (cmd, input) =
            unpack_member_command(Path::new("tar"), &archive, "a.tar.gz", Path::new("/stage"));

        assert_eq!(
            args(&cmd),
            vec!["-C", "/stage", "-x", "-M", "-f", "/stage/1.tar", "-f", "/stage/2.tar", "a.tar.gz"]
        );
        assert_eq!(input, Some(&b"q\n"[..]));
    }
}
