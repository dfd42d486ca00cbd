// src/archive/locator.rs

//! Archive source locators
//!
//! Locators use a URL-like syntax, `scheme://[host][:port]/path`:
//! - `file:///dir/archive.tar` - local file (also the default for bare paths)
//! - `nfs://server:/dir/archive.tar` - file on an NFS export
//! - `dev://sdb1/archive.tar` - file on a block device
//! - `cd://archive.tar`, `cd1://archive.tar` - file on a CD drive (index defaults to 0)
//! - `fd://archive.tar`, `fd1://archive.tar` - file on a floppy drive

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Source type of a locator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Nfs,
    Device,
    Cd(u32),
    Floppy(u32),
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Scheme::File),
            "nfs" => Some(Scheme::Nfs),
            "dev" => Some(Scheme::Device),
            _ => {
                if let Some(index) = s.strip_prefix("cd") {
                    Self::drive_index(index).map(Scheme::Cd)
                } else if let Some(index) = s.strip_prefix("fd") {
                    Self::drive_index(index).map(Scheme::Floppy)
                } else {
                    None
                }
            }
        }
    }

    fn drive_index(s: &str) -> Option<u32> {
        if s.is_empty() {
            Some(0)
        } else {
            s.parse().ok()
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::File => write!(f, "file"),
            Scheme::Nfs => write!(f, "nfs"),
            Scheme::Device => write!(f, "dev"),
            Scheme::Cd(index) => write!(f, "cd{}", index),
            Scheme::Floppy(index) => write!(f, "fd{}", index),
        }
    }
}

/// A parsed archive locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Locator {
    /// The locator exactly as it was entered
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Local files and NFS exports stay reachable for the whole session,
    /// removable media may not.
    pub fn is_persistent(&self) -> bool {
        matches!(self.scheme, Scheme::File | Scheme::Nfs)
    }

    /// Device node for `dev://` locators (`sdb1` becomes `/dev/sdb1`)
    pub fn device(&self) -> Option<String> {
        match self.scheme {
            Scheme::Device if self.host.starts_with('/') => Some(self.host.clone()),
            Scheme::Device if !self.host.is_empty() => Some(format!("/dev/{}", self.host)),
            _ => None,
        }
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Validation("Empty archive locator".to_string()));
        }

        let Some((scheme_str, rest)) = input.split_once("://") else {
            return Ok(Self {
                raw: input.to_string(),
                scheme: Scheme::File,
                host: String::new(),
                port: None,
                path: input.to_string(),
            });
        };

        let scheme = Scheme::parse(scheme_str).ok_or_else(|| {
            Error::Validation(format!("Unknown prefix in input: {}", input))
        })?;

        // file:// takes everything after the prefix verbatim
        if scheme == Scheme::File {
            return Ok(Self {
                raw: input.to_string(),
                scheme,
                host: String::new(),
                port: None,
                path: rest.to_string(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.split_once(':') {
            Some((host, "")) => (host, None),
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Validation(format!("Invalid port '{}' in {}", port, input))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        // cd://archive.tar and fd://archive.tar carry the file name where a host would be
        let (host, path) = match scheme {
            Scheme::Cd(_) | Scheme::Floppy(_) if path.is_empty() => {
                (String::new(), format!("/{}", host))
            }
            _ => (host.to_string(), path.to_string()),
        };

        Ok(Self {
            raw: input.to_string(),
            scheme,
            host,
            port,
            path,
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_path_defaults_to_file() {
        let loc: Locator = "/backup/archive.tar".parse().unwrap();
        assert_eq!(loc.scheme, Scheme::File);
        assert_eq!(loc.path, "/backup/archive.tar");
        assert!(loc.is_persistent());
    }

    #[test]
    fn test_file_scheme() {
        let loc: Locator = "file:///backup/archive.tar".parse().unwrap();
        assert_eq!(loc.scheme, Scheme::File);
        assert_eq!(loc.path, "/backup/archive.tar");
        assert_eq!(loc.as_str(), "file:///backup/archive.tar");
    }

    #[test]
    fn test_nfs_with_empty_port() {
        let loc: Locator = "nfs://server:/exports/archive.tar".parse().unwrap();
        assert_eq!(loc.scheme, Scheme::Nfs);
        assert_eq!(loc.host, "server");
        assert_eq!(loc.port, None);
        assert_eq!(loc.path, "/exports/archive.tar");
        assert!(loc.is_persistent());
    }

    #[test]
    fn test_nfs_with_port() {
        let loc: Locator = "nfs://server:2049/exports/archive.tar".parse().unwrap();
        assert_eq!(loc.port, Some(2049));
    }

    #[test]
    fn test_device_scheme() {
        let loc: Locator = "dev://sdb1/backup/archive.tar".parse().unwrap();
        assert_eq!(loc.scheme, Scheme::Device);
        assert_eq!(loc.device(), Some("/dev/sdb1".to_string()));
        assert_eq!(loc.path, "/backup/archive.tar");
        assert!(!loc.is_persistent());
    }

    #[test]
    fn test_cd_and_floppy_indices() {
        let cd: Locator = "cd://archive.tar".parse().unwrap();
        assert_eq!(cd.scheme, Scheme::Cd(0));
        assert_eq!(cd.path, "/archive.tar");

        let cd2: Locator = "cd2:///dir/archive.tar".parse().unwrap();
        assert_eq!(cd2.scheme, Scheme::Cd(2));
        assert_eq!(cd2.path, "/dir/archive.tar");

        let fd: Locator = "fd1://archive.tar".parse().unwrap();
        assert_eq!(fd.scheme, Scheme::Floppy(1));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!("smb://host/share/archive.tar".parse::<Locator>().is_err());
        assert!("".parse::<Locator>().is_err());
    }
}
