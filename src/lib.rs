// src/lib.rs

//! Restorer
//!
//! Restores a machine's files and installed-package roster from backup
//! archives, including archives split across several volumes.
//!
//! # Architecture
//!
//! - Archives: a tar container with an `info/` manifest and one compressed
//!   subarchive per package
//! - Reconciliation: backup-time roster vs. the installed packages
//! - Selection: none, all or an explicit file subset per package
//! - Extraction: one external archiver process at a time, cancellable
//! - Sessions: all state lives in an explicit `RestoreSession`

pub mod archive;
pub mod config;
mod error;
pub mod extract;
pub mod hooks;
pub mod mount;
pub mod packages;
pub mod reconcile;
pub mod rpmdb;
pub mod selection;
pub mod session;

pub use error::{Error, Result};
pub use session::{Collaborators, RestoreSession, SessionProfile, Summary};
