// src/packages/mod.rs

//! Installed-package database access
//!
//! The restore engine only needs two queries from the system: the installed
//! roster (name -> version) and a one-line summary per package. Each backend
//! implements the `PackageDatabase` trait.

pub mod rpm;
pub mod traits;

pub use rpm::RpmDatabase;
pub use traits::{PackageDatabase, Roster, StaticDatabase};
