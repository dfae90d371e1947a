//! Core instance lifecycle engine for avsctl
//!
//! This crate provides:
//! - The data directory: on-disk layout, lock discipline, atomic state
//! - Package acquisition and verification (git, checksums, profiles)
//! - The install / update / uninstall / backup / restore state machines
//! - The monitoring stack and its scrape-target registry
//! - Node health probing

pub mod backup;
mod datadir;
mod error;
mod health;
mod instance;
mod locker;
mod manager;
mod monitoring;
mod package;

pub use datadir::*;
pub use error::*;
pub use health::*;
pub use instance::*;
pub use locker::*;
pub use manager::*;
pub use monitoring::*;
pub use package::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
