//! Configuration parsing for avsctl
//!
//! This crate provides:
//! - The global config file (`~/.config/avsctl/config.toml`)
//! - Package manifest and profile descriptor parsing (YAML)
//! - The typed option model with validation, env projection and merging

mod error;
mod global;
mod manifest;
mod options;

pub use error::*;
pub use global::*;
pub use manifest::*;
pub use options::*;
