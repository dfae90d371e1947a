//! Error types for avsctl-core

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] avsctl_config::ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] avsctl_provider::RuntimeError),

    #[error("Invalid package URL: {0}")]
    InvalidUrl(String),

    #[error("'{0}' is neither a version tag nor a commit hash")]
    InvalidRef(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance already exists: {0}")]
    InstanceExists(String),

    #[error("Instance is not running: {0}")]
    InstanceNotRunning(String),

    #[error("Version {version} is already installed for {instance}")]
    VersionAlreadyInstalled { instance: String, version: String },

    #[error("Package does not support upgrading from {from} to {to}")]
    UpgradeNotSupported { from: String, to: String },

    #[error("Profile does not exist: {0}")]
    ProfileNotFound(String),

    #[error("No pulled package for {0}; pull it first")]
    TempNotFound(String),

    #[error("Package checksum verification failed: {0}")]
    InvalidChecksum(String),

    #[error("Package file not found: {0}")]
    PackageFileNotFound(PathBuf),

    #[error("Package directory not found: {0}")]
    PackageDirNotFound(PathBuf),

    #[error("Package has no version tags")]
    NoVersions,

    #[error("Monitoring target for service '{0}' has no port")]
    MonitoringPortNotSet(String),

    #[error("Instance {0} declares no plugin")]
    NoPlugin(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("git {verb} failed: {message}")]
    Git { verb: String, message: String },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No free port for {variable}: tried {attempts} ports from {start}")]
    NoFreePort {
        variable: String,
        start: u16,
        attempts: u16,
    },

    #[error("Port variable {variable} has a non-integer value '{value}'")]
    InvalidPort { variable: String, value: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not connected to a container runtime: {0}")]
    NotConnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State file corrupted: {0}")]
    StateCorrupted(String),

    #[error("{original}; restore after failure also failed: {restore}")]
    RestoreAfterFailure {
        original: Box<CoreError>,
        restore: Box<CoreError>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;
