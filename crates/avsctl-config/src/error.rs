//! Error types for configuration parsing

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config at {path}: {source}")]
    TomlParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse YAML document at {path}: {source}")]
    YamlParseError {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Failed to determine data directory")]
    NoDataDir,

    #[error("Failed to write config file at {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unknown option type '{kind}' for option '{option}'")]
    UnknownOptionType { option: String, kind: String },

    #[error("Invalid value for option '{option}': {reason}")]
    InvalidOptionValue { option: String, reason: String },

    #[error("Option '{option}' declares an invalid regex: {pattern}")]
    InvalidRegex { option: String, pattern: String },

    #[error("Option '{0}' has no default value")]
    OptionWithoutDefault(String),

    #[error("Option '{0}' has no value")]
    OptionWithoutValue(String),

    #[error("Plugin declaration must set exactly one of 'image' or 'build_from'")]
    InvalidPlugin,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
