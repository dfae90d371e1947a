//! Package manifest and profile descriptor parsing
//!
//! A package ships a YAML manifest at `pkg/manifest.yml` and one descriptor
//! per profile at `pkg/<profile>/profile.yml`.

use crate::options::NodeOption;
use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Package manifest (`pkg/manifest.yml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable package name
    pub name: String,

    /// Upgrade matrix: target version -> versions it can be upgraded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<std::collections::HashMap<String, Vec<String>>>,

    /// Path (relative to the package root) of a shared hardware
    /// requirements document that profiles may fall back to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_requirements: Option<String>,

    /// Package-level plugin declaration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginDef>,

    /// Names of the profiles the package provides
    pub profiles: Vec<String>,
}

impl Manifest {
    /// Load and parse a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Plugin declaration: a prebuilt image or a remote build context,
/// never both
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_from: Option<String>,
}

impl PluginDef {
    /// Exactly one of `image` or `build_from` must be set
    pub fn validate(&self) -> Result<()> {
        match (&self.image, &self.build_from) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::InvalidPlugin),
        }
    }
}

/// Hardware requirements advertised by a package or profile.
/// Parsed and surfaced to the caller; probing the host is not our job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareRequirements {
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_space_gb: Option<u64>,
}

impl HardwareRequirements {
    /// Load from a standalone YAML document
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Raw profile descriptor (`pkg/<profile>/profile.yml`) as written on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Option declarations, in file order
    #[serde(default)]
    pub options: Vec<OptionSpec>,

    /// Monitoring declaration
    #[serde(default)]
    pub monitoring: MonitoringSpec,

    /// API endpoint exposed by the profile, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSpec>,

    /// Profile-level plugin declaration (overrides the manifest's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginDef>,

    /// Inline hardware requirements (override the manifest-level document)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_requirements: Option<HardwareRequirements>,
}

impl ProfileSpec {
    /// Load and parse a profile descriptor
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Raw option declaration inside a profile descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,

    /// Environment variable the option projects to
    pub target: String,

    /// Option type discriminator (`int`, `float`, `bool`, `string`,
    /// `path_dir`, `path_file`, `uri`, `select`, `port`, `id`)
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub help: String,

    /// Default value; YAML scalars of any type are accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<ValidateSpec>,
}

/// Variant-specific validation payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateSpec {
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub re2_regex: Option<String>,
    /// Required file extension for `path_file` options
    pub format: Option<String>,
    /// Accepted URI schemes for `uri` options
    pub uri_scheme: Vec<String>,
    /// Accepted values for `select` options
    pub options: Vec<String>,
}

/// Monitoring declaration inside a profile descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSpec {
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

/// A declared scrape target: a compose service plus where to scrape it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSpec {
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// API endpoint declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiSpec {
    pub service: String,
    pub port: u16,
}

/// A fully-typed profile: the descriptor with its options converted to
/// the validated option model
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub options: Vec<NodeOption>,
    pub monitoring_targets: Vec<TargetSpec>,
    pub api: Option<ApiSpec>,
    pub plugin: Option<PluginDef>,
    pub hardware_requirements: Option<HardwareRequirements>,
}

impl Profile {
    /// Type a raw descriptor. Rejects unknown option types and
    /// unparsable validation regexes.
    pub fn from_spec(name: &str, spec: ProfileSpec) -> Result<Self> {
        if let Some(ref plugin) = spec.plugin {
            plugin.validate()?;
        }

        let options = spec
            .options
            .into_iter()
            .map(NodeOption::from_spec)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            options,
            monitoring_targets: spec.monitoring.targets,
            api: spec.api,
            plugin: spec.plugin,
            hardware_requirements: spec.hardware_requirements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let yaml = r#"
name: mock-avs
upgrade:
  v3.0.3: ["v3.0.2", "v3.0.1"]
plugin:
  image: mockavs/plugin:latest
profiles:
  - health-checker
  - option-returner
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.name, "mock-avs");
        assert_eq!(manifest.profiles.len(), 2);
        assert_eq!(
            manifest.plugin.as_ref().unwrap().image.as_deref(),
            Some("mockavs/plugin:latest")
        );
        assert_eq!(
            manifest.upgrade.as_ref().unwrap()["v3.0.3"],
            vec!["v3.0.2", "v3.0.1"]
        );
    }

    #[test]
    fn test_parse_profile_spec() {
        let yaml = r#"
options:
  - name: main-port
    target: MAIN_PORT
    type: port
    help: "Port the node listens on"
    default: 8080
monitoring:
  targets:
    - service: main-service
      port: 9090
      path: /metrics
api:
  service: main-service
  port: 8080
"#;
        let spec: ProfileSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.options.len(), 1);
        assert_eq!(spec.options[0].kind, "port");
        assert_eq!(spec.monitoring.targets[0].port, Some(9090));
        assert_eq!(spec.api.as_ref().unwrap().port, 8080);
    }

    #[test]
    fn test_target_spec_default_path() {
        let yaml = r#"
targets:
  - service: node
    port: 9100
"#;
        let spec: MonitoringSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.targets[0].path, "/metrics");
    }

    #[test]
    fn test_plugin_validate() {
        let image_only = PluginDef {
            image: Some("img".into()),
            build_from: None,
        };
        assert!(image_only.validate().is_ok());

        let both = PluginDef {
            image: Some("img".into()),
            build_from: Some("https://example.com/repo".into()),
        };
        assert!(matches!(both.validate(), Err(ConfigError::InvalidPlugin)));

        let neither = PluginDef {
            image: None,
            build_from: None,
        };
        assert!(matches!(neither.validate(), Err(ConfigError::InvalidPlugin)));
    }

    #[test]
    fn test_profile_from_spec_rejects_unknown_type() {
        let yaml = r#"
options:
  - name: weird
    target: WEIRD
    type: quantum
"#;
        let spec: ProfileSpec = serde_yaml::from_str(yaml).unwrap();
        let err = Profile::from_spec("p", spec).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOptionType { .. }));
    }
}
