//! Instance identity and persisted state
//!
//! An instance is identified by `<name>-<tag>` where the name derives from
//! the package URL. Its durable form is the `state.json` document inside
//! the instance directory.

use crate::{CoreError, Result};
use avsctl_config::{ApiSpec, PluginDef, TargetSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The `state.json` document of an installed instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceState {
    pub name: String,
    pub tag: String,
    pub url: String,
    /// Semantic version, `v<MAJOR>.<MINOR>.<PATCH>`
    pub version: String,
    /// 40-hex commit the package was pinned to
    pub commit: String,
    pub profile: String,

    #[serde(default)]
    pub monitoring_targets: Vec<TargetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_target: Option<ApiSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginDef>,
}

impl InstanceState {
    /// The instance id, `<name>-<tag>`
    pub fn id(&self) -> String {
        instance_id(&self.name, &self.tag)
    }
}

/// Compose an instance id from its parts
pub fn instance_id(name: &str, tag: &str) -> String {
    format!("{}-{}", name, tag)
}

/// Derive the instance name from the final path segment of a package URL
pub fn name_from_url(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw).map_err(|_| CoreError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CoreError::InvalidUrl(raw.to_string()));
    }

    let name = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.trim_end_matches(".git").to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::InvalidUrl(raw.to_string()))?;

    Ok(name)
}

/// Temp-area key for a package URL: reruns of the same URL are cache hits
pub fn temp_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_url() {
        assert_eq!(
            name_from_url("https://github.com/acme/mock-avs").unwrap(),
            "mock-avs"
        );
        assert_eq!(
            name_from_url("https://github.com/acme/mock-avs.git").unwrap(),
            "mock-avs"
        );
        assert_eq!(
            name_from_url("https://github.com/acme/mock-avs/").unwrap(),
            "mock-avs"
        );
    }

    #[test]
    fn test_name_from_url_rejects_bad_urls() {
        assert!(matches!(
            name_from_url("not a url"),
            Err(CoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            name_from_url("ftp://example.com/pkg"),
            Err(CoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            name_from_url("https://example.com"),
            Err(CoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_instance_id() {
        assert_eq!(instance_id("mock-avs", "default"), "mock-avs-default");
    }

    #[test]
    fn test_temp_key_is_stable() {
        let a = temp_key("https://github.com/acme/mock-avs");
        let b = temp_key("https://github.com/acme/mock-avs");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, temp_key("https://github.com/acme/other"));
    }

    #[test]
    fn test_state_json_round_trip() {
        let state = InstanceState {
            name: "mock-avs".into(),
            tag: "default".into(),
            url: "https://github.com/acme/mock-avs".into(),
            version: "v3.0.3".into(),
            commit: "a".repeat(40),
            profile: "health-checker".into(),
            monitoring_targets: vec![TargetSpec {
                service: "main-service".into(),
                port: Some(9090),
                path: "/metrics".into(),
            }],
            api_target: Some(ApiSpec {
                service: "main-service".into(),
                port: 8080,
            }),
            plugin: None,
        };

        let json = serde_json::to_string_pretty(&state).unwrap();
        let parsed: InstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.id(), "mock-avs-default");
        // Optional absent fields stay out of the document
        assert!(!json.contains("plugin"));
    }
}
