//! Common types for the container runtime adapter

use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One row of `compose ps` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Service")]
    pub service: String,
}

impl ComposeService {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Selector for `compose ps`
#[derive(Debug, Clone, Default)]
pub struct PsQuery {
    /// Only return services whose container state is `running`
    pub filter_running: bool,
    /// Only return the service with this name
    pub service: Option<String>,
}

impl PsQuery {
    pub fn running() -> Self {
        Self {
            filter_running: true,
            service: None,
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            filter_running: false,
            service: Some(name.into()),
        }
    }

    pub fn matches(&self, service: &ComposeService) -> bool {
        if self.filter_running && !service.is_running() {
            return false;
        }
        if let Some(ref name) = self.service {
            if &service.service != name {
                return false;
            }
        }
        true
    }
}

/// Parse `compose ps --format json` output.
///
/// Compose emits either a single JSON array or one object per line
/// depending on its version; both forms must be accepted.
pub fn parse_compose_ps(raw: &str) -> Result<Vec<ComposeService>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(services) = serde_json::from_str::<Vec<ComposeService>>(trimmed) {
        return Ok(services);
    }

    let mut services = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let service: ComposeService = serde_json::from_str(line)
            .map_err(|e| RuntimeError::Parse(format!("compose ps row '{}': {}", line, e)))?;
        services.push(service);
    }
    Ok(services)
}

/// Bind mount passed to `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    pub source: String,
    pub target: String,
}

impl std::str::FromStr for VolumeBind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, target)) if !source.is_empty() && !target.is_empty() => Ok(Self {
                source: source.to_string(),
                target: target.to_string(),
            }),
            _ => Err(format!("'{}' is not a src:dst volume binding", s)),
        }
    }
}

/// Specification for a one-shot container run
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    /// Network to attach to (`host` for the host network)
    pub network: Option<String>,
    /// Command arguments appended to the image entrypoint
    pub args: Vec<String>,
    pub mounts: Vec<VolumeBind>,
}

/// Log retrieval options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    /// Number of lines from the end, `None` for all
    pub tail: Option<String>,
    /// Unix timestamp lower bound
    pub since: Option<i64>,
    /// Unix timestamp upper bound
    pub until: Option<i64>,
    pub timestamps: bool,
}
