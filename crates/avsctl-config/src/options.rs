//! Typed option model
//!
//! Each profile declares options that project to environment variables.
//! An option is a name, a target env key and a typed validator; the
//! variant set is closed and a value only sticks if it validates.

use crate::manifest::OptionSpec;
use crate::{ConfigError, Result};
use regex::Regex;
use std::collections::BTreeMap;

/// Variant payload of an option. Validation is a pure function over the
/// payload and the candidate string.
#[derive(Debug, Clone)]
pub enum OptionKind {
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Bool,
    Str { regex: Option<Regex> },
    PathDir,
    PathFile { format: Option<String> },
    Uri { schemes: Vec<String> },
    Select { alternatives: Vec<String> },
    Port,
    Id,
}

impl OptionKind {
    /// The wire name of the variant, as it appears in profile descriptors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int { .. } => "int",
            Self::Float { .. } => "float",
            Self::Bool => "bool",
            Self::Str { .. } => "string",
            Self::PathDir => "path_dir",
            Self::PathFile { .. } => "path_file",
            Self::Uri { .. } => "uri",
            Self::Select { .. } => "select",
            Self::Port => "port",
            Self::Id => "id",
        }
    }
}

/// A typed, validated option
#[derive(Debug, Clone)]
pub struct NodeOption {
    name: String,
    target: String,
    help: String,
    default: Option<String>,
    value: Option<String>,
    kind: OptionKind,
}

impl NodeOption {
    /// Build a typed option from its raw declaration. Rejects unknown
    /// type discriminators and regexes that do not compile.
    pub fn from_spec(spec: OptionSpec) -> Result<Self> {
        let validate = spec.validate.unwrap_or_default();

        let kind = match spec.kind.as_str() {
            "int" => OptionKind::Int {
                min: validate.min_value.map(|v| v as i64),
                max: validate.max_value.map(|v| v as i64),
            },
            "float" => OptionKind::Float {
                min: validate.min_value,
                max: validate.max_value,
            },
            "bool" => OptionKind::Bool,
            "str" | "string" => OptionKind::Str {
                regex: match validate.re2_regex {
                    Some(ref pattern) => {
                        Some(Regex::new(pattern).map_err(|_| ConfigError::InvalidRegex {
                            option: spec.name.clone(),
                            pattern: pattern.clone(),
                        })?)
                    }
                    None => None,
                },
            },
            "path_dir" => OptionKind::PathDir,
            "path_file" => OptionKind::PathFile {
                format: validate.format,
            },
            "uri" => OptionKind::Uri {
                schemes: validate.uri_scheme,
            },
            "select" => OptionKind::Select {
                alternatives: validate.options,
            },
            "port" => OptionKind::Port,
            "id" => OptionKind::Id,
            other => {
                return Err(ConfigError::UnknownOptionType {
                    option: spec.name,
                    kind: other.to_string(),
                })
            }
        };

        Ok(Self {
            name: spec.name,
            target: spec.target,
            help: spec.help,
            default: spec.default.as_ref().and_then(yaml_scalar_to_string),
            value: None,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn default(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn kind(&self) -> &OptionKind {
        &self.kind
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Validate and store a value. A rejected value leaves the option
    /// untouched.
    pub fn set(&mut self, candidate: &str) -> Result<()> {
        validate_value(&self.kind, candidate).map_err(|reason| {
            ConfigError::InvalidOptionValue {
                option: self.name.clone(),
                reason,
            }
        })?;
        self.value = Some(candidate.to_string());
        Ok(())
    }

    /// Apply the declared default as the value. Fails when the option
    /// declares none.
    pub fn set_default(&mut self) -> Result<()> {
        let default = self
            .default
            .clone()
            .ok_or_else(|| ConfigError::OptionWithoutDefault(self.name.clone()))?;
        self.set(&default)
    }
}

/// Pure validator: `Ok(())` or a human-readable rejection reason
fn validate_value(kind: &OptionKind, candidate: &str) -> std::result::Result<(), String> {
    match kind {
        OptionKind::Int { min, max } => {
            let parsed: i64 = candidate
                .parse()
                .map_err(|_| format!("'{}' is not an integer", candidate))?;
            if let Some(min) = min {
                if parsed < *min {
                    return Err(format!("{} is below the minimum {}", parsed, min));
                }
            }
            if let Some(max) = max {
                if parsed > *max {
                    return Err(format!("{} is above the maximum {}", parsed, max));
                }
            }
            Ok(())
        }
        OptionKind::Float { min, max } => {
            let parsed: f64 = candidate
                .parse()
                .map_err(|_| format!("'{}' is not a number", candidate))?;
            if let Some(min) = min {
                if parsed < *min {
                    return Err(format!("{} is below the minimum {}", parsed, min));
                }
            }
            if let Some(max) = max {
                if parsed > *max {
                    return Err(format!("{} is above the maximum {}", parsed, max));
                }
            }
            Ok(())
        }
        OptionKind::Bool => candidate
            .parse::<bool>()
            .map(|_| ())
            .map_err(|_| format!("'{}' is not a boolean", candidate)),
        OptionKind::Str { regex } => {
            if let Some(regex) = regex {
                if !regex.is_match(candidate) {
                    return Err(format!("'{}' does not match {}", candidate, regex.as_str()));
                }
            }
            Ok(())
        }
        OptionKind::PathDir => {
            if !is_unix_path(candidate) {
                return Err(format!("'{}' is not a Unix path", candidate));
            }
            Ok(())
        }
        OptionKind::PathFile { format } => {
            if !is_unix_path(candidate) {
                return Err(format!("'{}' is not a Unix path", candidate));
            }
            if let Some(format) = format {
                let want = format.trim_start_matches('.');
                let got = std::path::Path::new(candidate)
                    .extension()
                    .and_then(|e| e.to_str());
                if got != Some(want) {
                    return Err(format!("'{}' does not have extension .{}", candidate, want));
                }
            }
            Ok(())
        }
        OptionKind::Uri { schemes } => {
            let parsed = url::Url::parse(candidate)
                .map_err(|_| format!("'{}' is not a valid URI", candidate))?;
            if !schemes.is_empty() {
                let ok = schemes
                    .iter()
                    .any(|s| parsed.scheme() == s.trim_end_matches("://"));
                if !ok {
                    return Err(format!(
                        "scheme '{}' is not one of {:?}",
                        parsed.scheme(),
                        schemes
                    ));
                }
            }
            Ok(())
        }
        OptionKind::Select { alternatives } => {
            if !alternatives.iter().any(|a| a == candidate) {
                return Err(format!("'{}' is not one of {:?}", candidate, alternatives));
            }
            Ok(())
        }
        OptionKind::Port => {
            candidate
                .parse::<u16>()
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a port in [0, 65535]", candidate))
        }
        OptionKind::Id => Ok(()),
    }
}

/// Absolute or explicitly-relative Unix path shape
fn is_unix_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && (candidate.starts_with('/')
            || candidate.starts_with("./")
            || candidate.starts_with("../"))
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Project a fully-set option list to its environment map.
/// Unset options fail with `OptionWithoutValue`.
pub fn project_env(options: &[NodeOption]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for option in options {
        let value = option
            .value()
            .ok_or_else(|| ConfigError::OptionWithoutValue(option.name().to_string()))?;
        env.insert(option.target().to_string(), value.to_string());
    }
    Ok(env)
}

/// Result of merging an installed instance's options with the options of
/// the version being installed over it
#[derive(Debug, Clone, Default)]
pub struct MergedOptions {
    /// The target version's options, carrying values from the old install
    /// where names match
    pub options: Vec<NodeOption>,
    /// Options that exist only in the old install
    pub deprecated: Vec<NodeOption>,
}

/// Merge old (installed) options into new (target-version) options.
///
/// For every new option: a same-named old option that was set donates its
/// value, falling back to the new default when the old value no longer
/// validates; otherwise the default is applied when one exists. Old
/// options with no counterpart are surfaced as deprecated. Idempotent.
pub fn merge_options(old: &[NodeOption], new: &[NodeOption]) -> MergedOptions {
    let mut options = Vec::with_capacity(new.len());
    for template in new {
        let mut option = template.clone();
        let carried = old
            .iter()
            .find(|o| o.name() == option.name() && o.is_set())
            .and_then(|o| o.value())
            .map(|v| option.set(v));
        match carried {
            Some(Ok(())) => {}
            // Old value rejected by the new rules, or nothing to carry
            _ => {
                let _ = option.set_default();
            }
        }
        options.push(option);
    }

    let deprecated = old
        .iter()
        .filter(|o| !new.iter().any(|n| n.name() == o.name()))
        .cloned()
        .collect();

    MergedOptions { options, deprecated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ValidateSpec;

    fn spec(name: &str, kind: &str, validate: Option<ValidateSpec>) -> OptionSpec {
        OptionSpec {
            name: name.to_string(),
            target: name.to_uppercase().replace('-', "_"),
            kind: kind.to_string(),
            help: String::new(),
            default: None,
            validate,
        }
    }

    fn option(name: &str, kind: &str, validate: Option<ValidateSpec>) -> NodeOption {
        NodeOption::from_spec(spec(name, kind, validate)).unwrap()
    }

    #[test]
    fn test_int_range() {
        let mut opt = option(
            "workers",
            "int",
            Some(ValidateSpec {
                min_value: Some(1.0),
                max_value: Some(16.0),
                ..Default::default()
            }),
        );
        assert!(opt.set("8").is_ok());
        assert_eq!(opt.value(), Some("8"));
        assert!(opt.set("0").is_err());
        assert!(opt.set("17").is_err());
        assert!(opt.set("eight").is_err());
        // Rejections leave the previous value in place
        assert_eq!(opt.value(), Some("8"));
    }

    #[test]
    fn test_float_range() {
        let mut opt = option(
            "ratio",
            "float",
            Some(ValidateSpec {
                min_value: Some(0.0),
                max_value: Some(1.0),
                ..Default::default()
            }),
        );
        assert!(opt.set("0.5").is_ok());
        assert!(opt.set("1.5").is_err());
        assert!(opt.set("-0.1").is_err());
    }

    #[test]
    fn test_bool() {
        let mut opt = option("enabled", "bool", None);
        assert!(opt.set("true").is_ok());
        assert!(opt.set("false").is_ok());
        assert!(opt.set("yes").is_err());
    }

    #[test]
    fn test_string_regex() {
        let mut opt = option(
            "chain",
            "string",
            Some(ValidateSpec {
                re2_regex: Some("^0x[0-9a-f]{4}$".to_string()),
                ..Default::default()
            }),
        );
        assert!(opt.set("0xbeef").is_ok());
        assert!(opt.set("beef").is_err());
    }

    #[test]
    fn test_invalid_regex_rejected_at_typing_time() {
        let result = NodeOption::from_spec(spec(
            "bad",
            "string",
            Some(ValidateSpec {
                re2_regex: Some("(unclosed".to_string()),
                ..Default::default()
            }),
        ));
        assert!(matches!(result, Err(ConfigError::InvalidRegex { .. })));
    }

    #[test]
    fn test_path_dir() {
        let mut opt = option("data", "path_dir", None);
        assert!(opt.set("/var/lib/node").is_ok());
        assert!(opt.set("./data").is_ok());
        assert!(opt.set("../data").is_ok());
        assert!(opt.set("data").is_err());
        assert!(opt.set("").is_err());
    }

    #[test]
    fn test_path_file_format() {
        let mut opt = option(
            "keystore",
            "path_file",
            Some(ValidateSpec {
                format: Some("json".to_string()),
                ..Default::default()
            }),
        );
        assert!(opt.set("/keys/operator.json").is_ok());
        assert!(opt.set("/keys/operator.txt").is_err());
        assert!(opt.set("operator.json").is_err());
    }

    #[test]
    fn test_uri_schemes() {
        let mut opt = option(
            "rpc",
            "uri",
            Some(ValidateSpec {
                uri_scheme: vec!["https".to_string(), "wss".to_string()],
                ..Default::default()
            }),
        );
        assert!(opt.set("https://rpc.example.com").is_ok());
        assert!(opt.set("wss://rpc.example.com/ws").is_ok());
        assert!(opt.set("http://rpc.example.com").is_err());
        assert!(opt.set("not a uri").is_err());
    }

    #[test]
    fn test_select() {
        let mut opt = option(
            "network",
            "select",
            Some(ValidateSpec {
                options: vec!["mainnet".to_string(), "holesky".to_string()],
                ..Default::default()
            }),
        );
        assert!(opt.set("holesky").is_ok());
        assert!(opt.set("goerli").is_err());
    }

    #[test]
    fn test_port() {
        let mut opt = option("p2p-port", "port", None);
        assert!(opt.set("0").is_ok());
        assert!(opt.set("65535").is_ok());
        assert!(opt.set("65536").is_err());
        assert!(opt.set("-1").is_err());
    }

    #[test]
    fn test_id_accepts_anything() {
        let mut opt = option("operator-id", "id", None);
        assert!(opt.set("whatever goes").is_ok());
    }

    #[test]
    fn test_failed_set_keeps_unset() {
        let mut opt = option("workers", "int", None);
        assert!(opt.set("nope").is_err());
        assert!(!opt.is_set());
        assert_eq!(opt.value(), None);
    }

    #[test]
    fn test_default_from_yaml_number() {
        let mut raw = spec("main-port", "port", None);
        raw.default = Some(serde_yaml::Value::Number(serde_yaml::Number::from(8080u64)));
        let mut opt = NodeOption::from_spec(raw).unwrap();
        assert_eq!(opt.default(), Some("8080"));
        opt.set_default().unwrap();
        assert_eq!(opt.value(), Some("8080"));
    }

    #[test]
    fn test_set_default_without_default() {
        let mut opt = option("operator-id", "id", None);
        assert!(matches!(
            opt.set_default(),
            Err(ConfigError::OptionWithoutDefault(_))
        ));
    }

    #[test]
    fn test_project_env() {
        let mut a = option("a-opt", "id", None);
        let mut b = option("b-opt", "id", None);
        a.set("1").unwrap();
        b.set("2").unwrap();
        let env = project_env(&[a, b]).unwrap();
        assert_eq!(env["A_OPT"], "1");
        assert_eq!(env["B_OPT"], "2");
    }

    #[test]
    fn test_project_env_unset_fails() {
        let mut a = option("a-opt", "id", None);
        a.set("1").unwrap();
        let b = option("b-opt", "id", None);
        let err = project_env(&[a, b]).unwrap_err();
        assert!(matches!(err, ConfigError::OptionWithoutValue(name) if name == "b-opt"));
    }

    #[test]
    fn test_merge_carries_old_values() {
        let mut old = vec![option("kept", "id", None), option("gone", "id", None)];
        old[0].set("custom").unwrap();
        old[1].set("old-value").unwrap();

        let mut new_tpl = spec("kept", "id", None);
        new_tpl.default = Some(serde_yaml::Value::String("default".into()));
        let fresh = spec("fresh", "id", None);
        let new = vec![
            NodeOption::from_spec(new_tpl).unwrap(),
            NodeOption::from_spec(fresh).unwrap(),
        ];

        let merged = merge_options(&old, &new);
        assert_eq!(merged.options.len(), 2);
        assert_eq!(merged.options[0].value(), Some("custom"));
        assert!(!merged.options[1].is_set());
        assert_eq!(merged.deprecated.len(), 1);
        assert_eq!(merged.deprecated[0].name(), "gone");
    }

    #[test]
    fn test_merge_falls_back_to_default_when_old_value_invalid() {
        let mut old = vec![option("workers", "id", None)];
        old[0].set("not-a-number").unwrap();

        let mut new_spec = spec(
            "workers",
            "int",
            Some(ValidateSpec {
                min_value: Some(1.0),
                max_value: Some(4.0),
                ..Default::default()
            }),
        );
        new_spec.default = Some(serde_yaml::Value::Number(serde_yaml::Number::from(2u64)));
        let new = vec![NodeOption::from_spec(new_spec).unwrap()];

        let merged = merge_options(&old, &new);
        assert_eq!(merged.options[0].value(), Some("2"));
    }

    #[test]
    fn test_merge_idempotent() {
        let mut old = vec![option("kept", "id", None)];
        old[0].set("v1").unwrap();
        let new = vec![option("kept", "id", None), option("fresh", "id", None)];

        let once = merge_options(&old, &new);
        let twice = merge_options(&once.options, &new);

        assert_eq!(once.options.len(), twice.options.len());
        for (a, b) in once.options.iter().zip(twice.options.iter()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.value(), b.value());
        }
        assert!(twice.deprecated.is_empty());
    }
}
