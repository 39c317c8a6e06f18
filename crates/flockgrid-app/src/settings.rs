//! Loading a [`FlockConfig`] from JSON and patching it with `path=value` overrides.

use std::fs;
use std::path::{Path, PathBuf};

use flockgrid_core::{FlockConfig, WorldError};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use thiserror::Error;

/// Errors produced while assembling a configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    InvalidPatch(String),
    #[error("unknown config path: {0}")]
    UnknownPath(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Invalid(#[from] WorldError),
}

impl SettingsError {
    fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// One `path=value` override, e.g. `params.neighbor_search_range=2.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: Value,
}

impl std::str::FromStr for ConfigOverride {
    type Err = SettingsError;

    /// The value is read as JSON, falling back to a plain string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((path, raw)) = s.split_once('=') else {
            return Err(SettingsError::InvalidPatch(format!(
                "expected PATH=VALUE, got '{s}'"
            )));
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(SettingsError::InvalidPatch("empty config path".into()));
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
        Ok(Self {
            path: path.to_owned(),
            value,
        })
    }
}

/// Read a configuration file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<FlockConfig, SettingsError> {
    let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(SettingsError::serialization)
}

/// Apply `overrides` on top of `config` and validate the result.
///
/// Each path must name an existing field of [`FlockConfig`]; values are coerced to that
/// field's kind before the config is read back.
pub fn apply_overrides(
    config: &FlockConfig,
    overrides: &[ConfigOverride],
) -> Result<FlockConfig, SettingsError> {
    let mut tree = serde_json::to_value(config).map_err(SettingsError::serialization)?;
    for item in overrides {
        set_field(&mut tree, &item.path, &item.value)?;
    }
    finish(tree)
}

/// Apply a nested JSON object, e.g. `{"params": {"range_coef": 2.0}}`, as a set of overrides.
pub fn apply_patch(config: &FlockConfig, patch: &Value) -> Result<FlockConfig, SettingsError> {
    let Value::Object(map) = patch else {
        return Err(SettingsError::InvalidPatch(
            "configuration patch must be a JSON object".into(),
        ));
    };
    let mut overrides = Vec::new();
    flatten_patch(map, "", &mut overrides);
    apply_overrides(config, &overrides)
}

fn finish(tree: Value) -> Result<FlockConfig, SettingsError> {
    let patched: FlockConfig = serde_json::from_value(tree)
        .map_err(|err| SettingsError::InvalidPatch(err.to_string()))?;
    patched.validate()?;
    Ok(patched)
}

fn flatten_patch(map: &Map<String, Value>, prefix: &str, out: &mut Vec<ConfigOverride>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_patch(inner, &path, out),
            _ => out.push(ConfigOverride {
                path,
                value: value.clone(),
            }),
        }
    }
}

/// Kind of a config leaf, read off its current serialized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Float,
    Integer,
    Flag,
    /// Plain strings and unit enums such as `strategy`.
    Name,
    /// `Option` fields currently unset; their type is checked on read-back.
    Unset,
}

impl FieldKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) if n.is_f64() => Some(Self::Float),
            Value::Number(_) => Some(Self::Integer),
            Value::Bool(_) => Some(Self::Flag),
            Value::String(_) => Some(Self::Name),
            Value::Null => Some(Self::Unset),
            Value::Object(_) | Value::Array(_) => None,
        }
    }

    fn coerce(self, value: &Value, path: &str) -> Result<Value, SettingsError> {
        let mismatch = || SettingsError::InvalidPatch(format!("{path} expects {self}, got {value}"));
        match (self, value) {
            // Null clears a set `Option`; read-back rejects it for required fields.
            (Self::Unset, _) | (Self::Float | Self::Integer | Self::Name, Value::Null) => {
                Ok(value.clone())
            }
            (Self::Float, Value::Number(_)) | (Self::Flag, Value::Bool(_)) => Ok(value.clone()),
            (Self::Name, Value::String(_)) => Ok(value.clone()),
            (Self::Integer, Value::Number(n)) if n.is_u64() => Ok(value.clone()),
            (Self::Float, Value::String(s)) => {
                let parsed: f64 = s.trim().parse().map_err(|_| mismatch())?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(mismatch)
            }
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<u64>().map(Value::from).map_err(|_| mismatch())
            }
            (Self::Flag, Value::String(s)) => {
                s.trim().parse::<bool>().map(Value::Bool).map_err(|_| mismatch())
            }
            _ => Err(mismatch()),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Float => "a number",
            Self::Integer => "a non-negative integer",
            Self::Flag => "true or false",
            Self::Name => "a name",
            Self::Unset => "any value",
        })
    }
}

/// Resolve the dotted `path` to a config leaf and store `value` there.
fn set_field(tree: &mut Value, path: &str, value: &Value) -> Result<(), SettingsError> {
    let segments: SmallVec<[&str; 4]> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|seg| seg.is_empty()) {
        return Err(SettingsError::InvalidPatch(format!(
            "malformed config path '{path}'"
        )));
    }
    let mut slot = tree;
    for seg in &segments {
        slot = match slot {
            Value::Object(fields) => fields
                .get_mut(*seg)
                .ok_or_else(|| SettingsError::UnknownPath(path.to_owned()))?,
            _ => return Err(SettingsError::UnknownPath(path.to_owned())),
        };
    }
    let kind = FieldKind::of(slot).ok_or_else(|| {
        SettingsError::InvalidPatch(format!("{path} is a section, not a field"))
    })?;
    *slot = kind.coerce(value, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use flockgrid_core::NeighborStrategy;

    use super::*;

    #[test]
    fn overrides_patch_nested_fields() {
        let overrides: Vec<ConfigOverride> = [
            "params.neighbor_search_range=2.5",
            "strategy=cell_cell",
            "rng_seed=7",
            "initial_agents=\"64\"",
        ]
        .iter()
        .map(|s| s.parse().expect("valid override"))
        .collect();
        let config = apply_overrides(&FlockConfig::default(), &overrides).expect("patched");
        assert_eq!(config.params.neighbor_search_range, 2.5);
        assert_eq!(config.strategy, NeighborStrategy::CellCell);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.initial_agents, 64);
    }

    #[test]
    fn unknown_paths_and_bad_values_are_rejected() {
        let unknown: ConfigOverride = "params.gravity=1".parse().expect("syntax ok");
        assert!(matches!(
            apply_overrides(&FlockConfig::default(), &[unknown]),
            Err(SettingsError::UnknownPath(path)) if path == "params.gravity"
        ));

        let invalid: ConfigOverride = "params.neighbor_search_angle=720".parse().expect("syntax ok");
        assert!(matches!(
            apply_overrides(&FlockConfig::default(), &[invalid]),
            Err(SettingsError::Invalid(WorldError::InvalidConfig(_)))
        ));

        assert!("no-equals-sign".parse::<ConfigOverride>().is_err());
    }

    #[test]
    fn values_must_fit_the_field_kind() {
        let rejected = |raw: &str| {
            let item: ConfigOverride = raw.parse().expect("syntax ok");
            apply_overrides(&FlockConfig::default(), &[item]).expect_err(raw)
        };
        assert!(matches!(rejected("initial_agents=2.5"), SettingsError::InvalidPatch(_)));
        assert!(matches!(rejected("initial_agents=-3"), SettingsError::InvalidPatch(_)));
        assert!(matches!(rejected("strategy=5"), SettingsError::InvalidPatch(_)));
        assert!(matches!(rejected("strategy=sideways"), SettingsError::InvalidPatch(_)));
        assert!(matches!(rejected("params=1"), SettingsError::InvalidPatch(_)));
        assert!(matches!(rejected("params..range_coef=1"), SettingsError::InvalidPatch(_)));
        assert!(matches!(
            rejected("initial_agents.count=1"),
            SettingsError::UnknownPath(path) if path == "initial_agents.count"
        ));

        let item: ConfigOverride = "params.range_coef=\"2\"".parse().expect("syntax ok");
        let config = apply_overrides(&FlockConfig::default(), &[item]).expect("string coerced");
        assert_eq!(config.params.range_coef, 2.0);
    }

    #[test]
    fn nested_patches_resolve_like_overrides() {
        let patch = serde_json::json!({
            "params": { "neighbor_search_angle": 120.0, "cell_merge_size": 3 },
            "history_capacity": 8
        });
        let config = apply_patch(&FlockConfig::default(), &patch).expect("patched");
        assert_eq!(config.params.neighbor_search_angle, 120.0);
        assert_eq!(config.params.cell_merge_size, 3);
        assert_eq!(config.history_capacity, 8);

        let unknown = serde_json::json!({ "params": { "drag": 0.1 } });
        assert!(matches!(
            apply_patch(&FlockConfig::default(), &unknown),
            Err(SettingsError::UnknownPath(path)) if path == "params.drag"
        ));
        assert!(apply_patch(&FlockConfig::default(), &serde_json::json!([1, 2])).is_err());
    }
}
