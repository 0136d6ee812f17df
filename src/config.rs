//! BP-030: Tool configuration (`bpforge.toml`).
//!
//! Every field is optional. Relative `module_roots` are resolved against the
//! directory holding the config file. CLI flags override file values.

use crate::core::types::ValidationLevel;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up next to the blueprint when `--config` is absent.
pub const CONFIG_FILE: &str = "bpforge.toml";

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Validation level as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelSetting {
    Ignore,
    Warning,
    Error,
}

impl From<LevelSetting> for ValidationLevel {
    fn from(level: LevelSetting) -> Self {
        match level {
            LevelSetting::Ignore => ValidationLevel::Ignore,
            LevelSetting::Warning => ValidationLevel::Warning,
            LevelSetting::Error => ValidationLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Overrides the blueprint's `validation_level`
    #[serde(default)]
    pub validation_level: Option<LevelSetting>,

    /// Validators to skip on every run
    #[serde(default)]
    pub skip_validators: Vec<String>,

    /// Per-check timeout for cloud preflight validators
    #[serde(default = "default_timeout_secs")]
    pub preflight_timeout_secs: u64,

    /// Directories searched for non-relative module sources
    #[serde(default)]
    pub module_roots: Vec<PathBuf>,

    /// Default log filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            validation_level: None,
            skip_validators: Vec::new(),
            preflight_timeout_secs: default_timeout_secs(),
            module_roots: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl ToolConfig {
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_secs)
    }

    /// The effective level: the config override, else the blueprint's own.
    pub fn level(&self, blueprint_level: ValidationLevel) -> ValidationLevel {
        self.validation_level
            .map(ValidationLevel::from)
            .unwrap_or(blueprint_level)
    }
}

/// Parse a config from a TOML string.
pub fn parse_config(text: &str) -> Result<ToolConfig, String> {
    toml::from_str(text).map_err(|e| format!("config parse error: {}", e))
}

/// Load a config file, anchoring relative module roots at its directory.
pub fn load_config(path: &Path) -> Result<ToolConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut config = parse_config(&text).map_err(|e| format!("{}: {}", path.display(), e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for root in config.module_roots.iter_mut() {
        if root.is_relative() {
            *root = base.join(&*root);
        }
    }
    Ok(config)
}

/// Load `explicit` if given, else `bpforge.toml` beside the blueprint, else
/// defaults.
pub fn discover_config(explicit: Option<&Path>, blueprint: &Path) -> Result<ToolConfig, String> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let beside = blueprint
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CONFIG_FILE);
    if beside.is_file() {
        load_config(&beside)
    } else {
        Ok(ToolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bp030_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ToolConfig::default());
        assert_eq!(config.preflight_timeout(), Duration::from_secs(30));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.level(ValidationLevel::Error), ValidationLevel::Error);
    }

    #[test]
    fn test_bp030_full() {
        let config = parse_config(
            r#"
validation_level = "ignore"
skip_validators = ["test_apis_enabled"]
preflight_timeout_secs = 5
module_roots = ["/opt/modules"]
log_level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.level(ValidationLevel::Error), ValidationLevel::Ignore);
        assert_eq!(config.skip_validators, vec!["test_apis_enabled"]);
        assert_eq!(config.preflight_timeout(), Duration::from_secs(5));
        assert_eq!(config.module_roots, vec![PathBuf::from("/opt/modules")]);
    }

    #[test]
    fn test_bp030_rejects_unknown_keys_and_levels() {
        assert!(parse_config("colour = \"blue\"").is_err());
        let err = parse_config("validation_level = \"loud\"").unwrap_err();
        assert!(err.starts_with("config parse error"));
    }

    #[test]
    fn test_bp030_relative_roots_anchor_at_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "module_roots = [\"lib\", \"/abs\"]\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(
            config.module_roots,
            vec![dir.path().join("lib"), PathBuf::from("/abs")]
        );
    }

    #[test]
    fn test_bp030_discover() {
        let dir = tempfile::tempdir().unwrap();
        let bp = dir.path().join("bp.yaml");
        assert_eq!(discover_config(None, &bp).unwrap(), ToolConfig::default());

        std::fs::write(dir.path().join(CONFIG_FILE), "log_level = \"info\"\n").unwrap();
        assert_eq!(discover_config(None, &bp).unwrap().log_level, "info");

        let other = dir.path().join("other.toml");
        std::fs::write(&other, "log_level = \"trace\"\n").unwrap();
        assert_eq!(
            discover_config(Some(&other), &bp).unwrap().log_level,
            "trace"
        );
        assert!(discover_config(Some(&dir.path().join("missing.toml")), &bp).is_err());
    }
}
