//! BP-005: Blueprint loading and export.
//!
//! Blueprints are strict YAML: unknown fields are rejected. Setting strings
//! are loaded verbatim; reference markers are parsed by expansion. Export
//! renders references back to their `$(...)` form, so an exported blueprint
//! reloads to an equivalent model.

use super::types::Blueprint;
use std::path::Path;
use tracing::debug;

/// Parse a blueprint file from disk.
pub fn load_blueprint(path: &Path) -> Result<Blueprint, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    parse_blueprint(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Parse a blueprint from a YAML string.
pub fn parse_blueprint(yaml: &str) -> Result<Blueprint, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Render a blueprint as YAML.
pub fn to_yaml(bp: &Blueprint) -> Result<String, String> {
    serde_yaml_ng::to_string(bp).map_err(|e| format!("serialize error: {}", e))
}

/// Write a blueprint atomically (write to temp, then rename).
pub fn export_blueprint(bp: &Blueprint, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let yaml = to_yaml(bp)?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    debug!(path = %path.display(), bytes = yaml.len(), "exported blueprint");
    Ok(())
}
