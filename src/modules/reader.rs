//! BP-012: Module metadata from module source trees.
//!
//! Terraform modules are read from `*.tf` files, Packer templates from
//! `*.pkr.hcl`. `variable "name" { ... }` blocks become inputs (required when
//! they carry no `default`), `output "name" { ... }` blocks become outputs.
//! An optional `metadata.yaml` next to the sources lists required services.

use super::{MetadataProvider, ModuleError, ModuleInfo, OutputInfo, VarInfo};
use crate::core::types::ModuleKind;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(variable|output)\s+"([^"]+)"\s*\{"#).expect("block pattern is valid")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$").expect("attribute pattern is valid")
});

const METADATA_FILE: &str = "metadata.yaml";

#[derive(Debug, Default, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    services: Vec<String>,
}

/// Reads module metadata from directories on disk.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    base_dir: PathBuf,
    roots: Vec<PathBuf>,
}

impl DirectoryProvider {
    /// `base_dir` anchors `./` and `../` sources, usually the blueprint's
    /// directory. `roots` are searched for every other relative source.
    pub fn new(base_dir: impl Into<PathBuf>, roots: Vec<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            roots,
        }
    }

    /// Locate the directory holding `source`.
    pub fn resolve(&self, source: &str) -> Result<PathBuf, ModuleError> {
        let not_found = |reason: String| ModuleError::NotFound {
            location: source.to_string(),
            reason,
        };
        let path = Path::new(source);
        let candidates: Vec<PathBuf> = if path.is_absolute() {
            vec![path.to_path_buf()]
        } else if source.starts_with("./") || source.starts_with("../") {
            vec![self.base_dir.join(path)]
        } else {
            self.roots.iter().map(|r| r.join(path)).collect()
        };
        if candidates.is_empty() {
            return Err(not_found("no module roots configured".to_string()));
        }
        candidates
            .iter()
            .find(|p| p.is_dir())
            .cloned()
            .ok_or_else(|| {
                let searched: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                not_found(format!("searched {}", searched.join(", ")))
            })
    }

    fn read_dir(&self, dir: &Path, source: &str, kind: &ModuleKind) -> Result<ModuleInfo, ModuleError> {
        let read_err = |reason: String| ModuleError::Read {
            location: source.to_string(),
            reason,
        };
        let ext = match kind {
            ModuleKind::Terraform | ModuleKind::Unset => "tf",
            ModuleKind::Packer => "pkr.hcl",
            ModuleKind::Other(k) => return Err(read_err(format!("unsupported module kind '{}'", k))),
        };

        let pattern = format!("{}/*.{}", glob::Pattern::escape(&dir.to_string_lossy()), ext);
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| read_err(format!("invalid glob pattern: {}", e)))?
            .filter_map(Result::ok)
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(read_err(format!("no *.{} files in {}", ext, dir.display())));
        }

        let mut info = ModuleInfo::new();
        for file in &files {
            let content = std::fs::read_to_string(file)
                .map_err(|e| read_err(format!("cannot read {}: {}", file.display(), e)))?;
            parse_hcl_blocks(&content, &mut info)
                .map_err(|e| read_err(format!("{}: {}", file.display(), e)))?;
        }
        if *kind == ModuleKind::Packer {
            info.outputs.clear();
        }

        let meta_path = dir.join(METADATA_FILE);
        if meta_path.is_file() {
            let content = std::fs::read_to_string(&meta_path)
                .map_err(|e| read_err(format!("cannot read {}: {}", meta_path.display(), e)))?;
            let meta: MetadataFile = serde_yaml_ng::from_str(&content)
                .map_err(|e| read_err(format!("invalid {}: {}", meta_path.display(), e)))?;
            info.services = meta.services;
        }

        debug!(
            source,
            inputs = info.inputs.len(),
            outputs = info.outputs.len(),
            "read module metadata"
        );
        Ok(info)
    }
}

impl MetadataProvider for DirectoryProvider {
    fn module_info(&self, source: &str, kind: &ModuleKind) -> Result<ModuleInfo, ModuleError> {
        let dir = self.resolve(source)?;
        self.read_dir(&dir, source, kind)
    }
}

// ============================================================================
// HCL block scanning
// ============================================================================

/// Append every `variable` and `output` block in `content` to `info`.
fn parse_hcl_blocks(content: &str, info: &mut ModuleInfo) -> Result<(), String> {
    for caps in BLOCK_RE.captures_iter(content) {
        let (Some(whole), Some(block), Some(name)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let body = block_body(content, whole.end())
            .ok_or_else(|| format!("unterminated {} block '{}'", block.as_str(), name.as_str()))?;
        let attrs = top_level_attributes(body);
        let attr = |key: &str| attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        match block.as_str() {
            "variable" => {
                let default = attr("default").map(parse_literal);
                info.inputs.push(VarInfo {
                    name: name.as_str().to_string(),
                    var_type: attr("type").unwrap_or("any").to_string(),
                    description: attr("description").map(unquote),
                    required: default.is_none(),
                    default,
                });
            }
            _ => info.outputs.push(OutputInfo {
                name: name.as_str().to_string(),
                description: attr("description").map(unquote),
                sensitive: attr("sensitive") == Some("true"),
            }),
        }
    }
    Ok(())
}

/// Body of the block whose opening brace ends just before `start`.
fn block_body(content: &str, start: usize) -> Option<&str> {
    let mut depth = 1usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// `key = value` attributes at nesting depth zero of a block body.
///
/// A value that opens brackets runs until they close; its lines are joined
/// with single spaces.
fn top_level_attributes(body: &str) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut depth = 0i32;
    let mut open: Option<usize> = None;
    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }
        if depth == 0 {
            open = ATTR_RE.captures(line).and_then(|caps| {
                let (k, v) = (caps.get(1)?, caps.get(2)?);
                attrs.push((k.as_str().to_string(), v.as_str().to_string()));
                Some(attrs.len() - 1)
            });
        } else if let Some((_, value)) = open.and_then(|idx| attrs.get_mut(idx)) {
            for word in line.split_whitespace() {
                value.push(' ');
                value.push_str(word);
            }
        }
        depth = (depth + bracket_delta(line)).max(0);
        if depth == 0 {
            open = None;
        }
    }
    attrs
}

fn bracket_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string = false;
    let mut prev = '\0';
    for ch in line.chars() {
        match ch {
            '"' if prev != '\\' => in_string = !in_string,
            '{' | '[' | '(' if !in_string => delta += 1,
            '}' | ']' | ')' if !in_string => delta -= 1,
            _ => {}
        }
        prev = ch;
    }
    delta
}

fn unquote(raw: &str) -> String {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
        .to_string()
}

/// Scalars become typed YAML values; anything else is kept as raw text.
fn parse_literal(raw: &str) -> serde_yaml_ng::Value {
    match serde_yaml_ng::from_str::<serde_yaml_ng::Value>(raw) {
        Ok(v) if !matches!(v, serde_yaml_ng::Value::Mapping(_)) => v,
        _ => serde_yaml_ng::Value::String(raw.to_string()),
    }
}
