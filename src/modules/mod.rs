//! BP-010: Module metadata.
//!
//! Expansion needs to know what each module accepts and produces. A
//! [`MetadataProvider`] answers `module_info(source, kind)` with the declared
//! inputs, outputs and required cloud services of a module. Providers own any
//! caching; the core only ever calls through the trait.

pub mod cache;
pub mod reader;

use crate::core::types::ModuleKind;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::CachedProvider;
pub use reader::DirectoryProvider;

/// A module input declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<serde_yaml_ng::Value>,
    /// No default and no binding means the module cannot be deployed
    #[serde(default)]
    pub required: bool,
}

impl VarInfo {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            var_type: "string".to_string(),
            description: None,
            default: None,
            required: true,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }
}

/// A module output declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            sensitive: false,
        }
    }
}

/// Everything expansion needs to know about one module source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    #[serde(default)]
    pub inputs: Vec<VarInfo>,
    #[serde(default)]
    pub outputs: Vec<OutputInfo>,
    /// Cloud APIs the module needs enabled
    #[serde(default)]
    pub services: Vec<String>,
}

impl ModuleInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, var: VarInfo) -> Self {
        self.inputs.push(var);
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(OutputInfo::new(name));
        self
    }

    pub fn service(mut self, name: &str) -> Self {
        self.services.push(name.to_string());
        self
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|v| v.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }
}

/// Why a module source could not be inspected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("module not found at {location}: {reason}")]
    NotFound { location: String, reason: String },

    #[error("failed to read module at {location}: {reason}")]
    Read { location: String, reason: String },
}

/// Source of module metadata.
pub trait MetadataProvider: Send + Sync {
    fn module_info(&self, source: &str, kind: &ModuleKind) -> Result<ModuleInfo, ModuleError>;

    /// Warm any cache for the given keys. Providers without a cache ignore it.
    fn prefetch(&self, _keys: &[(String, ModuleKind)]) {}
}

/// In-memory provider keyed by source; used by tests and embedders that
/// already hold module metadata.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    modules: FxHashMap<String, ModuleInfo>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: &str, info: ModuleInfo) -> Self {
        self.modules.insert(source.to_string(), info);
        self
    }

    pub fn insert(&mut self, source: &str, info: ModuleInfo) {
        self.modules.insert(source.to_string(), info);
    }
}

impl MetadataProvider for StaticProvider {
    fn module_info(&self, source: &str, _kind: &ModuleKind) -> Result<ModuleInfo, ModuleError> {
        self.modules
            .get(source)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound {
                location: source.to_string(),
                reason: "no metadata registered".to_string(),
            })
    }
}
