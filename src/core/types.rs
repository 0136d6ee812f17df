//! BP-001: Blueprint data model.
//!
//! Defines the YAML schema for blueprints: deployment variables, ordered
//! deployment groups of modules, Terraform backends and validator
//! configuration. All types round-trip through YAML.

use super::error::BlueprintError;
use super::value::{Dict, Value};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Module identifiers are plain strings, unique across the blueprint.
pub type ModuleId = String;

/// Schema stand-in for [`Dict`] fields.
type DictSchema = BTreeMap<String, serde_json::Value>;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]{1,63}$").expect("name pattern is valid"));

/// Check a blueprint or deployment name against the identifier grammar.
pub fn validate_name(field: &str, value: &str) -> Result<(), BlueprintError> {
    if NAME_RE.is_match(value) {
        return Ok(());
    }
    let reason = if value.is_empty() {
        "must not be empty"
    } else if value.chars().count() > 63 {
        "must be at most 63 characters"
    } else {
        "may only contain lowercase letters, digits, dashes and underscores"
    };
    Err(BlueprintError::InputValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// Top-level blueprint
// ============================================================================

/// Root document: a multi-group deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Blueprint {
    /// Blueprint name (identifier grammar)
    pub blueprint_name: String,

    /// Validators to run against the resolved blueprint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ValidatorConfig>,

    /// How validator failures are treated
    #[serde(default)]
    #[schemars(with = "u8")]
    pub validation_level: ValidationLevel,

    /// Deployment (global) variables
    #[serde(default)]
    #[schemars(with = "DictSchema")]
    pub vars: Dict,

    /// Backend applied to groups that don't set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform_backend_defaults: Option<TerraformBackend>,

    /// Deployment groups, in deployment order
    pub deployment_groups: Vec<DeploymentGroup>,
}

impl Blueprint {
    /// All modules, group by group.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.deployment_groups.iter().flat_map(|g| g.modules.iter())
    }

    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.deployment_groups
            .iter_mut()
            .flat_map(|g| g.modules.iter_mut())
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules().find(|m| m.id == id)
    }

    /// Index of the group holding module `id`.
    pub fn module_group(&self, id: &str) -> Option<usize> {
        self.deployment_groups
            .iter()
            .position(|g| g.modules.iter().any(|m| m.id == id))
    }

    /// The validated `deployment_name` variable.
    pub fn deployment_name(&self) -> Result<String, BlueprintError> {
        let invalid = |value: String, reason: &str| BlueprintError::InputValue {
            field: "vars.deployment_name".to_string(),
            value,
            reason: reason.to_string(),
        };
        match self.vars.get("deployment_name") {
            None => Err(invalid(String::new(), "deployment_name must be set")),
            Some(Value::String(s)) => {
                validate_name("vars.deployment_name", s)?;
                Ok(s.clone())
            }
            Some(other) => Err(invalid(other.to_string(), "deployment_name must be a string")),
        }
    }

    /// Every backend block with its location label.
    pub fn backends(&self) -> Vec<(String, &TerraformBackend)> {
        let mut out = Vec::new();
        if let Some(b) = &self.terraform_backend_defaults {
            out.push(("terraform_backend_defaults".to_string(), b));
        }
        for g in &self.deployment_groups {
            if let Some(b) = &g.backend {
                out.push((format!("deployment group {}", g.name), b));
            }
        }
        out
    }
}

// ============================================================================
// Deployment groups and modules
// ============================================================================

/// An ordered set of modules deployed together by one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeploymentGroup {
    /// Group name
    #[serde(rename = "group")]
    pub name: String,

    /// Group-level backend (overrides the defaults)
    #[serde(
        default,
        rename = "terraform_backend",
        skip_serializing_if = "Option::is_none"
    )]
    pub backend: Option<TerraformBackend>,

    /// Modules in authoring order
    pub modules: Vec<Module>,
}

impl DeploymentGroup {
    /// Kind of the group, taken from its first module.
    pub fn kind(&self) -> ModuleKind {
        self.modules
            .first()
            .map(|m| m.kind.clone())
            .unwrap_or_default()
    }
}

/// A single deployment unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Module {
    /// Unique identifier
    pub id: ModuleId,

    /// Module location (local path or embedded library path)
    pub source: String,

    /// Tooling that processes the module
    #[serde(default, skip_serializing_if = "ModuleKind::is_unset")]
    #[schemars(with = "String")]
    pub kind: ModuleKind,

    /// Modules whose outputs feed this module's inputs
    #[serde(default, rename = "use", skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<ModuleId>,

    /// Outputs exposed at the group level
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    /// Input settings
    #[serde(default, skip_serializing_if = "Dict::is_empty")]
    #[schemars(with = "DictSchema")]
    pub settings: Dict,
}

impl Module {
    pub fn new(id: &str, source: &str, kind: ModuleKind) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            kind,
            ..Self::default()
        }
    }
}

/// Module tooling kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModuleKind {
    #[default]
    Unset,
    Terraform,
    Packer,
    Other(String),
}

impl ModuleKind {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Terraform | Self::Packer)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Terraform => "terraform",
            Self::Packer => "packer",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ModuleKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" => Self::Unset,
            "terraform" => Self::Terraform,
            "packer" => Self::Packer,
            _ => Self::Other(s),
        }
    }
}

impl From<ModuleKind> for String {
    fn from(k: ModuleKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Terraform state backend: a type plus literal configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TerraformBackend {
    #[serde(rename = "type", default)]
    pub backend_type: String,

    #[serde(default, skip_serializing_if = "Dict::is_empty")]
    #[schemars(with = "DictSchema")]
    pub configuration: Dict,
}

impl TerraformBackend {
    pub fn new(backend_type: &str) -> Self {
        Self {
            backend_type: backend_type.to_string(),
            configuration: Dict::new(),
        }
    }
}

// ============================================================================
// Validators
// ============================================================================

/// A validator invocation declared in the blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    pub validator: String,

    #[serde(default, skip_serializing_if = "Dict::is_empty")]
    #[schemars(with = "DictSchema")]
    pub inputs: Dict,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
}

impl ValidatorConfig {
    pub fn new(validator: &str) -> Self {
        Self {
            validator: validator.to_string(),
            ..Self::default()
        }
    }
}

/// Severity applied to validator failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ValidationLevel {
    /// Validators are not run
    Ignore,
    /// Failures are reported, not fatal
    #[default]
    Warning,
    /// Failures are fatal
    Error,
}

/// Whether `level` is a recognised numeric validation level.
pub fn is_valid_validation_level(level: i64) -> bool {
    ValidationLevel::try_from(level).is_ok()
}

impl TryFrom<i64> for ValidationLevel {
    type Error = String;

    fn try_from(level: i64) -> Result<Self, String> {
        match level {
            0 => Ok(ValidationLevel::Ignore),
            1 => Ok(ValidationLevel::Warning),
            2 => Ok(ValidationLevel::Error),
            other => Err(format!(
                "validation_level must be 0 (ignore), 1 (warning) or 2 (error), got {}",
                other
            )),
        }
    }
}

impl From<ValidationLevel> for i64 {
    fn from(level: ValidationLevel) -> Self {
        match level {
            ValidationLevel::Ignore => 0,
            ValidationLevel::Warning => 1,
            ValidationLevel::Error => 2,
        }
    }
}

impl std::str::FromStr for ValidationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" | "0" => Ok(Self::Ignore),
            "warning" | "1" => Ok(Self::Warning),
            "error" | "2" => Ok(Self::Error),
            other => Err(format!("unknown validation level '{}'", other)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
