//! BP-004: Error taxonomy and diagnostics.
//!
//! Structural problems are [`BlueprintError`]s and always block the writer.
//! Unused bindings and validator outcomes are [`Finding`]s whose severity is
//! decided by the blueprint's validation level.

use super::reference::MalformedReference;
use super::types::ModuleKind;
use crate::modules::ModuleError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A fatal blueprint problem.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlueprintError {
    /// A marker whose content is not a reference
    #[error("{location}: {source}")]
    MalformedReference {
        location: String,
        source: MalformedReference,
    },

    /// A reference or `use` that breaks existence or ordering rules
    #[error("module {module} references {target}: {reason}")]
    DanglingReference {
        module: String,
        target: String,
        reason: String,
    },

    #[error("module IDs must be unique: {id} used more than once")]
    DuplicateId { id: String },

    #[error("mixing modules of differing kinds in a deployment group is not supported: deployment group {group}, got {first} and {second}")]
    MixedKind {
        group: String,
        first: ModuleKind,
        second: ModuleKind,
    },

    /// A name or value that violates its grammar
    #[error("invalid value for {field}: '{value}': {reason}")]
    InputValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("{location}: invalid label {part}: '{key}: {value}'")]
    LabelValidation {
        location: String,
        part: &'static str,
        key: String,
        value: String,
    },

    #[error("{location} cannot have more than {limit} labels")]
    TooManyLabels { location: String, limit: usize },

    #[error("can not use variables in terraform_backend block, got '{field}' = '{value}'")]
    BackendVariable { field: String, value: String },

    #[error("passed wrong validator to {expected} implementation")]
    WrongValidator { expected: String, got: String },

    #[error("at least one required input was not provided to {validator}: missing [{}]", .missing.join(" "))]
    MissingRequiredInput {
        validator: String,
        missing: Vec<String>,
    },

    #[error("only {} inputs [{}] should be provided to {validator}", .allowed.len(), .allowed.join(" "))]
    TooManyInputs {
        validator: String,
        allowed: Vec<String>,
    },

    #[error("unknown validator {name}")]
    UnknownValidator { name: String },

    #[error("the blueprint references modules that have moved: {old} has moved to {new}")]
    ModuleMoved { old: String, new: String },

    #[error("module {module} is missing required setting {setting}")]
    MissingSetting { module: String, setting: String },

    #[error("module {module} has no input named {setting}")]
    UnknownSetting { module: String, setting: String },

    /// A validator that ran and failed at the error level
    #[error("validator {validator} failed: {message}")]
    ValidatorFailed { validator: String, message: String },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl BlueprintError {
    /// Stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedReference { .. } => "malformed_reference",
            Self::DanglingReference { .. } => "dangling_reference",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::MixedKind { .. } => "mixed_kind",
            Self::InputValue { .. } => "input_value",
            Self::LabelValidation { .. } | Self::TooManyLabels { .. } => "label_validation",
            Self::BackendVariable { .. } => "backend_variable",
            Self::WrongValidator { .. } => "wrong_validator",
            Self::MissingRequiredInput { .. } => "missing_required_input",
            Self::TooManyInputs { .. } => "too_many_inputs",
            Self::UnknownValidator { .. } => "unknown_validator",
            Self::ModuleMoved { .. } => "module_moved",
            Self::MissingSetting { .. } => "missing_setting",
            Self::UnknownSetting { .. } => "unknown_setting",
            Self::ValidatorFailed { .. } => "validator_failed",
            Self::Module(ModuleError::NotFound { .. }) => "module_not_found",
            Self::Module(ModuleError::Read { .. }) => "module_read",
        }
    }

    /// The blueprint entity the error points at.
    pub fn entity(&self) -> String {
        match self {
            Self::MalformedReference { location, .. }
            | Self::LabelValidation { location, .. }
            | Self::TooManyLabels { location, .. } => location.clone(),
            Self::DanglingReference { module, .. }
            | Self::MissingSetting { module, .. }
            | Self::UnknownSetting { module, .. } => module.clone(),
            Self::DuplicateId { id } => id.clone(),
            Self::MixedKind { group, .. } => group.clone(),
            Self::InputValue { field, .. } | Self::BackendVariable { field, .. } => field.clone(),
            Self::WrongValidator { got, .. } => got.clone(),
            Self::MissingRequiredInput { validator, .. }
            | Self::TooManyInputs { validator, .. }
            | Self::ValidatorFailed { validator, .. } => validator.clone(),
            Self::UnknownValidator { name } => name.clone(),
            Self::ModuleMoved { old, .. } => old.clone(),
            Self::Module(ModuleError::NotFound { location, .. })
            | Self::Module(ModuleError::Read { location, .. }) => location.clone(),
        }
    }
}

/// Every fatal error found in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlueprintErrors(pub Vec<BlueprintError>);

impl BlueprintErrors {
    pub fn push(&mut self, err: BlueprintError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlueprintError> {
        self.0.iter()
    }

    /// `Ok(value)` when nothing was collected.
    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl Extend<BlueprintError> for BlueprintErrors {
    fn extend<I: IntoIterator<Item = BlueprintError>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl From<BlueprintError> for BlueprintErrors {
    fn from(err: BlueprintError) -> Self {
        Self(vec![err])
    }
}

impl fmt::Display for BlueprintErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BlueprintErrors {}

// ============================================================================
// Findings
// ============================================================================

/// A non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    UnusedVariable { name: String },
    UnusedModule { module: String, used: String },
    ValidatorFailed { validator: String, message: String },
}

impl Finding {
    /// Name of the validator that surfaces this finding.
    pub fn validator(&self) -> &str {
        match self {
            Self::UnusedVariable { .. } => "test_deployment_variable_not_used",
            Self::UnusedModule { .. } => "test_module_not_used",
            Self::ValidatorFailed { validator, .. } => validator,
        }
    }

    /// Promote to a fatal error.
    pub fn into_error(self) -> BlueprintError {
        BlueprintError::ValidatorFailed {
            validator: self.validator().to_string(),
            message: self.to_string(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnusedVariable { name } => write!(
                f,
                "the deployment variable \"{}\" was not used in this blueprint",
                name
            ),
            Self::UnusedModule { module, used } => write!(
                f,
                "module {} uses module {}, but matching setting and outputs were not found. \
                 This may be because the value is set explicitly or set by a prior used module",
                module, used
            ),
            Self::ValidatorFailed { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Aggregate result of validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub errors: Vec<BlueprintError>,
    pub findings: Vec<Finding>,
}

impl Diagnostics {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Machine-readable rendering for `--json`.
    pub fn to_json(&self) -> serde_json::Value {
        let errors: Vec<_> = self
            .errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "kind": e.kind(),
                    "entity": e.entity(),
                    "message": e.to_string(),
                })
            })
            .collect();
        let findings: Vec<_> = self
            .findings
            .iter()
            .map(|f| {
                let mut v = serde_json::to_value(f).unwrap_or(serde_json::Value::Null);
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("message".into(), f.to_string().into());
                }
                v
            })
            .collect();
        serde_json::json!({ "errors": errors, "findings": findings })
    }
}
