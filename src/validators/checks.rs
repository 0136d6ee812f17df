//! BP-020: Structural blueprint checks.
//!
//! Each check is a pure `fn(&Blueprint) -> Vec<BlueprintError>`; none depends
//! on another's outcome, so the registry may run them in any order.

use super::ValidatorKind;
use crate::core::error::BlueprintError;
use crate::core::reference::{find_variable_marker, Reference};
use crate::core::types::{validate_name, Blueprint, Module, ModuleKind};
use crate::core::value::{Dict, Value};
use crate::modules::ModuleInfo;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::LazyLock;

static LABEL_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{Ll}\p{Lo}\p{N}_-]{1,63}$").expect("label key pattern is valid")
});

static LABEL_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{Ll}\p{Lo}\p{N}_-]{0,63}$").expect("label value pattern is valid")
});

/// Maximum number of labels on one resource.
pub const MAX_LABELS: usize = 64;

/// Legacy module paths and where they live now.
pub const MOVED_MODULES: &[(&str, &str)] = &[
    (
        "community/modules/scheduler/cloud-batch-job",
        "modules/scheduler/batch-job-template",
    ),
    (
        "community/modules/scheduler/cloud-batch-login-node",
        "modules/scheduler/batch-login-node",
    ),
    (
        "community/modules/scheduler/htcondor-configure",
        "community/modules/scheduler/htcondor-setup",
    ),
];

// ============================================================================
// Names
// ============================================================================

pub fn blueprint_name(bp: &Blueprint) -> Vec<BlueprintError> {
    validate_name("blueprint_name", &bp.blueprint_name)
        .err()
        .into_iter()
        .collect()
}

pub fn deployment_name(bp: &Blueprint) -> Vec<BlueprintError> {
    bp.deployment_name().err().into_iter().collect()
}

// ============================================================================
// Modules and groups
// ============================================================================

/// Unique module ids, valid kinds and one kind per group.
pub fn modules_and_groups(bp: &Blueprint) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    let mut seen = FxHashSet::default();
    let mut reported = FxHashSet::default();

    for group in &bp.deployment_groups {
        let group_kind = group.kind();
        for module in &group.modules {
            if !seen.insert(module.id.as_str()) && reported.insert(module.id.as_str()) {
                errors.push(BlueprintError::DuplicateId {
                    id: module.id.clone(),
                });
            }
            if let ModuleKind::Other(kind) = &module.kind {
                errors.push(BlueprintError::InputValue {
                    field: format!("module {} kind", module.id),
                    value: kind.clone(),
                    reason: "kind must be terraform or packer".to_string(),
                });
            }
        }
        if let Some(odd) = group.modules.iter().find(|m| m.kind != group_kind) {
            errors.push(BlueprintError::MixedKind {
                group: group.name.clone(),
                first: group_kind,
                second: odd.kind.clone(),
            });
        }
    }
    errors
}

/// Sources that match the moved-module table, with or without a `./` prefix.
pub fn moved_modules(bp: &Blueprint) -> Vec<BlueprintError> {
    bp.modules()
        .filter_map(|m| {
            let source = m.source.trim_start_matches("./");
            MOVED_MODULES
                .iter()
                .find(|(old, _)| source == *old || source.ends_with(&format!("/{}", old)))
                .map(|(old, new)| BlueprintError::ModuleMoved {
                    old: old.to_string(),
                    new: new.to_string(),
                })
        })
        .collect()
}

// ============================================================================
// Labels
// ============================================================================

/// `vars.labels` and every module `labels` setting.
pub fn labels(bp: &Blueprint) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    match bp.vars.get("labels") {
        None => {}
        Some(Value::Object(map)) => check_label_map("vars.labels", map.iter(), &mut errors),
        Some(other) => errors.push(BlueprintError::InputValue {
            field: "vars.labels".to_string(),
            value: other.to_string(),
            reason: "labels must be a map".to_string(),
        }),
    }
    for module in bp.modules() {
        // Merged or referenced labels are checked once they are literal.
        if let Some(Value::Object(map)) = module.settings.get("labels") {
            let location = format!("module {} setting labels", module.id);
            check_label_map(&location, map.iter(), &mut errors);
        }
    }
    errors
}

fn check_label_map<'a>(
    location: &str,
    entries: impl ExactSizeIterator<Item = (&'a String, &'a Value)>,
    errors: &mut Vec<BlueprintError>,
) {
    if entries.len() > MAX_LABELS {
        errors.push(BlueprintError::TooManyLabels {
            location: location.to_string(),
            limit: MAX_LABELS,
        });
        return;
    }
    for (key, value) in entries {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Expr(_) => continue,
            other => other.to_string(),
        };
        let label_err = |part| BlueprintError::LabelValidation {
            location: location.to_string(),
            part,
            key: key.clone(),
            value: value.clone(),
        };
        if !LABEL_KEY_RE.is_match(key) {
            errors.push(label_err("name"));
        }
        if !LABEL_VALUE_RE.is_match(&value) {
            errors.push(label_err("value"));
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Backend blocks must be fully literal.
pub fn backends(bp: &Blueprint) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    for (_, backend) in bp.backends() {
        if find_variable_marker(&backend.backend_type).is_some() {
            errors.push(BlueprintError::BackendVariable {
                field: "type".to_string(),
                value: backend.backend_type.clone(),
            });
        }
        for (key, value) in backend.configuration.iter() {
            check_backend_value(key, value, &mut errors);
        }
    }
    errors
}

fn check_backend_value(field: &str, value: &Value, errors: &mut Vec<BlueprintError>) {
    match value {
        Value::Expr(_) => errors.push(BlueprintError::BackendVariable {
            field: field.to_string(),
            value: value.to_string(),
        }),
        Value::String(s) if find_variable_marker(s).is_some() => {
            errors.push(BlueprintError::BackendVariable {
                field: field.to_string(),
                value: s.clone(),
            })
        }
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                check_backend_value(&format!("{}[{}]", field, i), item, errors);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                check_backend_value(&format!("{}.{}", field, k), v, errors);
            }
        }
        _ => {}
    }
}

// ============================================================================
// References
// ============================================================================

/// Check one reference made by module `from`.
///
/// `infos` maps module ids to metadata; without it output names are not
/// checked.
pub fn validate_reference(
    bp: &Blueprint,
    infos: Option<&FxHashMap<String, ModuleInfo>>,
    from: &Module,
    reference: &Reference,
) -> Result<(), BlueprintError> {
    let dangling = |reason: &str| BlueprintError::DanglingReference {
        module: from.id.clone(),
        target: reference.to_string(),
        reason: reason.to_string(),
    };

    let (target_id, output) = match reference {
        Reference::Global(name) => {
            return if bp.vars.contains(name) {
                Ok(())
            } else {
                Err(dangling("deployment variable is not defined"))
            };
        }
        Reference::Module { module, output } => (module, output),
    };

    if *target_id == from.id {
        return Err(dangling("a module cannot reference its own outputs"));
    }
    let (Some(target_group), Some(target)) = (bp.module_group(target_id), bp.module(target_id))
    else {
        return Err(dangling("module is not defined"));
    };
    if target.kind == ModuleKind::Packer {
        return Err(dangling("packer modules have no outputs to reference"));
    }
    let from_group = bp
        .module_group(&from.id)
        .ok_or_else(|| dangling("referencing module is not part of the blueprint"))?;
    if target_group > from_group {
        return Err(dangling(&format!(
            "module is in a later deployment group ({})",
            bp.deployment_groups[target_group].name
        )));
    }
    if let Some(info) = infos.and_then(|m| m.get(target_id)) {
        if !info.has_output(output) {
            return Err(dangling(&format!("module has no output named {}", output)));
        }
    }
    Ok(())
}

/// Every reference in every module setting.
pub fn references(bp: &Blueprint) -> Vec<BlueprintError> {
    references_with(bp, None)
}

pub(crate) fn references_with(
    bp: &Blueprint,
    infos: Option<&FxHashMap<String, ModuleInfo>>,
) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    for module in bp.modules() {
        for (_, value) in module.settings.iter() {
            for reference in value.references() {
                if let Err(e) = validate_reference(bp, infos, module, reference) {
                    if !errors.contains(&e) {
                        errors.push(e);
                    }
                }
            }
        }
    }
    errors
}

// ============================================================================
// Validator configs
// ============================================================================

/// Known names, exact input sets, and global-only input references.
pub fn validator_configs(bp: &Blueprint) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    for config in bp.validators.iter().filter(|v| !v.skip) {
        let Some(kind) = ValidatorKind::from_name(&config.validator) else {
            errors.push(BlueprintError::UnknownValidator {
                name: config.validator.clone(),
            });
            continue;
        };
        if let Err(e) = config.check(kind) {
            errors.push(e);
        }
        errors.extend(validator_input_references(bp, &config.validator, &config.inputs));
    }
    errors
}

pub(crate) fn validator_input_references(
    bp: &Blueprint,
    validator: &str,
    inputs: &Dict,
) -> Vec<BlueprintError> {
    let mut errors = Vec::new();
    for (_, value) in inputs.iter() {
        for reference in value.references() {
            let reason = match reference {
                Reference::Module { .. } => "validator inputs may only reference deployment variables",
                Reference::Global(name) if !bp.vars.contains(name) => {
                    "deployment variable is not defined"
                }
                Reference::Global(_) => continue,
            };
            errors.push(BlueprintError::DanglingReference {
                module: format!("validator {}", validator),
                target: reference.to_string(),
                reason: reason.to_string(),
            });
        }
    }
    errors
}
