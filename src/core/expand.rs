//! BP-006: Blueprint expansion.
//!
//! Turns implicit `use` wiring and authored references into explicit,
//! validated settings. Modules are processed in group order, then module
//! order. Per-module problems are collected so a single pass reports every
//! structural error; unused `use` entries and unused deployment variables are
//! returned as an [`ExpandReport`] rather than raised.

use super::error::{BlueprintError, BlueprintErrors, Finding};
use super::reference::Reference;
use super::types::{Blueprint, Module, ModuleKind};
use super::value::Value;
use crate::modules::{MetadataProvider, ModuleInfo};
use crate::validators::checks;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info};

/// Variables consumed outside module settings; never reported unused.
pub const IMPLICIT_VARS: &[&str] = &["labels", "deployment_name"];

const BLUEPRINT_LABEL: &str = "ghpc_blueprint";
const DEPLOYMENT_LABEL: &str = "ghpc_deployment";

/// Non-fatal results of expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpandReport {
    /// `(module, used)` pairs where `used` is listed in `module`'s `use` but
    /// none of its outputs were bound
    pub unused_modules: Vec<(String, String)>,
    /// Deployment variables no module setting refers to
    pub unused_vars: Vec<String>,
    /// Cloud services required by the blueprint's modules
    pub services: Vec<String>,
}

impl ExpandReport {
    pub fn unused_module_findings(&self) -> Vec<Finding> {
        self.unused_modules
            .iter()
            .map(|(module, used)| Finding::UnusedModule {
                module: module.clone(),
                used: used.clone(),
            })
            .collect()
    }

    pub fn unused_var_findings(&self) -> Vec<Finding> {
        self.unused_vars
            .iter()
            .map(|name| Finding::UnusedVariable { name: name.clone() })
            .collect()
    }

    pub fn findings(&self) -> Vec<Finding> {
        let mut all = self.unused_module_findings();
        all.extend(self.unused_var_findings());
        all
    }
}

/// Expand `bp` in place.
pub fn expand(
    bp: &mut Blueprint,
    provider: &dyn MetadataProvider,
) -> Result<ExpandReport, BlueprintErrors> {
    info!(blueprint = %bp.blueprint_name, "expanding blueprint");
    add_kind_to_modules(bp);

    let mut errors = BlueprintErrors::default();
    errors.extend(checks::modules_and_groups(bp));
    errors.extend(checks::moved_modules(bp));
    if !errors.is_empty() {
        return Err(errors);
    }

    check_vars_literal(bp, &mut errors);
    parse_markers(bp, &mut errors);
    add_default_labels(bp);

    let infos = fetch_metadata(bp, provider, &mut errors);
    if infos.len() < bp.modules().count() {
        return Err(errors);
    }

    for gi in 0..bp.deployment_groups.len() {
        for mi in 0..bp.deployment_groups[gi].modules.len() {
            let bindings = plan_bindings(bp, gi, mi, &infos, &mut errors);
            let module = &mut bp.deployment_groups[gi].modules[mi];
            for binding in bindings {
                match binding.producer {
                    Some(producer) => {
                        module
                            .settings
                            .set_produced_by(binding.input, binding.value, &producer);
                    }
                    None => {
                        module.settings.set(binding.input, binding.value);
                    }
                }
            }
        }
    }

    check_settings(bp, &infos, &mut errors);
    for e in checks::references_with(bp, Some(&infos)) {
        push_unique(&mut errors, e);
    }
    for config in bp.validators.iter().filter(|v| !v.skip) {
        errors.extend(checks::validator_input_references(
            bp,
            &config.validator,
            &config.inputs,
        ));
    }

    let report = ExpandReport {
        unused_modules: list_unused_modules(bp),
        unused_vars: list_unused_vars(bp),
        services: collect_services(bp, &infos),
    };
    info!(
        errors = errors.len(),
        unused_modules = report.unused_modules.len(),
        unused_vars = report.unused_vars.len(),
        "expansion finished"
    );
    errors.into_result(report)
}

fn push_unique(errors: &mut BlueprintErrors, err: BlueprintError) {
    if !errors.iter().any(|e| *e == err) {
        errors.push(err);
    }
}

// ============================================================================
// Preparation
// ============================================================================

/// Modules without a kind are Terraform modules.
pub fn add_kind_to_modules(bp: &mut Blueprint) {
    for module in bp.modules_mut() {
        if module.kind.is_unset() {
            module.kind = ModuleKind::Terraform;
        }
    }
}

/// Deployment variables are literal; references in them are rejected.
fn check_vars_literal(bp: &Blueprint, errors: &mut BlueprintErrors) {
    for (name, value) in bp.vars.iter() {
        let field = format!("vars.{}", name);
        match value.clone().resolve_markers() {
            Ok(parsed) if parsed.references().is_empty() => {}
            Ok(_) => errors.push(BlueprintError::InputValue {
                field,
                value: value.to_string(),
                reason: "deployment variables cannot contain references".to_string(),
            }),
            Err(source) => errors.push(BlueprintError::MalformedReference {
                location: field,
                source,
            }),
        }
    }
}

/// Parse reference markers in module settings and validator inputs.
fn parse_markers(bp: &mut Blueprint, errors: &mut BlueprintErrors) {
    for module in bp.modules_mut() {
        for (key, value) in module.settings.values_mut() {
            match value.clone().resolve_markers() {
                Ok(parsed) => *value = parsed,
                Err(source) => errors.push(BlueprintError::MalformedReference {
                    location: format!("module {} setting {}", module.id, key),
                    source,
                }),
            }
        }
    }
    for config in bp.validators.iter_mut() {
        for (key, value) in config.inputs.values_mut() {
            match value.clone().resolve_markers() {
                Ok(parsed) => *value = parsed,
                Err(source) => errors.push(BlueprintError::MalformedReference {
                    location: format!("validator {} input {}", config.validator, key),
                    source,
                }),
            }
        }
    }
}

/// Add the blueprint and deployment labels to `vars.labels`.
///
/// Authored label keys win. A non-map `labels` is left for the label check.
pub fn add_default_labels(bp: &mut Blueprint) {
    let deployment = bp.deployment_name().ok();
    let mut labels = match bp.vars.get("labels") {
        None => IndexMap::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return,
    };
    labels
        .entry(BLUEPRINT_LABEL.to_string())
        .or_insert_with(|| Value::from(bp.blueprint_name.as_str()));
    if let Some(deployment) = deployment {
        labels
            .entry(DEPLOYMENT_LABEL.to_string())
            .or_insert_with(|| Value::from(deployment));
    }
    bp.vars.set("labels", Value::Object(labels));
}

/// Metadata for every module, keyed by module id.
fn fetch_metadata(
    bp: &Blueprint,
    provider: &dyn MetadataProvider,
    errors: &mut BlueprintErrors,
) -> FxHashMap<String, ModuleInfo> {
    let mut keys: Vec<(String, ModuleKind)> = Vec::new();
    for module in bp.modules() {
        let key = (module.source.clone(), module.kind.clone());
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    provider.prefetch(&keys);

    let mut infos = FxHashMap::default();
    for module in bp.modules() {
        match provider.module_info(&module.source, &module.kind) {
            Ok(info) => {
                infos.insert(module.id.clone(), info);
            }
            Err(e) => push_unique(errors, e.into()),
        }
    }
    infos
}

// ============================================================================
// Wiring
// ============================================================================

struct Binding {
    input: String,
    value: Value,
    producer: Option<String>,
}

/// Bindings for the unset inputs of module `(gi, mi)`.
///
/// An input takes the matching output of the first usable module in `use`,
/// otherwise the deployment variable of the same name.
fn plan_bindings(
    bp: &Blueprint,
    gi: usize,
    mi: usize,
    infos: &FxHashMap<String, ModuleInfo>,
    errors: &mut BlueprintErrors,
) -> Vec<Binding> {
    let module = &bp.deployment_groups[gi].modules[mi];
    let Some(info) = infos.get(&module.id) else {
        return Vec::new();
    };

    let mut usable: Vec<(&str, &ModuleInfo)> = Vec::new();
    let mut seen = FxHashSet::default();
    for used in module.uses.iter().filter(|u| seen.insert(u.as_str())) {
        let dangling = |reason: &str| BlueprintError::DanglingReference {
            module: module.id.clone(),
            target: used.clone(),
            reason: reason.to_string(),
        };
        let err = if *used == module.id {
            Some(dangling("a module cannot use itself"))
        } else {
            match (bp.module_group(used), bp.module(used)) {
                (Some(ug), Some(target)) => {
                    if ug > gi {
                        Some(dangling(&format!(
                            "used module is in a later deployment group ({})",
                            bp.deployment_groups[ug].name
                        )))
                    } else if target.kind == ModuleKind::Packer {
                        Some(dangling("packer modules have no outputs to use"))
                    } else {
                        None
                    }
                }
                _ => Some(dangling("used module is not defined")),
            }
        };
        match err {
            Some(e) => push_unique(errors, e),
            None => {
                if let Some(used_info) = infos.get(used) {
                    usable.push((used.as_str(), used_info));
                }
            }
        }
    }

    let mut bindings = Vec::new();
    for input in info.inputs.iter().filter(|v| !module.settings.contains(&v.name)) {
        if let Some((used, _)) = usable.iter().find(|(_, ui)| ui.has_output(&input.name)) {
            debug!(module = %module.id, input = %input.name, from = used, "wiring module output");
            bindings.push(Binding {
                input: input.name.clone(),
                value: Reference::module(used, &input.name).into(),
                producer: Some(used.to_string()),
            });
        } else if bp.vars.contains(&input.name) {
            debug!(module = %module.id, input = %input.name, "wiring deployment variable");
            bindings.push(Binding {
                input: input.name.clone(),
                value: Reference::global(&input.name).into(),
                producer: None,
            });
        }
    }
    bindings
}

/// Required inputs must be bound; every setting must be a declared input.
fn check_settings(
    bp: &Blueprint,
    infos: &FxHashMap<String, ModuleInfo>,
    errors: &mut BlueprintErrors,
) {
    for module in bp.modules() {
        let Some(info) = infos.get(&module.id) else {
            continue;
        };
        for input in info.inputs.iter().filter(|v| v.required) {
            if !module.settings.contains(&input.name) {
                errors.push(BlueprintError::MissingSetting {
                    module: module.id.clone(),
                    setting: input.name.clone(),
                });
            }
        }
        for key in module.settings.keys() {
            if !info.has_input(key) {
                errors.push(BlueprintError::UnknownSetting {
                    module: module.id.clone(),
                    setting: key.clone(),
                });
            }
        }
    }
}

// ============================================================================
// Report
// ============================================================================

fn list_unused_modules(bp: &Blueprint) -> Vec<(String, String)> {
    let mut unused = Vec::new();
    for module in bp.modules() {
        let mut seen = FxHashSet::default();
        for used in module.uses.iter().filter(|u| seen.insert(u.as_str())) {
            if bp.module(used).is_some() && !consumes_outputs_of(module, used) {
                unused.push((module.id.clone(), used.clone()));
            }
        }
    }
    unused
}

/// A setting of `module` came from `used`: tagged by wiring in memory, or
/// in the `$(used.<setting>)` shape wiring writes, as found in an exported
/// blueprint.
fn consumes_outputs_of(module: &Module, used: &str) -> bool {
    module.settings.has_product_of(used)
        || module.settings.iter().any(|(key, value)| match value {
            Value::Expr(e) => matches!(
                e.as_single_reference(),
                Some(Reference::Module { module: target, output }) if target == used && output == key
            ),
            _ => false,
        })
}

fn list_unused_vars(bp: &Blueprint) -> Vec<String> {
    let mut used: FxHashSet<&str> = IMPLICIT_VARS.iter().copied().collect();
    for module in bp.modules() {
        for (_, value) in module.settings.iter() {
            for reference in value.references() {
                if let Reference::Global(name) = reference {
                    used.insert(name.as_str());
                }
            }
        }
    }
    bp.vars
        .keys()
        .filter(|k| !used.contains(k.as_str()))
        .cloned()
        .collect()
}

fn collect_services(bp: &Blueprint, infos: &FxHashMap<String, ModuleInfo>) -> Vec<String> {
    let mut services: Vec<String> = Vec::new();
    for module in bp.modules() {
        if let Some(info) = infos.get(&module.id) {
            for service in &info.services {
                if !services.contains(service) {
                    services.push(service.clone());
                }
            }
        }
    }
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_blueprint;
    use crate::modules::{StaticProvider, VarInfo};

    fn provider() -> StaticProvider {
        StaticProvider::new()
            .with(
                "./modules/vpc",
                ModuleInfo::new()
                    .input(VarInfo::required("project_id"))
                    .input(VarInfo::optional("region"))
                    .input(VarInfo::optional("deployment_name"))
                    .output("network_self_link")
                    .output("subnetwork_name")
                    .service("compute.googleapis.com"),
            )
            .with(
                "./modules/filestore",
                ModuleInfo::new()
                    .input(VarInfo::required("project_id"))
                    .input(VarInfo::required("network_self_link"))
                    .input(VarInfo::optional("zone"))
                    .input(VarInfo::optional("labels"))
                    .output("network_storage")
                    .service("file.googleapis.com"),
            )
            .with(
                "./modules/compute",
                ModuleInfo::new()
                    .input(VarInfo::required("project_id"))
                    .input(VarInfo::optional("network_self_link"))
                    .input(VarInfo::optional("subnetwork_name"))
                    .input(VarInfo::optional("network_storage"))
                    .input(VarInfo::optional("instance_count"))
                    .output("instance_ids")
                    .service("compute.googleapis.com"),
            )
            .with(
                "./packer/image",
                ModuleInfo::new().input(VarInfo::optional("zone")),
            )
    }

    const TWO_GROUPS: &str = r#"
blueprint_name: two-groups
vars:
  project_id: test-project
  deployment_name: golden
  region: us-central1
  zone: us-central1-a
  unused_key: nobody
deployment_groups:
- group: primary
  modules:
  - id: network
    source: ./modules/vpc
  - id: homefs
    source: ./modules/filestore
    use: [network]
- group: compute
  modules:
  - id: workers
    source: ./modules/compute
    use: [network, homefs, network]
    settings:
      instance_count: 4
"#;

    fn expanded(yaml: &str) -> (Blueprint, Result<ExpandReport, BlueprintErrors>) {
        let mut bp = parse_blueprint(yaml).unwrap();
        let result = expand(&mut bp, &provider());
        (bp, result)
    }

    fn setting(bp: &Blueprint, module: &str, key: &str) -> String {
        bp.module(module)
            .and_then(|m| m.settings.get(key))
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_bp006_use_wiring_and_globals() {
        let (bp, result) = expanded(TWO_GROUPS);
        let report = result.unwrap();
        assert_eq!(setting(&bp, "network", "project_id"), "$(vars.project_id)");
        assert_eq!(setting(&bp, "network", "region"), "$(vars.region)");
        assert_eq!(
            setting(&bp, "homefs", "network_self_link"),
            "$(network.network_self_link)"
        );
        assert_eq!(setting(&bp, "workers", "network_storage"), "$(homefs.network_storage)");
        assert_eq!(setting(&bp, "workers", "subnetwork_name"), "$(network.subnetwork_name)");
        assert_eq!(setting(&bp, "workers", "instance_count"), "4");

        let homefs = bp.module("homefs").unwrap();
        assert!(homefs.settings.has_product_of("network"));
        assert_eq!(
            homefs.settings.setting("project_id").unwrap().produced_by,
            None
        );
        assert_eq!(report.unused_vars, vec!["unused_key"]);
        assert!(report.unused_modules.is_empty());
        assert_eq!(
            report.services,
            vec!["compute.googleapis.com", "file.googleapis.com"]
        );
    }

    #[test]
    fn test_bp006_kinds_filled() {
        let (bp, _) = expanded(TWO_GROUPS);
        assert!(bp.modules().all(|m| m.kind == ModuleKind::Terraform));
    }

    #[test]
    fn test_bp006_default_labels() {
        let (bp, _) = expanded(TWO_GROUPS);
        let labels = bp.vars.get("labels").and_then(Value::as_object).unwrap();
        assert_eq!(labels.get("ghpc_blueprint"), Some(&Value::from("two-groups")));
        assert_eq!(labels.get("ghpc_deployment"), Some(&Value::from("golden")));
        assert_eq!(setting(&bp, "homefs", "labels"), "$(vars.labels)");

        let yaml = TWO_GROUPS.replace(
            "  unused_key: nobody\n",
            "  unused_key: nobody\n  labels:\n    ghpc_blueprint: mine\n",
        );
        let (bp, _) = expanded(&yaml);
        let labels = bp.vars.get("labels").and_then(Value::as_object).unwrap();
        assert_eq!(labels.get("ghpc_blueprint"), Some(&Value::from("mine")));
    }

    #[test]
    fn test_bp006_unused_use_reported_once() {
        let yaml = TWO_GROUPS.replace(
            "    use: [network]\n",
            "    use: [network]\n    settings:\n      network_self_link: explicit\n",
        );
        let (_, result) = expanded(&yaml);
        let report = result.unwrap();
        assert_eq!(
            report.unused_modules,
            vec![("homefs".to_string(), "network".to_string())]
        );
        let findings = report.findings();
        assert_eq!(findings.len(), 2);
        assert!(findings[0]
            .to_string()
            .starts_with("module homefs uses module network"));
    }

    #[test]
    fn test_bp006_duplicate_ids() {
        let yaml = TWO_GROUPS.replace("id: workers", "id: network");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs.to_string().contains("network used more than once"));
    }

    #[test]
    fn test_bp006_mixed_kinds() {
        let yaml = format!(
            "{}  - id: image\n    source: ./packer/image\n    kind: packer\n",
            TWO_GROUPS
        );
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs
            .to_string()
            .contains("deployment group compute, got terraform and packer"));
    }

    #[test]
    fn test_bp006_cross_group_ordering() {
        // later group referencing earlier group is fine
        let yaml = TWO_GROUPS.replace(
            "      instance_count: 4\n",
            "      instance_count: $(homefs.network_storage)\n",
        );
        let (_, result) = expanded(&yaml);
        assert!(result.is_ok());

        // earlier group referencing a later group is not
        let yaml = TWO_GROUPS.replace(
            "    use: [network]\n",
            "    use: [network]\n    settings:\n      zone: $(workers.instance_ids)\n",
        );
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.len(), 1);
        let err = errs.iter().next().unwrap();
        assert_eq!(err.kind(), "dangling_reference");
        assert!(err.to_string().contains("homefs references workers.instance_ids"));
    }

    #[test]
    fn test_bp006_same_group_either_order() {
        let yaml = TWO_GROUPS.replace(
            "  - id: network\n    source: ./modules/vpc\n",
            "  - id: network\n    source: ./modules/vpc\n    settings:\n      region: $(homefs.network_storage)\n",
        );
        let (_, result) = expanded(&yaml);
        assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn test_bp006_use_of_later_group() {
        let yaml = TWO_GROUPS.replace("    use: [network]\n", "    use: [network, workers]\n");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.to_string().contains("later deployment group")));
    }

    #[test]
    fn test_bp006_use_of_unknown_module() {
        let yaml = TWO_GROUPS.replace("    use: [network]\n", "    use: [network, ghost]\n");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs.to_string().contains("module homefs references ghost"));
    }

    #[test]
    fn test_bp006_missing_and_unknown_settings() {
        let yaml = TWO_GROUPS
            .replace("  project_id: test-project\n", "")
            .replace("      instance_count: 4\n", "      instance_count: 4\n      colour: red\n");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        let kinds: Vec<_> = errs.iter().map(|e| (e.kind(), e.entity())).collect();
        assert_eq!(
            kinds,
            vec![
                ("missing_setting", "network".to_string()),
                ("missing_setting", "homefs".to_string()),
                ("missing_setting", "workers".to_string()),
                ("unknown_setting", "workers".to_string()),
            ]
        );
    }

    #[test]
    fn test_bp006_errors_aggregated_across_modules() {
        let yaml = TWO_GROUPS
            .replace(
                "    use: [network]\n",
                "    use: [network]\n    settings:\n      zone: $(a.b.c)\n",
            )
            .replace("      instance_count: 4\n", "      instance_count: $(vars.nope)\n");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        let kinds: Vec<_> = errs.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["malformed_reference", "dangling_reference"]);
        assert_eq!(errs.to_string().lines().count(), 2);
    }

    #[test]
    fn test_bp006_vars_must_be_literal() {
        let yaml = TWO_GROUPS.replace("  unused_key: nobody\n", "  unused_key: $(vars.zone)\n");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.iter().next().unwrap().entity(), "vars.unused_key");

        let yaml = TWO_GROUPS.replace("  unused_key: nobody\n", "  unused_key: \\$(escaped)\n");
        let (_, result) = expanded(&yaml);
        assert!(result.is_ok());
    }

    #[test]
    fn test_bp006_module_not_found() {
        let yaml = TWO_GROUPS.replace("./modules/filestore", "./modules/nowhere");
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.iter().next().unwrap().kind(), "module_not_found");
    }

    #[test]
    fn test_bp006_moved_module_before_lookup() {
        let yaml = TWO_GROUPS.replace(
            "./modules/filestore",
            "community/modules/scheduler/cloud-batch-job",
        );
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs.iter().next().unwrap().kind(), "module_moved");
    }

    #[test]
    fn test_bp006_validator_inputs_globals_only() {
        let yaml = format!(
            "{}validators:\n- validator: test_project_exists\n  inputs:\n    project_id: $(network.project)\n",
            TWO_GROUPS
        );
        let (_, result) = expanded(&yaml);
        let errs = result.unwrap_err();
        assert!(errs.to_string().contains("validator test_project_exists"));
    }

    #[test]
    fn test_bp006_validator_only_use_is_unused() {
        let yaml = format!(
            "{}validators:\n- validator: test_project_exists\n  inputs:\n    project_id: $(vars.unused_key)\n",
            TWO_GROUPS
        );
        let (bp, result) = expanded(&yaml);
        assert_eq!(result.unwrap().unused_vars, vec!["unused_key"]);
        assert_eq!(
            bp.validators[0].inputs.get("project_id").unwrap().to_string(),
            "$(vars.unused_key)"
        );
    }

    #[test]
    fn test_bp006_reexpand_exported_keeps_report() {
        let (bp, result) = expanded(TWO_GROUPS);
        let first = result.unwrap();
        let yaml = crate::core::parser::to_yaml(&bp).unwrap();
        let (reloaded, result) = expanded(&yaml);
        let second = result.unwrap();
        assert!(second.unused_modules.is_empty());
        assert_eq!(second, first);
        assert!(!reloaded
            .module("homefs")
            .unwrap()
            .settings
            .has_product_of("network"));
    }

    #[test]
    fn test_bp006_idempotent() {
        let mut bp = parse_blueprint(TWO_GROUPS).unwrap();
        let provider = provider();
        let first = expand(&mut bp, &provider).unwrap();
        let snapshot = bp.clone();
        let second = expand(&mut bp, &provider).unwrap();
        assert_eq!(bp, snapshot);
        assert_eq!(first, second);
    }
}
