//! BP-021: Validator registry.
//!
//! Two kinds of validation run over an expanded blueprint:
//! - structural checks ([`checks`]), always fatal
//! - configured validators (`validators:` in the blueprint), whose failures
//!   are ignored, reported as warnings, or fatal depending on the
//!   validation level
//!
//! Structural checks are pure functions and may run concurrently over a
//! shared read-only blueprint.

pub mod checks;
pub mod preflight;

use crate::core::error::{BlueprintError, Diagnostics, Finding};
use crate::core::expand::ExpandReport;
use crate::core::reference::Reference;
use crate::core::types::{Blueprint, ValidationLevel, ValidatorConfig};
use crate::core::value::Value;
use indexmap::IndexMap;
use preflight::{run_preflight, CloudPreflight, PreflightRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Known validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidatorKind {
    ProjectExists,
    ApisEnabled,
    RegionExists,
    ZoneExists,
    ZoneInRegion,
    ModuleNotUsed,
    DeploymentVariableNotUsed,
}

impl ValidatorKind {
    pub const ALL: [ValidatorKind; 7] = [
        Self::ProjectExists,
        Self::ApisEnabled,
        Self::RegionExists,
        Self::ZoneExists,
        Self::ZoneInRegion,
        Self::ModuleNotUsed,
        Self::DeploymentVariableNotUsed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ProjectExists => "test_project_exists",
            Self::ApisEnabled => "test_apis_enabled",
            Self::RegionExists => "test_region_exists",
            Self::ZoneExists => "test_zone_exists",
            Self::ZoneInRegion => "test_zone_in_region",
            Self::ModuleNotUsed => "test_module_not_used",
            Self::DeploymentVariableNotUsed => "test_deployment_variable_not_used",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// The exact input set the validator accepts.
    pub fn required_inputs(self) -> &'static [&'static str] {
        match self {
            Self::ProjectExists => &["project_id"],
            Self::RegionExists => &["project_id", "region"],
            Self::ZoneExists => &["project_id", "zone"],
            Self::ZoneInRegion => &["project_id", "region", "zone"],
            Self::ApisEnabled | Self::ModuleNotUsed | Self::DeploymentVariableNotUsed => &[],
        }
    }

    /// Whether the validator queries live cloud state.
    pub fn is_cloud(self) -> bool {
        !matches!(self, Self::ModuleNotUsed | Self::DeploymentVariableNotUsed)
    }
}

impl ValidatorConfig {
    /// The config names `expected` and its input keys equal `required` as a set.
    pub fn check_contract(&self, expected: &str, required: &[&str]) -> Result<(), BlueprintError> {
        if self.validator != expected {
            return Err(BlueprintError::WrongValidator {
                expected: expected.to_string(),
                got: self.validator.clone(),
            });
        }
        let missing: Vec<String> = required
            .iter()
            .filter(|r| !self.inputs.contains(r))
            .map(|r| r.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BlueprintError::MissingRequiredInput {
                validator: expected.to_string(),
                missing,
            });
        }
        if self.inputs.len() > required.len() {
            return Err(BlueprintError::TooManyInputs {
                validator: expected.to_string(),
                allowed: required.iter().map(|r| r.to_string()).collect(),
            });
        }
        Ok(())
    }

    pub fn check(&self, kind: ValidatorKind) -> Result<(), BlueprintError> {
        self.check_contract(kind.name(), kind.required_inputs())
    }
}

// ============================================================================
// Defaults and skipping
// ============================================================================

/// Append the standard validators that are not configured yet.
///
/// The unused-binding checks are always added; cloud checks are added when
/// the variables they need are defined.
pub fn add_default_validators(bp: &mut Blueprint) {
    let has = |name: &str| bp.vars.contains(name);
    let project = has("project_id");
    let wanted = [
        (ValidatorKind::ModuleNotUsed, true),
        (ValidatorKind::DeploymentVariableNotUsed, true),
        (ValidatorKind::ProjectExists, project),
        (ValidatorKind::ApisEnabled, project),
        (ValidatorKind::RegionExists, project && has("region")),
        (ValidatorKind::ZoneExists, project && has("zone")),
        (
            ValidatorKind::ZoneInRegion,
            project && has("region") && has("zone"),
        ),
    ];
    let missing: Vec<ValidatorKind> = wanted
        .into_iter()
        .filter(|(kind, enabled)| {
            *enabled && !bp.validators.iter().any(|v| v.validator == kind.name())
        })
        .map(|(kind, _)| kind)
        .collect();

    for kind in missing {
        let mut config = ValidatorConfig::new(kind.name());
        for input in kind.required_inputs() {
            config.inputs.set(*input, Reference::global(input));
        }
        debug!(validator = kind.name(), "adding default validator");
        bp.validators.push(config);
    }
}

/// Mark every validator named `name` as skipped, adding one if none exists.
pub fn skip_validator(bp: &mut Blueprint, name: &str) {
    let mut found = false;
    for config in bp.validators.iter_mut().filter(|v| v.validator == name) {
        config.skip = true;
        found = true;
    }
    if !found {
        let mut config = ValidatorConfig::new(name);
        config.skip = true;
        bp.validators.push(config);
    }
}

// ============================================================================
// Running validators
// ============================================================================

/// How configured validators are run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOptions {
    pub level: ValidationLevel,
    pub preflight_timeout: Duration,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            level: ValidationLevel::Warning,
            preflight_timeout: Duration::from_secs(30),
        }
    }
}

impl ValidationOptions {
    /// Options using the blueprint's own validation level.
    pub fn for_blueprint(bp: &Blueprint) -> Self {
        Self {
            level: bp.validation_level,
            ..Self::default()
        }
    }
}

/// Render a validator input as the string the cloud API expects.
fn input_string(bp: &Blueprint, value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Expr(e) => match e.as_single_reference() {
            Some(Reference::Global(name)) => match bp.vars.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => e.to_string(),
            },
            _ => e.to_string(),
        },
        other => other.to_string(),
    }
}

fn preflight_request(bp: &Blueprint, kind: ValidatorKind, config: &ValidatorConfig) -> PreflightRequest {
    let mut inputs: IndexMap<String, String> = config
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), input_string(bp, v)))
        .collect();
    if kind == ValidatorKind::ApisEnabled && !inputs.contains_key("project_id") {
        if let Some(project) = bp.vars.get("project_id") {
            inputs.insert("project_id".to_string(), input_string(bp, project));
        }
    }
    PreflightRequest { kind, inputs }
}

/// Run the blueprint's configured validators.
///
/// Unknown names and bad input sets are structural errors reported by
/// [`checks::validator_configs`]; such configs are not run here.
pub async fn run_validators(
    bp: &Blueprint,
    report: &ExpandReport,
    preflight: Option<Arc<dyn CloudPreflight>>,
    opts: &ValidationOptions,
) -> Diagnostics {
    if opts.level == ValidationLevel::Ignore {
        info!("validation level is ignore; validators not run");
        return Diagnostics::default();
    }

    let mut findings: Vec<Finding> = Vec::new();
    let mut requests = Vec::new();
    for config in bp.validators.iter().filter(|v| !v.skip) {
        let Some(kind) = ValidatorKind::from_name(&config.validator) else {
            continue;
        };
        if config.check(kind).is_err() {
            continue;
        }
        match kind {
            ValidatorKind::ModuleNotUsed => findings.extend(report.unused_module_findings()),
            ValidatorKind::DeploymentVariableNotUsed => {
                findings.extend(report.unused_var_findings())
            }
            _ => requests.push(preflight_request(bp, kind, config)),
        }
    }

    if !requests.is_empty() {
        match preflight {
            Some(client) => {
                info!(count = requests.len(), "running cloud preflight checks");
                findings.extend(
                    run_preflight(
                        client,
                        requests,
                        report.services.clone(),
                        opts.preflight_timeout,
                    )
                    .await,
                );
            }
            None => {
                let names: Vec<&str> = requests.iter().map(|r| r.kind.name()).collect();
                warn!(validators = ?names, "no cloud client configured; skipping cloud validators");
            }
        }
    }

    for finding in &findings {
        warn!("{}", finding);
    }
    match opts.level {
        ValidationLevel::Error => Diagnostics {
            errors: findings.into_iter().map(Finding::into_error).collect(),
            findings: Vec::new(),
        },
        _ => Diagnostics {
            errors: Vec::new(),
            findings,
        },
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A pure structural check.
pub type CheckFn = fn(&Blueprint) -> Vec<BlueprintError>;

/// Ordered battery of structural checks.
#[derive(Clone)]
pub struct ValidatorRegistry {
    checks: Vec<(&'static str, CheckFn)>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl ValidatorRegistry {
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    /// Every built-in structural check.
    pub fn standard() -> Self {
        Self::empty()
            .with_check("blueprint_name", checks::blueprint_name)
            .with_check("deployment_name", checks::deployment_name)
            .with_check("modules_and_groups", checks::modules_and_groups)
            .with_check("moved_modules", checks::moved_modules)
            .with_check("labels", checks::labels)
            .with_check("backends", checks::backends)
            .with_check("references", checks::references)
            .with_check("validator_configs", checks::validator_configs)
    }

    pub fn with_check(mut self, name: &'static str, check: CheckFn) -> Self {
        self.checks.push((name, check));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|(n, _)| *n).collect()
    }

    /// Run every check in order and merge the results.
    pub fn check(&self, bp: &Blueprint) -> Vec<BlueprintError> {
        self.checks
            .iter()
            .flat_map(|(name, check)| {
                let errors = check(bp);
                debug!(check = name, errors = errors.len(), "structural check done");
                errors
            })
            .collect()
    }

    /// Same as [`check`](Self::check), with each check on a blocking task.
    pub async fn check_concurrent(&self, bp: Arc<Blueprint>) -> Vec<BlueprintError> {
        let mut tasks = JoinSet::new();
        for (idx, (name, check)) in self.checks.iter().copied().enumerate() {
            let bp = Arc::clone(&bp);
            tasks.spawn_blocking(move || (idx, name, check(&bp)));
        }

        let mut results = Vec::with_capacity(self.checks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, name, errors)) => {
                    debug!(check = name, errors = errors.len(), "structural check done");
                    results.push((idx, errors));
                }
                Err(e) => results.push((
                    usize::MAX,
                    vec![BlueprintError::ValidatorFailed {
                        validator: "structural check".to_string(),
                        message: e.to_string(),
                    }],
                )),
            }
        }
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().flat_map(|(_, e)| e).collect()
    }

    /// Structural checks followed by the configured validators.
    pub async fn validate(
        &self,
        bp: Arc<Blueprint>,
        report: &ExpandReport,
        preflight: Option<Arc<dyn CloudPreflight>>,
        opts: &ValidationOptions,
    ) -> Diagnostics {
        let mut errors = self.check_concurrent(Arc::clone(&bp)).await;
        let mut diags = run_validators(&bp, report, preflight, opts).await;
        errors.append(&mut diags.errors);
        diags.errors = errors;
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint(yaml: &str) -> Blueprint {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    const MINIMAL: &str = r#"
blueprint_name: minimal
vars:
  deployment_name: golden
  project_id: test-project
  region: us-central1
  zone: us-central1-a
deployment_groups:
- group: primary
  modules:
  - id: vpc
    source: ./vpc
    kind: terraform
"#;

    #[test]
    fn test_bp021_validator_names() {
        for kind in ValidatorKind::ALL {
            assert_eq!(ValidatorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ValidatorKind::from_name("who_is_this"), None);
        assert!(ValidatorKind::ZoneInRegion.is_cloud());
        assert!(!ValidatorKind::ModuleNotUsed.is_cloud());
    }

    fn config_with(inputs: &[&str]) -> ValidatorConfig {
        let mut v = ValidatorConfig::new("test_project_exists");
        for input in inputs {
            v.inputs.set(*input, Value::Null);
        }
        v
    }

    #[test]
    fn test_bp021_contract_name_mismatch() {
        let v = ValidatorConfig::new("who_is_this");
        let err = v.check_contract("test_project_exists", &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "passed wrong validator to test_project_exists implementation"
        );
        assert!(ValidatorConfig::new("test_project_exists")
            .check_contract("test_project_exists", &[])
            .is_ok());
    }

    #[test]
    fn test_bp021_contract_order_irrelevant() {
        let v = config_with(&["in0", "in1"]);
        assert!(v.check_contract("test_project_exists", &["in0", "in1"]).is_ok());
        assert!(v.check_contract("test_project_exists", &["in1", "in0"]).is_ok());
    }

    #[test]
    fn test_bp021_contract_missing() {
        let required = ["in0", "in1", "in2"];
        for inputs in [&["in0", "in1"][..], &["in0", "in1", "in3"][..]] {
            let err = config_with(inputs)
                .check_contract("test_project_exists", &required)
                .unwrap_err();
            assert!(
                err.to_string()
                    .starts_with("at least one required input was not provided to test_project_exists"),
                "{}",
                err
            );
        }
    }

    #[test]
    fn test_bp021_contract_superset() {
        let err = config_with(&["in0", "in1", "in2", "in3"])
            .check_contract("test_project_exists", &["in0", "in1", "in2"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "only 3 inputs [in0 in1 in2] should be provided to test_project_exists"
        );
    }

    fn names(bp: &Blueprint) -> Vec<(String, bool)> {
        bp.validators
            .iter()
            .map(|v| (v.validator.clone(), v.skip))
            .collect()
    }

    #[test]
    fn test_bp021_skip_validator() {
        let mut bp = blueprint(MINIMAL);
        skip_validator(&mut bp, "zebra");
        assert_eq!(names(&bp), vec![("zebra".into(), true)]);

        let mut bp = blueprint(MINIMAL);
        bp.validators = vec![ValidatorConfig::new("pony")];
        skip_validator(&mut bp, "zebra");
        assert_eq!(names(&bp), vec![("pony".into(), false), ("zebra".into(), true)]);

        let mut bp = blueprint(MINIMAL);
        bp.validators = vec![ValidatorConfig::new("pony"), ValidatorConfig::new("zebra")];
        skip_validator(&mut bp, "zebra");
        assert_eq!(names(&bp), vec![("pony".into(), false), ("zebra".into(), true)]);

        let mut bp = blueprint(MINIMAL);
        let mut skipped = ValidatorConfig::new("zebra");
        skipped.skip = true;
        bp.validators = vec![ValidatorConfig::new("pony"), skipped];
        skip_validator(&mut bp, "zebra");
        assert_eq!(names(&bp), vec![("pony".into(), false), ("zebra".into(), true)]);

        let mut bp = blueprint(MINIMAL);
        bp.validators = vec![
            ValidatorConfig::new("zebra"),
            ValidatorConfig::new("pony"),
            ValidatorConfig::new("zebra"),
        ];
        skip_validator(&mut bp, "zebra");
        assert_eq!(
            names(&bp),
            vec![
                ("zebra".into(), true),
                ("pony".into(), false),
                ("zebra".into(), true)
            ]
        );
    }

    #[test]
    fn test_bp021_default_validators() {
        let mut bp = blueprint(MINIMAL);
        add_default_validators(&mut bp);
        let got: Vec<_> = bp.validators.iter().map(|v| v.validator.as_str()).collect();
        assert_eq!(
            got,
            vec![
                "test_module_not_used",
                "test_deployment_variable_not_used",
                "test_project_exists",
                "test_apis_enabled",
                "test_region_exists",
                "test_zone_exists",
                "test_zone_in_region",
            ]
        );
        let zir = &bp.validators[6];
        assert_eq!(zir.inputs.get("zone").unwrap().to_string(), "$(vars.zone)");
        // every default satisfies its own contract
        assert!(checks::validator_configs(&bp).is_empty());

        add_default_validators(&mut bp);
        assert_eq!(bp.validators.len(), 7);
    }

    #[test]
    fn test_bp021_default_validators_without_project() {
        let mut bp = blueprint("blueprint_name: x\ndeployment_groups: []\n");
        add_default_validators(&mut bp);
        assert_eq!(bp.validators.len(), 2);
    }

    #[test]
    fn test_bp021_registry_sequential_and_concurrent_agree() {
        let mut bp = blueprint(MINIMAL);
        bp.blueprint_name = "Bad.Name".into();
        bp.vars.set("labels", Value::from("not a map"));
        bp.validators.push(ValidatorConfig::new("test_nope"));
        let registry = ValidatorRegistry::standard();
        let sequential = registry.check(&bp);
        assert_eq!(sequential.len(), 3);
        assert_eq!(sequential[0].entity(), "blueprint_name");

        let rt = tokio::runtime::Runtime::new().unwrap();
        let concurrent = rt.block_on(registry.check_concurrent(Arc::new(bp)));
        assert_eq!(sequential, concurrent);
    }

    #[test]
    fn test_bp021_registry_custom_check() {
        fn no_vpc(bp: &Blueprint) -> Vec<BlueprintError> {
            bp.module("vpc")
                .map(|m| BlueprintError::UnknownSetting {
                    module: m.id.clone(),
                    setting: "vpc".into(),
                })
                .into_iter()
                .collect()
        }
        let registry = ValidatorRegistry::empty().with_check("no_vpc", no_vpc);
        assert_eq!(registry.names(), vec!["no_vpc"]);
        assert_eq!(registry.check(&blueprint(MINIMAL)).len(), 1);
    }

    fn unused_report() -> ExpandReport {
        ExpandReport {
            unused_modules: vec![("compute".into(), "vpc".into())],
            unused_vars: vec!["zone".into()],
            services: vec![],
        }
    }

    #[tokio::test]
    async fn test_bp021_levels() {
        let mut bp = blueprint(MINIMAL);
        bp.validators = vec![
            ValidatorConfig::new("test_module_not_used"),
            ValidatorConfig::new("test_deployment_variable_not_used"),
        ];
        let report = unused_report();

        let mut opts = ValidationOptions::for_blueprint(&bp);
        let diags = run_validators(&bp, &report, None, &opts).await;
        assert!(diags.is_ok());
        assert_eq!(diags.findings.len(), 2);

        opts.level = ValidationLevel::Error;
        let diags = run_validators(&bp, &report, None, &opts).await;
        assert_eq!(diags.errors.len(), 2);
        assert!(diags.findings.is_empty());

        opts.level = ValidationLevel::Ignore;
        let diags = run_validators(&bp, &report, None, &opts).await;
        assert_eq!(diags, Diagnostics::default());
    }

    #[tokio::test]
    async fn test_bp021_skipped_validator_not_run() {
        let mut bp = blueprint(MINIMAL);
        bp.validators = vec![ValidatorConfig::new("test_module_not_used")];
        skip_validator(&mut bp, "test_module_not_used");
        let diags =
            run_validators(&bp, &unused_report(), None, &ValidationOptions::default()).await;
        assert!(diags.findings.is_empty());
    }

    #[test]
    fn test_bp021_preflight_request_resolves_vars() {
        let mut bp = blueprint(MINIMAL);
        add_default_validators(&mut bp);
        let apis = bp
            .validators
            .iter()
            .find(|v| v.validator == "test_apis_enabled")
            .unwrap()
            .clone();
        let request = preflight_request(&bp, ValidatorKind::ApisEnabled, &apis);
        assert_eq!(request.inputs.get("project_id").map(String::as_str), Some("test-project"));

        let zone = bp.validators[5].clone();
        let request = preflight_request(&bp, ValidatorKind::ZoneExists, &zone);
        assert_eq!(request.inputs.get("zone").map(String::as_str), Some("us-central1-a"));
    }
}
