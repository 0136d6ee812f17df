//! BP-031: CLI subcommands: expand, validate, schema.

use crate::config::{discover_config, ToolConfig};
use crate::core::error::Diagnostics;
use crate::core::expand::{expand, ExpandReport};
use crate::core::types::{Blueprint, ValidationLevel};
use crate::core::{fingerprint, parser};
use crate::modules::{CachedProvider, DirectoryProvider};
use crate::validators::{
    add_default_validators, skip_validator, ValidationOptions, ValidatorRegistry,
};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expand a blueprint: wire `use` lists, resolve references, validate
    Expand {
        #[command(flatten)]
        common: CommonArgs,

        /// Write the expanded blueprint here (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Validate a blueprint without writing anything
    Validate {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the blueprint JSON schema
    Schema,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the blueprint YAML
    #[arg(short, long)]
    pub blueprint: PathBuf,

    /// Treat validator findings (unused variables and modules) as errors
    #[arg(long)]
    pub strict: bool,

    /// Skip a validator by name (repeatable)
    #[arg(long = "skip-validator", value_name = "NAME")]
    pub skip_validator: Vec<String>,

    /// Tool config file (default: bpforge.toml beside the blueprint)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print diagnostics as JSON
    #[arg(long)]
    pub json: bool,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Expand { common, out } => cmd_expand(&common, out.as_deref()),
        Commands::Validate { common } => cmd_validate(&common),
        Commands::Schema => cmd_schema(),
    }
}

/// Install the global subscriber once; later calls are no-ops.
fn init_logging(config: &ToolConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Load, expand and validate. Returns the expanded blueprint and its
/// diagnostics; `Err` only for failures that prevent validation.
fn run_pipeline(args: &CommonArgs) -> Result<(Blueprint, ExpandReport, Diagnostics), String> {
    let config = discover_config(args.config.as_deref(), &args.blueprint)?;
    init_logging(&config);

    let mut bp = parser::load_blueprint(&args.blueprint)?;
    for name in config.skip_validators.iter().chain(&args.skip_validator) {
        skip_validator(&mut bp, name);
    }
    add_default_validators(&mut bp);

    let base_dir = args
        .blueprint
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let provider = CachedProvider::new(DirectoryProvider::new(
        base_dir,
        config.module_roots.clone(),
    ));

    let registry = ValidatorRegistry::standard();
    let report = match expand(&mut bp, &provider) {
        Ok(report) => report,
        Err(errors) => {
            // Structural checks still run so one pass reports every problem.
            let mut errors = errors.0;
            for e in registry.check(&bp) {
                if !errors.contains(&e) {
                    errors.push(e);
                }
            }
            let diags = Diagnostics {
                errors,
                findings: Vec::new(),
            };
            return Ok((bp, ExpandReport::default(), diags));
        }
    };

    let level = if args.strict {
        ValidationLevel::Error
    } else {
        config.level(bp.validation_level)
    };
    let opts = ValidationOptions {
        level,
        preflight_timeout: config.preflight_timeout(),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;
    let shared = Arc::new(bp);
    let diags = runtime.block_on(registry.validate(
        Arc::clone(&shared),
        &report,
        None,
        &opts,
    ));
    let bp = Arc::try_unwrap(shared).unwrap_or_else(|arc| (*arc).clone());
    Ok((bp, report, diags))
}

/// Print diagnostics and turn fatal errors into the command error.
fn report_diagnostics(diags: &Diagnostics, json: bool) -> Result<(), String> {
    if json {
        let text = serde_json::to_string_pretty(&diags.to_json())
            .map_err(|e| format!("serialize error: {}", e))?;
        println!("{}", text);
    } else {
        for e in &diags.errors {
            eprintln!("  ERROR: {}", e);
        }
        for f in &diags.findings {
            eprintln!("  WARNING: {}", f);
        }
    }
    if diags.is_ok() {
        Ok(())
    } else {
        Err(format!("{} validation error(s)", diags.errors.len()))
    }
}

fn cmd_validate(args: &CommonArgs) -> Result<(), String> {
    let (bp, _, diags) = run_pipeline(args)?;
    report_diagnostics(&diags, args.json)?;
    if !args.json {
        println!(
            "OK: {} ({} groups, {} modules, {} warning(s))",
            bp.blueprint_name,
            bp.deployment_groups.len(),
            bp.modules().count(),
            diags.findings.len()
        );
    }
    Ok(())
}

fn cmd_expand(args: &CommonArgs, out: Option<&Path>) -> Result<(), String> {
    let (bp, report, diags) = run_pipeline(args)?;
    report_diagnostics(&diags, args.json)?;
    info!(services = ?report.services, "expanded blueprint");

    match out {
        Some(path) => {
            parser::export_blueprint(&bp, path)?;
            if !args.json {
                println!(
                    "Expanded {} → {} ({})",
                    args.blueprint.display(),
                    path.display(),
                    fingerprint::fingerprint(&bp)?
                );
            }
        }
        None if !args.json => print!("{}", parser::to_yaml(&bp)?),
        None => {}
    }
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(Blueprint);
    let text =
        serde_json::to_string_pretty(&schema).map_err(|e| format!("serialize error: {}", e))?;
    println!("{}", text);
    Ok(())
}
