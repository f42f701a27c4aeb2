//! Stepwright - self-correcting multi-step build pipeline CLI
//!
//! ## Commands
//!
//! - `run`: Apply a step manifest to an artifact tree with verification and remediation
//! - `report`: Health report aggregated from the metrics ledger
//! - `dashboard`: Boxed health dashboard
//! - `export`: Dump ledger records as JSON or CSV
//! - `repair`: Collapse a self-nested project directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use stepwright_ci::{
    CommandAgent, CommandFeatureCheck, CommandToolchain, PipelineController, ProcessSupervisor,
    SupervisorLimits, ValidatorRegistry,
};
use stepwright_core::{
    aggregate, export_records, recent_records, render_dashboard, render_health_report,
    render_run_summary_md, repair_if_nested, resolve_path, write_run_artifacts, ExportFormat,
    FingerprintTracker, JsonlMetricsStore, MetricsRecord, MetricsStore, StepManifest,
    StepwrightConfig,
};

const DEFAULT_CONFIG_FILE: &str = "stepwright.toml";

#[derive(Parser)]
#[command(name = "stepwright")]
#[command(author = "Stepwright Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-correcting multi-step build pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Artifact root the pipeline operates on
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Configuration file (default: <root>/stepwright.toml, optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every step of a manifest against the artifact root
    Run {
        /// Step manifest (JSON or TOML)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Abort the run when a step's validation stays failed
        #[arg(long, env = "STEPWRIGHT_STRICT_VALIDATION")]
        strict_validation: bool,

        /// Treat analyzer warnings as failures
        #[arg(long, env = "STEPWRIGHT_STRICT_LINTING")]
        strict_linting: bool,

        /// Do not write step and stage records to the metrics ledger
        #[arg(long)]
        no_monitoring: bool,
    },

    /// Print the pipeline health report
    Report {
        /// Restrict the report to one run ID
        #[arg(long)]
        run: Option<String>,

        /// Days of history to read; 0 reads the whole ledger (default: metrics.history_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Print the health dashboard
    Dashboard {
        /// Days of history to read; 0 reads the whole ledger (default: metrics.history_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Export metrics ledger records
    Export {
        /// Output format: json or csv
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Collapse a self-nested duplicate of a project directory
    Repair {
        /// Project directory to repair (default: --root)
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("Artifact root not found: {:?}", cli.root))?;
    let config = load_config(&root, cli.config.as_deref())?;

    // Setup logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json |= cli.json;
    stepwright_core::init_tracing(&logging);

    let exit_code = match cli.command {
        Commands::Run {
            manifest,
            strict_validation,
            strict_linting,
            no_monitoring,
        } => {
            let mut config = config;
            config.policy.strict_validation |= strict_validation;
            config.policy.strict_linting |= strict_linting;
            if no_monitoring {
                config.policy.monitoring_enabled = false;
            }
            cmd_run(&root, config, &manifest).await?
        }
        Commands::Report { run, days } => {
            let days = days.unwrap_or(config.metrics.history_days);
            cmd_report(&root, &config, run.as_deref(), days)?;
            0
        }
        Commands::Dashboard { days } => {
            let days = days.unwrap_or(config.metrics.history_days);
            cmd_dashboard(&root, &config, days)?;
            0
        }
        Commands::Export { format, output } => {
            cmd_export(&root, &config, &format, output.as_deref())?;
            0
        }
        Commands::Repair { dir } => {
            cmd_repair(&config, dir.as_deref().unwrap_or(root.as_path()))?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Load the explicit config, or `<root>/stepwright.toml` when it exists.
fn load_config(root: &Path, explicit: Option<&Path>) -> Result<StepwrightConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = root.join(DEFAULT_CONFIG_FILE);
            if !candidate.exists() {
                return Ok(StepwrightConfig::default());
            }
            candidate
        }
    };
    StepwrightConfig::load(&path).with_context(|| format!("Failed to load config {:?}", path))
}

fn ledger(root: &Path, config: &StepwrightConfig) -> JsonlMetricsStore {
    JsonlMetricsStore::new(resolve_path(root, &config.metrics.ledger))
}

async fn cmd_run(root: &Path, config: StepwrightConfig, manifest_path: &Path) -> Result<i32> {
    let manifest = StepManifest::load(manifest_path)
        .with_context(|| format!("Failed to load step manifest {:?}", manifest_path))?;

    let supervisor = Arc::new(ProcessSupervisor::new());
    let limits = SupervisorLimits::from_config(&config.supervisor);

    let agent = CommandAgent::new(
        root,
        config.agent.clone(),
        Arc::clone(&supervisor),
        limits.clone(),
    )?;
    let toolchain = CommandToolchain::new(
        root,
        config.toolchain.clone(),
        Arc::clone(&supervisor),
        limits,
    );

    let mut validators = ValidatorRegistry::new(root);
    if !config.toolchain.feature_check.is_empty() {
        validators = validators.with_feature_check(Arc::new(CommandFeatureCheck::new(
            config.toolchain.feature_check.clone(),
            Arc::clone(&supervisor),
            Duration::from_secs(config.supervisor.timeout_secs),
        )));
    }

    let store: Arc<dyn MetricsStore> = Arc::new(ledger(root, &config));
    let fingerprint =
        FingerprintTracker::persistent(resolve_path(root, &config.toolchain.fingerprint_state));

    info!(
        root = %root.display(),
        steps = manifest.len(),
        "Starting pipeline run"
    );
    let report = PipelineController::new(
        root,
        config.policy.clone(),
        Arc::new(agent),
        Arc::new(toolchain),
    )
    .with_validators(validators)
    .with_metrics_store(store)
    .with_fingerprint(fingerprint)
    .with_dependency_manifest(resolve_path(root, &config.toolchain.manifest))
    .with_repair(config.repair.clone())
    .run(manifest)
    .await;

    // Anything a cancelled invocation left behind.
    supervisor.sweep();

    let artifacts = resolve_path(root, &config.metrics.artifacts_dir);
    match write_run_artifacts(&report, &artifacts) {
        Ok(path) => info!(path = %path.display(), "Run report written"),
        Err(e) => warn!(error = %e, "failed to write run artifacts"),
    }

    println!("{}", render_run_summary_md(&report));
    Ok(report.exit_code)
}

/// Ledger records inside the history window, optionally for one run.
fn load_history(
    root: &Path,
    config: &StepwrightConfig,
    run: Option<&str>,
    days: u32,
) -> Result<Vec<MetricsRecord>> {
    let store = ledger(root, config);
    let records = match run {
        Some(run_id) => store.load_run(run_id)?,
        None => store.load()?,
    };
    Ok(recent_records(records, days, chrono::Utc::now()))
}

fn cmd_report(root: &Path, config: &StepwrightConfig, run: Option<&str>, days: u32) -> Result<()> {
    let records = load_history(root, config, run, days)?;
    if let Some(run_id) = run {
        if records.is_empty() {
            bail!("No metrics recorded for run {} in the last {} days", run_id, days);
        }
    }
    let report = aggregate(&records, &config.metrics.alerts);
    print!("{}", render_health_report(&report));
    Ok(())
}

fn cmd_dashboard(root: &Path, config: &StepwrightConfig, days: u32) -> Result<()> {
    let records = load_history(root, config, None, days)?;
    let report = aggregate(&records, &config.metrics.alerts);
    print!("{}", render_dashboard(&report));
    Ok(())
}

fn cmd_export(
    root: &Path,
    config: &StepwrightConfig,
    format: &str,
    output: Option<&Path>,
) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let records = ledger(root, config).load()?;
    let rendered = export_records(&records, format)?;

    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write export to {:?}", path))?;
            println!("Exported {} records to {:?}", records.len(), path);
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

fn cmd_repair(config: &StepwrightConfig, dir: &Path) -> Result<()> {
    let report = repair_if_nested(dir, &config.repair)
        .with_context(|| format!("Structural repair failed for {:?}", dir))?;
    if report.repaired() {
        println!(
            "Collapsed {} nested level(s): {} files moved, {} overwritten",
            report.levels_collapsed,
            report.files_moved,
            report.overwritten.len()
        );
        for path in &report.overwritten {
            println!("  overwritten: {}", path.display());
        }
    } else {
        println!("No nested project directory found in {:?}", dir);
    }
    Ok(())
}
