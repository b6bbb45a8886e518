//! epiflag - outlier flagging and export validation
//!
//! # Usage
//!
//! ```bash
//! # Build flag caches for every job in params.json
//! epiflag flag --params params.json
//!
//! # Validate the exports under common.export_dir
//! epiflag validate --params params.json --dry-run
//!
//! # Flag, then validate
//! epiflag run --params params.json
//! ```
//!
//! Exit status is 0 on success, 1 when validation reports unsuppressed
//! errors and 2 when the run could not complete.
//!
//! # Environment Variables
//!
//! - `EPIFLAG_PARAMS`: Params file used when `--params` is not given
//! - `RUST_LOG`: Logging level (default: info)

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use epiflag::config::{CommonParams, Params};
use epiflag::{flag_cache, logging, Validator};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "epiflag")]
#[command(about = "Outlier flagging and validation for daily indicator exports")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Args, Debug)]
struct ParamsArg {
    /// Params document (JSON, or TOML by extension)
    #[arg(long, env = "EPIFLAG_PARAMS", default_value = "params.json")]
    params: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Build or refresh the flag cache for every flagging job
    Flag(ParamsArg),

    /// Run the validation battery over the export directory
    Validate {
        #[command(flatten)]
        params: ParamsArg,

        /// Report errors without failing the run
        #[arg(long)]
        dry_run: bool,
    },

    /// Flag, then validate
    Run(ParamsArg),
}

// ============================================================================
// Commands
// ============================================================================

fn load_params(path: &Path) -> Result<Params> {
    match Params::load_from_file(path) {
        Ok(params) => {
            logging::init(&params.common).context("Failed to initialise logging")?;
            Ok(params)
        }
        Err(e) => {
            // Still report the failure through the default subscriber.
            let _ = logging::init(&CommonParams::default());
            Err(e).with_context(|| format!("Failed to load params from {}", path.display()))
        }
    }
}

fn run_flagging(params: &Params) -> Result<()> {
    let summary = flag_cache::flagging(params).context("Flagging failed")?;
    for job in &summary.jobs {
        info!(
            sig_fold = %job.sig_fold,
            sig_str = %job.sig_str,
            strategy = job.strategy,
            lags = job.lags.len(),
            "Flagging job complete"
        );
    }
    info!(jobs = summary.jobs.len(), flags = summary.total_flags(), "Flagging complete");
    Ok(())
}

/// `Ok(false)` when the report carries unsuppressed errors.
fn run_validation(params: &Params, dry_run: bool) -> Result<bool> {
    let validator = Validator::new(params)
        .context("Invalid validation params")?
        .dry_run(dry_run);
    let report = validator.validate().context("Validation could not run")?;
    report.log();
    print!("{}", report.summary());
    Ok(report.success())
}

fn dispatch(args: CliArgs) -> Result<bool> {
    match args.command {
        SubCommand::Flag(p) => {
            let params = load_params(&p.params)?;
            run_flagging(&params)?;
            Ok(true)
        }
        SubCommand::Validate { params: p, dry_run } => {
            let params = load_params(&p.params)?;
            run_validation(&params, dry_run)
        }
        SubCommand::Run(p) => {
            let params = load_params(&p.params)?;
            if params.flagging.is_some() {
                run_flagging(&params)?;
            } else {
                info!("No flagging section, skipping flagging");
            }
            if params.validation.is_some() {
                run_validation(&params, false)
            } else {
                info!("No validation section, skipping validation");
                Ok(true)
            }
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = CliArgs::parse();

    match dispatch(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            eprintln!("epiflag: {e:#}");
            ExitCode::from(2)
        }
    }
}
