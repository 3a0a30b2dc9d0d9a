mod codeowners;
mod data;
mod git;
mod orchestrator;
mod usersync;
mod validate;

use crate::data::Data;
use crate::orchestrator::{CycleError, Orchestrator, ServiceConfig};
use anyhow::Context;
use clap::Parser;
use log::{error, warn};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
/// Keep a forge organization in sync with its teams repository
enum Cli {
    /// Check that a checkout of the teams repository is valid
    Check {
        /// Path to the checkout
        path: PathBuf,
    },
    /// Print the plan that would converge the organization, without
    /// applying anything
    Plan {
        /// Path to the checkout
        path: PathBuf,
        #[clap(flatten)]
        service: ServiceConfig,
    },
    /// Apply the desired state to the organization
    ///
    /// Environment variables:
    /// - GITHUB_TOKEN  Authentication token with the forge
    #[clap(verbatim_doc_comment)]
    Apply {
        /// Path to the checkout
        path: PathBuf,
        #[clap(flatten)]
        service: ServiceConfig,
    },
    /// Regenerate the .github/CODEOWNERS file of a checkout
    Codeowners {
        /// Path to the checkout
        path: PathBuf,
        /// Organization login used in the owner handles
        #[arg(long, env = "ORGWARDEN_ORG")]
        org: String,
        /// Only check that the file is up-to-date
        #[arg(long)]
        check: bool,
    },
    /// Run the reconciliation loop against the configured repository
    Serve {
        #[clap(flatten)]
        service: ServiceConfig,
        /// Compute and log the plans without applying them
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    init_log();
    let cli = Cli::parse();
    match app(cli) {
        Ok(()) => {}
        Err(err) => {
            error!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn app(cli: Cli) -> Result<(), CycleError> {
    match cli {
        Cli::Check { path } => {
            let (data, load_warnings) = Data::load(&path).map_err(CycleError::Validation)?;
            let warnings = validate::validate(&data).map_err(CycleError::Validation)?;
            for warning in load_warnings.iter().chain(warnings.iter()) {
                warn!("{warning}");
            }
            Ok(())
        }
        Cli::Plan { path, service } => {
            let orchestrator = orchestrator(service)?;
            orchestrator.cycle_from_path(&path, true)
        }
        Cli::Apply { path, service } => {
            let orchestrator = orchestrator(service)?;
            orchestrator.cycle_from_path(&path, false)
        }
        Cli::Codeowners { path, org, check } => {
            let (data, _) = Data::load(&path).map_err(CycleError::Validation)?;
            if check {
                codeowners::check_codeowners(&path, &data, &org).map_err(CycleError::Validation)
            } else {
                codeowners::update_codeowners_file(&path, &data, &org)
                    .map(|_| ())
                    .map_err(CycleError::Other)
            }
        }
        Cli::Serve { service, dry_run } => {
            let orchestrator = orchestrator(service)?;
            orchestrator.run_forever(dry_run)
        }
    }
}

fn orchestrator(service: ServiceConfig) -> Result<Orchestrator, CycleError> {
    let token = std::env::var("GITHUB_TOKEN")
        .context("failed to get the GITHUB_TOKEN environment variable")
        .map_err(CycleError::Other)?;
    Orchestrator::new(service, SecretString::from(token)).map_err(CycleError::Other)
}

fn init_log() {
    let mut env = env_logger::Builder::new();
    env.filter_level(log::LevelFilter::Info);
    if let Ok(content) = std::env::var("RUST_LOG") {
        env.parse_filters(&content);
    }
    env.init();
}
