use crate::codeowners::update_codeowners_file;
use crate::data::Data;
use crate::git::TeamsCheckout;
use crate::usersync::{plugin_by_name, sync_users};
use crate::validate::validate;
use anyhow::Context;
use log::{error, info, warn};
use secrecy::SecretString;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sync_org::github::GithubRemote;
use sync_org::github::api::HttpClient;
use sync_org::{CancelToken, run_sync};

/// Rolling tag marking the last commit that was fully applied.
const APPLIED_TAG: &str = "orgwarden-applied";

/// Connection and scheduling parameters of the service, read from the
/// environment by the CLI. Distinct from the in-repo configuration, which
/// travels with the teams repository itself.
#[derive(clap::Args, Debug)]
pub(crate) struct ServiceConfig {
    /// Login of the organization to reconcile
    #[arg(long, env = "ORGWARDEN_ORG")]
    pub(crate) org: String,
    /// URL of the teams repository
    #[arg(long, env = "ORGWARDEN_TEAMS_REPO", default_value = "")]
    pub(crate) teams_repo: String,
    /// Branch of the teams repository to reconcile
    #[arg(long, env = "ORGWARDEN_BRANCH", default_value = "main")]
    pub(crate) branch: String,
    /// Base URL of the forge API
    #[arg(long, env = "ORGWARDEN_API_BASE", default_value = "https://api.github.com")]
    pub(crate) api_base: String,
    /// Seconds between two reconcile cycles
    #[arg(long, env = "ORGWARDEN_INTERVAL", default_value_t = 600)]
    pub(crate) interval: u64,
    /// Ceiling on the duration of one cycle, in seconds
    #[arg(long, env = "ORGWARDEN_CYCLE_TIMEOUT", default_value_t = 1800)]
    pub(crate) cycle_timeout: u64,
}

/// What went wrong in a cycle, mapped onto the process exit codes the
/// one-shot commands report.
#[derive(Debug)]
pub(crate) enum CycleError {
    Validation(anyhow::Error),
    RemoteFetch(anyhow::Error),
    Timeout,
    Executor(anyhow::Error),
    Other(anyhow::Error),
}

impl CycleError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            CycleError::Other(_) => 1,
            CycleError::Validation(_) => 2,
            CycleError::RemoteFetch(_) => 3,
            CycleError::Timeout => 4,
            CycleError::Executor(_) => 5,
        }
    }
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleError::Validation(err) => write!(f, "the local model is invalid: {err:#}"),
            CycleError::RemoteFetch(err) => write!(f, "failed to fetch the remote state: {err:#}"),
            CycleError::Timeout => write!(f, "the cycle hit its time ceiling and was cancelled"),
            CycleError::Executor(err) => write!(f, "failed to apply the plan: {err:#}"),
            CycleError::Other(err) => write!(f, "{err:#}"),
        }
    }
}

/// Guard against overlapping cycles. A run request arriving while a cycle
/// is active is coalesced: at most one run stays queued, the rest are
/// dropped.
#[derive(Default)]
pub(crate) struct SingleFlight {
    state: Mutex<FlightState>,
}

#[derive(Default)]
struct FlightState {
    running: bool,
    queued: bool,
}

impl SingleFlight {
    /// Claims the flight. `false` means a cycle is already active and this
    /// request was queued (or dropped, when one is queued already).
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.running {
            state.queued = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Releases the flight; `true` when a coalesced request is pending and
    /// the caller should run again.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        std::mem::take(&mut state.queued)
    }
}

pub(crate) struct Orchestrator {
    service: ServiceConfig,
    client: HttpClient,
    remote: GithubRemote,
    flight: SingleFlight,
}

impl Orchestrator {
    pub(crate) fn new(service: ServiceConfig, token: SecretString) -> anyhow::Result<Self> {
        // The default snapshot TTL is one cycle: each tick fetches the
        // remote state at most once.
        let ttl = Duration::from_secs(service.interval);
        let (client, remote) =
            sync_org::remote_from_token(&service.api_base, &service.org, token, ttl)?;
        Ok(Orchestrator {
            service,
            client,
            remote,
            flight: SingleFlight::default(),
        })
    }

    /// The periodic loop: clone, load, reconcile, tag; sleep; repeat.
    pub(crate) fn run_forever(&self, dry_run: bool) -> ! {
        let interval = Duration::from_secs(self.service.interval);
        loop {
            self.tick(dry_run);
            std::thread::sleep(interval);
        }
    }

    fn tick(&self, dry_run: bool) {
        if !self.flight.begin() {
            info!("a cycle is already running, queueing this one");
            return;
        }
        loop {
            if let Err(err) = self.cycle_from_clone(dry_run) {
                error!("cycle failed: {err}");
            }
            if !self.flight.finish() {
                break;
            }
            info!("running the queued cycle");
            let claimed = self.flight.begin();
            debug_assert!(claimed);
        }
    }

    pub(crate) fn cycle_from_clone(&self, dry_run: bool) -> Result<(), CycleError> {
        if self.service.teams_repo.is_empty() {
            return Err(CycleError::Other(anyhow::anyhow!(
                "no teams repository configured, set ORGWARDEN_TEAMS_REPO"
            )));
        }
        let checkout =
            TeamsCheckout::clone_repository(&self.service.teams_repo, &self.service.branch)
                .map_err(CycleError::RemoteFetch)?;
        self.run_cycle(&checkout, dry_run)
    }

    pub(crate) fn cycle_from_path(&self, path: &Path, dry_run: bool) -> Result<(), CycleError> {
        let checkout = TeamsCheckout::existing(path, &self.service.branch);
        self.run_cycle(&checkout, dry_run)
    }

    fn run_cycle(&self, checkout: &TeamsCheckout, dry_run: bool) -> Result<(), CycleError> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.service.cycle_timeout);
        let ctx = CancelToken::with_deadline(deadline);

        let data = self.load_and_validate(checkout.root())?;

        let data = self
            .maintain_teams_repository(checkout, data, dry_run)
            .map_err(CycleError::Other)?;

        self.remote.load().map_err(CycleError::RemoteFetch)?;

        run_sync(
            &ctx,
            data.config(),
            data.organization(),
            &self.remote,
            self.client.clone(),
            dry_run,
        )
        .map_err(|err| {
            if ctx.is_cancelled() {
                CycleError::Timeout
            } else {
                CycleError::Executor(err)
            }
        })?;

        if !dry_run && checkout.head().is_ok() {
            checkout.move_tag(APPLIED_TAG).map_err(CycleError::Other)?;
        }

        info!("cycle finished in {:.1?}", started.elapsed());
        Ok(())
    }

    fn load_and_validate(&self, root: &Path) -> Result<Data, CycleError> {
        let (data, load_warnings) = Data::load(root).map_err(CycleError::Validation)?;
        let warnings = validate(&data).map_err(CycleError::Validation)?;
        for warning in load_warnings.iter().chain(warnings.iter()) {
            warn!("{warning}");
        }
        Ok(data)
    }

    /// The self-maintenance half of a cycle: regenerate CODEOWNERS and run
    /// the user-sync plugin, committing whatever changed. Returns the data
    /// to reconcile with, reloaded when user sync rewrote documents.
    fn maintain_teams_repository(
        &self,
        checkout: &TeamsCheckout,
        data: Data,
        dry_run: bool,
    ) -> anyhow::Result<Data> {
        let codeowners_changed =
            update_codeowners_file(checkout.root(), &data, &self.service.org)?;
        if codeowners_changed {
            info!(".github/CODEOWNERS regenerated");
            if !dry_run {
                let path = checkout.root().join(".github/CODEOWNERS");
                checkout.commit_and_push([path.as_path()].into_iter(), "update CODEOWNERS")?;
            }
        }

        let plugin = plugin_by_name(&data.config().usersync.plugin, &self.remote)?;
        let changes = sync_users(checkout.root(), data.config(), plugin.as_ref())?;
        if changes.is_empty() {
            return Ok(data);
        }

        info!("some users and/or teams must be committed");
        if !dry_run {
            checkout.commit_and_push(changes.paths(), "update teams and users")?;
        }
        // the documents changed under us, reload before diffing
        self.load_and_validate(checkout.root())
            .map_err(|err| anyhow::anyhow!("{err}"))
            .context("reloading after user sync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flight_coalesces_to_one_queued_run() {
        let flight = SingleFlight::default();
        assert!(flight.begin());
        // two triggers arrive while the cycle runs, only one stays queued
        assert!(!flight.begin());
        assert!(!flight.begin());
        assert!(flight.finish());
        assert!(flight.begin());
        assert!(!flight.finish());
        assert!(flight.begin());
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(CycleError::Validation(anyhow::anyhow!("x")).exit_code(), 2);
        assert_eq!(CycleError::RemoteFetch(anyhow::anyhow!("x")).exit_code(), 3);
        assert_eq!(CycleError::Timeout.exit_code(), 4);
        assert_eq!(CycleError::Executor(anyhow::anyhow!("x")).exit_code(), 5);
    }
}
