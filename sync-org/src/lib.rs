pub mod github;
mod utils;

use crate::github::api::{GitHubApiRead, GitHubWrite, HttpClient};
use crate::github::{GithubRemote, Reconciler};
use anyhow::Context;
use log::warn;
use orgwarden_data::v1;
use secrecy::SecretString;

pub use crate::utils::CancelToken;

const USER_AGENT: &str = "orgwarden organization reconciler";

/// One reconciliation pass against the live forge: load (or reuse) the
/// remote snapshot, diff it against the desired state and stream the
/// resulting mutations to the forge executor.
pub fn run_sync(
    ctx: &CancelToken,
    config: &v1::RepositoryConfig,
    local: &v1::Organization,
    remote: &GithubRemote,
    client: HttpClient,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        warn!("running in dry mode, no changes will be applied");
    }

    let snapshot = remote.load().context("failed to load the remote organization state")?;
    let executor = GitHubWrite::new(client, snapshot.app_ids.clone());
    Reconciler::new(config).reconcile(ctx, local, &snapshot, dry_run, &executor)
}

/// Builds the HTTP client and the remote cache from the forge credentials.
pub fn remote_from_token(
    api_base: &str,
    org: &str,
    token: SecretString,
    cache_ttl: std::time::Duration,
) -> anyhow::Result<(HttpClient, GithubRemote)> {
    let client = HttpClient::new(api_base, org, token)?;
    let read = GitHubApiRead::from_client(client.clone());
    Ok((client, GithubRemote::new(Box::new(read), cache_ttl)))
}
