mod read;
mod write;

use crate::utils::ForgeResponse;
use anyhow::{Context, bail};
use hyper_old_types::header::{Link, RelationType};
use log::{trace, warn};
use orgwarden_data::v1;
use reqwest::header::HeaderMap;
use reqwest::{
    Method, StatusCode,
    blocking::{Client, RequestBuilder, Response},
    header::{self, HeaderValue},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use read::{GitHubApiRead, GithubRead, RepoNode};
pub use write::GitHubWrite;

/// Hard stop for cursor pagination, protecting against malformed cursors
/// sending a query in circles. Hitting it is reported as a warning and the
/// pages fetched so far are kept.
const MAX_PAGES: usize = 100;

/// Transport failures are retried this many times before giving up.
const MAX_TRANSPORT_RETRIES: u32 = 3;

/// Rate-limited responses have their own, larger budget: the forge tells
/// us when to come back, so waiting it out is almost always the right call.
const MAX_RATE_LIMIT_WAITS: u32 = 10;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    api_base: String,
    org: String,
    token: SecretString,
}

impl HttpClient {
    pub fn new(api_base: &str, org: &str, token: SecretString) -> anyhow::Result<Self> {
        let mut map = HeaderMap::default();
        map.insert(
            header::USER_AGENT,
            HeaderValue::from_static(crate::USER_AGENT),
        );
        let client = reqwest::blocking::ClientBuilder::default()
            .default_headers(map)
            .build()?;

        Ok(HttpClient {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            org: org.to_string(),
            token,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    fn auth_header(&self) -> anyhow::Result<HeaderValue> {
        let mut auth = HeaderValue::from_str(&format!("token {}", self.token.expose_secret()))?;
        auth.set_sensitive(true);
        Ok(auth)
    }

    fn req(&self, method: Method, url: &str) -> anyhow::Result<RequestBuilder> {
        let url = if url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.api_base, url)
        };
        trace!("http request: {method} {url}");
        Ok(self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, self.auth_header()?))
    }

    /// Sends the request, waiting out rate limits and retrying transient
    /// transport failures.
    fn execute(&self, req: RequestBuilder) -> anyhow::Result<Response> {
        let mut transport_retries = 0;
        let mut rate_limit_waits = 0;
        loop {
            let attempt = req
                .try_clone()
                .context("request is not replayable, cannot retry")?;
            match attempt.send() {
                Ok(resp) if is_rate_limited(&resp) => {
                    if rate_limit_waits >= MAX_RATE_LIMIT_WAITS {
                        // hand the 429 back; the caller labels it with
                        // the operation it was performing
                        return Ok(resp);
                    }
                    let wait = retry_after(&resp, rate_limit_waits);
                    warn!("rate limited by the forge, waiting {wait:?} before retrying");
                    std::thread::sleep(wait);
                    rate_limit_waits += 1;
                }
                Ok(resp) => return Ok(resp),
                Err(err) if transport_retries < MAX_TRANSPORT_RETRIES => {
                    warn!("transport error ({err}), retrying");
                    std::thread::sleep(backoff(transport_retries));
                    transport_retries += 1;
                }
                Err(err) => return Err(err).context("failed to send request"),
            }
        }
    }

    fn send<T: serde::Serialize + fmt::Debug>(
        &self,
        method: Method,
        url: &str,
        body: &T,
    ) -> anyhow::Result<Response> {
        let operation = format!("{method} {url}");
        let resp = self.execute(self.req(method, url)?.json(body))?;
        resp.forge_error_for_status(&operation)
    }

    fn send_option<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
    ) -> anyhow::Result<Option<T>> {
        let operation = format!("{method} {url}");
        let resp = self.execute(self.req(method, url)?)?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.forge_json(&operation)?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(resp.forge_error_for_status(&operation).unwrap_err()),
        }
    }

    pub(crate) fn graphql<R, V>(&self, query: &str, variables: V) -> anyhow::Result<R>
    where
        R: DeserializeOwned,
        V: serde::Serialize,
    {
        #[derive(serde::Serialize)]
        struct Request<'a, V> {
            query: &'a str,
            variables: V,
        }
        let operation = graphql_operation(query);
        let resp = self
            .execute(
                self.req(Method::POST, "graphql")?
                    .json(&Request { query, variables }),
            )
            .with_context(|| format!("failed to send {operation}"))?
            .forge_error_for_status(&operation)?;

        let res: GraphResult<R> = resp.forge_json(&operation)?;
        if let Some(error) = res.errors.first() {
            bail!("{operation} failed: {}", error.message);
        }
        match res.data {
            Some(data) => Ok(data),
            None => bail!("{operation} returned no data"),
        }
    }

    fn rest_paginated<F, T>(&self, method: &Method, url: &str, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(T) -> anyhow::Result<()>,
        T: DeserializeOwned,
    {
        let mut next = Some(url.to_string());
        let mut pages = 0;
        while let Some(next_url) = next.take() {
            if pages >= MAX_PAGES {
                warn!("giving up paginating {url} after {MAX_PAGES} pages");
                break;
            }
            pages += 1;

            let operation = format!("{method} {next_url}");
            let resp = self
                .execute(self.req(method.clone(), &next_url)?)
                .with_context(|| format!("failed to send {operation}"))?
                .forge_error_for_status(&operation)?;

            // Extract the next page
            if let Some(links) = resp.headers().get(header::LINK) {
                let links: Link = links.to_str()?.parse()?;
                for link in links.values() {
                    if link
                        .rel()
                        .map(|r| r.iter().any(|r| *r == RelationType::Next))
                        .unwrap_or(false)
                    {
                        next = Some(link.link().to_string());
                        break;
                    }
                }
            }

            f(resp.forge_json(&operation)?)?;
        }
        Ok(())
    }
}

/// Label of a GraphQL document for error messages: the operation kind and
/// its name, e.g. `graphql query orgTeams`.
fn graphql_operation(query: &str) -> String {
    let mut words = query.split_whitespace();
    let first = words.next().unwrap_or("query");
    let kind = first.split('(').next().filter(|k| !k.is_empty()).unwrap_or("query");
    if first.contains('(') {
        return format!("graphql {kind}");
    }
    match words
        .next()
        .and_then(|word| word.split('(').next())
        .filter(|name| !name.is_empty())
    {
        Some(name) => format!("graphql {kind} {name}"),
        None => format!("graphql {kind}"),
    }
}

fn is_rate_limited(resp: &Response) -> bool {
    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    resp.status() == StatusCode::FORBIDDEN
        && resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false)
}

fn retry_after(resp: &Response, attempt: u32) -> Duration {
    resp.headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| backoff(attempt))
}

fn backoff(attempt: u32) -> Duration {
    MAX_BACKOFF.min(Duration::from_secs(1u64 << attempt.min(6)))
}

fn allow_not_found(resp: Response, method: Method, url: &str) -> anyhow::Result<()> {
    match resp.status() {
        StatusCode::NOT_FOUND => {
            log::debug!("Response from {method} {url} returned 404 which is treated as success");
        }
        _ => {
            resp.forge_error_for_status(&format!("{method} {url}"))?;
        }
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct GraphResult<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphError>,
}

#[derive(Debug, serde::Deserialize)]
struct GraphError {
    message: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphPageInfo {
    end_cursor: Option<String>,
    has_next_page: bool,
}

impl GraphPageInfo {
    fn start() -> Self {
        GraphPageInfo {
            end_cursor: None,
            has_next_page: true,
        }
    }
}

/// An object with a `login` field
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Login {
    pub(crate) login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubTeam {
    pub name: String,
    /// The slug usually matches the name but can differ: the forge slugs
    /// display names its own way, so trust what it reports.
    pub slug: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GithubRepository {
    pub name: String,
    /// GraphQL node id, needed by a few mutations that have no REST route.
    pub ref_id: String,
    pub visibility: v1::Visibility,
    pub archived: bool,
    /// Direct outside collaborators: login -> granted permission.
    pub external_users: HashMap<String, RepoPermission>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubTeamRepo {
    pub name: String,
    #[serde(rename = "role_name")]
    pub permission: RepoPermission,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RepoPermission {
    // The UI says 'read'/'write', the REST API still speaks 'pull'/'push'.
    // The in-between roles the forge also knows are folded onto the
    // nearest of the three the model reconciles.
    #[serde(
        rename(serialize = "pull"),
        alias = "pull",
        alias = "READ",
        alias = "read",
        alias = "triage"
    )]
    Read,
    #[serde(
        rename(serialize = "push"),
        alias = "push",
        alias = "WRITE",
        alias = "write",
        alias = "maintain"
    )]
    Write,
    #[serde(rename(serialize = "admin"), alias = "admin", alias = "ADMIN")]
    Admin,
}

impl fmt::Display for RepoPermission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Read => write!(f, "READ"),
            Self::Write => write!(f, "WRITE"),
            Self::Admin => write!(f, "ADMIN"),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Eq, PartialEq, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Member,
    Maintainer,
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TeamRole::Member => write!(f, "member"),
            TeamRole::Maintainer => write!(f, "maintainer"),
        }
    }
}

/// The normalized form of an organization ruleset, shared between the
/// desired state (built from the local documents plus the configuration
/// pattern) and the observed state (parsed from the forge). Everything but
/// `id` takes part in the equality check driving the update decision.
#[derive(Debug, Clone, PartialEq)]
pub struct GithubRuleSet {
    pub id: Option<u64>,
    pub name: String,
    pub enforcement: v1::Enforcement,
    /// App slug -> bypass mode, normalized into a sorted map.
    pub bypass_apps: BTreeMap<String, v1::BypassMode>,
    /// Branch patterns the ruleset applies to.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Rule type -> parameters, normalized into a sorted map.
    pub rules: BTreeMap<String, v1::RuleParameters>,
    /// Repository name patterns, from the top-level configuration.
    pub repositories: Vec<String>,
}

impl GithubRuleSet {
    /// Builds the desired ruleset from a local document and the repository
    /// pattern the configuration binds it to.
    pub fn from_local(ruleset: &v1::Ruleset, repository_pattern: &str) -> Self {
        let mut include = ruleset.spec.conditions.include.clone();
        let mut exclude = ruleset.spec.conditions.exclude.clone();
        include.sort();
        exclude.sort();
        GithubRuleSet {
            id: None,
            name: ruleset.name.clone(),
            enforcement: ruleset.spec.enforcement,
            bypass_apps: ruleset
                .spec
                .bypass_apps
                .iter()
                .map(|app| (app.app_name.clone(), app.mode))
                .collect(),
            include,
            exclude,
            rules: ruleset
                .spec
                .rules
                .iter()
                .map(|rule| (rule.rule_type.clone(), rule.parameters.clone()))
                .collect(),
            repositories: vec![repository_pattern.to_string()],
        }
    }

    /// Whether the two rulesets describe a different configuration,
    /// ignoring the forge-assigned id.
    pub fn differs(&self, other: &GithubRuleSet) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.id = None;
        right.id = None;
        left != right
    }
}

#[cfg(test)]
mod tests {
    use super::graphql_operation;

    #[test]
    fn graphql_operations_are_labeled_by_name() {
        assert_eq!(
            graphql_operation("query orgTeams($org: String!) { organization { id } }"),
            "graphql query orgTeams"
        );
        assert_eq!(
            graphql_operation("\n            query samlIdentities($org: String!) {}"),
            "graphql query samlIdentities"
        );
        assert_eq!(graphql_operation("query($org: String!) {}"), "graphql query");
        assert_eq!(graphql_operation(""), "graphql query");
    }
}
