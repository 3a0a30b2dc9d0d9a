use crate::github::api::{
    GithubRuleSet, GithubTeam, GithubTeamRepo, GraphPageInfo, HttpClient, Login, MAX_PAGES,
    RepoPermission,
};
use anyhow::Context;
use log::warn;
use orgwarden_data::v1;
use reqwest::Method;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Raw repository attributes as reported by the forge, before the direct
/// collaborators are folded in.
#[derive(Debug, Clone)]
pub struct RepoNode {
    pub name: String,
    pub ref_id: String,
    pub visibility: v1::Visibility,
    pub archived: bool,
}

/// Read-only queries against the forge. The production implementation
/// talks to the REST and GraphQL APIs; tests substitute an in-memory one.
pub trait GithubRead {
    /// Capability probe: SAML identities and organization rulesets only
    /// exist on the enterprise plan.
    fn is_enterprise(&self) -> anyhow::Result<bool>;

    /// Logins of every organization member.
    fn org_members(&self) -> anyhow::Result<Vec<String>>;

    /// Every team of the organization, with member logins.
    fn teams(&self) -> anyhow::Result<Vec<GithubTeam>>;

    /// Repositories a team was granted access to, with the permission.
    fn team_repos(&self, team_slug: &str) -> anyhow::Result<Vec<GithubTeamRepo>>;

    /// Every repository of the organization.
    fn repos(&self) -> anyhow::Result<Vec<RepoNode>>;

    /// Direct outside collaborators of a repository.
    fn repo_external_users(&self, repo: &str) -> anyhow::Result<HashMap<String, RepoPermission>>;

    /// Organization rulesets in normalized form.
    fn rulesets(&self) -> anyhow::Result<Vec<GithubRuleSet>>;

    /// App slug -> installation id for the apps installed on the org.
    fn app_installations(&self) -> anyhow::Result<HashMap<String, u64>>;

    /// SAML identity provider mappings: identity name id -> login.
    fn saml_identities(&self) -> anyhow::Result<HashMap<String, String>>;
}

pub struct GitHubApiRead {
    client: HttpClient,
}

impl GitHubApiRead {
    pub fn from_client(client: HttpClient) -> Self {
        Self { client }
    }

    /// Follow-up query for teams with more members than a single nested
    /// page carries.
    fn remaining_team_members(
        &self,
        slug: &str,
        mut page_info: GraphPageInfo,
    ) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Wrapper {
            organization: OrgResponse,
        }
        #[derive(Deserialize)]
        struct OrgResponse {
            team: Option<TeamResponse>,
        }
        #[derive(Deserialize)]
        struct TeamResponse {
            members: MembersResponse,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MembersResponse {
            page_info: GraphPageInfo,
            nodes: Vec<Option<Login>>,
        }
        #[derive(serde::Serialize)]
        struct Params<'a> {
            org: &'a str,
            team: &'a str,
            cursor: Option<&'a str>,
        }
        static QUERY: &str = "
            query teamMembers($org: String!, $team: String!, $cursor: String) {
                organization(login: $org) {
                    team(slug: $team) {
                        members(first: 100, after: $cursor) {
                            pageInfo {
                                endCursor
                                hasNextPage
                            }
                            nodes {
                                login
                            }
                        }
                    }
                }
            }
        ";

        let mut members = Vec::new();
        let mut pages = 0;
        while page_info.has_next_page {
            if pages >= MAX_PAGES {
                warn!("giving up paginating members of team '{slug}' after {MAX_PAGES} pages");
                break;
            }
            pages += 1;
            let res: Wrapper = self.client.graphql(
                QUERY,
                Params {
                    org: self.client.org(),
                    team: slug,
                    cursor: page_info.end_cursor.as_deref(),
                },
            )?;
            let Some(team) = res.organization.team else {
                break;
            };
            page_info = team.members.page_info;
            members.extend(team.members.nodes.into_iter().flatten().map(|l| l.login));
        }
        Ok(members)
    }
}

impl GithubRead for GitHubApiRead {
    fn is_enterprise(&self) -> anyhow::Result<bool> {
        #[derive(Deserialize)]
        struct Org {
            plan: Option<Plan>,
        }
        #[derive(Deserialize)]
        struct Plan {
            name: String,
        }
        let org: Option<Org> = self
            .client
            .send_option(Method::GET, &format!("orgs/{}", self.client.org()))?;
        Ok(org
            .and_then(|o| o.plan)
            .map(|p| p.name == "enterprise")
            .unwrap_or(false))
    }

    fn org_members(&self) -> anyhow::Result<Vec<String>> {
        let mut members = Vec::new();
        self.client.rest_paginated(
            &Method::GET,
            &format!("orgs/{}/members", self.client.org()),
            |resp: Vec<Login>| {
                members.extend(resp.into_iter().map(|l| l.login));
                Ok(())
            },
        )?;
        Ok(members)
    }

    fn teams(&self) -> anyhow::Result<Vec<GithubTeam>> {
        #[derive(Deserialize)]
        struct Wrapper {
            organization: OrgResponse,
        }
        #[derive(Deserialize)]
        struct OrgResponse {
            teams: TeamsResponse,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TeamsResponse {
            page_info: GraphPageInfo,
            nodes: Vec<Option<TeamNode>>,
        }
        #[derive(Deserialize)]
        struct TeamNode {
            name: String,
            slug: String,
            members: MembersResponse,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MembersResponse {
            page_info: GraphPageInfo,
            nodes: Vec<Option<Login>>,
        }
        #[derive(serde::Serialize)]
        struct Params<'a> {
            org: &'a str,
            cursor: Option<&'a str>,
        }
        static QUERY: &str = "
            query orgTeams($org: String!, $cursor: String) {
                organization(login: $org) {
                    teams(first: 100, after: $cursor) {
                        pageInfo {
                            endCursor
                            hasNextPage
                        }
                        nodes {
                            name
                            slug
                            members(first: 100) {
                                pageInfo {
                                    endCursor
                                    hasNextPage
                                }
                                nodes {
                                    login
                                }
                            }
                        }
                    }
                }
            }
        ";

        let mut teams = Vec::new();
        let mut page_info = GraphPageInfo::start();
        let mut pages = 0;
        while page_info.has_next_page {
            if pages >= MAX_PAGES {
                warn!("giving up paginating the organization teams after {MAX_PAGES} pages");
                break;
            }
            pages += 1;
            let res: Wrapper = self.client.graphql(
                QUERY,
                Params {
                    org: self.client.org(),
                    cursor: page_info.end_cursor.as_deref(),
                },
            )?;
            page_info = res.organization.teams.page_info;
            for node in res.organization.teams.nodes.into_iter().flatten() {
                let mut members: Vec<String> = node
                    .members
                    .nodes
                    .into_iter()
                    .flatten()
                    .map(|l| l.login)
                    .collect();
                if node.members.page_info.has_next_page {
                    members.extend(
                        self.remaining_team_members(&node.slug, node.members.page_info)?,
                    );
                }
                teams.push(GithubTeam {
                    name: node.name,
                    slug: node.slug,
                    members,
                });
            }
        }
        Ok(teams)
    }

    fn team_repos(&self, team_slug: &str) -> anyhow::Result<Vec<GithubTeamRepo>> {
        let mut repos = Vec::new();
        self.client.rest_paginated(
            &Method::GET,
            &format!("orgs/{}/teams/{team_slug}/repos", self.client.org()),
            |resp: Vec<GithubTeamRepo>| {
                repos.extend(resp);
                Ok(())
            },
        )?;
        Ok(repos)
    }

    fn repos(&self) -> anyhow::Result<Vec<RepoNode>> {
        #[derive(Deserialize)]
        struct Wrapper {
            organization: OrgResponse,
        }
        #[derive(Deserialize)]
        struct OrgResponse {
            repositories: ReposResponse,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ReposResponse {
            page_info: GraphPageInfo,
            nodes: Vec<Option<RepoResponse>>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RepoResponse {
            id: String,
            name: String,
            visibility: v1::Visibility,
            is_archived: bool,
        }
        #[derive(serde::Serialize)]
        struct Params<'a> {
            org: &'a str,
            cursor: Option<&'a str>,
        }
        static QUERY: &str = "
            query orgRepositories($org: String!, $cursor: String) {
                organization(login: $org) {
                    repositories(first: 100, after: $cursor) {
                        pageInfo {
                            endCursor
                            hasNextPage
                        }
                        nodes {
                            id
                            name
                            visibility
                            isArchived
                        }
                    }
                }
            }
        ";

        let mut repos = Vec::new();
        let mut page_info = GraphPageInfo::start();
        let mut pages = 0;
        while page_info.has_next_page {
            if pages >= MAX_PAGES {
                warn!("giving up paginating the organization repositories after {MAX_PAGES} pages");
                break;
            }
            pages += 1;
            let res: Wrapper = self.client.graphql(
                QUERY,
                Params {
                    org: self.client.org(),
                    cursor: page_info.end_cursor.as_deref(),
                },
            )?;
            page_info = res.organization.repositories.page_info;
            repos.extend(
                res.organization
                    .repositories
                    .nodes
                    .into_iter()
                    .flatten()
                    .map(|node| RepoNode {
                        name: node.name,
                        ref_id: node.id,
                        visibility: node.visibility,
                        archived: node.is_archived,
                    }),
            );
        }
        Ok(repos)
    }

    fn repo_external_users(&self, repo: &str) -> anyhow::Result<HashMap<String, RepoPermission>> {
        #[derive(Deserialize)]
        struct Collaborator {
            login: String,
            role_name: RepoPermission,
        }
        let mut users = HashMap::new();
        self.client.rest_paginated(
            &Method::GET,
            &format!(
                "repos/{}/{repo}/collaborators?affiliation=outside",
                self.client.org()
            ),
            |resp: Vec<Collaborator>| {
                users.extend(resp.into_iter().map(|c| (c.login, c.role_name)));
                Ok(())
            },
        )?;
        Ok(users)
    }

    fn rulesets(&self) -> anyhow::Result<Vec<GithubRuleSet>> {
        #[derive(Deserialize)]
        struct RulesetSummary {
            id: u64,
        }
        let mut summaries = Vec::new();
        self.client.rest_paginated(
            &Method::GET,
            &format!("orgs/{}/rulesets", self.client.org()),
            |resp: Vec<RulesetSummary>| {
                summaries.extend(resp);
                Ok(())
            },
        )?;

        // Bypass actors come back as installation ids; resolve them to app
        // slugs so the desired and observed forms compare.
        let apps: HashMap<u64, String> = self
            .app_installations()?
            .into_iter()
            .map(|(slug, id)| (id, slug))
            .collect();

        let mut rulesets = Vec::new();
        for summary in summaries {
            let detail: RulesetDetail = self
                .client
                .send_option(
                    Method::GET,
                    &format!("orgs/{}/rulesets/{}", self.client.org(), summary.id),
                )?
                .with_context(|| format!("ruleset {} disappeared while loading", summary.id))?;
            rulesets.push(detail.into_ruleset(&apps));
        }
        Ok(rulesets)
    }

    fn app_installations(&self) -> anyhow::Result<HashMap<String, u64>> {
        #[derive(Deserialize)]
        struct InstallationPage {
            installations: Vec<Installation>,
        }
        #[derive(Deserialize)]
        struct Installation {
            id: u64,
            app_slug: String,
        }
        let mut apps = HashMap::new();
        self.client.rest_paginated(
            &Method::GET,
            &format!("orgs/{}/installations", self.client.org()),
            |resp: InstallationPage| {
                apps.extend(resp.installations.into_iter().map(|i| (i.app_slug, i.id)));
                Ok(())
            },
        )?;
        Ok(apps)
    }

    fn saml_identities(&self) -> anyhow::Result<HashMap<String, String>> {
        #[derive(Deserialize)]
        struct Wrapper {
            organization: OrgResponse,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct OrgResponse {
            saml_identity_provider: Option<Provider>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Provider {
            external_identities: Identities,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Identities {
            page_info: GraphPageInfo,
            edges: Vec<Edge>,
        }
        #[derive(Deserialize)]
        struct Edge {
            node: IdentityNode,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct IdentityNode {
            saml_identity: Option<SamlIdentity>,
            user: Option<Login>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SamlIdentity {
            name_id: String,
        }
        #[derive(serde::Serialize)]
        struct Params<'a> {
            org: &'a str,
            cursor: Option<&'a str>,
        }
        static QUERY: &str = "
            query samlIdentities($org: String!, $cursor: String) {
                organization(login: $org) {
                    samlIdentityProvider {
                        externalIdentities(first: 100, after: $cursor) {
                            pageInfo {
                                endCursor
                                hasNextPage
                            }
                            edges {
                                node {
                                    samlIdentity {
                                        nameId
                                    }
                                    user {
                                        login
                                    }
                                }
                            }
                        }
                    }
                }
            }
        ";

        let mut identities = HashMap::new();
        let mut page_info = GraphPageInfo::start();
        let mut pages = 0;
        while page_info.has_next_page {
            if pages >= MAX_PAGES {
                warn!("giving up paginating SAML identities after {MAX_PAGES} pages");
                break;
            }
            pages += 1;
            let res: Wrapper = self.client.graphql(
                QUERY,
                Params {
                    org: self.client.org(),
                    cursor: page_info.end_cursor.as_deref(),
                },
            )?;
            let Some(provider) = res.organization.saml_identity_provider else {
                break;
            };
            page_info = provider.external_identities.page_info;
            for edge in provider.external_identities.edges {
                if let (Some(identity), Some(user)) = (edge.node.saml_identity, edge.node.user) {
                    identities.insert(identity.name_id, user.login);
                }
            }
        }
        Ok(identities)
    }
}

/// Wire format of a ruleset as the REST API reports it.
#[derive(Deserialize)]
struct RulesetDetail {
    id: u64,
    name: String,
    enforcement: v1::Enforcement,
    #[serde(default)]
    bypass_actors: Vec<BypassActor>,
    #[serde(default)]
    conditions: Conditions,
    #[serde(default)]
    rules: Vec<WireRule>,
}

#[derive(Deserialize)]
struct BypassActor {
    #[serde(default)]
    actor_id: Option<u64>,
    bypass_mode: v1::BypassMode,
}

#[derive(Deserialize, Default)]
struct Conditions {
    #[serde(default)]
    ref_name: Patterns,
    #[serde(default)]
    repository_name: Patterns,
}

#[derive(Deserialize, Default)]
struct Patterns {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Deserialize)]
struct WireRule {
    #[serde(rename = "type")]
    rule_type: String,
    #[serde(default)]
    parameters: WireRuleParameters,
}

#[derive(Deserialize, Default)]
struct WireRuleParameters {
    #[serde(default)]
    required_approving_review_count: u32,
    #[serde(default)]
    dismiss_stale_reviews_on_push: bool,
    #[serde(default)]
    require_code_owner_review: bool,
    #[serde(default)]
    required_status_checks: Vec<StatusCheck>,
    #[serde(default)]
    strict_required_status_checks_policy: bool,
}

#[derive(Deserialize)]
struct StatusCheck {
    context: String,
}

impl RulesetDetail {
    fn into_ruleset(self, apps: &HashMap<u64, String>) -> GithubRuleSet {
        let mut include = self.conditions.ref_name.include;
        let mut exclude = self.conditions.ref_name.exclude;
        include.sort();
        exclude.sort();
        let mut bypass_apps = BTreeMap::new();
        for actor in self.bypass_actors {
            if let Some(slug) = actor.actor_id.and_then(|id| apps.get(&id)) {
                bypass_apps.insert(slug.clone(), actor.bypass_mode);
            }
        }
        let mut rules = BTreeMap::new();
        for rule in self.rules {
            let mut checks: Vec<String> = rule
                .parameters
                .required_status_checks
                .into_iter()
                .map(|c| c.context)
                .collect();
            checks.sort();
            rules.insert(
                rule.rule_type,
                v1::RuleParameters {
                    required_approving_review_count: rule.parameters.required_approving_review_count,
                    dismiss_stale_reviews_on_push: rule.parameters.dismiss_stale_reviews_on_push,
                    require_code_owner_review: rule.parameters.require_code_owner_review,
                    required_status_checks: checks,
                    strict_required_status_checks_policy: rule
                        .parameters
                        .strict_required_status_checks_policy,
                },
            );
        }
        GithubRuleSet {
            id: Some(self.id),
            name: self.name,
            enforcement: self.enforcement,
            bypass_apps,
            include,
            exclude,
            rules,
            repositories: self.conditions.repository_name.include,
        }
    }
}
