pub mod api;
mod remote;
#[cfg(test)]
mod tests;

use crate::utils::CancelToken;
use anyhow::bail;
use api::{GithubRuleSet, RepoPermission, TeamRole};
use log::{debug, info, warn};
use orgwarden_data::v1::{self, EVERYONE_TEAM, OWNERS_SUFFIX, slugify};
use std::collections::{BTreeMap, BTreeSet};

pub use remote::{GithubRemote, RemoteSnapshot};

static DEFAULT_TEAM_DESCRIPTION: &str = "Managed by the orgwarden teams repository.";

/// Consumer of the mutation stream produced by a reconciliation. The two
/// canonical implementations are the forge executor ([`api::GitHubWrite`])
/// and the recorder used by the test suite. The `dry_run` flag is honored
/// by the executor, never by the reconciler.
pub trait ReconcileListener {
    fn begin(&self, dry_run: bool) -> anyhow::Result<()>;

    fn add_user_to_org(&self, dry_run: bool, github_id: &str) -> anyhow::Result<()>;
    fn remove_user_from_org(&self, dry_run: bool, github_id: &str) -> anyhow::Result<()>;

    fn create_team(
        &self,
        dry_run: bool,
        slug: &str,
        description: &str,
        members: &[String],
    ) -> anyhow::Result<()>;
    fn update_team_add_member(
        &self,
        dry_run: bool,
        team_slug: &str,
        github_id: &str,
        role: TeamRole,
    ) -> anyhow::Result<()>;
    fn update_team_remove_member(
        &self,
        dry_run: bool,
        team_slug: &str,
        github_id: &str,
    ) -> anyhow::Result<()>;
    fn delete_team(&self, dry_run: bool, team_slug: &str) -> anyhow::Result<()>;

    fn create_repository(
        &self,
        dry_run: bool,
        repo: &str,
        description: &str,
        writers: &[String],
        readers: &[String],
        public: bool,
    ) -> anyhow::Result<()>;
    fn update_repository_add_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()>;
    /// Idempotent in-place permission rewrite. Kept for parity with the
    /// forge API; the diff models permission changes as remove plus add
    /// and never emits this.
    fn update_repository_update_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()>;
    fn update_repository_remove_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
    ) -> anyhow::Result<()>;
    fn update_repository_update_private(
        &self,
        dry_run: bool,
        repo: &str,
        private: bool,
    ) -> anyhow::Result<()>;
    fn update_repository_update_archived(
        &self,
        dry_run: bool,
        repo: &str,
        archived: bool,
    ) -> anyhow::Result<()>;
    fn update_repository_set_external_user(
        &self,
        dry_run: bool,
        repo: &str,
        github_id: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()>;
    fn update_repository_remove_external_user(
        &self,
        dry_run: bool,
        repo: &str,
        github_id: &str,
    ) -> anyhow::Result<()>;
    fn delete_repository(&self, dry_run: bool, repo: &str) -> anyhow::Result<()>;

    fn add_ruleset(&self, dry_run: bool, ruleset: &GithubRuleSet) -> anyhow::Result<()>;
    fn update_ruleset(&self, dry_run: bool, ruleset: &GithubRuleSet) -> anyhow::Result<()>;
    fn delete_ruleset(&self, dry_run: bool, id: u64) -> anyhow::Result<()>;

    fn commit(&self, dry_run: bool) -> anyhow::Result<()>;
    fn rollback(&self, dry_run: bool, err: &anyhow::Error);
}

/// One entry of a reconciliation plan.
#[derive(Debug)]
pub(crate) enum Mutation {
    AddUserToOrg {
        github_id: String,
    },
    RemoveUserFromOrg {
        github_id: String,
    },
    CreateTeam {
        slug: String,
        description: String,
        members: Vec<String>,
    },
    UpdateTeamAddMember {
        team_slug: String,
        github_id: String,
        role: TeamRole,
    },
    UpdateTeamRemoveMember {
        team_slug: String,
        github_id: String,
    },
    DeleteTeam {
        team_slug: String,
    },
    CreateRepository {
        repo: String,
        description: String,
        writers: Vec<String>,
        readers: Vec<String>,
        public: bool,
    },
    UpdateRepositoryAddTeamAccess {
        repo: String,
        team_slug: String,
        permission: RepoPermission,
    },
    UpdateRepositoryRemoveTeamAccess {
        repo: String,
        team_slug: String,
    },
    UpdateRepositoryUpdatePrivate {
        repo: String,
        private: bool,
    },
    UpdateRepositoryUpdateArchived {
        repo: String,
        archived: bool,
    },
    UpdateRepositorySetExternalUser {
        repo: String,
        github_id: String,
        permission: RepoPermission,
    },
    UpdateRepositoryRemoveExternalUser {
        repo: String,
        github_id: String,
    },
    DeleteRepository {
        repo: String,
    },
    AddRuleset {
        ruleset: GithubRuleSet,
    },
    UpdateRuleset {
        ruleset: GithubRuleSet,
    },
    DeleteRuleset {
        id: u64,
    },
}

/// The diff engine. Compares the desired organization against a remote
/// snapshot and streams the mutations closing the gap, in a fixed phase
/// order: users, teams, repositories, rulesets.
pub struct Reconciler<'a> {
    config: &'a v1::RepositoryConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a v1::RepositoryConfig) -> Self {
        Reconciler { config }
    }

    /// Computes the plan and delivers it to the listener, framed by
    /// `begin`/`commit`. A listener failure or a cancellation stops the
    /// stream and triggers `rollback`; nothing reaches the listener when
    /// the plan exceeds the changeset cap.
    pub fn reconcile(
        &self,
        ctx: &CancelToken,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
        dry_run: bool,
        listener: &dyn ReconcileListener,
    ) -> anyhow::Result<()> {
        let plan = self.plan(ctx, local, remote)?;
        if plan.len() > self.config.max_changesets {
            bail!(
                "the plan contains {} changes, more than the configured max_changesets of {}; \
                 refusing to apply any of them",
                plan.len(),
                self.config.max_changesets
            );
        }
        debug!("applying a plan of {} changes", plan.len());

        listener.begin(dry_run)?;
        for mutation in &plan {
            let result = ctx
                .ensure_active()
                .and_then(|()| dispatch(mutation, dry_run, listener));
            if let Err(err) = result {
                listener.rollback(dry_run, &err);
                return Err(err);
            }
        }
        listener.commit(dry_run)?;
        Ok(())
    }

    /// Pure diff: no I/O, no listener. Ordering inside the plan is part of
    /// the contract: phases run in sequence and deletions trail the
    /// creations and updates of their phase.
    pub(crate) fn plan(
        &self,
        ctx: &CancelToken,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
    ) -> anyhow::Result<Vec<Mutation>> {
        let mut plan = Vec::new();
        self.plan_users(local, remote, &mut plan);
        ctx.ensure_active()?;
        self.plan_teams(local, remote, &mut plan);
        ctx.ensure_active()?;
        self.plan_repositories(local, remote, &mut plan);
        ctx.ensure_active()?;
        if remote.enterprise {
            self.plan_rulesets(local, remote, &mut plan);
        } else if !self.config.rulesets.is_empty() {
            warn!("rulesets are configured but the organization has no enterprise plan, skipping");
        }
        Ok(plan)
    }

    fn plan_users(
        &self,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
        plan: &mut Vec<Mutation>,
    ) {
        let desired: BTreeSet<&str> = local
            .users
            .values()
            .map(|u| u.spec.github_id.as_str())
            .collect();

        for github_id in &desired {
            if !remote.users.contains_key(*github_id) {
                plan.push(Mutation::AddUserToOrg {
                    github_id: github_id.to_string(),
                });
            }
        }

        let mut observed: Vec<&String> = remote.users.keys().collect();
        observed.sort();
        for github_id in observed {
            if desired.contains(github_id.as_str()) {
                continue;
            }
            if self.config.destructive_operations.users {
                plan.push(Mutation::RemoveUserFromOrg {
                    github_id: github_id.clone(),
                });
            } else {
                info!("blocked by configuration: removing user '{github_id}' from the organization");
            }
        }
    }

    fn plan_teams(
        &self,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
        plan: &mut Vec<Mutation>,
    ) {
        let desired = self.desired_teams(local);

        for (slug, members) in &desired {
            match remote.teams.get(slug) {
                None => plan.push(Mutation::CreateTeam {
                    slug: slug.clone(),
                    description: DEFAULT_TEAM_DESCRIPTION.to_string(),
                    members: members.iter().cloned().collect(),
                }),
                Some(team) => {
                    let observed: BTreeSet<&str> =
                        team.members.iter().map(String::as_str).collect();
                    for github_id in members.iter().filter(|m| !observed.contains(m.as_str())) {
                        plan.push(Mutation::UpdateTeamAddMember {
                            team_slug: slug.clone(),
                            github_id: github_id.clone(),
                            role: TeamRole::Member,
                        });
                    }
                    for github_id in observed.iter().filter(|m| !members.contains(**m)) {
                        plan.push(Mutation::UpdateTeamRemoveMember {
                            team_slug: slug.clone(),
                            github_id: github_id.to_string(),
                        });
                    }
                }
            }
        }

        let mut observed: Vec<&String> = remote.teams.keys().collect();
        observed.sort();
        for slug in observed {
            if desired.contains_key(slug) {
                continue;
            }
            if self.config.destructive_operations.teams {
                plan.push(Mutation::DeleteTeam {
                    team_slug: slug.clone(),
                });
            } else {
                info!("blocked by configuration: deleting team '{slug}'");
            }
        }
    }

    /// The desired teams in slug space, members resolved to their forge
    /// ids. Every local team contributes itself and its owners sibling;
    /// the synthetic everyone team joins when enabled.
    fn desired_teams(&self, local: &v1::Organization) -> BTreeMap<String, BTreeSet<String>> {
        let mut desired = BTreeMap::new();
        for team in local.teams.values() {
            let members = resolve_members(
                local,
                &team.name,
                team.spec.owners.iter().chain(team.spec.members.iter()),
            );
            let owners = resolve_members(local, &team.name, team.spec.owners.iter());
            desired.insert(team.slug(), members);
            desired.insert(format!("{}{}", team.slug(), OWNERS_SUFFIX), owners);
        }
        if self.config.everyone_team_enabled {
            let everyone = local
                .users
                .values()
                .map(|u| u.spec.github_id.clone())
                .collect();
            desired.insert(EVERYONE_TEAM.to_string(), everyone);
        }
        desired
    }

    fn plan_repositories(
        &self,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
        plan: &mut Vec<Mutation>,
    ) {
        let mut names: Vec<&String> = local.repositories.keys().collect();
        names.sort();

        for name in names {
            let repo = &local.repositories[name];
            let expected = self.expected_team_permissions(repo);
            let expected_externals = expected_external_users(local, repo);

            match remote.repos.get(name) {
                None => {
                    let writers = permission_slugs(&expected, RepoPermission::Write);
                    let readers = permission_slugs(&expected, RepoPermission::Read);
                    plan.push(Mutation::CreateRepository {
                        repo: name.clone(),
                        description: String::new(),
                        writers,
                        readers,
                        public: !repo.spec.visibility.is_private(),
                    });
                    for (github_id, permission) in &expected_externals {
                        plan.push(Mutation::UpdateRepositorySetExternalUser {
                            repo: name.clone(),
                            github_id: github_id.clone(),
                            permission: *permission,
                        });
                    }
                }
                Some(observed) => {
                    if observed.visibility.is_private() != repo.spec.visibility.is_private() {
                        plan.push(Mutation::UpdateRepositoryUpdatePrivate {
                            repo: name.clone(),
                            private: repo.spec.visibility.is_private(),
                        });
                    }
                    if observed.archived != repo.archived {
                        plan.push(Mutation::UpdateRepositoryUpdateArchived {
                            repo: name.clone(),
                            archived: repo.archived,
                        });
                    }

                    let observed_teams = remote.repo_team_permissions(name);
                    for (slug, permission) in &expected {
                        match observed_teams.get(slug.as_str()) {
                            None => plan.push(Mutation::UpdateRepositoryAddTeamAccess {
                                repo: name.clone(),
                                team_slug: slug.clone(),
                                permission: *permission,
                            }),
                            Some(granted) if granted != permission => {
                                // A permission move is a remove plus an
                                // add: the team-repo relation has exactly
                                // two primitives.
                                plan.push(Mutation::UpdateRepositoryRemoveTeamAccess {
                                    repo: name.clone(),
                                    team_slug: slug.clone(),
                                });
                                plan.push(Mutation::UpdateRepositoryAddTeamAccess {
                                    repo: name.clone(),
                                    team_slug: slug.clone(),
                                    permission: *permission,
                                });
                            }
                            Some(_) => {}
                        }
                    }
                    let mut observed_slugs: Vec<&&str> = observed_teams.keys().collect();
                    observed_slugs.sort();
                    for slug in observed_slugs {
                        if !expected.contains_key(*slug) {
                            plan.push(Mutation::UpdateRepositoryRemoveTeamAccess {
                                repo: name.clone(),
                                team_slug: slug.to_string(),
                            });
                        }
                    }

                    for (github_id, permission) in &expected_externals {
                        match observed.external_users.get(github_id) {
                            Some(granted) if granted == permission => {}
                            _ => plan.push(Mutation::UpdateRepositorySetExternalUser {
                                repo: name.clone(),
                                github_id: github_id.clone(),
                                permission: *permission,
                            }),
                        }
                    }
                    let mut observed_externals: Vec<&String> =
                        observed.external_users.keys().collect();
                    observed_externals.sort();
                    for github_id in observed_externals {
                        if !expected_externals.contains_key(github_id) {
                            plan.push(Mutation::UpdateRepositoryRemoveExternalUser {
                                repo: name.clone(),
                                github_id: github_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut observed: Vec<&String> = remote.repos.keys().collect();
        observed.sort();
        for name in observed {
            if local.repositories.contains_key(name) {
                continue;
            }
            if self.config.destructive_operations.repositories {
                plan.push(Mutation::DeleteRepository { repo: name.clone() });
            } else {
                info!("blocked by configuration: deleting repository '{name}'");
            }
        }
    }

    /// The team permissions a repository must carry: readers get READ, the
    /// synthetic everyone team gets READ when enabled, declared writers
    /// and the owner team get WRITE. The owner wins on conflicting
    /// declarations, which validation rejects anyway.
    fn expected_team_permissions(
        &self,
        repo: &v1::Repository,
    ) -> BTreeMap<String, RepoPermission> {
        let mut expected = BTreeMap::new();
        for reader in &repo.spec.readers {
            expected.insert(slugify(reader), RepoPermission::Read);
        }
        if self.config.everyone_team_enabled {
            expected.insert(EVERYONE_TEAM.to_string(), RepoPermission::Read);
        }
        for writer in &repo.spec.writers {
            expected.insert(slugify(writer), RepoPermission::Write);
        }
        let owner = repo.owner.as_deref().unwrap_or(self.config.admin_team.as_str());
        expected.insert(slugify(owner), RepoPermission::Write);
        expected
    }

    fn plan_rulesets(
        &self,
        local: &v1::Organization,
        remote: &RemoteSnapshot,
        plan: &mut Vec<Mutation>,
    ) {
        let mut referenced: BTreeMap<&str, GithubRuleSet> = BTreeMap::new();
        for reference in &self.config.rulesets {
            let Some(ruleset) = local.rulesets.get(&reference.ruleset) else {
                warn!(
                    "ruleset '{}' is referenced by the configuration but not defined locally",
                    reference.ruleset
                );
                continue;
            };
            referenced.insert(
                ruleset.name.as_str(),
                GithubRuleSet::from_local(ruleset, &reference.pattern),
            );
        }

        for (name, desired) in &referenced {
            match remote.rulesets.get(*name) {
                None => plan.push(Mutation::AddRuleset {
                    ruleset: desired.clone(),
                }),
                Some(observed) if observed.differs(desired) => {
                    // The ruleset API is not patch-based: the update
                    // carries the full desired state under the observed id.
                    let mut ruleset = desired.clone();
                    ruleset.id = observed.id;
                    plan.push(Mutation::UpdateRuleset { ruleset });
                }
                Some(_) => {}
            }
        }

        let mut observed: Vec<&String> = remote.rulesets.keys().collect();
        observed.sort();
        for name in observed {
            if referenced.contains_key(name.as_str()) {
                continue;
            }
            let Some(id) = remote.rulesets[name].id else {
                continue;
            };
            if self.config.destructive_operations.rulesets {
                plan.push(Mutation::DeleteRuleset { id });
            } else {
                info!("blocked by configuration: deleting ruleset '{name}'");
            }
        }
    }
}

/// Maps team member names onto forge ids, dropping names without a
/// matching user document.
fn resolve_members<'b>(
    local: &v1::Organization,
    team: &str,
    names: impl Iterator<Item = &'b String>,
) -> BTreeSet<String> {
    let mut members = BTreeSet::new();
    for name in names {
        match local.users.get(name) {
            Some(user) => {
                members.insert(user.spec.github_id.clone());
            }
            None => warn!("user '{name}' of team '{team}' is not an organization user, dropping"),
        }
    }
    members
}

fn expected_external_users(
    local: &v1::Organization,
    repo: &v1::Repository,
) -> BTreeMap<String, RepoPermission> {
    let mut expected = BTreeMap::new();
    for (names, permission) in [
        (&repo.spec.external_user_readers, RepoPermission::Read),
        (&repo.spec.external_user_writers, RepoPermission::Write),
    ] {
        for name in names {
            match local.external_users.get(name) {
                Some(user) => {
                    expected.insert(user.spec.github_id.clone(), permission);
                }
                None => warn!(
                    "external user '{name}' of repository '{}' is not declared, dropping",
                    repo.name
                ),
            }
        }
    }
    expected
}

fn permission_slugs(
    expected: &BTreeMap<String, RepoPermission>,
    permission: RepoPermission,
) -> Vec<String> {
    expected
        .iter()
        .filter(|(_, p)| **p == permission)
        .map(|(slug, _)| slug.clone())
        .collect()
}

fn dispatch(
    mutation: &Mutation,
    dry_run: bool,
    listener: &dyn ReconcileListener,
) -> anyhow::Result<()> {
    match mutation {
        Mutation::AddUserToOrg { github_id } => listener.add_user_to_org(dry_run, github_id),
        Mutation::RemoveUserFromOrg { github_id } => {
            listener.remove_user_from_org(dry_run, github_id)
        }
        Mutation::CreateTeam {
            slug,
            description,
            members,
        } => listener.create_team(dry_run, slug, description, members),
        Mutation::UpdateTeamAddMember {
            team_slug,
            github_id,
            role,
        } => listener.update_team_add_member(dry_run, team_slug, github_id, *role),
        Mutation::UpdateTeamRemoveMember {
            team_slug,
            github_id,
        } => listener.update_team_remove_member(dry_run, team_slug, github_id),
        Mutation::DeleteTeam { team_slug } => listener.delete_team(dry_run, team_slug),
        Mutation::CreateRepository {
            repo,
            description,
            writers,
            readers,
            public,
        } => listener.create_repository(dry_run, repo, description, writers, readers, *public),
        Mutation::UpdateRepositoryAddTeamAccess {
            repo,
            team_slug,
            permission,
        } => listener.update_repository_add_team_access(dry_run, repo, team_slug, *permission),
        Mutation::UpdateRepositoryRemoveTeamAccess { repo, team_slug } => {
            listener.update_repository_remove_team_access(dry_run, repo, team_slug)
        }
        Mutation::UpdateRepositoryUpdatePrivate { repo, private } => {
            listener.update_repository_update_private(dry_run, repo, *private)
        }
        Mutation::UpdateRepositoryUpdateArchived { repo, archived } => {
            listener.update_repository_update_archived(dry_run, repo, *archived)
        }
        Mutation::UpdateRepositorySetExternalUser {
            repo,
            github_id,
            permission,
        } => listener.update_repository_set_external_user(dry_run, repo, github_id, *permission),
        Mutation::UpdateRepositoryRemoveExternalUser { repo, github_id } => {
            listener.update_repository_remove_external_user(dry_run, repo, github_id)
        }
        Mutation::DeleteRepository { repo } => listener.delete_repository(dry_run, repo),
        Mutation::AddRuleset { ruleset } => listener.add_ruleset(dry_run, ruleset),
        Mutation::UpdateRuleset { ruleset } => listener.update_ruleset(dry_run, ruleset),
        Mutation::DeleteRuleset { id } => listener.delete_ruleset(dry_run, *id),
    }
}
