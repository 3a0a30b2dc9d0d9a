use crate::github::ReconcileListener;
use crate::github::api::{
    GithubRuleSet, HttpClient, RepoPermission, TeamRole, allow_not_found,
};
use anyhow::Context;
use log::{error, info};
use reqwest::Method;
use serde_json::json;
use std::collections::HashMap;

/// The forge executor: translates every mutation event into the matching
/// REST call. Honors `dry_run` by logging the would-be action and doing
/// nothing else, so a dry reconciliation prints the full plan.
pub struct GitHubWrite {
    client: HttpClient,
    /// App slug -> installation id, needed to translate ruleset bypass
    /// actors into the payload the forge expects.
    app_ids: HashMap<String, u64>,
}

impl GitHubWrite {
    pub fn new(client: HttpClient, app_ids: HashMap<String, u64>) -> Self {
        Self { client, app_ids }
    }

    fn org(&self) -> &str {
        self.client.org()
    }

    /// DELETE that treats 404 as success: a target already gone means the
    /// desired state is reached.
    fn delete(&self, url: &str) -> anyhow::Result<()> {
        let method = Method::DELETE;
        let resp = self.client.execute(self.client.req(method.clone(), url)?)?;
        allow_not_found(resp, method, url)
    }

    fn set_team_permission(
        &self,
        repo: &str,
        team_slug: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()> {
        #[derive(serde::Serialize, Debug)]
        struct Req {
            permission: RepoPermission,
        }
        self.client.send(
            Method::PUT,
            &format!("orgs/{0}/teams/{team_slug}/repos/{0}/{repo}", self.org()),
            &Req { permission },
        )?;
        Ok(())
    }

    fn ruleset_payload(&self, ruleset: &GithubRuleSet) -> anyhow::Result<serde_json::Value> {
        let mut bypass_actors = Vec::new();
        for (app, mode) in &ruleset.bypass_apps {
            let id = self
                .app_ids
                .get(app)
                .with_context(|| format!("app '{app}' is not installed on the organization"))?;
            bypass_actors.push(json!({
                "actor_id": id,
                "actor_type": "Integration",
                "bypass_mode": mode,
            }));
        }

        let rules: Vec<serde_json::Value> = ruleset
            .rules
            .iter()
            .map(|(rule_type, params)| {
                let parameters = match rule_type.as_str() {
                    "pull_request" => json!({
                        "required_approving_review_count": params.required_approving_review_count,
                        "dismiss_stale_reviews_on_push": params.dismiss_stale_reviews_on_push,
                        "require_code_owner_review": params.require_code_owner_review,
                    }),
                    "required_status_checks" => json!({
                        "required_status_checks": params
                            .required_status_checks
                            .iter()
                            .map(|context| json!({ "context": context }))
                            .collect::<Vec<_>>(),
                        "strict_required_status_checks_policy":
                            params.strict_required_status_checks_policy,
                    }),
                    _ => json!({}),
                };
                json!({ "type": rule_type, "parameters": parameters })
            })
            .collect();

        Ok(json!({
            "name": ruleset.name,
            "target": "branch",
            "enforcement": ruleset.enforcement,
            "bypass_actors": bypass_actors,
            "conditions": {
                "ref_name": { "include": ruleset.include, "exclude": ruleset.exclude },
                "repository_name": { "include": ruleset.repositories, "exclude": [] },
            },
            "rules": rules,
        }))
    }
}

impl ReconcileListener for GitHubWrite {
    fn begin(&self, dry_run: bool) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) applying the reconciliation plan");
        Ok(())
    }

    fn add_user_to_org(&self, dry_run: bool, github_id: &str) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) inviting user '{github_id}' to the organization");
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req<'a> {
                role: &'a str,
            }
            self.client.send(
                Method::PUT,
                &format!("orgs/{}/memberships/{github_id}", self.org()),
                &Req { role: "member" },
            )?;
        }
        Ok(())
    }

    fn remove_user_from_org(&self, dry_run: bool, github_id: &str) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) removing user '{github_id}' from the organization");
        if !dry_run {
            self.delete(&format!("orgs/{}/memberships/{github_id}", self.org()))?;
        }
        Ok(())
    }

    fn create_team(
        &self,
        dry_run: bool,
        slug: &str,
        description: &str,
        members: &[String],
    ) -> anyhow::Result<()> {
        info!(
            "(dry_run={dry_run}) creating team '{slug}' with {} members",
            members.len()
        );
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req<'a> {
                name: &'a str,
                description: &'a str,
                privacy: &'a str,
            }
            self.client.send(
                Method::POST,
                &format!("orgs/{}/teams", self.org()),
                &Req {
                    name: slug,
                    description,
                    privacy: "closed",
                },
            )?;
            for member in members {
                self.update_team_add_member(dry_run, slug, member, TeamRole::Member)?;
            }
        }
        Ok(())
    }

    fn update_team_add_member(
        &self,
        dry_run: bool,
        team_slug: &str,
        github_id: &str,
        role: TeamRole,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) adding '{github_id}' to team '{team_slug}' as {role}");
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req {
                role: TeamRole,
            }
            self.client.send(
                Method::PUT,
                &format!(
                    "orgs/{}/teams/{team_slug}/memberships/{github_id}",
                    self.org()
                ),
                &Req { role },
            )?;
        }
        Ok(())
    }

    fn update_team_remove_member(
        &self,
        dry_run: bool,
        team_slug: &str,
        github_id: &str,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) removing '{github_id}' from team '{team_slug}'");
        if !dry_run {
            self.delete(&format!(
                "orgs/{}/teams/{team_slug}/memberships/{github_id}",
                self.org()
            ))?;
        }
        Ok(())
    }

    fn delete_team(&self, dry_run: bool, team_slug: &str) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) deleting team '{team_slug}'");
        if !dry_run {
            self.delete(&format!("orgs/{}/teams/{team_slug}", self.org()))?;
        }
        Ok(())
    }

    fn create_repository(
        &self,
        dry_run: bool,
        repo: &str,
        description: &str,
        writers: &[String],
        readers: &[String],
        public: bool,
    ) -> anyhow::Result<()> {
        info!(
            "(dry_run={dry_run}) creating {} repository '{repo}' (writers: {writers:?}, readers: {readers:?})",
            if public { "public" } else { "private" },
        );
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req<'a> {
                name: &'a str,
                description: &'a str,
                private: bool,
                auto_init: bool,
            }
            self.client.send(
                Method::POST,
                &format!("orgs/{}/repos", self.org()),
                &Req {
                    name: repo,
                    description,
                    private: !public,
                    auto_init: true,
                },
            )?;
            for team_slug in writers {
                self.set_team_permission(repo, team_slug, RepoPermission::Write)?;
            }
            for team_slug in readers {
                self.set_team_permission(repo, team_slug, RepoPermission::Read)?;
            }
        }
        Ok(())
    }

    fn update_repository_add_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) granting {permission} on '{repo}' to team '{team_slug}'");
        if !dry_run {
            self.set_team_permission(repo, team_slug, permission)?;
        }
        Ok(())
    }

    fn update_repository_update_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) rewriting {permission} on '{repo}' for team '{team_slug}'");
        if !dry_run {
            self.set_team_permission(repo, team_slug, permission)?;
        }
        Ok(())
    }

    fn update_repository_remove_team_access(
        &self,
        dry_run: bool,
        repo: &str,
        team_slug: &str,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) revoking access of team '{team_slug}' on '{repo}'");
        if !dry_run {
            self.delete(&format!(
                "orgs/{0}/teams/{team_slug}/repos/{0}/{repo}",
                self.org()
            ))?;
        }
        Ok(())
    }

    fn update_repository_update_private(
        &self,
        dry_run: bool,
        repo: &str,
        private: bool,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) setting repository '{repo}' private={private}");
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req {
                private: bool,
            }
            self.client.send(
                Method::PATCH,
                &format!("repos/{}/{repo}", self.org()),
                &Req { private },
            )?;
        }
        Ok(())
    }

    fn update_repository_update_archived(
        &self,
        dry_run: bool,
        repo: &str,
        archived: bool,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) setting repository '{repo}' archived={archived}");
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req {
                archived: bool,
            }
            self.client.send(
                Method::PATCH,
                &format!("repos/{}/{repo}", self.org()),
                &Req { archived },
            )?;
        }
        Ok(())
    }

    fn update_repository_set_external_user(
        &self,
        dry_run: bool,
        repo: &str,
        github_id: &str,
        permission: RepoPermission,
    ) -> anyhow::Result<()> {
        info!(
            "(dry_run={dry_run}) granting {permission} on '{repo}' to collaborator '{github_id}'"
        );
        if !dry_run {
            #[derive(serde::Serialize, Debug)]
            struct Req {
                permission: RepoPermission,
            }
            self.client.send(
                Method::PUT,
                &format!("repos/{}/{repo}/collaborators/{github_id}", self.org()),
                &Req { permission },
            )?;
        }
        Ok(())
    }

    fn update_repository_remove_external_user(
        &self,
        dry_run: bool,
        repo: &str,
        github_id: &str,
    ) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) removing collaborator '{github_id}' from '{repo}'");
        if !dry_run {
            self.delete(&format!(
                "repos/{}/{repo}/collaborators/{github_id}",
                self.org()
            ))?;
        }
        Ok(())
    }

    fn delete_repository(&self, dry_run: bool, repo: &str) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) deleting repository '{repo}'");
        if !dry_run {
            self.delete(&format!("repos/{}/{repo}", self.org()))?;
        }
        Ok(())
    }

    fn add_ruleset(&self, dry_run: bool, ruleset: &GithubRuleSet) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) creating ruleset '{}'", ruleset.name);
        if !dry_run {
            let payload = self.ruleset_payload(ruleset)?;
            self.client.send(
                Method::POST,
                &format!("orgs/{}/rulesets", self.org()),
                &payload,
            )?;
        }
        Ok(())
    }

    fn update_ruleset(&self, dry_run: bool, ruleset: &GithubRuleSet) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) updating ruleset '{}'", ruleset.name);
        if !dry_run {
            let id = ruleset
                .id
                .with_context(|| format!("ruleset '{}' has no remote id", ruleset.name))?;
            let payload = self.ruleset_payload(ruleset)?;
            self.client.send(
                Method::PUT,
                &format!("orgs/{}/rulesets/{id}", self.org()),
                &payload,
            )?;
        }
        Ok(())
    }

    fn delete_ruleset(&self, dry_run: bool, id: u64) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) deleting ruleset {id}");
        if !dry_run {
            self.delete(&format!("orgs/{}/rulesets/{id}", self.org()))?;
        }
        Ok(())
    }

    fn commit(&self, dry_run: bool) -> anyhow::Result<()> {
        info!("(dry_run={dry_run}) all changes applied");
        Ok(())
    }

    fn rollback(&self, dry_run: bool, err: &anyhow::Error) {
        // No reverse operations are attempted: already-applied changes
        // stay and the next cycle converges from wherever this one stopped.
        error!("(dry_run={dry_run}) aborting the remaining plan: {err:?}");
    }
}
