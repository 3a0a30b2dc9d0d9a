use crate::github::api::{
    GithubRead, GithubRepository, GithubRuleSet, GithubTeam, GithubTeamRepo, RepoPermission,
};
use anyhow::Context;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A fully populated, immutable view of the organization as the forge
/// reports it. The reconciler only ever sees one of these.
#[derive(Debug, Default)]
pub struct RemoteSnapshot {
    pub enterprise: bool,
    /// Org member logins, keyed by themselves for cheap membership tests.
    pub users: HashMap<String, String>,
    /// Team slug -> team.
    pub teams: HashMap<String, GithubTeam>,
    /// Team slug -> repository name -> granted permission.
    pub team_repos: HashMap<String, HashMap<String, GithubTeamRepo>>,
    /// Repository name -> repository.
    pub repos: HashMap<String, GithubRepository>,
    /// Ruleset name -> ruleset.
    pub rulesets: HashMap<String, GithubRuleSet>,
    /// App slug -> installation id.
    pub app_ids: HashMap<String, u64>,
}

/// Caching layer in front of [`GithubRead`]. A snapshot is served to every
/// consumer until the TTL expires or the cache is flushed explicitly; the
/// default TTL of one cycle means each tick fetches at most once.
pub struct GithubRemote {
    read: Box<dyn GithubRead>,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

struct Cached {
    fetched_at: Instant,
    snapshot: Arc<RemoteSnapshot>,
}

impl GithubRemote {
    pub fn new(read: Box<dyn GithubRead>, ttl: Duration) -> Self {
        GithubRemote {
            read,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn load(&self) -> anyhow::Result<Arc<RemoteSnapshot>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                debug!("serving the remote state from cache");
                return Ok(cached.snapshot.clone());
            }
        }

        let snapshot = Arc::new(self.fetch()?);
        *cache = Some(Cached {
            fetched_at: Instant::now(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub fn flush_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    pub fn is_enterprise(&self) -> anyhow::Result<bool> {
        self.read.is_enterprise()
    }

    /// SAML identity mappings, for the user-sync plugin. Not cached: the
    /// plugin runs at most once per cycle.
    pub fn saml_users(&self) -> anyhow::Result<HashMap<String, String>> {
        if !self.read.is_enterprise()? {
            anyhow::bail!("SAML identities are only available on the enterprise plan");
        }
        self.read.saml_identities()
    }

    fn fetch(&self) -> anyhow::Result<RemoteSnapshot> {
        debug!("loading the remote organization state");
        let enterprise = self.read.is_enterprise()?;

        let users: HashMap<String, String> = self
            .read
            .org_members()
            .context("failed to list the organization members")?
            .into_iter()
            .map(|login| (login.clone(), login))
            .collect();

        let mut teams = HashMap::new();
        let mut team_repos: HashMap<String, HashMap<String, GithubTeamRepo>> = HashMap::new();
        for team in self
            .read
            .teams()
            .context("failed to list the organization teams")?
        {
            let repos = self
                .read
                .team_repos(&team.slug)
                .with_context(|| format!("failed to list repositories of team '{}'", team.slug))?;
            team_repos.insert(
                team.slug.clone(),
                repos.into_iter().map(|r| (r.name.clone(), r)).collect(),
            );
            teams.insert(team.slug.clone(), team);
        }

        let mut repos = HashMap::new();
        for node in self
            .read
            .repos()
            .context("failed to list the organization repositories")?
        {
            let external_users = self.read.repo_external_users(&node.name).with_context(|| {
                format!("failed to list collaborators of repository '{}'", node.name)
            })?;
            repos.insert(
                node.name.clone(),
                GithubRepository {
                    name: node.name,
                    ref_id: node.ref_id,
                    visibility: node.visibility,
                    archived: node.archived,
                    external_users,
                },
            );
        }

        let rulesets = if enterprise {
            self.read
                .rulesets()
                .context("failed to list the organization rulesets")?
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };

        let app_ids = self
            .read
            .app_installations()
            .context("failed to list the organization app installations")?;

        debug!(
            "remote state loaded: {} users, {} teams, {} repositories, {} rulesets",
            users.len(),
            teams.len(),
            repos.len(),
            rulesets.len()
        );

        Ok(RemoteSnapshot {
            enterprise,
            users,
            teams,
            team_repos,
            repos,
            rulesets,
            app_ids,
        })
    }
}

impl RemoteSnapshot {
    /// Pivot of `team_repos`: the permissions granted on one repository,
    /// keyed by team slug.
    pub fn repo_team_permissions(&self, repo: &str) -> HashMap<&str, RepoPermission> {
        let mut permissions = HashMap::new();
        for (slug, repos) in &self.team_repos {
            if let Some(granted) = repos.get(repo) {
                permissions.insert(slug.as_str(), granted.permission);
            }
        }
        permissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::api::RepoNode;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct CountingRead {
        fetches: Rc<Cell<usize>>,
    }

    impl GithubRead for CountingRead {
        fn is_enterprise(&self) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn org_members(&self) -> anyhow::Result<Vec<String>> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(vec!["alice-gh".to_string()])
        }

        fn teams(&self) -> anyhow::Result<Vec<GithubTeam>> {
            Ok(Vec::new())
        }

        fn team_repos(&self, _team_slug: &str) -> anyhow::Result<Vec<GithubTeamRepo>> {
            Ok(Vec::new())
        }

        fn repos(&self) -> anyhow::Result<Vec<RepoNode>> {
            Ok(Vec::new())
        }

        fn repo_external_users(
            &self,
            _repo: &str,
        ) -> anyhow::Result<HashMap<String, RepoPermission>> {
            Ok(HashMap::new())
        }

        fn rulesets(&self) -> anyhow::Result<Vec<GithubRuleSet>> {
            Ok(Vec::new())
        }

        fn app_installations(&self) -> anyhow::Result<HashMap<String, u64>> {
            Ok(HashMap::new())
        }

        fn saml_identities(&self) -> anyhow::Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn snapshots_are_cached_until_the_ttl() {
        let fetches = Rc::new(Cell::new(0));
        let read = CountingRead {
            fetches: fetches.clone(),
        };
        let remote = GithubRemote::new(Box::new(read), Duration::from_secs(600));

        let first = remote.load().unwrap();
        let second = remote.load().unwrap();
        assert_eq!(fetches.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.users.len(), 1);
    }

    #[test]
    fn flushing_evicts_the_snapshot() {
        let fetches = Rc::new(Cell::new(0));
        let read = CountingRead {
            fetches: fetches.clone(),
        };
        let remote = GithubRemote::new(Box::new(read), Duration::from_secs(600));

        remote.load().unwrap();
        remote.flush_cache();
        remote.load().unwrap();
        assert_eq!(fetches.get(), 2);
    }

    #[test]
    fn zero_ttl_always_refetches() {
        let fetches = Rc::new(Cell::new(0));
        let read = CountingRead {
            fetches: fetches.clone(),
        };
        let remote = GithubRemote::new(Box::new(read), Duration::from_secs(0));

        remote.load().unwrap();
        remote.load().unwrap();
        assert_eq!(fetches.get(), 2);
    }

    #[test]
    fn saml_needs_the_enterprise_plan() {
        let remote = GithubRemote::new(
            Box::new(CountingRead::default()),
            Duration::from_secs(600),
        );
        assert!(remote.saml_users().is_err());
    }
}

