use anyhow::{Context, bail};
use log::info;
use orgwarden_data::v1;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sync_org::github::GithubRemote;

/// Source of truth for the managed organization members. Plugins map the
/// corporate directory (SAML, LDAP, a flat file) onto user documents; the
/// loader then commits whatever changed.
pub(crate) trait UserSyncPlugin {
    /// Returns the full new set of org users, keyed by document name.
    fn update_users(
        &self,
        config: &v1::RepositoryConfig,
        current: &HashMap<String, v1::User>,
    ) -> anyhow::Result<HashMap<String, v1::User>>;
}

/// Keeps the current set untouched. The default.
pub(crate) struct NoopUserSync;

impl UserSyncPlugin for NoopUserSync {
    fn update_users(
        &self,
        _config: &v1::RepositoryConfig,
        current: &HashMap<String, v1::User>,
    ) -> anyhow::Result<HashMap<String, v1::User>> {
        Ok(current.clone())
    }
}

/// Derives the org users from the SAML identity provider attached to the
/// organization: the identity name becomes the document name, the linked
/// forge login becomes the github id.
pub(crate) struct GithubSamlSync<'a> {
    remote: &'a GithubRemote,
}

impl UserSyncPlugin for GithubSamlSync<'_> {
    fn update_users(
        &self,
        _config: &v1::RepositoryConfig,
        _current: &HashMap<String, v1::User>,
    ) -> anyhow::Result<HashMap<String, v1::User>> {
        let identities = self
            .remote
            .saml_users()
            .context("failed to list the SAML identities")?;
        let mut users = HashMap::new();
        for (name_id, login) in identities {
            users.insert(name_id.clone(), v1::User::new(&name_id, &login));
        }
        Ok(users)
    }
}

pub(crate) fn plugin_by_name<'a>(
    name: &str,
    remote: &'a GithubRemote,
) -> anyhow::Result<Box<dyn UserSyncPlugin + 'a>> {
    match name {
        "noop" => Ok(Box::new(NoopUserSync)),
        "github-saml" => Ok(Box::new(GithubSamlSync { remote })),
        other => bail!("unknown usersync plugin '{other}'"),
    }
}

/// File mutations produced by one user-sync pass, ready to be staged.
#[derive(Debug, Default)]
pub(crate) struct UserSyncChanges {
    pub(crate) deleted: Vec<PathBuf>,
    pub(crate) written: Vec<PathBuf>,
}

impl UserSyncChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.written.is_empty()
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &Path> {
        self.deleted
            .iter()
            .chain(self.written.iter())
            .map(PathBuf::as_path)
    }
}

/// Diffs the current `users/org` documents against the plugin's view and
/// applies the difference to the working tree. Two documents are the same
/// when their serialized form is byte-identical.
pub(crate) fn sync_users(
    root: &Path,
    config: &v1::RepositoryConfig,
    plugin: &dyn UserSyncPlugin,
) -> anyhow::Result<UserSyncChanges> {
    let org_dir = root.join("users/org");
    let current = read_user_directory(&org_dir)?;
    let mut new_users = plugin.update_users(config, &current)?;

    let mut changes = UserSyncChanges::default();
    for (name, user) in &current {
        let path = org_dir.join(format!("{name}.yaml"));
        match new_users.remove(name) {
            None => {
                info!("user sync: removing user '{name}'");
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                changes.deleted.push(path);
            }
            Some(new_user) => {
                let old = serde_yaml::to_string(user)?;
                let new = serde_yaml::to_string(&new_user)?;
                if old != new {
                    info!("user sync: updating user '{name}'");
                    std::fs::write(&path, new)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    changes.written.push(path);
                }
            }
        }
    }
    for (name, user) in new_users {
        let path = org_dir.join(format!("{name}.yaml"));
        info!("user sync: adding user '{name}'");
        std::fs::create_dir_all(&org_dir)?;
        std::fs::write(&path, serde_yaml::to_string(&user)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        changes.written.push(path);
    }

    changes.deleted.sort();
    changes.written.sort();
    Ok(changes)
}

fn read_user_directory(dir: &Path) -> anyhow::Result<HashMap<String, v1::User>> {
    let mut users = HashMap::new();
    if !dir.is_dir() {
        return Ok(users);
    }
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory '{}'", dir.display()))?
    {
        let path = entry?.path();
        if path.extension() != Some(std::ffi::OsStr::new("yaml")) {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let user: v1::User = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        users.insert(user.name.clone(), user);
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write;

    struct ScriptedSync(HashMap<String, v1::User>);

    impl UserSyncPlugin for ScriptedSync {
        fn update_users(
            &self,
            _config: &v1::RepositoryConfig,
            _current: &HashMap<String, v1::User>,
        ) -> anyhow::Result<HashMap<String, v1::User>> {
            Ok(self.0.clone())
        }
    }

    fn user_doc(name: &str, github_id: &str) -> String {
        serde_yaml::to_string(&v1::User::new(name, github_id)).unwrap()
    }

    #[test]
    fn noop_plugin_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "users/org/alice.yaml", &user_doc("alice", "alice-gh"));

        let changes = sync_users(
            dir.path(),
            &v1::RepositoryConfig::default(),
            &NoopUserSync,
        )
        .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn plugin_diff_is_applied_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "users/org/alice.yaml", &user_doc("alice", "alice-gh"));
        write(dir.path(), "users/org/bob.yaml", &user_doc("bob", "bob-gh"));

        let mut desired = HashMap::new();
        // alice changes her forge account, bob leaves, carol joins
        desired.insert("alice".to_string(), v1::User::new("alice", "alice-2"));
        desired.insert("carol".to_string(), v1::User::new("carol", "carol-gh"));

        let changes = sync_users(
            dir.path(),
            &v1::RepositoryConfig::default(),
            &ScriptedSync(desired),
        )
        .unwrap();

        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.written.len(), 2);
        assert!(!dir.path().join("users/org/bob.yaml").exists());
        let alice = std::fs::read_to_string(dir.path().join("users/org/alice.yaml")).unwrap();
        assert!(alice.contains("alice-2"));
        assert!(dir.path().join("users/org/carol.yaml").exists());
    }

    #[test]
    fn unknown_plugin_name_is_rejected() {
        let remote = stub_remote();
        assert!(plugin_by_name("noop", &remote).is_ok());
        assert!(plugin_by_name("github-saml", &remote).is_ok());
        assert!(plugin_by_name("ldap-magic", &remote).is_err());
    }

    #[test]
    fn saml_plugin_maps_identities_to_users() {
        let remote = stub_remote();
        let plugin = plugin_by_name("github-saml", &remote).unwrap();
        let users = plugin
            .update_users(&v1::RepositoryConfig::default(), &HashMap::new())
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users["jane.doe"].spec.github_id, "jdoe");
    }

    struct StubRead;

    impl sync_org::github::api::GithubRead for StubRead {
        fn is_enterprise(&self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn org_members(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn teams(&self) -> anyhow::Result<Vec<sync_org::github::api::GithubTeam>> {
            Ok(Vec::new())
        }

        fn team_repos(
            &self,
            _team_slug: &str,
        ) -> anyhow::Result<Vec<sync_org::github::api::GithubTeamRepo>> {
            Ok(Vec::new())
        }

        fn repos(&self) -> anyhow::Result<Vec<sync_org::github::api::RepoNode>> {
            Ok(Vec::new())
        }

        fn repo_external_users(
            &self,
            _repo: &str,
        ) -> anyhow::Result<HashMap<String, sync_org::github::api::RepoPermission>> {
            Ok(HashMap::new())
        }

        fn rulesets(&self) -> anyhow::Result<Vec<sync_org::github::api::GithubRuleSet>> {
            Ok(Vec::new())
        }

        fn app_installations(&self) -> anyhow::Result<HashMap<String, u64>> {
            Ok(HashMap::new())
        }

        fn saml_identities(&self) -> anyhow::Result<HashMap<String, String>> {
            Ok(HashMap::from([("jane.doe".to_string(), "jdoe".to_string())]))
        }
    }

    fn stub_remote() -> GithubRemote {
        GithubRemote::new(Box::new(StubRead), std::time::Duration::from_secs(0))
    }
}
