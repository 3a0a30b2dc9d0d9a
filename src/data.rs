use anyhow::{Context, Error, bail};
use log::debug;
use orgwarden_data::v1;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

/// Top-level configuration file at the root of the teams repository.
pub(crate) const CONFIG_FILE: &str = "orgwarden.yaml";

pub(crate) type Warning = String;

/// The teams repository materialized in memory: the desired organization
/// plus its top-level configuration. Rebuilt from disk on every cycle.
#[derive(Debug)]
pub(crate) struct Data {
    org: v1::Organization,
    config: v1::RepositoryConfig,
}

impl Data {
    /// Walks the repository layout and parses every document. Parsing
    /// problems are fatal as a whole; schema oddities that do not prevent
    /// reconciliation come back as warnings.
    pub(crate) fn load(root: &Path) -> Result<(Self, Vec<Warning>), Error> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let config: v1::RepositoryConfig = load_file(&root.join(CONFIG_FILE))?;

        let mut org = v1::Organization::default();

        for dir in ["users/protected", "users/org"] {
            let mut users = HashMap::new();
            load_documents(&root.join(dir), &mut errors, |user: v1::User, path| {
                check_envelope(&user.api_version, &user.kind, "User", &user.name, path)?;
                collect_unknown(&user.unknown, &user.spec.unknown, path, &mut warnings);
                if users.insert(user.name.clone(), user).is_some() {
                    bail!("duplicate user document in {}", path.display());
                }
                Ok(())
            });
            for (name, user) in users {
                if org.users.insert(name.clone(), user).is_some() {
                    errors.push(format!("user '{name}' is declared in several populations"));
                }
            }
        }

        load_documents(
            &root.join("users/external"),
            &mut errors,
            |user: v1::User, path| {
                check_envelope(&user.api_version, &user.kind, "User", &user.name, path)?;
                collect_unknown(&user.unknown, &user.spec.unknown, path, &mut warnings);
                if org.external_users.insert(user.name.clone(), user).is_some() {
                    bail!("duplicate external user document in {}", path.display());
                }
                Ok(())
            },
        );

        let teams_dir = root.join("teams");
        if teams_dir.is_dir() {
            let mut team_dirs: Vec<_> = std::fs::read_dir(&teams_dir)
                .with_context(|| format!("failed to read directory '{}'", teams_dir.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_dir())
                .collect();
            team_dirs.sort();
            for team_dir in team_dirs {
                let team_name = team_dir
                    .file_name()
                    .and_then(OsStr::to_str)
                    .map(str::to_string)
                    .unwrap_or_default();
                load_team_directory(&team_dir, &team_name, &mut org, &mut errors, &mut warnings);
            }
        }

        load_documents(
            &root.join("archived"),
            &mut errors,
            |mut repo: v1::Repository, path| {
                check_envelope(&repo.api_version, &repo.kind, "Repository", &repo.name, path)?;
                check_file_name(&repo.name, path)?;
                collect_unknown(&repo.unknown, &repo.spec.unknown, path, &mut warnings);
                repo.archived = true;
                if org.repositories.insert(repo.name.clone(), repo).is_some() {
                    bail!("duplicate repository document in {}", path.display());
                }
                Ok(())
            },
        );

        load_documents(
            &root.join("rulesets"),
            &mut errors,
            |ruleset: v1::Ruleset, path| {
                check_envelope(&ruleset.api_version, &ruleset.kind, "Ruleset", &ruleset.name, path)?;
                check_file_name(&ruleset.name, path)?;
                collect_unknown(&ruleset.unknown, &ruleset.spec.unknown, path, &mut warnings);
                if org.rulesets.insert(ruleset.name.clone(), ruleset).is_some() {
                    bail!("duplicate ruleset document in {}", path.display());
                }
                Ok(())
            },
        );

        if !errors.is_empty() {
            errors.sort();
            errors.dedup();
            for error in &errors {
                log::error!("load error: {error}");
            }
            bail!("{} errors found while loading the teams repository", errors.len());
        }

        debug!(
            "loaded {} users, {} external users, {} teams, {} repositories, {} rulesets",
            org.users.len(),
            org.external_users.len(),
            org.teams.len(),
            org.repositories.len(),
            org.rulesets.len()
        );

        Ok((Data { org, config }, warnings))
    }

    pub(crate) fn organization(&self) -> &v1::Organization {
        &self.org
    }

    pub(crate) fn config(&self) -> &v1::RepositoryConfig {
        &self.config
    }

    pub(crate) fn users(&self) -> &HashMap<String, v1::User> {
        &self.org.users
    }

    pub(crate) fn external_users(&self) -> &HashMap<String, v1::User> {
        &self.org.external_users
    }

    pub(crate) fn teams(&self) -> impl Iterator<Item = &v1::Team> {
        self.org.teams.values()
    }

    pub(crate) fn team(&self, name: &str) -> Option<&v1::Team> {
        self.org.teams.get(name)
    }

    pub(crate) fn repositories(&self) -> impl Iterator<Item = &v1::Repository> {
        self.org.repositories.values()
    }

    pub(crate) fn rulesets(&self) -> &HashMap<String, v1::Ruleset> {
        &self.org.rulesets
    }
}

/// Parses every repository document living next to a `team.yaml`; the
/// directory name is the owning team.
fn load_team_directory(
    team_dir: &Path,
    team_name: &str,
    org: &mut v1::Organization,
    errors: &mut Vec<String>,
    warnings: &mut Vec<Warning>,
) {
    load_documents(team_dir, errors, |doc: serde_yaml::Value, path| {
        if path.file_name() == Some(OsStr::new("team.yaml")) {
            let team: v1::Team = serde_yaml::from_value(doc)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            check_envelope(&team.api_version, &team.kind, "Team", &team.name, path)?;
            collect_unknown(&team.unknown, &team.spec.unknown, path, warnings);
            if team.name != team_name {
                bail!(
                    "team '{}' is declared in the '{team_name}' directory, please ensure the names match",
                    team.name
                );
            }
            if org.teams.insert(team.name.clone(), team).is_some() {
                bail!("duplicate team document in {}", path.display());
            }
        } else {
            let mut repo: v1::Repository = serde_yaml::from_value(doc)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            check_envelope(&repo.api_version, &repo.kind, "Repository", &repo.name, path)?;
            check_file_name(&repo.name, path)?;
            collect_unknown(&repo.unknown, &repo.spec.unknown, path, warnings);
            repo.owner = Some(team_name.to_string());
            if org.repositories.insert(repo.name.clone(), repo).is_some() {
                bail!("duplicate repository document in {}", path.display());
            }
        }
        Ok(())
    });
    if !org.teams.contains_key(team_name) {
        errors.push(format!(
            "directory 'teams/{team_name}' has no team.yaml definition"
        ));
    }
}

/// Parses every `.yaml` file of a directory, funneling per-file failures
/// into the shared error list so one bad document does not hide the rest.
fn load_documents<T, F>(dir: &Path, errors: &mut Vec<String>, mut f: F)
where
    T: DeserializeOwned,
    F: FnMut(T, &Path) -> Result<(), Error>,
{
    if !dir.is_dir() {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push(format!("failed to read directory '{}': {err}", dir.display()));
            return;
        }
    };
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension() == Some(OsStr::new("yaml")))
        .collect();
    paths.sort();
    for path in paths {
        let result = load_file(&path).and_then(|doc| f(doc, &path));
        if let Err(err) = result {
            errors.push(format!("{err:#}"));
        }
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}

fn check_envelope(
    api_version: &str,
    kind: &str,
    expected_kind: &str,
    name: &str,
    path: &Path,
) -> Result<(), Error> {
    if api_version != v1::API_VERSION {
        bail!(
            "unsupported apiVersion '{api_version}' in {} (expected '{}')",
            path.display(),
            v1::API_VERSION
        );
    }
    if kind != expected_kind {
        bail!(
            "unexpected kind '{kind}' in {} (expected '{expected_kind}')",
            path.display()
        );
    }
    if name.is_empty() {
        bail!("document {} has an empty name", path.display());
    }
    Ok(())
}

/// Document names must match their file name, so a directory listing tells
/// the truth about what is declared.
fn check_file_name(name: &str, path: &Path) -> Result<(), Error> {
    let stem = path.file_stem().and_then(OsStr::to_str).unwrap_or_default();
    if name != stem {
        bail!(
            "document '{name}' lives in file '{}', please ensure the names match",
            path.display()
        );
    }
    Ok(())
}

fn collect_unknown(
    envelope: &v1::UnknownFields,
    spec: &v1::UnknownFields,
    path: &Path,
    warnings: &mut Vec<Warning>,
) {
    for field in envelope.keys().chain(spec.keys()) {
        warnings.push(format!("unknown field '{field}' in {}", path.display()));
    }
}
