use crate::data::{Data, Warning};
use anyhow::{Error, bail};
use log::error;
use orgwarden_data::v1::{Team, slugify};
use regex::Regex;
use std::collections::{HashMap, HashSet};

macro_rules! checks {
    ($($f:ident,)*) => {
        &[$(
            Check {
                f: $f,
                name: stringify!($f)
            }
        ),*]
    }
}

#[allow(clippy::type_complexity)]
static CHECKS: &[Check<fn(&Data, &mut Vec<String>)>] = checks![
    validate_team_members,
    validate_team_slugs,
    validate_parent_teams,
    validate_repository_teams,
    validate_repository_roles,
    validate_repository_external_users,
    validate_ruleset_references,
];

#[allow(clippy::type_complexity)]
static LINTS: &[Check<fn(&Data, &mut Vec<String>)>] = checks![
    lint_unused_users,
    lint_slugged_team_names,
];

struct Check<F> {
    f: F,
    name: &'static str,
}

/// Runs every cross-document check on the loaded model. Check failures
/// abort the cycle; lints come back as warnings for the operator.
pub(crate) fn validate(data: &Data) -> Result<Vec<Warning>, Error> {
    let mut errors = Vec::new();
    for check in CHECKS {
        log::trace!("running check: {}", check.name);
        (check.f)(data, &mut errors);
    }

    let mut warnings = Vec::new();
    for lint in LINTS {
        log::trace!("running lint: {}", lint.name);
        (lint.f)(data, &mut warnings);
    }

    if !errors.is_empty() {
        errors.sort();
        errors.dedup();
        for err in &errors {
            error!("validation error: {err}");
        }
        bail!("{} validation errors found", errors.len());
    }

    Ok(warnings)
}

/// Ensure every owner and member of a team is a declared user
fn validate_team_members(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.teams(), errors, |team, errors| {
        for name in team.spec.owners.iter().chain(team.spec.members.iter()) {
            if !data.users().contains_key(name) {
                errors.push(format!(
                    "team '{}' references user '{name}' which does not exist",
                    team.name
                ));
            }
        }
        Ok(())
    });
}

/// Ensure no two teams collide once slugged, including the owners siblings
fn validate_team_slugs(data: &Data, errors: &mut Vec<String>) {
    let mut seen: HashMap<String, &str> = HashMap::new();
    wrapper(data.teams(), errors, |team, errors| {
        for slug in [team.slug(), team.owners_slug()] {
            if let Some(other) = seen.insert(slug.clone(), team.name.as_str()) {
                if other != team.name {
                    errors.push(format!(
                        "teams '{other}' and '{}' collide on slug '{slug}'",
                        team.name
                    ));
                }
            }
        }
        Ok(())
    });
}

/// Ensure `parentTeam` references exist and contain no cycle
fn validate_parent_teams(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.teams(), errors, |team, _| {
        let mut visited = Vec::new();
        let mut current = team;
        while let Some(parent) = current.spec.parent_team.as_deref() {
            visited.push(current.name.as_str());
            if visited.contains(&parent) {
                bail!(
                    "team '{parent}' is a parent of itself: {} => {parent}",
                    visited.join(" => ")
                );
            }
            let Some(next) = data.team(parent) else {
                bail!(
                    "team '{}' references parent team '{parent}' which does not exist",
                    current.name
                );
            };
            current = next;
        }
        Ok(())
    });
}

/// Ensure repository owner, writers and readers are declared teams
fn validate_repository_teams(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.repositories(), errors, |repo, errors| {
        let teams = repo
            .owner
            .iter()
            .chain(repo.spec.writers.iter())
            .chain(repo.spec.readers.iter());
        for team in teams {
            if data.team(team).is_none() {
                errors.push(format!(
                    "repository '{}' references team '{team}' which does not exist",
                    repo.name
                ));
            }
        }
        Ok(())
    });
}

/// Ensure a team holds a single role on a repository (the owner already
/// implies write access)
fn validate_repository_roles(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.repositories(), errors, |repo, errors| {
        let mut roles: HashMap<&str, &str> = HashMap::new();
        let assignments = repo
            .owner
            .iter()
            .map(|t| (t.as_str(), "owner"))
            .chain(repo.spec.writers.iter().map(|t| (t.as_str(), "writers")))
            .chain(repo.spec.readers.iter().map(|t| (t.as_str(), "readers")));
        for (team, role) in assignments {
            if let Some(previous) = roles.insert(team, role) {
                errors.push(format!(
                    "repository '{}' lists team '{team}' as both {previous} and {role}",
                    repo.name
                ));
            }
        }
        Ok(())
    });
}

/// Ensure external collaborators of a repository are declared externals
fn validate_repository_external_users(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.repositories(), errors, |repo, errors| {
        for name in repo
            .spec
            .external_user_writers
            .iter()
            .chain(repo.spec.external_user_readers.iter())
        {
            if !data.external_users().contains_key(name) {
                errors.push(format!(
                    "repository '{}' references external user '{name}' which does not exist",
                    repo.name
                ));
            }
        }
        Ok(())
    });
}

/// Ensure configured rulesets exist on disk and their repository patterns
/// compile
fn validate_ruleset_references(data: &Data, errors: &mut Vec<String>) {
    wrapper(data.config().rulesets.iter(), errors, |reference, errors| {
        if !data.rulesets().contains_key(&reference.ruleset) {
            errors.push(format!(
                "the configuration references ruleset '{}' which does not exist",
                reference.ruleset
            ));
        }
        if let Err(err) = Regex::new(&reference.pattern) {
            errors.push(format!(
                "the repository pattern of ruleset '{}' does not compile: {err}",
                reference.ruleset
            ));
        }
        Ok(())
    });
}

/// A user no team references is usually a leftover from a departure
fn lint_unused_users(data: &Data, warnings: &mut Vec<String>) {
    let mut referenced = HashSet::new();
    for team in data.teams() {
        referenced.extend(team.spec.owners.iter());
        referenced.extend(team.spec.members.iter());
    }
    let mut unused: Vec<&String> = data
        .users()
        .keys()
        .filter(|name| !referenced.contains(name))
        .collect();
    unused.sort();
    for name in unused {
        warnings.push(format!("user '{name}' is not referenced by any team"));
    }
}

fn lint_slugged_team_names(data: &Data, warnings: &mut Vec<String>) {
    let mut renamed: Vec<&Team> = data
        .teams()
        .filter(|team| slugify(&team.name) != team.name)
        .collect();
    renamed.sort_by(|a, b| a.name.cmp(&b.name));
    for team in renamed {
        warnings.push(format!(
            "team '{}' is known to the forge as '{}'",
            team.name,
            team.slug()
        ));
    }
}

fn wrapper<T, I, F>(iter: I, errors: &mut Vec<String>, mut func: F)
where
    I: Iterator<Item = T>,
    F: FnMut(T, &mut Vec<String>) -> Result<(), Error>,
{
    for item in iter {
        if let Err(err) = func(item, errors) {
            errors.push(err.to_string());
        }
    }
}
