use crate::data::Data;
use anyhow::Context;
use orgwarden_data::v1::slugify;
use std::path::Path;

const CODEOWNERS_PATH: &str = ".github/CODEOWNERS";

/// Regenerates `.github/CODEOWNERS` inside a checkout of the teams
/// repository. Returns whether the file changed; committing and pushing is
/// the caller's business.
pub(crate) fn update_codeowners_file(checkout: &Path, data: &Data, org: &str) -> anyhow::Result<bool> {
    let path = checkout.join(CODEOWNERS_PATH);
    let expected = generate_codeowners_content(data, org);
    let actual = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).context("cannot read CODEOWNERS"),
    };
    if actual == expected {
        return Ok(false);
    }
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, expected).context("cannot write CODEOWNERS")?;
    Ok(true)
}

/// Check that `.github/CODEOWNERS` matches the team set, for CI.
pub(crate) fn check_codeowners(checkout: &Path, data: &Data, org: &str) -> anyhow::Result<()> {
    let expected = generate_codeowners_content(data, org);
    let actual = std::fs::read_to_string(checkout.join(CODEOWNERS_PATH))
        .context("cannot read CODEOWNERS")?;
    if expected != actual {
        anyhow::bail!(
            "CODEOWNERS content is not up-to-date. Regenerate it using `orgwarden codeowners`."
        );
    }
    Ok(())
}

/// The admin team owns everything by default; each team's directory is
/// additionally owned by that team's owners, so owners approve changes to
/// their own team definition without pulling in the admins.
fn generate_codeowners_content(data: &Data, org: &str) -> String {
    use std::fmt::Write;

    let admin_slug = slugify(&data.config().admin_team);

    let mut codeowners = String::new();
    writeln!(codeowners, "# DO NOT MODIFY THIS FILE MANUALLY").unwrap();
    writeln!(codeowners, "* @{org}/{admin_slug}").unwrap();

    let mut team_names: Vec<&str> = data.teams().map(|t| t.name.as_str()).collect();
    team_names.sort();

    for name in team_names {
        writeln!(
            codeowners,
            "/teams/{name}/* @{org}/{}-owners @{org}/{admin_slug}",
            slugify(name)
        )
        .unwrap();
    }

    codeowners
}
