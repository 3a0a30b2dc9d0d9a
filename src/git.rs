use anyhow::{Context, bail};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const COMMIT_AUTHOR: &str = "orgwarden";
const COMMIT_EMAIL: &str = "orgwarden@localhost";

/// A scratch checkout of the teams repository. Every cycle clones into a
/// fresh temporary directory, so concurrent state on disk never leaks from
/// one cycle into the next; dropping the value removes the tree.
pub(crate) struct TeamsCheckout {
    dir: Scratch,
    branch: String,
}

enum Scratch {
    Temporary(TempDir),
    /// An operator-provided working tree, used by the one-shot commands.
    Existing(PathBuf),
}

impl TeamsCheckout {
    pub(crate) fn clone_repository(url: &str, branch: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir().context("failed to create a scratch directory")?;
        info!("cloning the teams repository into {}", dir.path().display());
        run_git(
            dir.path(),
            &["clone", "--branch", branch, "--", url, "."],
        )?;
        Ok(TeamsCheckout {
            dir: Scratch::Temporary(dir),
            branch: branch.to_string(),
        })
    }

    pub(crate) fn existing(path: &Path, branch: &str) -> Self {
        TeamsCheckout {
            dir: Scratch::Existing(path.to_path_buf()),
            branch: branch.to_string(),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        match &self.dir {
            Scratch::Temporary(dir) => dir.path(),
            Scratch::Existing(path) => path,
        }
    }

    /// Stages the given paths and commits them with the fixed bot
    /// identity, then pushes the branch.
    pub(crate) fn commit_and_push<'a>(
        &self,
        paths: impl Iterator<Item = &'a Path>,
        message: &str,
    ) -> anyhow::Result<()> {
        for path in paths {
            let rel = path.strip_prefix(self.root()).unwrap_or(path);
            run_git(self.root(), &["add", "--all", "--", &rel.display().to_string()])?;
        }
        run_git(
            self.root(),
            &[
                "-c",
                &format!("user.name={COMMIT_AUTHOR}"),
                "-c",
                &format!("user.email={COMMIT_EMAIL}"),
                "commit",
                "--message",
                message,
            ],
        )?;
        run_git(
            self.root(),
            &["push", "origin", &format!("HEAD:{}", self.branch)],
        )?;
        Ok(())
    }

    /// Moves the rolling tag to the current HEAD and force-pushes it.
    pub(crate) fn move_tag(&self, tag: &str) -> anyhow::Result<()> {
        run_git(self.root(), &["tag", "--force", tag])?;
        run_git(
            self.root(),
            &[
                "push",
                "origin",
                "--force",
                &format!("refs/tags/{tag}:refs/tags/{tag}"),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn head(&self) -> anyhow::Result<String> {
        run_git(self.root(), &["rev-parse", "HEAD"]).map(|out| out.trim().to_string())
    }
}

fn run_git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    debug!("running git {args:?} in {}", dir.display());
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .context("failed to spawn git")?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
