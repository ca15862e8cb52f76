//! Reads and writes of the gitops repository layout:
//!
//! ```text
//! <env>/
//!   release.json              latest release written to this env
//!   <app>/
//!     release.json            latest release for this app
//!     <rendered-chart-files>.yaml
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

use crate::dx::Release;

use super::cli::Repo;

pub const REVERT_MARKER: &str = "This reverts commit";

/// Commits rendered chart files and the release record for one
/// (env, app) pair.
///
/// The app directory is deleted and recreated so stale output of
/// previous chart versions is purged. Returns the new commit sha, or
/// None when the rendered output matches the tree exactly.
pub fn commit_rendered_files(
    repo: &Repo,
    files: &BTreeMap<String, String>,
    env: &str,
    app: &str,
    release_json: &str,
) -> Result<Option<String>> {
    ensure_clean(repo)?;

    let app_dir = repo.path().join(env).join(app);
    if app_dir.exists() {
        std::fs::remove_dir_all(&app_dir).context("cannot clear app dir")?;
    }
    std::fs::create_dir_all(&app_dir).context("cannot create app dir")?;

    for (name, content) in files {
        std::fs::write(app_dir.join(name), with_trailing_newline(content))
            .with_context(|| format!("cannot write {}", name))?;
    }

    let release_content = with_trailing_newline(release_json);
    std::fs::write(repo.path().join(env).join("release.json"), &release_content)
        .context("cannot write env release.json")?;
    std::fs::write(app_dir.join("release.json"), &release_content)
        .context("cannot write app release.json")?;

    repo.add_all()?;
    if repo.is_clean()? {
        return Ok(None);
    }

    let sha = repo.commit(&format!("[Gimlet] {}/{} automated deploy", env, app))?;
    Ok(Some(sha))
}

/// Deletes the `<env>/<app>/` directory and commits the removal.
/// Returns None when there is nothing to delete.
pub fn delete_app_dir(repo: &Repo, env: &str, app: &str) -> Result<Option<String>> {
    ensure_clean(repo)?;

    let app_dir = repo.path().join(env).join(app);
    if !app_dir.exists() {
        return Ok(None);
    }
    std::fs::remove_dir_all(&app_dir).context("cannot delete app dir")?;

    repo.add_all()?;
    if repo.is_clean()? {
        return Ok(None);
    }

    let sha = repo.commit(&format!("[Gimlet] {}/{} automated cleanup", env, app))?;
    Ok(Some(sha))
}

// Uncommitted changes mean a concurrent writer; fatal for this attempt.
fn ensure_clean(repo: &Repo) -> Result<()> {
    if !repo.is_clean()? {
        anyhow::bail!("there are staged changes in the gitops repo. Commit them first then try again");
    }
    Ok(())
}

fn with_trailing_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{}\n", content)
    }
}

/// Environments in a checked-out tree: top-level directories that carry
/// a `release.json` at their root.
pub fn envs(root: &Path) -> Result<Vec<String>> {
    let mut envs = Vec::new();
    for entry in std::fs::read_dir(root).context("cannot list gitops root")? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.path().join("release.json").exists() {
            envs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    envs.sort();
    Ok(envs)
}

/// The latest release of every app in an environment, read from the
/// per-app `release.json` files. With `app` given, only that app.
pub fn status(root: &Path, env: &str, app: Option<&str>) -> Result<BTreeMap<String, Release>> {
    let env_dir = root.join(env);
    let mut releases = BTreeMap::new();
    if !env_dir.exists() {
        return Ok(releases);
    }

    for entry in std::fs::read_dir(&env_dir).context("cannot list env dir")? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(app) = app {
            if name != app {
                continue;
            }
        }
        let release_file = entry.path().join("release.json");
        if !release_file.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&release_file)
            .with_context(|| format!("cannot read {}", release_file.display()))?;
        let release: Release = serde_json::from_str(&content)
            .with_context(|| format!("cannot parse {}", release_file.display()))?;
        releases.insert(name, release);
    }

    Ok(releases)
}

/// Walks the commit history of an environment (or one app in it) and
/// returns the releases recorded there, most recent first.
pub fn releases(
    repo: &Repo,
    env: &str,
    app: Option<&str>,
    git_repo: Option<&str>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: usize,
) -> Result<Vec<Release>> {
    let (log_path, release_path) = match app {
        Some(app) => (
            format!("{}/{}/", env, app),
            format!("{}/{}/release.json", env, app),
        ),
        None => (format!("{}/", env), format!("{}/release.json", env)),
    };

    let mut releases = Vec::new();
    for commit in repo.log_touching(&log_path)? {
        if limit > 0 && releases.len() >= limit {
            break;
        }
        if commit.message.contains("Revert \"") {
            continue;
        }
        if let Some(since) = since {
            if commit.created < since.timestamp() {
                continue;
            }
        }
        if let Some(until) = until {
            if commit.created >= until.timestamp() {
                continue;
            }
        }

        let Some(content) = repo.file_at(&commit.sha, &release_path)? else {
            continue;
        };
        let Ok(mut release) = serde_json::from_str::<Release>(&content) else {
            continue;
        };

        if let Some(git_repo) = git_repo {
            let repository = release
                .version
                .as_ref()
                .map(|v| v.repository_name.as_str())
                .unwrap_or_default();
            if repository != git_repo {
                continue;
            }
        }

        release.created = commit.created;
        release.gitops_ref = commit.sha.clone();
        release.rolled_back = !repo
            .log_grep(&log_path, &format!("{} {}", REVERT_MARKER, commit.sha))?
            .is_empty();
        releases.push(release);
    }

    Ok(releases)
}
