//! Rollback executor: returns an (env, app) path to a prior state with
//! native revert commits.

use anyhow::{Context, Result};
use std::collections::HashSet;

use crate::dx::RollbackRequest;
use crate::git::gitops::REVERT_MARKER;
use crate::git::{Repo, RepoCache};

/// Walks the `<env>/<app>/` history from HEAD back to (excluding) the
/// target sha and reverts every commit on the way that is not a revert
/// itself and has not been reverted before. Reverts are applied newest
/// first. Returns the shas of all commits created by the rollback.
pub fn process_rollback(repo_cache: &RepoCache, request: &RollbackRequest) -> Result<Vec<String>> {
    let (repo, checkout_path) = repo_cache.checkout_for_write()?;
    let result = rollback(&repo, request);
    repo_cache.discard(&checkout_path);
    result
}

fn rollback(repo: &Repo, request: &RollbackRequest) -> Result<Vec<String>> {
    let head_before = repo.head()?;
    let path = format!("{}/{}/", request.env, request.app);

    let revert_commits: HashSet<String> =
        repo.log_grep(&path, REVERT_MARKER)?.into_iter().collect();

    let mut to_revert = Vec::new();
    for commit in repo.log_touching(&path)? {
        if commit.sha == request.target_sha {
            break;
        }
        if revert_commits.contains(&commit.sha) {
            continue;
        }
        to_revert.push(commit.sha);
    }

    for sha in &to_revert {
        let already_reverted = !repo
            .log_grep(&path, &format!("{} {}", REVERT_MARKER, sha))?
            .is_empty();
        if already_reverted {
            continue;
        }
        if let Err(e) = repo.revert(sha) {
            // No partial pushes: the conflict aborts the whole rollback.
            let _ = repo.revert_abort();
            return Err(e).with_context(|| format!("cannot revert {}", sha));
        }
    }

    repo.push().context("cannot push rollback commits")?;
    repo.commits_since(&head_before)
        .context("cannot collect rollback commits")
}
