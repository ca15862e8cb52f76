//! The gitops writer: turns one (artifact, manifest) pair into at most
//! one commit on the gitops repository.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use crate::dx::{Artifact, Manifest, Release};
use crate::git::{gitops, RepoCache};
use crate::helm;

/// Renders a manifest and commits the result under `<env>/<app>/`,
/// together with the release audit record. Returns the pushed commit
/// sha, or None when the tree already matched the rendered output.
///
/// Rendering is deterministic given (manifest, artifact context), so a
/// failed push is safe to retry by reprocessing the event.
pub fn process_deploy(
    repo_cache: &RepoCache,
    manifest: &Manifest,
    artifact: &Artifact,
    triggered_by: &str,
    gitops_repo: &str,
    chart_deploy_key_path: Option<&Path>,
) -> Result<Option<String>> {
    let mut resolved = manifest.clone();
    resolved
        .resolve_vars(&artifact.vars())
        .with_context(|| format!("cannot resolve manifest vars for {}", manifest.app))?;

    let files = helm::template(&resolved, chart_deploy_key_path)
        .with_context(|| format!("cannot render manifest for {}", resolved.app))?;

    let release = Release {
        app: resolved.app.clone(),
        env: resolved.env.clone(),
        artifact_id: artifact.id.clone(),
        triggered_by: triggered_by.to_string(),
        version: Some(artifact.version.clone()),
        gitops_repo: gitops_repo.to_string(),
        created: Utc::now().timestamp(),
        ..Default::default()
    };
    let release_json =
        serde_json::to_string(&release).context("cannot serialize release record")?;

    let (repo, checkout_path) = repo_cache.checkout_for_write()?;
    let result = (|| {
        let sha = gitops::commit_rendered_files(
            &repo,
            &files,
            &resolved.env,
            &resolved.app,
            &release_json,
        )?;
        if sha.is_some() {
            repo.push().context("cannot push gitops changes")?;
        }
        Ok(sha)
    })();
    repo_cache.discard(&checkout_path);
    result
}

/// Deletes `<env>/<app>/` after the branch feeding it disappeared.
/// Returns the cleanup commit sha, or None when there was nothing to
/// delete.
pub fn process_cleanup(
    repo_cache: &RepoCache,
    env: &str,
    app: &str,
) -> Result<Option<String>> {
    let (repo, checkout_path) = repo_cache.checkout_for_write()?;
    let result = (|| {
        let sha = gitops::delete_app_dir(&repo, env, app)?;
        if sha.is_some() {
            repo.push().context("cannot push gitops changes")?;
        }
        Ok(sha)
    })();
    repo_cache.discard(&checkout_path);
    result
}
