//! Release state reporter: exports one gauge sample per (env, app)
//! pair from the cached gitops repository.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::git::{gitops, RepoCache};
use crate::observability::metrics;

const REPORT_INTERVAL_SECONDS: u64 = 30;

pub struct ReleaseStateWorker {
    repo_cache: Arc<RepoCache>,
    gitops_repo: String,
}

impl std::fmt::Debug for ReleaseStateWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseStateWorker")
            .field("gitops_repo", &self.gitops_repo)
            .finish_non_exhaustive()
    }
}

impl ReleaseStateWorker {
    pub fn new(repo_cache: Arc<RepoCache>, gitops_repo: &str) -> ReleaseStateWorker {
        ReleaseStateWorker {
            repo_cache,
            gitops_repo: gitops_repo.to_string(),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        loop {
            self.report();

            tokio::select! {
                _ = stop.changed() => {
                    info!("shutting down release state worker");
                    return;
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(REPORT_INTERVAL_SECONDS)) => {}
            }
        }
    }

    fn report(&self) {
        let snapshot = self.repo_cache.snapshot_for_read();
        let repo = snapshot.repo();

        let envs = match gitops::envs(snapshot.path()) {
            Ok(envs) => envs,
            Err(e) => {
                error!("cannot get envs: {}", e);
                return;
            }
        };

        metrics::reset_release_state();
        for env in envs {
            // One broken environment must not hide the others.
            let releases = match gitops::status(snapshot.path(), &env, None) {
                Ok(releases) => releases,
                Err(e) => {
                    error!("cannot get status of {}: {}", env, e);
                    continue;
                }
            };

            for (app, release) in releases {
                let last_commit = match repo.last_commit_touching(&format!("{}/{}/", env, app)) {
                    Ok(commit) => commit,
                    Err(e) => {
                        error!("cannot get last commit of {}/{}: {}", env, app, e);
                        continue;
                    }
                };
                let Some(commit) = last_commit else { continue };

                let created = Utc
                    .timestamp_opt(commit.created, 0)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                let version = release.version.unwrap_or_default();
                let gitops_commit_url = format!(
                    "https://github.com/{}/commit/{}",
                    self.gitops_repo, commit.sha
                );
                metrics::set_release_state(
                    &env,
                    &app,
                    &version.url,
                    &version.message,
                    &gitops_commit_url,
                    &created,
                );
            }
        }
    }
}
