//! Branch-deletion watcher: mirrors source repositories that carry
//! cleanup policies and emits a BranchDeleted event for every branch
//! that disappears from the remote.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dx::{BranchDeletedEvent, Manifest};
use crate::git::Repo;
use crate::model::{Event, EventType};
use crate::store::Store;

const POLL_INTERVAL_SECONDS: u64 = 30;
const MIRROR_DEPTH: u32 = 100;
const MANIFEST_DIR: &str = ".gimlet/";

// At most one mirror fetch runs at a time across the process.
static FETCH_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub struct BranchDeleteWorker {
    store: Store,
    cache_path: PathBuf,
    deploy_key_path: Option<PathBuf>,
}

impl std::fmt::Debug for BranchDeleteWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchDeleteWorker")
            .field("cache_path", &self.cache_path)
            .finish_non_exhaustive()
    }
}

impl BranchDeleteWorker {
    pub fn new(
        store: Store,
        cache_path: impl Into<PathBuf>,
        deploy_key_path: Option<PathBuf>,
    ) -> BranchDeleteWorker {
        BranchDeleteWorker {
            store,
            cache_path: cache_path.into(),
            deploy_key_path,
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        loop {
            self.poll();

            tokio::select! {
                _ = stop.changed() => {
                    info!("shutting down branch delete worker");
                    return;
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECONDS)) => {}
            }
        }
    }

    fn poll(&self) {
        let repos = match self.store.repos_with_cleanup_policy() {
            Ok(repos) => repos,
            Err(e) => {
                warn!("could not load repos with cleanup policy: {}", e);
                return;
            }
        };

        for repo_name in repos {
            if let Err(e) = self.poll_repo(&repo_name) {
                warn!("could not poll {}: {}", repo_name, e);
            }
        }
    }

    fn poll_repo(&self, repo_name: &str) -> Result<()> {
        let repo_path = self.mirror_path(repo_name);
        if !repo_path.exists() {
            self.clone_mirror(repo_name, &repo_path)?;
            return Ok(());
        }

        let repo = Repo::open(&repo_path, self.deploy_key_path.clone());
        let deleted_branches = {
            let _guard = FETCH_MUTEX
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            detect_deleted_branches(&repo)?
        };

        for branch in deleted_branches {
            let manifests = extract_manifests_from_branch(&repo, &branch);
            let blob = serde_json::to_string(&BranchDeletedEvent {
                manifests,
                branch: branch.clone(),
            })
            .context("could not serialize branch deleted event")?;

            self.store
                .create_event(Event {
                    id: String::new(),
                    created: 0,
                    event_type: EventType::BranchDeleted,
                    blob,
                    status: String::new(),
                    status_desc: String::new(),
                    repository: repo_name.to_string(),
                    branch: branch.clone(),
                    event: None,
                    source_branch: String::new(),
                    target_branch: String::new(),
                    tag: String::new(),
                    sha: String::new(),
                    artifact_id: String::new(),
                    gitops_hashes: Vec::new(),
                })
                .context("could not store branch deleted event")?;
            info!("stored branch deleted event for {}:{}", repo_name, branch);
        }

        // Only prune after the manifests were lifted off the dead refs.
        let _guard = FETCH_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        repo.fetch_prune()?;
        Ok(())
    }

    fn mirror_path(&self, repo_name: &str) -> PathBuf {
        self.cache_path.join(repo_name.replace('/', "%"))
    }

    fn clone_mirror(&self, repo_name: &str, repo_path: &Path) -> Result<()> {
        std::fs::create_dir_all(
            repo_path
                .parent()
                .context("mirror path has no parent")?,
        )
        .context("couldn't create mirror folder")?;

        let url = if repo_name.contains(':') || repo_name.contains("://") {
            repo_name.to_string()
        } else {
            format!("git@github.com:{}.git", repo_name)
        };

        let _guard = FETCH_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Repo::clone_shallow(&url, repo_path, MIRROR_DEPTH, self.deploy_key_path.clone())
            .with_context(|| format!("couldn't clone {}", url))?;
        Ok(())
    }
}

/// Branches the mirror still tracks but the remote no longer has.
fn detect_deleted_branches(repo: &Repo) -> Result<Vec<String>> {
    repo.fetch()?;
    let known: Vec<String> = repo.remote_branches()?;
    let remote: std::collections::HashSet<String> =
        repo.ls_remote_heads()?.into_iter().collect();

    Ok(known
        .into_iter()
        .filter(|branch| !remote.contains(branch))
        .collect())
}

/// Reads the environment manifests off the tip of a (locally still
/// known) branch.
fn extract_manifests_from_branch(repo: &Repo, branch: &str) -> Vec<Manifest> {
    let rev = format!("origin/{}", branch);
    let files = match repo.ls_tree(&rev, MANIFEST_DIR) {
        Ok(files) => files,
        Err(e) => {
            warn!("could not list manifests on {}: {}", branch, e);
            return Vec::new();
        }
    };

    let mut manifests = Vec::new();
    for file in files {
        if !file.ends_with(".yaml") && !file.ends_with(".yml") {
            continue;
        }
        match repo.file_at(&rev, &file) {
            Ok(Some(content)) => match serde_yaml::from_str::<Manifest>(&content) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("could not parse manifest {} on {}: {}", file, branch, e),
            },
            Ok(None) => {}
            Err(e) => warn!("could not read manifest {} on {}: {}", file, branch, e),
        }
    }
    manifests
}
