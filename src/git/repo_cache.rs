//! Cache of the gitops repository working copy.
//!
//! Owns a single on-disk clone. Readers get refcounted snapshots that
//! stay valid while they hold them; updates clone fresh and swap the
//! directory atomically, so a reader never observes a half-updated tree.
//! Writers get a private copy of the clone and discard it after push.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use walkdir::WalkDir;

use super::cli::Repo;

const SYNC_INTERVAL_SECONDS: u64 = 30;

struct CachedClone {
    // Holds the directory on disk; dropped (and deleted) once the last
    // snapshot referencing it goes away.
    dir: TempDir,
}

/// A stable point-in-time view of the gitops repository.
#[derive(Clone)]
pub struct ReadSnapshot {
    clone: Arc<CachedClone>,
}

impl std::fmt::Debug for ReadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSnapshot")
            .field("path", &self.clone.dir.path())
            .finish()
    }
}

impl ReadSnapshot {
    pub fn path(&self) -> &Path {
        self.clone.dir.path()
    }

    pub fn repo(&self) -> Repo {
        Repo::open(self.clone.dir.path(), None)
    }
}

pub struct RepoCache {
    gitops_repo: String,
    deploy_key_path: Option<PathBuf>,
    current: RwLock<Arc<CachedClone>>,
    invalidate_tx: mpsc::Sender<()>,
    invalidate_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for RepoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoCache")
            .field("gitops_repo", &self.gitops_repo)
            .finish_non_exhaustive()
    }
}

impl RepoCache {
    /// Clones the gitops repository and returns the cache around it.
    pub fn new(gitops_repo: &str, deploy_key_path: Option<PathBuf>) -> Result<RepoCache> {
        let url = ssh_url(gitops_repo);
        let clone = clone_to_tmp(&url, deploy_key_path.as_ref())?;

        // Capacity of one: invalidations between ticks coalesce, and the
        // send never blocks the caller.
        let (invalidate_tx, invalidate_rx) = mpsc::channel(1);

        Ok(RepoCache {
            gitops_repo: url,
            deploy_key_path,
            current: RwLock::new(Arc::new(clone)),
            invalidate_tx,
            invalidate_rx: tokio::sync::Mutex::new(invalidate_rx),
        })
    }

    /// A read snapshot reflecting the cache at the time of the call.
    /// Concurrent updates do not disturb it.
    pub fn snapshot_for_read(&self) -> ReadSnapshot {
        let current = self
            .current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ReadSnapshot {
            clone: Arc::clone(&current),
        }
    }

    /// A private copy of the cached clone for mutation. Release with
    /// [`RepoCache::discard`] once the push happened (or failed).
    pub fn checkout_for_write(&self) -> Result<(Repo, PathBuf)> {
        let snapshot = self.snapshot_for_read();
        let dest = tempfile::Builder::new()
            .prefix("gitops-write-")
            .tempdir()
            .context("cannot create write checkout dir")?
            .keep();

        copy_dir(snapshot.path(), &dest)?;
        Ok((Repo::open(&dest, self.deploy_key_path.clone()), dest))
    }

    pub fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_dir_all(path) {
            error!("could not clean up write checkout at {}: {}", path.display(), e);
        }
    }

    /// Signals that the remote advanced; the next tick fetches
    /// immediately. Never blocks, repeated signals coalesce.
    pub fn invalidate(&self) {
        let _ = self.invalidate_tx.try_send(());
    }

    /// Background loop: refresh on a fixed schedule or on invalidation,
    /// until the stop channel flips.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut invalidate_rx = self.invalidate_rx.lock().await;
        loop {
            self.sync();

            tokio::select! {
                _ = stop.changed() => {
                    info!("shutting down gitops repo cache");
                    return;
                }
                _ = invalidate_rx.recv() => {
                    info!("received cache invalidate message");
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(SYNC_INTERVAL_SECONDS)) => {}
            }
        }
    }

    fn sync(&self) {
        match self.remote_has_changes() {
            Ok(false) => {}
            Ok(true) => {
                info!("gitops repo cache is stale, updating");
                match clone_to_tmp(&self.gitops_repo, self.deploy_key_path.as_ref()) {
                    Ok(fresh) => {
                        let mut current = self
                            .current
                            .write()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        *current = Arc::new(fresh);
                    }
                    Err(e) => error!("could not update gitops repo cache: {}", e),
                }
            }
            // Keep serving the stale snapshot, retry on the next tick.
            Err(e) => error!("could not check gitops remote: {}", e),
        }
    }

    fn remote_has_changes(&self) -> Result<bool> {
        let snapshot = self.snapshot_for_read();
        let repo = Repo::open(snapshot.path(), self.deploy_key_path.clone());
        let remote_head = repo.remote_head()?;
        match remote_head {
            Some(remote) => Ok(remote != repo.head()?),
            None => Ok(false),
        }
    }
}

/// Expands an `org/repo` shorthand into an SSH url; full references are
/// used as given.
fn ssh_url(gitops_repo: &str) -> String {
    if gitops_repo.contains(':') || gitops_repo.contains("://") || Path::new(gitops_repo).is_absolute()
    {
        gitops_repo.to_string()
    } else {
        format!("git@github.com:{}.git", gitops_repo)
    }
}

fn clone_to_tmp(url: &str, deploy_key_path: Option<&PathBuf>) -> Result<CachedClone> {
    let dir = tempfile::Builder::new()
        .prefix("gitops-cache-")
        .tempdir()
        .context("cannot create cache dir")?;
    Repo::clone(url, dir.path(), deploy_key_path.cloned())
        .with_context(|| format!("cannot clone gitops repo {}", url))?;
    Ok(CachedClone { dir })
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.context("cannot walk cached clone")?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .context("walked entry outside the clone")?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("cannot create {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("cannot copy {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::cli::testutil::*;

    #[test]
    fn test_snapshot_and_write_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let (seed, bare) = init_with_bare_origin(dir.path());
        commit_file(&seed, "staging/release.json", "{}\n", "seed");
        seed.push().unwrap();

        let cache = RepoCache::new(&bare.to_string_lossy(), None).unwrap();

        let snapshot = cache.snapshot_for_read();
        assert!(snapshot.path().join("staging/release.json").exists());

        let (write_repo, write_path) = cache.checkout_for_write().unwrap();
        assert!(write_path.join("staging/release.json").exists());
        assert!(write_repo.is_clean().unwrap());

        // Mutating the write checkout leaves read snapshots untouched.
        std::fs::write(write_path.join("staging/release.json"), "changed\n").unwrap();
        let unchanged =
            std::fs::read_to_string(snapshot.path().join("staging/release.json")).unwrap();
        assert_eq!("{}\n", unchanged);

        cache.discard(&write_path);
        assert!(!write_path.exists());
    }

    #[test]
    fn test_write_checkout_can_push_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (seed, bare) = init_with_bare_origin(dir.path());
        commit_file(&seed, "staging/release.json", "{}\n", "seed");
        seed.push().unwrap();

        let cache = RepoCache::new(&bare.to_string_lossy(), None).unwrap();
        let (write_repo, write_path) = cache.checkout_for_write().unwrap();

        std::fs::write(write_path.join("new-file"), "content\n").unwrap();
        write_repo.add_all().unwrap();
        let sha = write_repo.commit("new commit").unwrap();
        write_repo.push().unwrap();
        cache.discard(&write_path);

        let origin = Repo::open(&bare, None);
        assert_eq!(sha, origin.head().unwrap());
    }

    #[test]
    fn test_invalidate_is_non_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (seed, bare) = init_with_bare_origin(dir.path());
        commit_file(&seed, "file", "0\n", "seed");
        seed.push().unwrap();

        let cache = RepoCache::new(&bare.to_string_lossy(), None).unwrap();
        // No consumer is running; repeated signals must still not block.
        cache.invalidate();
        cache.invalidate();
        cache.invalidate();
    }

    #[test]
    fn test_sync_picks_up_remote_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (seed, bare) = init_with_bare_origin(dir.path());
        commit_file(&seed, "file", "0\n", "seed");
        seed.push().unwrap();

        let cache = RepoCache::new(&bare.to_string_lossy(), None).unwrap();
        let stale = cache.snapshot_for_read();

        let new_sha = commit_file(&seed, "file", "1\n", "update");
        seed.push().unwrap();

        cache.sync();

        let fresh = cache.snapshot_for_read();
        assert_eq!(new_sha, fresh.repo().head().unwrap());
        // The old snapshot still serves its original state.
        assert_eq!("0\n", std::fs::read_to_string(stale.path().join("file")).unwrap());
    }
}
