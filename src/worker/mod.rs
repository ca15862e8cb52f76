//! # Event worker
//!
//! Single-threaded consumer of the event store. Polls unprocessed
//! events in creation order, dispatches them per type, records the
//! terminal status together with the produced gitops hashes, broadcasts
//! notifications and invalidates the repo cache after writes.
//!
//! Exactly one worker instance runs; it is the only writer of the
//! gitops repository. At-least-once semantics: a crash mid-dispatch
//! leaves the event in `new` and the next start retries it. Writes are
//! safe to retry because rendering is deterministic and the clean-tree
//! precondition detects concurrent writers.

pub mod branch_delete;
pub mod events;
pub mod gitops;
pub mod release_state;
pub mod rollback;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dx::{BranchDeletedEvent, Manifest, ReleaseRequest, RollbackRequest};
use crate::git::RepoCache;
use crate::model::{Event, EventType, STATUS_ERROR, STATUS_PROCESSED};
use crate::notifications::{Message, NotificationsManager};
use crate::observability::metrics;
use crate::policy;
use crate::store::Store;

use events::{DeleteEvent, DeployEvent, RollbackEvent, Status};

const POLL_INTERVAL_MILLIS: u64 = 100;

#[derive(Debug, Default)]
struct DispatchOutcome {
    gitops_hashes: Vec<String>,
    error: Option<String>,
    messages: Vec<Message>,
}

impl DispatchOutcome {
    fn from_error(error: impl std::fmt::Display) -> DispatchOutcome {
        DispatchOutcome {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

pub struct EventWorker {
    store: Store,
    repo_cache: Arc<RepoCache>,
    notifications: Arc<NotificationsManager>,
    gitops_repo: String,
    chart_deploy_key_path: Option<PathBuf>,
}

impl std::fmt::Debug for EventWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWorker")
            .field("gitops_repo", &self.gitops_repo)
            .finish_non_exhaustive()
    }
}

impl EventWorker {
    pub fn new(
        store: Store,
        repo_cache: Arc<RepoCache>,
        notifications: Arc<NotificationsManager>,
        gitops_repo: &str,
        chart_deploy_key_path: Option<PathBuf>,
    ) -> EventWorker {
        EventWorker {
            store,
            repo_cache,
            notifications,
            gitops_repo: gitops_repo.to_string(),
            chart_deploy_key_path,
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!("starting event worker");
        loop {
            match self.store.unprocessed_events() {
                Ok(events) => {
                    // Strictly sequential: no two writes may overlap.
                    for event in events {
                        self.process_event(&event);
                    }
                }
                Err(e) => {
                    error!("could not fetch unprocessed events: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }

            tokio::select! {
                _ = stop.changed() => {
                    info!("shutting down event worker");
                    return;
                }
                () = tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MILLIS)) => {}
            }
        }
    }

    /// Runs one event through dispatch and records the outcome. The
    /// event transitions new -> processed | error exactly once; if the
    /// status write fails the event stays `new` and is retried.
    pub fn process_event(&self, event: &Event) {
        let start = Instant::now();
        let outcome = self.dispatch(event);

        let (status, status_desc) = match &outcome.error {
            Some(desc) => (STATUS_ERROR, desc.as_str()),
            None => (STATUS_PROCESSED, ""),
        };

        if let Err(e) =
            self.store
                .update_event_status(&event.id, status, status_desc, &outcome.gitops_hashes)
        {
            error!("could not update event status of {}: {}", event.id, e);
            return;
        }

        metrics::increment_events_processed();
        metrics::observe_event_processing_duration(start.elapsed().as_secs_f64());
        if outcome.error.is_some() {
            metrics::increment_event_errors();
        }

        for message in outcome.messages {
            self.notifications.broadcast(message);
        }

        if !outcome.gitops_hashes.is_empty() {
            metrics::increment_writes(outcome.gitops_hashes.len() as u64);
            self.repo_cache.invalidate();
        }
    }

    fn dispatch(&self, event: &Event) -> DispatchOutcome {
        match event.event_type {
            EventType::Artifact => self.process_artifact_event(event),
            EventType::Release => self.process_release_event(event),
            EventType::Rollback => self.process_rollback_event(event),
            EventType::BranchDeleted => self.process_branch_deleted_event(event),
        }
    }

    fn process_artifact_event(&self, event: &Event) -> DispatchOutcome {
        let artifact = match event.as_artifact() {
            Ok(artifact) => artifact,
            Err(e) => return DispatchOutcome::from_error(e),
        };

        let mut outcome = DispatchOutcome::default();
        let mut attempted = 0;
        let mut failures = Vec::new();

        for manifest in &artifact.environments {
            if !policy::deploy_triggered(&artifact, manifest.deploy.as_ref()) {
                continue;
            }
            attempted += 1;
            self.deploy_manifest(manifest, &artifact, "policy", &mut outcome, &mut failures);
        }

        // A single failing manifest does not fail the event; all of
        // them failing does.
        if attempted > 0 && failures.len() == attempted {
            outcome.error = Some(failures.join("; "));
        }
        outcome
    }

    fn process_release_event(&self, event: &Event) -> DispatchOutcome {
        let request: ReleaseRequest = match serde_json::from_str(&event.blob) {
            Ok(request) => request,
            Err(e) => return DispatchOutcome::from_error(e),
        };

        let artifact = match self.store.artifact(&request.artifact_id) {
            Ok(Some(artifact_event)) => match artifact_event.as_artifact() {
                Ok(artifact) => artifact,
                Err(e) => return self.release_failure(&request, e),
            },
            Ok(None) => {
                return self.release_failure(
                    &request,
                    format!("artifact not found: {}", request.artifact_id),
                )
            }
            Err(e) => return self.release_failure(&request, e),
        };

        let mut outcome = DispatchOutcome::default();
        let mut attempted = 0;
        let mut failures = Vec::new();

        for manifest in &artifact.environments {
            if manifest.env != request.env {
                continue;
            }
            if let Some(app) = &request.app {
                if &manifest.app != app {
                    continue;
                }
            }
            attempted += 1;
            self.deploy_manifest(
                manifest,
                &artifact,
                &request.triggered_by,
                &mut outcome,
                &mut failures,
            );
        }

        if attempted > 0 && failures.len() == attempted {
            outcome.error = Some(failures.join("; "));
        }
        outcome
    }

    // Failure before any manifest was attempted still yields one
    // user-visible notification.
    fn release_failure(
        &self,
        request: &ReleaseRequest,
        error: impl std::fmt::Display,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::from_error(&error);
        outcome.messages.push(Message::Deploy(DeployEvent {
            manifest: Manifest {
                app: request.app.clone().unwrap_or_default(),
                env: request.env.clone(),
                ..Default::default()
            },
            artifact: Default::default(),
            triggered_by: request.triggered_by.clone(),
            status: Status::Failure,
            status_desc: error.to_string(),
            gitops_ref: String::new(),
            gitops_repo: self.gitops_repo.clone(),
        }));
        outcome
    }

    fn deploy_manifest(
        &self,
        manifest: &Manifest,
        artifact: &crate::dx::Artifact,
        triggered_by: &str,
        outcome: &mut DispatchOutcome,
        failures: &mut Vec<String>,
    ) {
        match gitops::process_deploy(
            &self.repo_cache,
            manifest,
            artifact,
            triggered_by,
            &self.gitops_repo,
            self.chart_deploy_key_path.as_deref(),
        ) {
            Ok(sha) => {
                if let Some(sha) = &sha {
                    outcome.gitops_hashes.push(sha.clone());
                }
                outcome.messages.push(Message::Deploy(DeployEvent {
                    manifest: manifest.clone(),
                    artifact: artifact.clone(),
                    triggered_by: triggered_by.to_string(),
                    status: Status::Success,
                    status_desc: String::new(),
                    gitops_ref: sha.unwrap_or_default(),
                    gitops_repo: self.gitops_repo.clone(),
                }));
            }
            Err(e) => {
                warn!("cannot deploy {}/{}: {:#}", manifest.env, manifest.app, e);
                failures.push(format!("{}: {:#}", manifest.app, e));
                outcome.messages.push(Message::Deploy(DeployEvent {
                    manifest: manifest.clone(),
                    artifact: artifact.clone(),
                    triggered_by: triggered_by.to_string(),
                    status: Status::Failure,
                    status_desc: format!("{:#}", e),
                    gitops_ref: String::new(),
                    gitops_repo: self.gitops_repo.clone(),
                }));
            }
        }
    }

    fn process_rollback_event(&self, event: &Event) -> DispatchOutcome {
        let request: RollbackRequest = match serde_json::from_str(&event.blob) {
            Ok(request) => request,
            Err(e) => return DispatchOutcome::from_error(e),
        };

        match rollback::process_rollback(&self.repo_cache, &request) {
            Ok(gitops_hashes) => DispatchOutcome {
                messages: vec![Message::Rollback(RollbackEvent {
                    rollback_request: request,
                    gitops_refs: gitops_hashes.clone(),
                    gitops_repo: self.gitops_repo.clone(),
                    status: Status::Success,
                    status_desc: String::new(),
                })],
                gitops_hashes,
                error: None,
            },
            Err(e) => {
                let desc = format!("{:#}", e);
                DispatchOutcome {
                    gitops_hashes: Vec::new(),
                    error: Some(desc.clone()),
                    messages: vec![Message::Rollback(RollbackEvent {
                        rollback_request: request,
                        gitops_refs: Vec::new(),
                        gitops_repo: self.gitops_repo.clone(),
                        status: Status::Failure,
                        status_desc: desc,
                    })],
                }
            }
        }
    }

    fn process_branch_deleted_event(&self, event: &Event) -> DispatchOutcome {
        let branch_deleted: BranchDeletedEvent = match serde_json::from_str(&event.blob) {
            Ok(branch_deleted) => branch_deleted,
            Err(e) => return DispatchOutcome::from_error(e),
        };

        let mut outcome = DispatchOutcome::default();
        let mut attempted = 0;
        let mut failures = Vec::new();

        for manifest in &branch_deleted.manifests {
            if !policy::cleanup_triggered(&branch_deleted.branch, manifest.cleanup.as_ref()) {
                continue;
            }
            attempted += 1;

            // Preview app names are templated with the branch they
            // belong to; resolve before touching the tree.
            let mut resolved = manifest.clone();
            let vars = std::collections::HashMap::from([(
                "BRANCH".to_string(),
                branch_deleted.branch.clone(),
            )]);
            if let Err(e) = resolved.resolve_vars(&vars) {
                failures.push(format!("{}: {:#}", manifest.app, e));
                continue;
            }

            match gitops::process_cleanup(&self.repo_cache, &resolved.env, &resolved.app) {
                Ok(sha) => {
                    if let Some(sha) = &sha {
                        outcome.gitops_hashes.push(sha.clone());
                    }
                    outcome.messages.push(Message::Delete(DeleteEvent {
                        env: resolved.env.clone(),
                        app: resolved.app.clone(),
                        branch: branch_deleted.branch.clone(),
                        gitops_ref: sha,
                        gitops_repo: self.gitops_repo.clone(),
                    }));
                }
                Err(e) => {
                    warn!(
                        "cannot clean up {}/{}: {:#}",
                        resolved.env, resolved.app, e
                    );
                    failures.push(format!("{}: {:#}", resolved.app, e));
                }
            }
        }

        if attempted > 0 && failures.len() == attempted {
            outcome.error = Some(failures.join("; "));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dx::{Artifact, Cleanup, CleanupEvent, Deploy, GitEvent, Version};
    use crate::git::cli::testutil::*;
    use crate::git::Repo;
    use crate::model::STATUS_NEW;

    fn worker_with_origin(dir: &std::path::Path) -> (EventWorker, Store, std::path::PathBuf) {
        let (seed, bare) = init_with_bare_origin(dir);
        commit_file(&seed, ".keep", "", "init");
        seed.push().unwrap();

        let store = Store::new_in_memory().unwrap();
        let cache = Arc::new(RepoCache::new(&bare.to_string_lossy(), None).unwrap());
        let notifications = Arc::new(NotificationsManager::new());
        let worker = EventWorker::new(store.clone(), cache, notifications, "acme/gitops", None);
        (worker, store, bare)
    }

    #[test]
    fn test_artifact_event_without_matching_policy_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, store, _) = worker_with_origin(dir.path());

        let artifact = Artifact {
            id: "my-app-1".to_string(),
            version: Version {
                branch: "feature".to_string(),
                event: GitEvent::Push,
                ..Default::default()
            },
            environments: vec![Manifest {
                app: "my-app".to_string(),
                env: "staging".to_string(),
                deploy: Some(Deploy {
                    branch: "master".to_string(),
                    event: Some(GitEvent::Push),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let event = store
            .create_event(Event::from_artifact(&artifact).unwrap())
            .unwrap();

        worker.process_event(&event);

        let updated = store.event(&event.id).unwrap().unwrap();
        assert_eq!(STATUS_PROCESSED, updated.status);
        assert!(updated.gitops_hashes.is_empty());
    }

    #[test]
    fn test_release_event_with_unknown_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, store, _) = worker_with_origin(dir.path());

        let request = ReleaseRequest {
            env: "staging".to_string(),
            app: None,
            artifact_id: "no-such-artifact".to_string(),
            triggered_by: "jane".to_string(),
        };
        let event = store
            .create_event(Event {
                id: String::new(),
                created: 0,
                event_type: EventType::Release,
                blob: serde_json::to_string(&request).unwrap(),
                status: STATUS_NEW.to_string(),
                status_desc: String::new(),
                repository: String::new(),
                branch: String::new(),
                event: None,
                source_branch: String::new(),
                target_branch: String::new(),
                tag: String::new(),
                sha: String::new(),
                artifact_id: String::new(),
                gitops_hashes: Vec::new(),
            })
            .unwrap();

        worker.process_event(&event);

        let updated = store.event(&event.id).unwrap().unwrap();
        assert_eq!(STATUS_ERROR, updated.status);
        assert!(updated.status_desc.contains("artifact not found"));
    }

    #[test]
    fn test_branch_deleted_event_cleans_up_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (seed, bare) = init_with_bare_origin(dir.path());
        commit_file(
            &seed,
            "staging/preview-feature-x/deployment.yaml",
            "kind: Deployment\n",
            "[Gimlet] staging/preview-feature-x automated deploy",
        );
        seed.push().unwrap();

        let store = Store::new_in_memory().unwrap();
        let cache = Arc::new(RepoCache::new(&bare.to_string_lossy(), None).unwrap());
        let notifications = Arc::new(NotificationsManager::new());
        let worker = EventWorker::new(store.clone(), cache, notifications, "acme/gitops", None);

        let branch_deleted = BranchDeletedEvent {
            branch: "feature/x".to_string(),
            manifests: vec![Manifest {
                app: "preview-{{ .BRANCH | sanitizeDNSName }}".to_string(),
                env: "staging".to_string(),
                cleanup: Some(Cleanup {
                    event: CleanupEvent::BranchDeleted,
                    branch: "feature/*".to_string(),
                }),
                ..Default::default()
            }],
        };
        let event = store
            .create_event(Event {
                id: String::new(),
                created: 0,
                event_type: EventType::BranchDeleted,
                blob: serde_json::to_string(&branch_deleted).unwrap(),
                status: STATUS_NEW.to_string(),
                status_desc: String::new(),
                repository: "acme/my-app".to_string(),
                branch: "feature/x".to_string(),
                event: None,
                source_branch: String::new(),
                target_branch: String::new(),
                tag: String::new(),
                sha: String::new(),
                artifact_id: String::new(),
                gitops_hashes: Vec::new(),
            })
            .unwrap();

        worker.process_event(&event);

        let updated = store.event(&event.id).unwrap().unwrap();
        assert_eq!(STATUS_PROCESSED, updated.status);
        assert_eq!(1, updated.gitops_hashes.len());

        // The cleanup commit made it to the origin.
        let verify_path = dir.path().join("verify");
        let verify = Repo::clone(&bare.to_string_lossy(), &verify_path, None).unwrap();
        assert!(!verify.path().join("staging/preview-feature-x").exists());
    }
}
