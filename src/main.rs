//! # GitOps Release Controller
//!
//! A long-running service that turns CI artifacts and release intents
//! into commits on a gitops repository, and tracks the downstream
//! reconciler's feedback to close the release lifecycle.
//!
//! ## Overview
//!
//! 1. **Artifact ingest** - CI posts build artifacts with deployment intents
//! 2. **Policy evaluation** - deploy rules decide which artifacts reach which environments
//! 3. **Manifest rendering** - charts are templated into Kubernetes YAML
//! 4. **Gitops writes** - rendered manifests are committed and pushed atomically
//! 5. **Reconciler feedback** - status callbacks update commit records and notify
//!
//! The service runs a fixed set of roles: one event worker (the single
//! gitops writer), the repo cache, the release state reporter, the
//! branch-deletion watcher, the notifications dispatcher and the HTTP
//! API.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use gitops_release_controller::config::Config;
use gitops_release_controller::git::RepoCache;
use gitops_release_controller::notifications::NotificationsManager;
use gitops_release_controller::observability::metrics;
use gitops_release_controller::server::{start_server, ApiState};
use gitops_release_controller::store::Store;
use gitops_release_controller::worker::branch_delete::BranchDeleteWorker;
use gitops_release_controller::worker::release_state::ReleaseStateWorker;
use gitops_release_controller::worker::EventWorker;

#[tokio::main]
async fn main() -> Result<()> {
    if dotenvy::dotenv().is_err() {
        warn!("could not load .env file, relying on env vars");
    }

    let config = Config::from_env();
    init_logging(&config);

    if config.logging.trace {
        println!("{}", config.as_string());
    }

    info!(
        "Starting GitOps Release Controller (build {})",
        env!("BUILD_GIT_HASH")
    );

    metrics::register_metrics()?;

    let store = Store::new(&config.database.driver, &config.database.config)
        .context("cannot open the event store")?;

    let mut notifications = NotificationsManager::new();
    if config.notifications.provider == "slack" {
        notifications.add_slack_provider(
            &config.notifications.token,
            &config.notifications.default_channel,
            &config.notifications.channel_mapping,
            config.notifications.send_progressing,
        );
    }
    let notifications = Arc::new(notifications);

    // Stop channel observed by every background task at its next
    // blocking point.
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    {
        let notifications = Arc::clone(&notifications);
        let stop = stop_rx.clone();
        tokio::spawn(async move { notifications.run(stop).await });
    }

    let mut repo_cache = None;
    if config.gitops_repo_configured() {
        let cache = Arc::new(
            RepoCache::new(
                &config.gitops_repo,
                Some(config.gitops_repo_deploy_key_path.clone().into()),
            )
            .context("cannot clone the gitops repo")?,
        );

        {
            let cache = Arc::clone(&cache);
            let stop = stop_rx.clone();
            tokio::spawn(async move { cache.run(stop).await });
        }

        let worker = EventWorker::new(
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&notifications),
            &config.gitops_repo,
            (!config.github_chart_access_deploy_key_path.is_empty())
                .then(|| config.github_chart_access_deploy_key_path.clone().into()),
        );
        {
            let stop = stop_rx.clone();
            tokio::spawn(async move { worker.run(stop).await });
        }

        let release_state = ReleaseStateWorker::new(Arc::clone(&cache), &config.gitops_repo);
        {
            let stop = stop_rx.clone();
            tokio::spawn(async move { release_state.run(stop).await });
        }

        if !config.repo_cache_path.is_empty() {
            let branch_delete =
                BranchDeleteWorker::new(store.clone(), config.repo_cache_path.clone(), None);
            let stop = stop_rx.clone();
            tokio::spawn(async move { branch_delete.run(stop).await });
        }

        repo_cache = Some(cache);
    } else {
        warn!("GITOPS_REPO not configured, the worker does not run");
    }

    let is_ready = Arc::new(AtomicBool::new(false));
    let state = ApiState {
        store,
        repo_cache,
        notifications,
        gitops_repo: config.gitops_repo.clone(),
        is_ready: Arc::clone(&is_ready),
    };

    let port = config.port;
    let server = tokio::spawn(async move {
        if let Err(e) = start_server(port, state).await {
            error!("HTTP server error: {}", e);
        }
    });

    is_ready.store(true, Ordering::Relaxed);

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);
    server.abort();

    info!("Controller stopped");
    Ok(())
}

// helper function configures the logging.
fn init_logging(config: &Config) {
    let default_level = if config.logging.trace {
        "trace"
    } else if config.logging.debug {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "gitops_release_controller={}",
            default_level
        ))
    });

    if config.logging.text {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.logging.color)
            .init();
    } else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if config.logging.pretty {
            builder.pretty().init();
        } else {
            builder.json().init();
        }
    }
}
