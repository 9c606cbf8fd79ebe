//! Runwright -- scheduled browser-test execution.
//!
//! Cron-driven schedules fire runs of stored test cases; each target runs
//! through a retry chain with optional failure classification, reuses
//! cached fixture state, and the finished run is announced on the
//! schedule's notification channels.

pub mod api;
pub mod config;
pub mod executor;
pub mod fixtures;
pub mod notify;
pub mod retry;
pub mod runs;
pub mod scheduler;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;

use crate::config::RunwrightConfig;
use crate::executor::{http::HttpExecutor, Browser};
use crate::fixtures::{crypto::AesGcmCipher, FixtureCache};
use crate::notify::{transport::HttpTransport, Dispatcher};
use crate::retry::{classifier::RuleClassifier, ledger::RetryLedger, RetryOrchestrator, RetryTimeouts};
use crate::runs::{pool::WorkerPool, recovery, Coordinator};
use crate::scheduler::Scheduler;

/// Everything a running instance shares.
#[derive(Clone)]
pub struct App {
    pub pool: storage::Pool,
    pub scheduler: Scheduler,
    pub coordinator: Coordinator,
    pub fixtures: FixtureCache,
}

impl App {
    pub fn state(&self) -> api::state::AppState {
        api::state::AppState {
            pool: self.pool.clone(),
            scheduler: self.scheduler.clone(),
            coordinator: self.coordinator.clone(),
            fixtures: self.fixtures.clone(),
        }
    }
}

/// Wire storage, the executor client, the fixture cache, retry, notification
/// and coordination from configuration.
pub fn build(config: &RunwrightConfig) -> Result<App> {
    tracing::info!(db_path = %config.database.path, "Initializing database");
    let pool = storage::open_pool(&config.database.path)
        .with_context(|| format!("failed to open database {}", config.database.path))?;

    let secret = config
        .encryption_key()
        .context("no fixture encryption key: set ENCRYPTION_KEY or fixtures.encryption_key")?;
    let cipher = Arc::new(AesGcmCipher::from_secret(&secret)?);

    let exec = &config.execution;
    let executor = Arc::new(HttpExecutor::new(
        &exec.executor_url,
        Duration::from_secs(exec.attempt_timeout_secs),
    )?);
    let fixtures = FixtureCache::new(
        pool.clone(),
        executor.clone(),
        cipher,
        Duration::from_secs(config.fixtures.capture_timeout_secs),
    );
    let orchestrator = RetryOrchestrator::new(
        RetryLedger::new(pool.clone()),
        executor,
        Arc::new(RuleClassifier),
        fixtures.clone(),
        RetryTimeouts {
            attempt: Duration::from_secs(exec.attempt_timeout_secs),
            classifier: Duration::from_secs(exec.classifier_timeout_secs),
        },
        exec.intelligent_retry_enabled,
    );

    let send_timeout = Duration::from_secs(config.notifications.send_timeout_secs);
    let transport = Arc::new(HttpTransport::new(send_timeout, config.notifications.smtp.as_ref())?);
    let dispatcher = Dispatcher::new(pool.clone(), transport, send_timeout);

    let coordinator = Coordinator::new(
        pool.clone(),
        orchestrator,
        dispatcher,
        WorkerPool::new(exec.max_concurrent_per_project),
        Browser::new(exec.default_browser.clone()),
    );

    Ok(App {
        scheduler: Scheduler::new(pool.clone()),
        pool,
        coordinator,
        fixtures,
    })
}

/// Start the Runwright daemon: recovery sweep, scheduler driver (which keeps
/// sweeping periodically), API server.
pub async fn serve(config: RunwrightConfig) -> Result<()> {
    // 1. Wire components
    let app = build(&config)?;

    // 2. Fail runs orphaned by a previous process
    recovery::sweep(&app.pool, config.scheduler.liveness_threshold(), Utc::now()).await?;
    let purged = app.fixtures.purge_expired(Utc::now()).await?;
    if purged > 0 {
        tracing::info!(purged, "expired fixture states removed");
    }

    // 3. Start scheduler driver (background task)
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = tokio::spawn(scheduler::engine::run_scheduler_loop(
        app.scheduler.clone(),
        app.coordinator.clone(),
        config.scheduler.tick_interval(),
        config.scheduler.liveness_threshold(),
        shutdown_rx,
    ));

    // 4. Start API server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Runwright listening");
    axum::serve(listener, api::router(app.state()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("shutting down scheduler driver");
    let _ = shutdown_tx.send(true);
    driver.await?;
    Ok(())
}
