//! sessionkeeper -- keeps website sessions alive by logging in on a
//! randomized schedule.
//!
//! The library holds the schedule policy, the login scripting language, the
//! automatic login form finder, the login orchestrator and the per-site
//! scheduler, plus the SQLite store and HTTP API the daemon runs on.

pub mod api;
pub mod config;
pub mod driver;
pub mod events;
pub mod finder;
pub mod login;
pub mod model;
pub mod notify;
pub mod policy;
pub mod scheduler;
pub mod script;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::driver::WebDriverFactory;
use crate::events::EventBus;
use crate::login::{LoginRunner, LoginTiming};
use crate::notify::LogNotifier;
use crate::storage::Store;

/// Open the store at the configured path, creating its directory.
pub fn open_store(config: &AppConfig) -> Result<Store> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    Store::open(db_path, EventBus::new(config.scheduler.event_buffer))
}

/// Start the sessionkeeper daemon: scheduler and API server.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    let store = open_store(&config)?;

    // 2. Login engine over the configured WebDriver endpoint
    let drivers = WebDriverFactory::new(&config.driver)?;
    tracing::info!(
        webdriver = %config.driver.webdriver_url,
        browser = %config.driver.browser,
        "Using WebDriver backend"
    );
    let runner = LoginRunner::new(Arc::new(drivers), LoginTiming::from(&config.login));

    // 3. Start Scheduler (background tasks)
    let scheduler = scheduler::start(store.clone(), runner, Arc::new(LogNotifier), &config.scheduler)?;

    // 4. Start API Server
    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.api.bind))?;
    let app = api::router(api::state::AppState { store, scheduler });

    tracing::info!(%addr, "sessionkeeper listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("sessionkeeper stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
