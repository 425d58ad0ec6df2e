//! Wiring between the store, the job table and the login engine.
//!
//! Committed store events keep the job table in sync; the [`LoginJob`] body
//! performs one attempt and records it in history. On startup stale
//! attempts are failed and every active site is installed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{history, JobBody, Scheduler};
use crate::config::SchedulerConfig;
use crate::events::DomainEvent;
use crate::login::{LoginRequest, LoginRunner};
use crate::model::{FinishHistory, NewHistory, SiteId};
use crate::notify::Notifier;
use crate::storage::{Store, StoreError};

/// Message written onto attempts that were in flight when the process died.
const INTERRUPTED: &str = "Attempt interrupted by a restart";

const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// One scheduled login attempt, start to terminal history row.
pub struct LoginJob {
    store: Store,
    runner: LoginRunner,
    notifier: Arc<dyn Notifier>,
}

impl LoginJob {
    pub fn new(store: Store, runner: LoginRunner, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            runner,
            notifier,
        }
    }
}

#[async_trait::async_trait]
impl JobBody for LoginJob {
    async fn run(&self, site_id: SiteId, started_at: DateTime<Utc>) -> Result<()> {
        let site = match self.store.get_site(site_id) {
            Ok(site) => site,
            Err(StoreError::SiteNotFound(_)) => {
                warn!(site_id, "site vanished before its job ran");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if site.paused {
            debug!(site_id, "site was paused before its job ran");
            return Ok(());
        }

        let screenshot_id = site.take_screenshot.then(|| Uuid::new_v4().to_string());
        let row = self
            .store
            .insert_history(site_id, NewHistory::in_progress(started_at, screenshot_id.clone()))?;

        let outcome = self
            .runner
            .run(&LoginRequest::for_site(&site, screenshot_id.as_deref()))
            .await;

        let finished = self.store.finish_history(
            row.id,
            FinishHistory::from_outcome(outcome.status, outcome.message, None),
        )?;
        let site = self.store.get_site(site_id).unwrap_or(site);
        self.notifier.notify(&site, &finished).await;
        Ok(())
    }

    async fn missed(&self, site_id: SiteId, due: DateTime<Utc>) -> Result<()> {
        match self.store.reschedule(site_id) {
            Ok(site) => {
                info!(site_id, %due, next = ?site.next_schedule, "missed run replaced by a fresh schedule");
                Ok(())
            }
            Err(StoreError::SiteNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Install or drop the job for one site from its committed state.
fn sync_site(store: &Store, scheduler: &Scheduler, site_id: SiteId) {
    match store.get_site(site_id) {
        Ok(site) if site.paused => scheduler.remove_task(site_id),
        Ok(site) => scheduler.add_task(&site),
        Err(StoreError::SiteNotFound(_)) => scheduler.remove_task(site_id),
        Err(e) => warn!(site_id, error = %e, "could not load site to schedule it"),
    }
}

fn apply(store: &Store, scheduler: &Scheduler, event: DomainEvent) {
    debug!(?event, "scheduler received event");
    match event {
        DomainEvent::SiteDeleted { site_id } | DomainEvent::SitePaused { site_id, paused: true } => {
            scheduler.remove_task(site_id)
        }
        DomainEvent::SiteCreated { site_id }
        | DomainEvent::SitePaused { site_id, paused: false }
        | DomainEvent::SiteRescheduled { site_id }
        | DomainEvent::HistoryLogged { site_id, .. }
        | DomainEvent::HistoryChanged { site_id, .. } => sync_site(store, scheduler, site_id),
    }
}

/// Rebuild the whole job table from the store.
async fn resync(store: &Store, scheduler: &Scheduler) {
    let sites = match store.list_sites() {
        Ok(sites) => sites,
        Err(e) => {
            warn!(error = %e, "could not list sites to resynchronise");
            return;
        }
    };
    for job in scheduler.pending().await {
        if !sites.iter().any(|s| s.id == job.site_id) {
            scheduler.remove_task(job.site_id);
        }
    }
    for site in &sites {
        if site.paused {
            scheduler.remove_task(site.id);
        } else {
            scheduler.add_task(site);
        }
    }
}

/// Keep the job table in step with committed store changes.
///
/// Edits made by another process (the CLI) never reach this bus, so the
/// table is also rebuilt from the store every [`RESYNC_INTERVAL`].
pub async fn follow_events(store: Store, scheduler: Scheduler, mut events: broadcast::Receiver<DomainEvent>) {
    let mut resync_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + RESYNC_INTERVAL,
        RESYNC_INTERVAL,
    );
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => apply(&store, &scheduler, event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "scheduler fell behind on events, resynchronising");
                    resync(&store, &scheduler).await;
                }
                Err(RecvError::Closed) => break,
            },
            _ = resync_timer.tick() => resync(&store, &scheduler).await,
        }
    }
}

/// Fail attempts a previous process left in flight and install every active
/// site. A next run older than the grace window is redrawn instead of
/// caught up. Returns the number of installed jobs.
pub fn recover(store: &Store, scheduler: &Scheduler, grace: Duration) -> Result<usize> {
    let stale = store.fail_stale_in_progress(INTERRUPTED)?;
    if stale > 0 {
        warn!(stale, "failed attempts left in progress by a previous run");
    }

    let cutoff = Utc::now() - chrono::Duration::from_std(grace)?;
    let mut installed = 0;
    for site in store.list_sites()? {
        if site.paused {
            continue;
        }
        let site = match site.next_schedule {
            Some(next) if next < cutoff => {
                info!(site_id = site.id, %next, "next run is past the grace window, redrawing");
                store.reschedule(site.id)?
            }
            _ => site,
        };
        if site.next_schedule.is_some() {
            scheduler.add_task(&site);
            installed += 1;
        }
    }
    Ok(installed)
}

/// Start the scheduler with its fault reconciler and event follower.
pub fn start(
    store: Store,
    runner: LoginRunner,
    notifier: Arc<dyn Notifier>,
    config: &SchedulerConfig,
) -> Result<Scheduler> {
    let grace = Duration::from_secs(config.misfire_grace_secs);
    let (faults, fault_rx) = mpsc::unbounded_channel();
    let job = Arc::new(LoginJob::new(store.clone(), runner, notifier));
    let scheduler = Scheduler::spawn(job, grace, faults);
    tokio::spawn(history::run_reconciler(store.clone(), fault_rx));

    // Subscribe before recovering so no commit slips between the two.
    let events = store.events().subscribe();
    let installed = recover(&store, &scheduler, grace)?;
    info!(installed, "scheduler recovered jobs");
    tokio::spawn(follow_events(store, scheduler.clone(), events));

    Ok(scheduler)
}
