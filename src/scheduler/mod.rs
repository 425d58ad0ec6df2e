//! Per-site login scheduler.
//!
//! One owner task holds the job table (at most one job per site id) and
//! decides what fires when. Job bodies run on their own tokio task so a slow
//! browser session never delays another site, and a site never has two
//! bodies in flight: a job that comes due while its site is still running
//! waits for that run to finish.
//!
//! A body that errors or panics is reported as a [`SchedulingFault`] on the
//! fault channel; [`history::reconcile`] turns it into a terminal history row.

pub mod engine;
pub mod history;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::model::{Site, SiteId};

pub use self::engine::{start, LoginJob};

/// Longest single sleep of the owner loop. Waking periodically keeps long
/// waits honest against wall-clock adjustments.
const MAX_NAP: Duration = Duration::from_secs(60);

/// Work performed when a site's job fires.
#[async_trait::async_trait]
pub trait JobBody: Send + Sync {
    /// Run one attempt. `started_at` identifies the attempt in any fault
    /// reported for it.
    async fn run(&self, site_id: SiteId, started_at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Called instead of [`JobBody::run`] when the job fired later than the
    /// misfire grace allows.
    async fn missed(&self, _site_id: SiteId, _due: DateTime<Utc>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A job body failed outside the login engine's own classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingFault {
    pub site_id: SiteId,
    pub started_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingJob {
    pub site_id: SiteId,
    pub fire_at: DateTime<Utc>,
}

enum Command {
    Install { site_id: SiteId, fire_at: DateTime<Utc> },
    Remove { site_id: SiteId },
    Pending { reply: oneshot::Sender<Vec<PendingJob>> },
}

/// Handle to the owner loop. Cheap to clone; the loop stops once every
/// handle has been dropped.
#[derive(Debug, Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Spawn the owner loop.
    pub fn spawn(
        body: Arc<dyn JobBody>,
        misfire_grace: Duration,
        faults: mpsc::UnboundedSender<SchedulingFault>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let owner = Owner {
            body,
            misfire_grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            faults,
            jobs: HashMap::new(),
            running: HashMap::new(),
            completed: HashMap::new(),
        };
        tokio::spawn(owner.run(rx));
        Self { commands: tx }
    }

    /// Install or replace the job for `site`. A site without a next run is
    /// left alone; a next run in the past fires immediately.
    pub fn add_task(&self, site: &Site) {
        match site.next_schedule {
            Some(fire_at) => self.schedule(site.id, fire_at),
            None => debug!(site_id = site.id, "site has no next run, nothing to schedule"),
        }
    }

    pub fn schedule(&self, site_id: SiteId, fire_at: DateTime<Utc>) {
        self.send(Command::Install { site_id, fire_at });
    }

    /// Cancel the site's job if one is pending. A running attempt is not
    /// interrupted.
    pub fn remove_task(&self, site_id: SiteId) {
        self.send(Command::Remove { site_id });
    }

    /// Snapshot of the job table, soonest first.
    pub async fn pending(&self) -> Vec<PendingJob> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Pending { reply });
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("scheduler loop is gone, command dropped");
        }
    }
}

struct Owner {
    body: Arc<dyn JobBody>,
    misfire_grace: chrono::Duration,
    faults: mpsc::UnboundedSender<SchedulingFault>,
    jobs: HashMap<SiteId, DateTime<Utc>>,
    /// Sites with a body in flight, keyed to the fire time that started it.
    running: HashMap<SiteId, DateTime<Utc>>,
    /// Fire time of each site's last finished run.
    completed: HashMap<SiteId, DateTime<Utc>>,
}

impl Owner {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("scheduler started");
        let (done_tx, mut done) = mpsc::unbounded_channel::<SiteId>();

        loop {
            let nap = self.next_due().map(|at| until(at).min(MAX_NAP));
            let sleep = async {
                match nap {
                    Some(nap) => tokio::time::sleep(nap).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(site_id) = done.recv() => {
                    if let Some(due) = self.running.remove(&site_id) {
                        self.completed.insert(site_id, due);
                    }
                }
                _ = sleep => self.fire_due(&done_tx),
            }
        }
        info!("scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Install { site_id, fire_at } => {
                // Coalesce a fire time a running or finished attempt already
                // covers. Stale snapshots of the store can still carry it.
                if self.running.get(&site_id).is_some_and(|&due| fire_at <= due) {
                    debug!(site_id, %fire_at, "job already running for this fire time");
                    return;
                }
                if self.completed.get(&site_id).is_some_and(|&due| fire_at <= due) {
                    debug!(site_id, %fire_at, "job already ran for this fire time");
                    return;
                }
                debug!(site_id, %fire_at, "job installed");
                self.jobs.insert(site_id, fire_at);
            }
            Command::Remove { site_id } => {
                self.completed.remove(&site_id);
                if self.jobs.remove(&site_id).is_some() {
                    debug!(site_id, "job removed");
                }
            }
            Command::Pending { reply } => {
                let mut pending: Vec<PendingJob> = self
                    .jobs
                    .iter()
                    .map(|(&site_id, &fire_at)| PendingJob { site_id, fire_at })
                    .collect();
                pending.sort_by_key(|job| (job.fire_at, job.site_id));
                let _ = reply.send(pending);
            }
        }
    }

    /// Earliest fire time among sites that are not currently running.
    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .filter(|&(site_id, _)| !self.running.contains_key(site_id))
            .map(|(_, &at)| at)
            .min()
    }

    fn fire_due(&mut self, done: &mpsc::UnboundedSender<SiteId>) {
        let now = Utc::now();
        let due: Vec<(SiteId, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|&(site_id, &at)| at <= now && !self.running.contains_key(site_id))
            .map(|(&site_id, &at)| (site_id, at))
            .collect();

        for (site_id, due_at) in due {
            self.jobs.remove(&site_id);
            self.running.insert(site_id, due_at);

            let late = now - due_at;
            let body = self.body.clone();
            let faults = self.faults.clone();
            let done = done.clone();

            if late > self.misfire_grace {
                warn!(site_id, %due_at, late_secs = late.num_seconds(), "job missed its grace window, skipping");
                tokio::spawn(async move {
                    if let Err(e) = body.missed(site_id, due_at).await {
                        error!(site_id, error = %e, "failed to handle missed job");
                    }
                    let _ = done.send(site_id);
                });
                continue;
            }

            info!(site_id, %due_at, "job fired");
            let started_at = Utc::now();
            let attempt = tokio::spawn(async move { body.run(site_id, started_at).await });
            tokio::spawn(async move {
                let reason = match attempt.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    Err(e) => Some(format!("job task failed: {e}")),
                };
                if let Some(reason) = reason {
                    error!(site_id, %reason, "scheduled job faulted");
                    let fault = SchedulingFault {
                        site_id,
                        started_at,
                        reason,
                    };
                    if faults.send(fault).is_err() {
                        error!(site_id, "fault channel closed, attempt left unreconciled");
                    }
                }
                let _ = done.send(site_id);
            });
        }
    }
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
