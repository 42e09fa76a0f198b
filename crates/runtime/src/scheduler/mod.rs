//! Cron-driven scheduling of recurring jobs.
//!
//! The scheduler owns an in-memory trigger per enabled scheduled job and a
//! background tick loop that fires due triggers. Every firing reloads its
//! job from the catalog, takes a per-job reentrancy lock (overlapping
//! firings are dropped, not queued), fans the frozen host set out through
//! the executor seam, stamps `last_run`, and sweeps cron history.

pub mod cron_expr;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::interval;

use crate::catalog::{Catalog, CatalogError};
use crate::ssh::ScriptExecutor;
use crate::types::{LogOwner, ScheduledJob};
use self::cron_expr::{CronError, CronExpression};

/// Errors produced by the scheduler's public API.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the tick loop checks for due triggers.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// An installed trigger: the parsed expression plus the next firing instant.
struct Trigger {
    expression: CronExpression,
    next_fire: Option<DateTime<Utc>>,
}

/// State shared between the scheduler handle, the tick loop, and in-flight
/// firings.
struct Core {
    catalog: Arc<Catalog>,
    executor: Arc<dyn ScriptExecutor>,
    /// Exactly one entry per enabled scheduled job, keyed by its id.
    triggers: RwLock<HashMap<i64, Trigger>>,
    /// Per-job reentrancy locks, created lazily and never removed; the map
    /// is bounded by the number of scheduled jobs.
    run_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// The cron scheduling engine.
pub struct CronScheduler {
    core: Arc<Core>,
    config: SchedulerConfig,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl CronScheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        executor: Arc<dyn ScriptExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                catalog,
                executor,
                triggers: RwLock::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
            }),
            config,
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        }
    }

    /// Install triggers for every enabled job and start the tick loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.load_triggers().await?;
        self.start_tick_loop();
        tracing::info!(
            triggers = self.trigger_count(),
            "cron scheduler started"
        );
        Ok(())
    }

    /// Install one trigger per enabled scheduled job in the catalog.
    pub async fn load_triggers(&self) -> Result<(), SchedulerError> {
        for job in self.core.catalog.list_enabled_scheduled_jobs().await? {
            if let Err(e) = self.install_trigger(&job) {
                // Rows are validated at save time, so this only happens if
                // the catalog was edited out-of-band.
                tracing::warn!(job = %job.name, error = %e, "skipping unschedulable job");
            }
        }
        Ok(())
    }

    /// Install (or replace) the trigger for a job. Installing under an
    /// existing id silently replaces the previous trigger; there is never
    /// more than one per job.
    pub fn install_trigger(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        let expression = CronExpression::parse(&job.schedule)?;
        let next_fire = expression.next_after(Utc::now());
        if next_fire.is_none() {
            tracing::warn!(job = %job.name, schedule = %job.schedule, "expression never fires");
        }
        self.core.triggers.write().insert(
            job.id,
            Trigger {
                expression,
                next_fire,
            },
        );
        tracing::debug!(job = %job.name, next_fire = ?next_fire, "trigger installed");
        Ok(())
    }

    /// Remove a job's trigger, if present.
    pub fn remove_trigger(&self, job_id: i64) -> bool {
        self.core.triggers.write().remove(&job_id).is_some()
    }

    /// Bring the trigger set in line with a job row after a catalog write:
    /// enabled jobs get exactly one trigger, disabled or deleted jobs none.
    pub fn sync_job(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        if job.enabled {
            self.install_trigger(job)
        } else {
            self.remove_trigger(job.id);
            Ok(())
        }
    }

    pub fn has_trigger(&self, job_id: i64) -> bool {
        self.core.triggers.read().contains_key(&job_id)
    }

    pub fn trigger_count(&self) -> usize {
        self.core.triggers.read().len()
    }

    /// Fire a job immediately, regardless of its schedule. The per-job
    /// reentrancy lock still applies.
    pub async fn trigger_now(&self, job_id: i64) {
        fire(self.core.clone(), job_id).await;
    }

    /// Stop the tick loop. In-flight firings run to completion.
    pub async fn shutdown(&self) {
        {
            let is_running = self.is_running.read();
            if !*is_running {
                return;
            }
        }
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
        tracing::info!("cron scheduler shut down");
    }

    fn start_tick_loop(&self) {
        let core = self.core.clone();
        let shutdown = self.shutdown_notify.clone();
        let is_running = self.is_running.clone();
        let tick = self.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(tick);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*is_running.read() {
                            break;
                        }

                        let now = Utc::now();
                        let due: Vec<i64> = {
                            let mut triggers = core.triggers.write();
                            triggers
                                .iter_mut()
                                .filter_map(|(job_id, trigger)| match trigger.next_fire {
                                    Some(at) if at <= now => {
                                        trigger.next_fire = trigger.expression.next_after(now);
                                        Some(*job_id)
                                    }
                                    _ => None,
                                })
                                .collect()
                        };

                        for job_id in due {
                            tokio::spawn(fire(core.clone(), job_id));
                        }
                    }
                    _ = shutdown.notified() => {
                        tracing::debug!("tick loop stopping");
                        break;
                    }
                }
            }
        });
    }
}

/// One firing of a scheduled job.
async fn fire(core: Arc<Core>, job_id: i64) {
    let job = match core.catalog.get_scheduled_job(job_id).await {
        Ok(Some(job)) if job.enabled => job,
        Ok(_) => {
            tracing::debug!(job_id, "skipping firing: job missing or disabled");
            return;
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "could not reload scheduled job");
            return;
        }
    };

    // Overlap guard: runs of one job are strictly serialized, and a firing
    // that meets an in-progress run is dropped, not queued.
    let lock = {
        let mut locks = core.run_locks.lock();
        locks.entry(job_id).or_default().clone()
    };
    let _guard = match lock.try_lock_owned() {
        Ok(guard) => guard,
        Err(_) => {
            tracing::warn!(job = %job.name, "previous run still in progress, dropping this firing");
            return;
        }
    };

    let fired_at = Utc::now();
    tracing::info!(job = %job.name, "firing scheduled job");

    if let Err(e) = run_scheduled(&core, &job).await {
        tracing::warn!(job = %job.name, error = %e, "scheduled run failed");
    }

    let next_run = CronExpression::parse(&job.schedule)
        .ok()
        .and_then(|expr| expr.next_after(Utc::now()));
    if let Err(e) = core
        .catalog
        .record_scheduled_run(job_id, fired_at, next_run)
        .await
    {
        tracing::warn!(job = %job.name, error = %e, "could not stamp last_run");
    }

    match core.catalog.sweep_cron_history().await {
        Ok(0) => {}
        Ok(deleted) => tracing::debug!(job = %job.name, deleted, "cron history swept"),
        Err(e) => tracing::warn!(job = %job.name, error = %e, "history sweep failed"),
    }
    // The guard drops here, releasing the per-job lock on every path.
}

/// Resolve the frozen host set and run the template on each host in
/// parallel. Hosts deleted since the job was saved are no-op targets.
async fn run_scheduled(core: &Arc<Core>, job: &ScheduledJob) -> Result<(), SchedulerError> {
    let template = core
        .catalog
        .get_template(job.template_id)
        .await?
        .ok_or(CatalogError::NotFound {
            entity: "template",
            id: job.template_id,
        })?;
    let credential = core
        .catalog
        .get_credential(job.credential_id)
        .await?
        .ok_or(CatalogError::NotFound {
            entity: "credential",
            id: job.credential_id,
        })?;

    let hosts = core.catalog.get_hosts_by_ids(&job.host_set).await?;
    if hosts.is_empty() {
        tracing::warn!(job = %job.name, "frozen host set resolves to no hosts");
        return Ok(());
    }

    let mut workers = Vec::with_capacity(hosts.len());
    for host in hosts {
        let executor = core.executor.clone();
        let credential = credential.clone();
        let script = template.content.clone();
        let script_type = template.script_type;
        let owner = LogOwner::Scheduled(job.id);
        workers.push(tokio::spawn(async move {
            executor
                .execute(&host, &credential, &script, script_type, owner)
                .await
        }));
    }

    for outcome in join_all(workers).await {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(job = %job.name, error = %e, "host execution failed"),
            Err(join_err) => tracing::warn!(job = %job.name, error = %join_err, "worker panicked"),
        }
    }
    Ok(())
}
