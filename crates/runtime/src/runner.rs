//! Ad-hoc fan-out of a template across a resolved host set.
//!
//! The caller gets a job id back as soon as the row exists; the fan-out
//! itself runs on background tasks, one per host, and the job-level status
//! is rolled up from the host logs once every worker is done.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;

use crate::catalog::{Catalog, CatalogError};
use crate::ssh::{ExecutorError, ScriptExecutor};
use crate::types::{Credential, Host, HostLogStatus, JobStatus, LogOwner, Template};

/// Errors surfaced synchronously to the caller of [`JobRunner::run`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Internal dispatch failures; they end as a synthetic host log plus a job
/// in `error` state, never as a panic or a silent drop.
#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// A run request: a template, a credential, and any mix of explicit hosts
/// and groups.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub template_id: i64,
    pub credential_id: i64,
    pub host_ids: Vec<i64>,
    pub group_ids: Vec<i64>,
}

/// Fans an ad-hoc job out across its resolved targets.
pub struct JobRunner {
    catalog: Arc<Catalog>,
    executor: Arc<dyn ScriptExecutor>,
}

impl JobRunner {
    pub fn new(catalog: Arc<Catalog>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self { catalog, executor }
    }

    /// Validate the request, commit the job row in `running` state, and
    /// launch the fan-out. Returns the new job's id immediately.
    pub async fn run(&self, request: RunRequest) -> Result<i64, RunnerError> {
        let template = self
            .catalog
            .get_template(request.template_id)
            .await?
            .ok_or(CatalogError::NotFound {
                entity: "template",
                id: request.template_id,
            })?;
        let credential = self
            .catalog
            .get_credential(request.credential_id)
            .await?
            .ok_or(CatalogError::NotFound {
                entity: "credential",
                id: request.credential_id,
            })?;

        let hosts = self.resolve_targets(&request).await?;

        let job = self.catalog.create_adhoc_job(&template.name).await?;
        tracing::info!(
            job_id = job.id,
            template = %template.name,
            hosts = hosts.len(),
            "dispatching ad-hoc job"
        );

        let catalog = self.catalog.clone();
        let executor = self.executor.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            dispatch(catalog, executor, job_id, hosts, credential, template).await;
        });

        Ok(job_id)
    }

    /// Union of explicit hosts and every referenced group's members,
    /// de-duplicated. Unknown explicit host ids and an empty result are
    /// user-visible validation errors.
    async fn resolve_targets(&self, request: &RunRequest) -> Result<Vec<Host>, RunnerError> {
        let mut target_ids: BTreeSet<i64> = request.host_ids.iter().copied().collect();
        for group_id in &request.group_ids {
            target_ids.extend(self.catalog.group_host_ids(*group_id).await?);
        }

        let ids: Vec<i64> = target_ids.into_iter().collect();
        let hosts = self.catalog.get_hosts_by_ids(&ids).await?;

        for host_id in &request.host_ids {
            if !hosts.iter().any(|h| h.id == *host_id) {
                return Err(RunnerError::Validation(format!(
                    "unknown host id {host_id}"
                )));
            }
        }
        if hosts.is_empty() {
            return Err(RunnerError::Validation(
                "run request resolves to no hosts".to_string(),
            ));
        }
        Ok(hosts)
    }
}

async fn dispatch(
    catalog: Arc<Catalog>,
    executor: Arc<dyn ScriptExecutor>,
    job_id: i64,
    hosts: Vec<Host>,
    credential: Credential,
    template: Template,
) {
    match fan_out(&catalog, &executor, job_id, hosts, credential, template).await {
        Ok(status) => {
            tracing::info!(job_id, %status, "ad-hoc job finished");
        }
        Err(e) => {
            tracing::error!(job_id, error = %e, "ad-hoc dispatch failed");
            // Leave a diagnosable trace: a synthetic host log carrying the
            // failure, and the job itself in `error`.
            let owner = LogOwner::AdHoc(job_id);
            match catalog.create_host_log(owner, "N/A").await {
                Ok(log_id) => {
                    if let Err(log_err) = catalog
                        .finalize_host_log(owner, log_id, HostLogStatus::Error, "", &e.to_string())
                        .await
                    {
                        tracing::error!(job_id, error = %log_err, "could not write synthetic log");
                    }
                }
                Err(log_err) => {
                    tracing::error!(job_id, error = %log_err, "could not write synthetic log");
                }
            }
            if let Err(status_err) = catalog.set_adhoc_job_status(job_id, JobStatus::Error).await {
                tracing::error!(job_id, error = %status_err, "could not mark job as error");
            }
        }
    }
}

async fn fan_out(
    catalog: &Arc<Catalog>,
    executor: &Arc<dyn ScriptExecutor>,
    job_id: i64,
    hosts: Vec<Host>,
    credential: Credential,
    template: Template,
) -> Result<JobStatus, DispatchError> {
    let mut workers = Vec::with_capacity(hosts.len());
    for host in hosts {
        let executor = executor.clone();
        let credential = credential.clone();
        let script = template.content.clone();
        let script_type = template.script_type;
        workers.push(tokio::spawn(async move {
            executor
                .execute(&host, &credential, &script, script_type, LogOwner::AdHoc(job_id))
                .await
        }));
    }

    // Every worker runs to completion before the rollup; per-host failures
    // are already in their log rows and never abort siblings.
    let mut first_internal: Option<DispatchError> = None;
    for outcome in join_all(workers).await {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if first_internal.is_none() {
                    first_internal = Some(e.into());
                }
            }
            Err(join_err) => {
                if first_internal.is_none() {
                    first_internal = Some(DispatchError::Worker(join_err.to_string()));
                }
            }
        }
    }
    if let Some(e) = first_internal {
        return Err(e);
    }

    let logs = catalog.adhoc_job_logs(job_id).await?;
    let status = if logs.iter().all(|log| log.status == HostLogStatus::Success) {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    catalog.set_adhoc_job_status(job_id, status).await?;
    Ok(status)
}
