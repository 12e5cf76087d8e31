//! Orchestration entry points
//!
//! Whatever mutates entities (an API handler, the startup sequence) calls in
//! here to turn "this row changed" into a task on the queue. Callers learn
//! only whether the task was accepted; the outcome lands on the row.

use crate::certificates::CertificateReconciler;
use crate::db::Database;
use crate::error::QueueError;
use crate::models::{CertificateStatus, ConfigStatus};
use crate::nginx::NginxApplier;
use crate::queue::{Task, TaskQueue};
use anyhow::Context;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Work the orchestrator knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    ConfigureHost(i64),
    ConfigureUpstream(i64),
    RemoveHost(i64),
    RemoveUpstream(i64),
    RequestCertificate(i64),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::ConfigureHost(id) => write!(f, "ConfigureHost #{}", id),
            Job::ConfigureUpstream(id) => write!(f, "ConfigureUpstream #{}", id),
            Job::RemoveHost(id) => write!(f, "RemoveHost #{}", id),
            Job::RemoveUpstream(id) => write!(f, "RemoveUpstream #{}", id),
            Job::RequestCertificate(id) => write!(f, "RequestCertificate #{}", id),
        }
    }
}

/// Shared handles for turning [`Job`]s into queued tasks
#[derive(Clone)]
pub struct Orchestrator {
    db: Arc<Database>,
    queue: Arc<TaskQueue>,
    applier: Arc<NginxApplier>,
    reconciler: Arc<CertificateReconciler>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<TaskQueue>,
        applier: Arc<NginxApplier>,
        reconciler: Arc<CertificateReconciler>,
    ) -> Self {
        Self {
            db,
            queue,
            applier,
            reconciler,
        }
    }

    /// Build the task for `job`
    pub fn task(&self, job: Job) -> Task {
        let name = job.to_string();
        let applier = Arc::clone(&self.applier);

        match job {
            Job::ConfigureHost(id) => Task::new(name, move || async move { applier.configure_host(id).await }),
            Job::ConfigureUpstream(id) => Task::new(name, move || async move { applier.configure_upstream(id).await }),
            Job::RemoveHost(id) => Task::new(name, move || async move { applier.remove_host(id).await }),
            Job::RemoveUpstream(id) => Task::new(name, move || async move { applier.remove_upstream(id).await }),
            Job::RequestCertificate(id) => self.reconciler.request_task(id),
        }
    }

    pub async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.queue.add_job(self.task(job)).await
    }

    /// A host was created or changed
    pub async fn host_saved(&self, id: i64) -> Result<(), QueueError> {
        self.enqueue(Job::ConfigureHost(id)).await
    }

    /// A host was deleted
    pub async fn host_deleted(&self, id: i64) -> Result<(), QueueError> {
        self.enqueue(Job::RemoveHost(id)).await
    }

    /// An upstream was created or changed
    pub async fn upstream_saved(&self, id: i64) -> Result<(), QueueError> {
        self.enqueue(Job::ConfigureUpstream(id)).await
    }

    /// An upstream was deleted
    pub async fn upstream_deleted(&self, id: i64) -> Result<(), QueueError> {
        self.enqueue(Job::RemoveUpstream(id)).await
    }

    /// A certificate was created or changed
    ///
    /// Only rows in `ready` are requested; anything else is left for an
    /// explicit reset. Returns whether a request was enqueued.
    pub async fn certificate_saved(&self, id: i64) -> anyhow::Result<bool> {
        let Some(cert) = self.db.get_certificate(id)? else {
            return Ok(false);
        };
        if cert.status != CertificateStatus::Ready {
            return Ok(false);
        }
        self.enqueue(Job::RequestCertificate(id)).await?;
        Ok(true)
    }

    /// Enqueue everything left in `ready` by a previous run
    ///
    /// Certificates go first so hosts rendered afterwards see them provided.
    pub async fn add_pending_jobs(&self) -> anyhow::Result<usize> {
        let certificates = self.reconciler.add_pending_jobs(&self.queue).await?;

        let hosts = self
            .db
            .list_host_ids_by_status(ConfigStatus::Ready)
            .context("Failed to list hosts awaiting configuration")?;
        for id in &hosts {
            self.host_saved(*id).await?;
        }

        let upstreams = self
            .db
            .list_upstream_ids_by_status(ConfigStatus::Ready)
            .context("Failed to list upstreams awaiting configuration")?;
        for id in &upstreams {
            self.upstream_saved(*id).await?;
        }

        info!(
            certificates,
            hosts = hosts.len(),
            upstreams = upstreams.len(),
            "Enqueued pending work"
        );
        Ok(certificates + hosts.len() + upstreams.len())
    }

    /// Start the periodic certificate sweep
    pub fn spawn_certificate_sweep(&self, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(reconciler.run(Arc::clone(&self.queue), interval, shutdown_rx))
    }
}
