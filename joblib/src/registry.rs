//! The per-tenant job table. Jobs are keyed by the authenticated identity
//! that launched them; one tenant's jobs are invisible to every other
//! tenant. Records are never removed while the registry lives, so listing
//! and status stay available after termination.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::JobOptions;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::multiplexer::OutputFrame;
use crate::types::{Args, JobId, JobSnapshot, SubscriberId, Tenant};

pub struct JobRegistry {
    /// tenant -> job id -> job. Reads take a shared hold; structural
    /// inserts take an exclusive hold. Never held across an await.
    tenants: RwLock<HashMap<Tenant, HashMap<JobId, Arc<Job>>>>,
    options: JobOptions,
}

impl JobRegistry {
    /// `options` is the per-job template the façade assembled from its
    /// configuration and the startup device probe.
    pub fn new(options: JobOptions) -> Self {
        JobRegistry {
            tenants: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// Launches a job for `tenant` and always returns an id: a job whose
    /// construction failed is recorded too, so the failure is observable
    /// via `status` and `list`. A constructed job runs on its own task,
    /// which blocks on the reap and then releases the job's resources.
    pub fn launch(&self, tenant: &str, command: &str, args: Args) -> JobId {
        let job = match Job::new(command, args.clone(), &self.options) {
            Ok(job) => {
                let job = Arc::new(job);
                let runner = Arc::clone(&job);
                tokio::spawn(async move {
                    let (_cancel_tx, cancel_rx) = oneshot::channel();
                    if let Err(e) = runner.start(cancel_rx).await {
                        warn!(job = %runner.id(), error = %e, "job failed to start");
                        runner.record_startup_failure(&e);
                    }
                    runner.finish().await;
                });
                job
            }
            Err(e) => {
                warn!(tenant, command, error = %e, "job construction failed");
                Arc::new(Job::failed(command, args, &e))
            }
        };
        let id = job.id();
        let mut tenants = self.tenants.write().unwrap();
        tenants.entry(tenant.to_string()).or_default().insert(id, job);
        id
    }

    pub fn status(&self, tenant: &str, job_id: JobId) -> Result<JobSnapshot> {
        Ok(self.find(tenant, job_id)?.snapshot())
    }

    /// The tenant's jobs, newest start first. A tenant that never launched
    /// anything gets an empty list.
    pub fn list(&self, tenant: &str) -> Vec<JobSnapshot> {
        let tenants = self.tenants.read().unwrap();
        let mut jobs: Vec<JobSnapshot> = tenants
            .get(tenant)
            .map(|jobs| jobs.values().map(|j| j.snapshot()).collect())
            .unwrap_or_default();
        jobs.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        jobs
    }

    /// SIGKILL to the job's process group. `NotFound` if this tenant never
    /// launched the id; invalid-state if the job is no longer running.
    pub fn terminate(&self, tenant: &str, job_id: JobId) -> Result<()> {
        self.find(tenant, job_id)?.kill()
    }

    pub fn attach(
        &self,
        tenant: &str,
        job_id: JobId,
        stdout: mpsc::Sender<OutputFrame>,
        stderr: mpsc::Sender<OutputFrame>,
    ) -> Result<SubscriberId> {
        self.find(tenant, job_id)?.subscribe(stdout, stderr)
    }

    pub fn detach(&self, tenant: &str, job_id: JobId, subscriber: SubscriberId) -> Result<()> {
        self.find(tenant, job_id)?.detach(subscriber)
    }

    /// Finishes every job of every tenant. Called from the server's
    /// shutdown hook.
    pub async fn shutdown(&self) {
        let jobs: Vec<Arc<Job>> = {
            let tenants = self.tenants.read().unwrap();
            tenants
                .values()
                .flat_map(|jobs| jobs.values().cloned())
                .collect()
        };
        for job in jobs {
            job.finish().await;
        }
    }

    fn find(&self, tenant: &str, job_id: JobId) -> Result<Arc<Job>> {
        let tenants = self.tenants.read().unwrap();
        // No fallback to a global lookup: another tenant's job id must be
        // indistinguishable from an id that never existed.
        tenants
            .get(tenant)
            .and_then(|jobs| jobs.get(&job_id))
            .cloned()
            .ok_or(Error::NotFound)
    }
}
