//! Client side of the workflow: build, persist and submit requests while
//! keeping every in-flight submission under its own job id.

use crate::{
    request::ReconstructionRequest,
    script::{ScriptBuilder, ScriptError},
    tracker::{ComputeApi, Credentials, PollPolicy, RemoteJob, Tracker, TrackerError},
};
use parking_lot::RwLock;
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to build batch script: {0}")]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("No job with id {0} was submitted through this service")]
    UnknownJob(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackedJob {
    pub request: ReconstructionRequest,
    pub script_path: PathBuf,
    pub job: RemoteJob,
}

/// Thread safe map of job id -> submission
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<String, TrackedJob>>,
}

impl JobRegistry {
    pub fn insert(&self, tracked: TrackedJob) {
        self.jobs.write().insert(tracked.job.job_id.clone(), tracked);
    }

    pub fn get(&self, job_id: &str) -> Option<TrackedJob> {
        self.jobs.read().get(job_id).cloned()
    }

    /// store a newer view of a registered job, returns false for unknown ids
    pub fn update(&self, job: &RemoteJob) -> bool {
        match self.jobs.write().get_mut(&job.job_id) {
            Some(tracked) => {
                tracked.job = job.clone();
                true
            }
            None => false,
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

pub struct SubmissionService<'a, A> {
    builder: ScriptBuilder<'a>,
    tracker: Tracker<A>,
    policy: PollPolicy,
    registry: JobRegistry,
}

impl<'a, A: ComputeApi> SubmissionService<'a, A> {
    pub fn new(builder: ScriptBuilder<'a>, tracker: Tracker<A>, policy: PollPolicy) -> Self {
        Self {
            builder,
            tracker,
            policy,
            registry: JobRegistry::default(),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &Tracker<A> {
        &self.tracker
    }

    /// Build and persist the script, then submit it. Build errors surface
    /// before the endpoint is contacted.
    #[instrument(skip_all, fields(name = %request.data.name))]
    pub fn submit(
        &self,
        request: ReconstructionRequest,
        credentials: &Credentials,
    ) -> Result<RemoteJob, ServiceError> {
        let script = self.builder.build(&request)?;
        let script_path = script.persist(&request)?;

        let job = self.tracker.submit(&script.text, credentials)?;
        info!(job_id = %job.job_id, script = ?script_path, "Registered submission");

        self.registry.insert(TrackedJob {
            request,
            script_path,
            job: job.clone(),
        });

        Ok(job)
    }

    /// poll a registered job once
    pub fn status(&self, job_id: &str, credentials: &Credentials) -> Result<RemoteJob, ServiceError> {
        let tracked = self
            .registry
            .get(job_id)
            .ok_or_else(|| ServiceError::UnknownJob(job_id.to_owned()))?;

        let job = self.tracker.poll(&tracked.job, credentials);
        self.registry.update(&job);

        Ok(job)
    }

    /// Poll a registered job until it is terminal or the policy runs out.
    /// The registry keeps the last polled view in both cases.
    pub fn wait(&self, job_id: &str, credentials: &Credentials) -> Result<RemoteJob, ServiceError> {
        let tracked = self
            .registry
            .get(job_id)
            .ok_or_else(|| ServiceError::UnknownJob(job_id.to_owned()))?;

        match self.tracker.wait(tracked.job, credentials, self.policy) {
            Ok(job) => {
                self.registry.update(&job);

                Ok(job)
            }
            Err(error) => {
                if let TrackerError::PollingExhausted { ref job, .. } = error {
                    self.registry.update(job);
                }

                Err(error.into())
            }
        }
    }
}
