//! Submit a batch script to an external compute endpoint and follow it to a
//! terminal status.

pub mod sfapi;

use crate::config::RemoteConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use sfapi::SuperfacilityClient;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP error with status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Unexpected response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Submission rejected: {0}")]
    SubmissionRejected(#[source] ApiError),
    #[error("Job {} still {} after {attempts} polls", .job.job_id, .job.status)]
    PollingExhausted {
        attempts: u32,
        // the job as seen by the last poll
        job: Box<RemoteJob>,
    },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    /// last poll failed, retry instead of giving up
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => f.write_str("SUBMITTED"),
            Self::Running => f.write_str("RUNNING"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Failed => f.write_str("FAILED"),
            Self::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// One submission to the external compute system, only mutated by `Tracker::poll`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RemoteJob {
    pub job_id: String,
    pub status: JobStatus,
    /// last status the endpoint actually reported, kept across failed polls
    #[serde(default)]
    pub last_known: Option<JobStatus>,
    // None when the job was picked up from a bare task id
    pub submitted_at: Option<DateTime<Utc>>,
    pub polled_at: Option<DateTime<Utc>>,
}

impl RemoteJob {
    /// follow a job submitted elsewhere, its status is unknown until polled
    pub fn resume(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Unknown,
            last_known: None,
            submitted_at: None,
            polled_at: None,
        }
    }
}

/// Bearer token for the compute endpoint, never printed
#[derive(Clone)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// The two calls the state machine needs from the external endpoint
pub trait ComputeApi {
    /// submit a script, returning the task id assigned by the endpoint
    fn submit(&self, script: &str, credentials: &Credentials) -> Result<String, ApiError>;
    fn task_status(&self, task_id: &str, credentials: &Credentials) -> Result<JobStatus, ApiError>;
}

/// Caller side bounds of the polling loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&RemoteConfig> for PollPolicy {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_attempts: config.max_attempts,
        }
    }
}

/// only forward transitions are applied, a still queued report never undoes `Running`
fn transition(current: JobStatus, reported: JobStatus) -> JobStatus {
    match (current, reported) {
        (current, _) if current.is_terminal() => current,
        (JobStatus::Running, JobStatus::Submitted) => JobStatus::Running,
        (_, reported) => reported,
    }
}

#[derive(Debug)]
pub struct Tracker<A> {
    api: A,
}

impl<A: ComputeApi> Tracker<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Submit once, a rejected submission creates no job and is not retried
    #[instrument(skip_all)]
    pub fn submit(&self, script: &str, credentials: &Credentials) -> Result<RemoteJob, TrackerError> {
        let job_id = self
            .api
            .submit(script, credentials)
            .map_err(TrackerError::SubmissionRejected)?;

        info!(job_id = %job_id, "Submitted job");

        Ok(RemoteJob {
            job_id,
            status: JobStatus::Submitted,
            last_known: Some(JobStatus::Submitted),
            submitted_at: Some(Utc::now()),
            polled_at: None,
        })
    }

    /// Query the status once. Terminal jobs are returned untouched, a failed
    /// query turns into `Unknown` instead of an error. Transitions are applied
    /// to the last reported status, so an `Unknown` in between never lets a
    /// job move backwards.
    pub fn poll(&self, job: &RemoteJob, credentials: &Credentials) -> RemoteJob {
        if job.status.is_terminal() {
            return job.clone();
        }

        let (status, last_known) = match self.api.task_status(&job.job_id, credentials) {
            Ok(JobStatus::Unknown) => {
                warn!(job_id = %job.job_id, "Endpoint reported an unrecognized status");

                (JobStatus::Unknown, job.last_known)
            }
            Ok(reported) => {
                let status = transition(job.last_known.unwrap_or(job.status), reported);

                (status, Some(status))
            }
            Err(error) => {
                warn!(job_id = %job.job_id, error = %error, "Failed to query job status");

                (JobStatus::Unknown, job.last_known)
            }
        };

        if status != job.status {
            debug!(job_id = %job.job_id, from = %job.status, to = %status, "Job status changed");
        }

        RemoteJob {
            status,
            last_known,
            polled_at: Some(Utc::now()),
            ..job.clone()
        }
    }

    /// Poll every `policy.interval` until the job is terminal. Running out of
    /// attempts leaves the remote job alone and reports `PollingExhausted`.
    #[instrument(skip(self, credentials), fields(job_id = %job.job_id))]
    pub fn wait(
        &self,
        mut job: RemoteJob,
        credentials: &Credentials,
        policy: PollPolicy,
    ) -> Result<RemoteJob, TrackerError> {
        for attempt in 1..=policy.max_attempts {
            if job.status.is_terminal() {
                break;
            }

            thread::sleep(policy.interval);
            job = self.poll(&job, credentials);
            debug!(attempt, status = %job.status, "Polled job");
        }

        if job.status.is_terminal() {
            info!(status = %job.status, "Job reached terminal status");

            Ok(job)
        } else {
            Err(TrackerError::PollingExhausted {
                attempts: policy.max_attempts,
                job: Box::new(job),
            })
        }
    }
}
