//! Blocking client for the NERSC superfacility API.

use super::{ApiError, ComputeApi, Credentials, JobStatus};
use crate::config::RemoteConfig;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::{debug, trace};

#[derive(Deserialize, Debug)]
struct SubmitReply {
    task_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct TaskPayload {
    #[serde(default)]
    pub status: Option<String>,
    // JSON document produced by the task once it completed
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TaskResult {
    #[serde(default)]
    status: Option<String>,
}

/// Map a task payload onto the tracked status
pub(crate) fn task_status(payload: &TaskPayload) -> JobStatus {
    let status = payload
        .status
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    match status.as_str() {
        "new" | "queued" | "pending" | "submitted" => JobStatus::Submitted,
        "running" | "active" => JobStatus::Running,
        "completed" => {
            let failed = payload
                .result
                .as_deref()
                .and_then(|result| serde_json::from_str::<TaskResult>(result).ok())
                .and_then(|result| result.status)
                .map(|status| status.eq_ignore_ascii_case("error"))
                .unwrap_or(false);

            if failed {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            }
        }
        "failed" | "error" | "canceled" | "cancelled" => JobStatus::Failed,
        _ => JobStatus::Unknown,
    }
}

#[derive(Debug, Clone)]
pub struct SuperfacilityClient {
    client: Client,
    endpoint: String,
    system: String,
}

impl SuperfacilityClient {
    /// every call made through this client is bounded by `config.request_timeout`
    pub fn new(config: &RemoteConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.to_string().trim_end_matches('/').to_owned(),
            system: config.system.clone(),
        })
    }

    fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let message = response
                .text()
                .unwrap_or_else(|_| String::from("Failed to read response text"));

            Err(ApiError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl ComputeApi for SuperfacilityClient {
    fn submit(&self, script: &str, credentials: &Credentials) -> Result<String, ApiError> {
        let url = format!("{}/compute/jobs/{}", self.endpoint, self.system);
        debug!(url = %url, "Submitting job");

        let response = self
            .client
            .post(&url)
            .bearer_auth(credentials.token())
            .form(&[
                ("job", script),
                ("isPath", "false"),
                ("machine", self.system.as_str()),
            ])
            .send()?;

        let reply: SubmitReply = Self::check(response)?.json()?;
        trace!(reply = ?reply, "Submission reply");

        match reply.task_id {
            Some(task_id) if !task_id.is_empty() => Ok(task_id),
            _ => Err(ApiError::Decode(
                reply
                    .error
                    .unwrap_or_else(|| String::from("reply carries no task_id")),
            )),
        }
    }

    fn task_status(&self, task_id: &str, credentials: &Credentials) -> Result<JobStatus, ApiError> {
        let url = format!("{}/tasks/{}", self.endpoint, task_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(credentials.token())
            .send()?;

        let payload: TaskPayload = Self::check(response)?.json()?;
        trace!(payload = ?payload, "Task payload");

        Ok(task_status(&payload))
    }
}
