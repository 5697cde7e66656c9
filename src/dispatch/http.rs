use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::{JobHandle, JobStatus, RemoteError, TrainingArtifact, TrainingDispatcher, TrainingSubmission};

/// Training service reached over HTTP.
///
/// `POST {base}/jobs` takes a [`TrainingSubmission`] and answers `{"job_id": ...}`;
/// `GET {base}/jobs/{id}` answers `{"status": "pending" | "running" | "succeeded" | "failed", ...}`
/// where a succeeded job carries `adapter_dir` and `files`, and a failed one carries `error`.
#[derive(Clone)]
pub struct HttpTrainingDispatcher {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum StatusResponse {
    Pending,
    Running,
    Succeeded {
        adapter_dir: String,
        #[serde(default)]
        files: Vec<String>,
    },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

impl From<StatusResponse> for JobStatus {
    fn from(response: StatusResponse) -> Self {
        match response {
            StatusResponse::Pending => JobStatus::Pending,
            StatusResponse::Running => JobStatus::Running,
            StatusResponse::Succeeded { adapter_dir, files } => {
                JobStatus::Succeeded(TrainingArtifact { adapter_dir, files })
            }
            StatusResponse::Failed { error } => {
                JobStatus::Failed(error.unwrap_or_else(|| "training job failed".to_string()))
            }
        }
    }
}

impl HttpTrainingDispatcher {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RemoteError> {
        debug!("Using training service at: {}", base_url);
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Submission(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TrainingDispatcher for HttpTrainingDispatcher {
    async fn submit(&self, submission: &TrainingSubmission) -> Result<JobHandle, RemoteError> {
        info!(
            "Submitting training job for model version {}",
            submission.model_version_id
        );

        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(submission)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to submit training job: {}", e);
                RemoteError::Submission(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Submission(format!("{}: {}", status, body)));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        debug!("Training job accepted: {}", parsed.job_id);
        Ok(JobHandle { job_id: parsed.job_id })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, RemoteError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, handle.job_id))
            .send()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Protocol(format!(
                "status check for job {} returned {}",
                handle.job_id, status
            )));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(parsed.into())
    }
}
