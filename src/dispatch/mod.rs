//! Submit/poll boundary to the remote GPU training service.
//!
//! Submission is at-most-once per call: no idempotency key is sent, so retrying a
//! failed `submit` may start a second remote job. The lifecycle manager never
//! resubmits a version whose job id has been persisted.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::AdapterConfig;

pub mod http;

pub use http::HttpTrainingDispatcher;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("remote execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Body sent to the training service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSubmission {
    pub model_version_id: Uuid,
    pub dataset_url: String,
    pub adapter_config: AdapterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
}

/// What a successful training run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub adapter_dir: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded(TrainingArtifact),
    Failed(String),
}

/// Bounds for waiting on a remote job.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive poll errors tolerated before giving up.
    pub max_poll_failures: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(15),
            max_poll_failures: 3,
        }
    }
}

#[async_trait]
pub trait TrainingDispatcher: Send + Sync {
    async fn submit(&self, submission: &TrainingSubmission) -> Result<JobHandle, RemoteError>;

    /// One status check, no waiting.
    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, RemoteError>;

    /// Poll until the job is terminal or `policy.timeout` elapses.
    async fn wait(&self, handle: &JobHandle, policy: &WaitPolicy) -> Result<TrainingArtifact, RemoteError> {
        let polling = async {
            let mut failures = 0u32;
            loop {
                match self.poll(handle).await {
                    Ok(JobStatus::Succeeded(artifact)) => return Ok(artifact),
                    Ok(JobStatus::Failed(reason)) => return Err(RemoteError::Execution(reason)),
                    Ok(status) => {
                        failures = 0;
                        debug!("Training job {} still {:?}", handle.job_id, status);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Polling training job {} failed ({}/{}): {}",
                            handle.job_id, failures, policy.max_poll_failures, e
                        );
                        if failures >= policy.max_poll_failures {
                            return Err(e);
                        }
                    }
                }
                tokio::time::sleep(policy.poll_interval).await;
            }
        };

        match tokio::time::timeout(policy.timeout, polling).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(policy.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        statuses: Mutex<Vec<Result<JobStatus, RemoteError>>>,
    }

    impl Scripted {
        fn new(mut statuses: Vec<Result<JobStatus, RemoteError>>) -> Self {
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl TrainingDispatcher for Scripted {
        async fn submit(&self, _submission: &TrainingSubmission) -> Result<JobHandle, RemoteError> {
            Ok(JobHandle { job_id: "job-1".into() })
        }

        async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus, RemoteError> {
            self.statuses.lock().unwrap().pop().unwrap_or(Ok(JobStatus::Running))
        }
    }

    fn fast() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(1),
            max_poll_failures: 2,
        }
    }

    fn handle() -> JobHandle {
        JobHandle { job_id: "job-1".into() }
    }

    #[tokio::test]
    async fn wait_returns_artifact_after_running() {
        let artifact = TrainingArtifact {
            adapter_dir: "mem://adapter.zip".into(),
            files: vec!["adapter_model.safetensors".into()],
        };
        let dispatcher = Scripted::new(vec![
            Ok(JobStatus::Pending),
            Ok(JobStatus::Running),
            Ok(JobStatus::Succeeded(artifact.clone())),
        ]);
        assert_eq!(dispatcher.wait(&handle(), &fast()).await.unwrap(), artifact);
    }

    #[tokio::test]
    async fn wait_surfaces_remote_failure() {
        let dispatcher = Scripted::new(vec![Ok(JobStatus::Failed("CUDA OOM".into()))]);
        let err = dispatcher.wait(&handle(), &fast()).await.unwrap_err();
        assert_eq!(err, RemoteError::Execution("CUDA OOM".into()));
    }

    #[tokio::test]
    async fn wait_tolerates_transient_poll_errors() {
        let dispatcher = Scripted::new(vec![
            Err(RemoteError::Protocol("502".into())),
            Ok(JobStatus::Running),
            Err(RemoteError::Protocol("502".into())),
            Ok(JobStatus::Succeeded(TrainingArtifact {
                adapter_dir: "mem://a".into(),
                files: vec![],
            })),
        ]);
        assert!(dispatcher.wait(&handle(), &fast()).await.is_ok());

        let dispatcher = Scripted::new(vec![
            Err(RemoteError::Protocol("502".into())),
            Err(RemoteError::Protocol("503".into())),
        ]);
        assert_eq!(
            dispatcher.wait(&handle(), &fast()).await.unwrap_err(),
            RemoteError::Protocol("503".into())
        );
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let dispatcher = Scripted::new(vec![]);
        let err = dispatcher.wait(&handle(), &fast()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout(_)));
    }
}
