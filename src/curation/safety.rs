//! Remote safety classification (curation stage 5).
//!
//! The classifier downloads the dataset, drops rows whose toxicity score is at or
//! above its threshold, and writes the cleaned dataset back in place.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::dispatch::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub rows_kept: usize,
    pub cleaned_dataset_url: String,
}

#[async_trait]
pub trait SafetyFilter: Send + Sync {
    async fn filter(&self, dataset_url: &str) -> Result<SafetyVerdict, RemoteError>;
}

#[derive(Serialize)]
struct SafetyRequest<'a> {
    dataset_url: &'a str,
}

/// Classifier service reached over HTTP: `POST {base}/clean` with `{"dataset_url": ...}`.
#[derive(Clone)]
pub struct HttpSafetyFilter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSafetyFilter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Submission(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl SafetyFilter for HttpSafetyFilter {
    async fn filter(&self, dataset_url: &str) -> Result<SafetyVerdict, RemoteError> {
        debug!("Requesting safety classification for {}", dataset_url);

        let response = self
            .client
            .post(format!("{}/clean", self.base_url))
            .json(&SafetyRequest { dataset_url })
            .send()
            .await
            .map_err(|e| {
                error!("Safety classification request failed: {}", e);
                if e.is_timeout() {
                    RemoteError::Timeout(self.timeout)
                } else {
                    RemoteError::Submission(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Execution(format!("{}: {}", status, body)));
        }

        response
            .json::<SafetyVerdict>()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }
}
