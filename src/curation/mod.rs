//! Dataset curation: turns selected feedback into a trainable, policy-compliant
//! newline-delimited JSON artifact.
//!
//! Stages run in order and each one only removes rows:
//! structural validity, PII, policy phrases, deduplication, then the optional
//! remote safety classifier. An empty result after any stage aborts the run
//! before anything is published.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactStore, WriteMode};
use crate::dispatch::RemoteError;
use crate::domain::Feedback;

pub mod filters;
pub mod safety;

use filters::{deduplicate, structural_defect, PiiDetector, PolicyFilter};
pub use safety::{HttpSafetyFilter, SafetyFilter, SafetyVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationStage {
    Structural,
    Pii,
    Policy,
    Dedup,
    Safety,
}

impl fmt::Display for CurationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CurationStage::Structural => "structural",
            CurationStage::Pii => "pii",
            CurationStage::Policy => "policy",
            CurationStage::Dedup => "dedup",
            CurationStage::Safety => "safety",
        })
    }
}

#[derive(Error, Debug)]
pub enum CurationError {
    #[error("no rows left after the {stage} stage")]
    Empty { stage: CurationStage },

    #[error("invalid PII pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("failed to serialize dataset: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("safety classifier: {0}")]
    Safety(RemoteError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub min_output_chars: usize,
    pub max_output_chars: usize,
    pub pii_patterns: Vec<String>,
    pub disallowed_phrases: Vec<String>,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            min_output_chars: 5,
            max_output_chars: 5000,
            pii_patterns: vec![
                r"\b\d{10}\b".to_string(),
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b".to_string(),
                r"(?i)api[_-]?key\s*=\s*\S+".to_string(),
                r"(?i)password\s*[:=]\s*\S+".to_string(),
            ],
            disallowed_phrases: vec![
                "as an ai".to_string(),
                "i cannot help".to_string(),
                "the model should have".to_string(),
            ],
        }
    }
}

/// One line of the dataset artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

impl DatasetRecord {
    fn from_feedback(feedback: &Feedback) -> Self {
        Self {
            instruction: feedback.prompt.trim().to_string(),
            input: feedback.model_response.trim().to_string(),
            output: feedback.corrected_response.as_deref().unwrap_or_default().trim().to_string(),
        }
    }
}

/// Rows removed per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurationReport {
    pub input_rows: usize,
    pub structural: usize,
    pub pii: usize,
    pub policy: usize,
    pub duplicates: usize,
    pub unsafe_rows: usize,
}

#[derive(Debug, Clone)]
pub struct CuratedDataset {
    pub records: Vec<DatasetRecord>,
    pub report: CurationReport,
}

impl CuratedDataset {
    pub fn to_jsonl(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        for record in &self.records {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PublishedDataset {
    pub url: String,
    pub row_count: usize,
    pub report: CurationReport,
}

pub struct CurationPipeline {
    config: CurationConfig,
    pii: PiiDetector,
    policy: PolicyFilter,
    artifacts: Arc<dyn ArtifactStore>,
    safety: Option<Arc<dyn SafetyFilter>>,
}

impl CurationPipeline {
    pub fn new(
        config: CurationConfig,
        artifacts: Arc<dyn ArtifactStore>,
        safety: Option<Arc<dyn SafetyFilter>>,
    ) -> Result<Self, CurationError> {
        let pii = PiiDetector::new(&config.pii_patterns)?;
        let policy = PolicyFilter::new(&config.disallowed_phrases);
        Ok(Self {
            config,
            pii,
            policy,
            artifacts,
            safety,
        })
    }

    /// Stages 1 to 4. Pure and synchronous.
    pub fn curate(&self, rows: &[Feedback]) -> Result<CuratedDataset, CurationError> {
        let mut report = CurationReport {
            input_rows: rows.len(),
            ..Default::default()
        };

        let structural: Vec<&Feedback> = rows
            .iter()
            .filter(|fb| {
                match structural_defect(fb, self.config.min_output_chars, self.config.max_output_chars) {
                    Some(reason) => {
                        debug!("Dropping feedback {}: {}", fb.id, reason);
                        false
                    }
                    None => true,
                }
            })
            .collect();
        report.structural = rows.len() - structural.len();
        ensure_rows(&structural, CurationStage::Structural)?;

        let clean = self.drop_where(structural, &mut report.pii, |text| self.pii.detects(text));
        ensure_rows(&clean, CurationStage::Pii)?;

        let aligned = self.drop_where(clean, &mut report.policy, |text| self.policy.violates(text));
        ensure_rows(&aligned, CurationStage::Policy)?;

        let before = aligned.len();
        let unique = deduplicate(aligned);
        report.duplicates = before - unique.len();
        ensure_rows(&unique, CurationStage::Dedup)?;

        Ok(CuratedDataset {
            records: unique.into_iter().map(DatasetRecord::from_feedback).collect(),
            report,
        })
    }

    fn drop_where<'a>(
        &self,
        rows: Vec<&'a Feedback>,
        removed: &mut usize,
        reject: impl Fn(&str) -> bool,
    ) -> Vec<&'a Feedback> {
        let before = rows.len();
        let kept: Vec<&Feedback> = rows
            .into_iter()
            .filter(|fb| !reject(fb.corrected_response.as_deref().unwrap_or_default()))
            .collect();
        *removed = before - kept.len();
        kept
    }

    /// Curate, publish the artifact, then run the remote safety stage if configured.
    pub async fn run(
        &self,
        org_id: Uuid,
        version_id: Uuid,
        rows: &[Feedback],
    ) -> Result<PublishedDataset, CurationError> {
        let dataset = self.curate(rows)?;
        let bytes = dataset.to_jsonl()?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let stem = format!("{}/{}/dataset-{}", org_id, version_id, &digest[..16]);
        let url = self.publish(bytes.clone(), &format!("{stem}.jsonl")).await?;
        let mut report = dataset.report;

        info!(
            org_id = %org_id,
            version_id = %version_id,
            "Curated {} of {} feedback rows into {}",
            dataset.records.len(),
            report.input_rows,
            url
        );

        let Some(safety) = &self.safety else {
            return Ok(PublishedDataset {
                url,
                row_count: dataset.records.len(),
                report,
            });
        };

        // The classifier may rewrite its input in place, so it gets a fresh working copy and
        // the content-addressed dataset stays immutable across retries.
        let working = self
            .artifacts
            .put(bytes, &format!("{stem}.safe.jsonl"), WriteMode::Overwrite)
            .await?;
        let verdict = safety.filter(&working).await.map_err(CurationError::Safety)?;
        report.unsafe_rows = dataset.records.len().saturating_sub(verdict.rows_kept);
        if verdict.rows_kept == 0 {
            return Err(CurationError::Empty {
                stage: CurationStage::Safety,
            });
        }

        info!(
            org_id = %org_id,
            version_id = %version_id,
            "Safety classifier kept {} rows",
            verdict.rows_kept
        );
        Ok(PublishedDataset {
            url: verdict.cleaned_dataset_url,
            row_count: verdict.rows_kept,
            report,
        })
    }

    /// The path is derived from the content, so a collision with identical bytes is a
    /// retry of the same curation and the existing object is reused.
    async fn publish(&self, bytes: Vec<u8>, logical_path: &str) -> Result<String, CurationError> {
        let expected = bytes.clone();
        match self.artifacts.put(bytes, logical_path, WriteMode::CreateNew).await {
            Ok(url) => Ok(url),
            Err(ArtifactError::AlreadyExists { url }) => {
                let existing = self.artifacts.get(&url).await?;
                if existing == expected {
                    warn!("Reusing previously published dataset at {}", url);
                    Ok(url)
                } else {
                    Err(ArtifactError::AlreadyExists { url }.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn ensure_rows(rows: &[&Feedback], stage: CurationStage) -> Result<(), CurationError> {
    if rows.is_empty() {
        return Err(CurationError::Empty { stage });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::domain::NewFeedback;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn feedback(prompt: &str, response: &str, corrected: &str) -> Feedback {
        NewFeedback {
            prompt: prompt.to_string(),
            model_response: response.to_string(),
            corrected_response: Some(corrected.to_string()),
            rating: -1,
            tags: vec![],
        }
        .into_feedback(Uuid::new_v4(), Uuid::new_v4())
        .unwrap()
    }

    fn pipeline(artifacts: Arc<MemoryArtifactStore>, safety: Option<Arc<dyn SafetyFilter>>) -> CurationPipeline {
        CurationPipeline::new(CurationConfig::default(), artifacts, safety).unwrap()
    }

    struct KeepOne;

    #[async_trait]
    impl SafetyFilter for KeepOne {
        async fn filter(&self, dataset_url: &str) -> Result<SafetyVerdict, RemoteError> {
            Ok(SafetyVerdict {
                rows_kept: 1,
                cleaned_dataset_url: dataset_url.to_string(),
            })
        }
    }

    struct DropAll;

    #[async_trait]
    impl SafetyFilter for DropAll {
        async fn filter(&self, dataset_url: &str) -> Result<SafetyVerdict, RemoteError> {
            Ok(SafetyVerdict {
                rows_kept: 0,
                cleaned_dataset_url: dataset_url.to_string(),
            })
        }
    }

    /// Rewrites its input in place down to the first line, then times out once.
    struct RewriteThenTimeout {
        artifacts: Arc<MemoryArtifactStore>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl SafetyFilter for RewriteThenTimeout {
        async fn filter(&self, dataset_url: &str) -> Result<SafetyVerdict, RemoteError> {
            let bytes = self
                .artifacts
                .get(dataset_url)
                .await
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            let first = bytes.split_inclusive(|b| *b == b'\n').next().unwrap_or_default().to_vec();
            self.artifacts
                .put(first, dataset_url.trim_start_matches("mem://"), WriteMode::Overwrite)
                .await
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(RemoteError::Timeout(std::time::Duration::from_secs(30)));
            }
            Ok(SafetyVerdict {
                rows_kept: 1,
                cleaned_dataset_url: dataset_url.to_string(),
            })
        }
    }

    #[test]
    fn stages_apply_in_order() {
        let p = pipeline(Arc::new(MemoryArtifactStore::new()), None);
        let rows = vec![
            feedback("Capital of France?", "Lyon", "  Paris is the capital.  "),
            feedback("Contact?", "none", "Write to help@example.com today"),
            feedback("Tone?", "rude", "As an AI I would be polite."),
            feedback("capital of  FRANCE?", "lyon", "paris is the capital."),
            feedback("Empty?", "x", ""),
        ];

        let dataset = p.curate(&rows).unwrap();
        assert_eq!(
            dataset.records,
            vec![DatasetRecord {
                instruction: "Capital of France?".into(),
                input: "Lyon".into(),
                output: "Paris is the capital.".into(),
            }]
        );
        assert_eq!(
            dataset.report,
            CurationReport {
                input_rows: 5,
                structural: 1,
                pii: 1,
                policy: 1,
                duplicates: 1,
                unsafe_rows: 0,
            }
        );
    }

    #[test]
    fn empty_after_structural_stage() {
        let p = pipeline(Arc::new(MemoryArtifactStore::new()), None);
        let err = p.curate(&[feedback("Hi", "Hello", "")]).unwrap_err();
        assert!(matches!(err, CurationError::Empty { stage: CurationStage::Structural }));
    }

    #[test]
    fn jsonl_shape() {
        let p = pipeline(Arc::new(MemoryArtifactStore::new()), None);
        let dataset = p
            .curate(&[feedback("Q \"one\"", "A", "Better answer"), feedback("Q two", "B", "Other answer")])
            .unwrap();
        let text = String::from_utf8(dataset.to_jsonl().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["instruction"], "Q \"one\"");
        assert_eq!(first["output"], "Better answer");
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn run_publishes_and_reuses_identical_dataset() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let p = pipeline(artifacts.clone(), None);
        let rows = vec![feedback("Capital of France?", "Lyon", "Paris is the capital.")];
        let (org, version) = (Uuid::new_v4(), Uuid::new_v4());

        let first = p.run(org, version, &rows).await.unwrap();
        assert_eq!(first.row_count, 1);
        assert!(first.url.starts_with(&format!("mem://{}/{}/dataset-", org, version)));

        let again = p.run(org, version, &rows).await.unwrap();
        assert_eq!(again.url, first.url);
        assert_eq!(artifacts.len().await, 1);
    }

    #[tokio::test]
    async fn run_refuses_to_overwrite_different_content() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let p = pipeline(artifacts.clone(), None);
        let rows = vec![feedback("Capital of France?", "Lyon", "Paris is the capital.")];
        let (org, version) = (Uuid::new_v4(), Uuid::new_v4());

        let first = p.run(org, version, &rows).await.unwrap();
        let logical = first.url.trim_start_matches("mem://").to_string();
        artifacts
            .put(b"tampered".to_vec(), &logical, WriteMode::Overwrite)
            .await
            .unwrap();

        let err = p.run(org, version, &rows).await.unwrap_err();
        assert!(matches!(err, CurationError::Artifact(ArtifactError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn safety_stage_sets_final_count() {
        let rows = vec![
            feedback("Capital of France?", "Lyon", "Paris is the capital."),
            feedback("Capital of Spain?", "Porto", "Madrid is the capital."),
        ];

        let p = pipeline(Arc::new(MemoryArtifactStore::new()), Some(Arc::new(KeepOne)));
        let published = p.run(Uuid::new_v4(), Uuid::new_v4(), &rows).await.unwrap();
        assert_eq!(published.row_count, 1);
        assert_eq!(published.report.unsafe_rows, 1);

        let p = pipeline(Arc::new(MemoryArtifactStore::new()), Some(Arc::new(DropAll)));
        let err = p.run(Uuid::new_v4(), Uuid::new_v4(), &rows).await.unwrap_err();
        assert!(matches!(err, CurationError::Empty { stage: CurationStage::Safety }));
    }

    #[tokio::test]
    async fn safety_retry_after_in_place_rewrite() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let safety: Arc<dyn SafetyFilter> = Arc::new(RewriteThenTimeout {
            artifacts: artifacts.clone(),
            failed: AtomicBool::new(false),
        });
        let p = pipeline(artifacts.clone(), Some(safety));
        let rows = vec![
            feedback("Capital of France?", "Lyon", "Paris is the capital."),
            feedback("Capital of Spain?", "Porto", "Madrid is the capital."),
        ];
        let (org, version) = (Uuid::new_v4(), Uuid::new_v4());
        let expected = p.curate(&rows).unwrap().to_jsonl().unwrap();

        let err = p.run(org, version, &rows).await.unwrap_err();
        assert!(matches!(err, CurationError::Safety(RemoteError::Timeout(_))));

        let published = p.run(org, version, &rows).await.unwrap();
        assert_eq!(published.row_count, 1);
        assert_eq!(published.report.unsafe_rows, 1);
        assert!(published.url.ends_with(".safe.jsonl"));
        let cleaned = artifacts.get(&published.url).await.unwrap();
        assert_eq!(cleaned.iter().filter(|b| **b == b'\n').count(), 1);

        let digest = hex::encode(Sha256::digest(&expected));
        let original = artifacts
            .get(&format!("mem://{}/{}/dataset-{}.jsonl", org, version, &digest[..16]))
            .await
            .unwrap();
        assert_eq!(original, expected);
    }
}
