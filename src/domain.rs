//! Persisted entities shared by the store, the curation pipeline and the lifecycle manager.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rejected caller input. The lifecycle manager turns it into a validation error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidInput(pub String);

// ─── Version status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    CollectingFeedback,
    TrainingRequested,
    TrainingInProgress,
    Ready,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::CollectingFeedback => "COLLECTING_FEEDBACK",
            VersionStatus::TrainingRequested => "TRAINING_REQUESTED",
            VersionStatus::TrainingInProgress => "TRAINING_IN_PROGRESS",
            VersionStatus::Ready => "READY",
            VersionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VersionStatus::Ready | VersionStatus::Failed)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COLLECTING_FEEDBACK" => Ok(VersionStatus::CollectingFeedback),
            "TRAINING_REQUESTED" => Ok(VersionStatus::TrainingRequested),
            "TRAINING_IN_PROGRESS" => Ok(VersionStatus::TrainingInProgress),
            "READY" => Ok(VersionStatus::Ready),
            "FAILED" => Ok(VersionStatus::Failed),
            other => Err(InvalidInput(format!("unknown version status: {}", other))),
        }
    }
}

// ─── Adapter configuration ────────────────────────────────────────────────────

pub const ALLOWED_BASE_MODELS: &[&str] = &[
    "meta-llama/Meta-Llama-3-8B-Instruct",
    "mistralai/Mistral-7B-Instruct-v0.2",
    "Qwen/Qwen2.5-7B-Instruct",
    "microsoft/phi-3-mini-4k-instruct",
];

pub const ALLOWED_TARGET_MODULES: &[&str] = &[
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
    "query_key_value",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: u32,
    pub alpha: u32,
    pub dropout: f64,
    pub target_modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub seed: u32,
}

/// LoRA adapter configuration locked onto a version before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_model: String,
    pub lora: LoraConfig,
    pub training: TrainingParams,
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), InvalidInput> {
        if !ALLOWED_BASE_MODELS.contains(&self.base_model.as_str()) {
            return Err(InvalidInput(format!("unsupported base model: {}", self.base_model)));
        }

        let lora = &self.lora;
        check_range("lora.r", lora.r as f64, 4.0, 64.0)?;
        check_range("lora.alpha", lora.alpha as f64, 8.0, 128.0)?;
        check_range("lora.dropout", lora.dropout, 0.0, 0.3)?;
        if lora.target_modules.is_empty() {
            return Err(InvalidInput("lora.target_modules cannot be empty".to_string()));
        }
        let invalid: Vec<&str> = lora
            .target_modules
            .iter()
            .map(String::as_str)
            .filter(|m| !ALLOWED_TARGET_MODULES.contains(m))
            .collect();
        if !invalid.is_empty() {
            return Err(InvalidInput(format!("invalid target modules: {}", invalid.join(", "))));
        }

        let training = &self.training;
        check_range("training.epochs", training.epochs as f64, 1.0, 5.0)?;
        check_range("training.batch_size", training.batch_size as f64, 1.0, 16.0)?;
        check_range("training.learning_rate", training.learning_rate, 1e-5, 5e-4)?;
        check_range("training.seed", training.seed as f64, 0.0, 10_000.0)?;
        Ok(())
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), InvalidInput> {
    if value.is_nan() || value < min || value > max {
        return Err(InvalidInput(format!(
            "{} must be within [{}, {}], got {}",
            field, min, max, value
        )));
    }
    Ok(())
}

// ─── Model version ────────────────────────────────────────────────────────────

/// One node of an organization's fine-tuning lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: Uuid,
    pub org_id: Uuid,
    pub version: i32,
    pub parent_model_version_id: Option<Uuid>,
    pub status: VersionStatus,
    pub feedback_ids: Vec<Uuid>,
    pub adapter_config: Option<AdapterConfig>,
    pub json_url: Option<String>,
    pub row_count: Option<i32>,
    pub adapter_url: Option<String>,
    pub sha256: Option<String>,
    /// Remote training job, set once the submission has been accepted.
    pub training_job_id: Option<String>,
    /// When the version entered TRAINING_IN_PROGRESS; the training deadline counts from here.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful write; used for compare-and-swap.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl ModelVersion {
    /// Version 0 of an organization with no lineage yet.
    pub fn bootstrap(org_id: Uuid) -> Self {
        Self::open(org_id, 0, None)
    }

    /// The version that follows `self` in the lineage, collecting feedback.
    pub fn successor(&self) -> Self {
        Self::open(self.org_id, self.version + 1, Some(self.id))
    }

    fn open(org_id: Uuid, version: i32, parent: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            version,
            parent_model_version_id: parent,
            status: VersionStatus::CollectingFeedback,
            feedback_ids: Vec::new(),
            adapter_config: None,
            json_url: None,
            row_count: None,
            adapter_url: None,
            sha256: None,
            training_job_id: None,
            dispatched_at: None,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == VersionStatus::CollectingFeedback
    }
}

// ─── Feedback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTag {
    Hallucination,
    Incorrect,
    Speculative,
    Incomplete,
    Overcomplete,
    PartialCompliance,
    WrongFormat,
    IgnoredConstraints,
    Unclear,
    Verbose,
    TooShort,
    Unsafe,
    PolicyViolation,
}

impl FeedbackTag {
    pub const ALL: [FeedbackTag; 13] = [
        FeedbackTag::Hallucination,
        FeedbackTag::Incorrect,
        FeedbackTag::Speculative,
        FeedbackTag::Incomplete,
        FeedbackTag::Overcomplete,
        FeedbackTag::PartialCompliance,
        FeedbackTag::WrongFormat,
        FeedbackTag::IgnoredConstraints,
        FeedbackTag::Unclear,
        FeedbackTag::Verbose,
        FeedbackTag::TooShort,
        FeedbackTag::Unsafe,
        FeedbackTag::PolicyViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackTag::Hallucination => "hallucination",
            FeedbackTag::Incorrect => "incorrect",
            FeedbackTag::Speculative => "speculative",
            FeedbackTag::Incomplete => "incomplete",
            FeedbackTag::Overcomplete => "overcomplete",
            FeedbackTag::PartialCompliance => "partial_compliance",
            FeedbackTag::WrongFormat => "wrong_format",
            FeedbackTag::IgnoredConstraints => "ignored_constraints",
            FeedbackTag::Unclear => "unclear",
            FeedbackTag::Verbose => "verbose",
            FeedbackTag::TooShort => "too_short",
            FeedbackTag::Unsafe => "unsafe",
            FeedbackTag::PolicyViolation => "policy_violation",
        }
    }
}

impl fmt::Display for FeedbackTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackTag {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        FeedbackTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == needle)
            .ok_or_else(|| InvalidInput(format!("unknown feedback tag: {}", s)))
    }
}

/// A labeled example tied to the version that was deployed when it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub org_id: Uuid,
    pub model_version_id: Uuid,
    pub prompt: String,
    pub model_response: String,
    pub corrected_response: Option<String>,
    pub rating: i16,
    pub tags: BTreeSet<FeedbackTag>,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    /// A missing correction and a blank one are the same thing.
    pub fn has_correction(&self) -> bool {
        self.corrected_response
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Caller-supplied feedback before it is bound to a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFeedback {
    pub prompt: String,
    pub model_response: String,
    #[serde(default)]
    pub corrected_response: Option<String>,
    pub rating: i16,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewFeedback {
    pub fn into_feedback(self, org_id: Uuid, model_version_id: Uuid) -> Result<Feedback, InvalidInput> {
        if self.prompt.trim().is_empty() {
            return Err(InvalidInput("prompt cannot be empty".to_string()));
        }
        if self.model_response.trim().is_empty() {
            return Err(InvalidInput("model_response cannot be empty".to_string()));
        }
        if !matches!(self.rating, -1..=1) {
            return Err(InvalidInput(format!("rating must be -1, 0 or 1, got {}", self.rating)));
        }
        let tags = self
            .tags
            .iter()
            .map(|t| t.parse::<FeedbackTag>())
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Feedback {
            id: Uuid::new_v4(),
            org_id,
            model_version_id,
            prompt: self.prompt,
            model_response: self.model_response,
            corrected_response: self.corrected_response,
            rating: self.rating,
            tags,
            created_at: Utc::now(),
        })
    }
}

/// Selection criteria for feedback that has not been claimed by a version yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackFilter {
    #[serde(default)]
    pub ratings: Vec<i16>,
    #[serde(default)]
    pub tags: Vec<FeedbackTag>,
    #[serde(default)]
    pub has_correction: Option<bool>,
}

impl FeedbackFilter {
    pub fn matches(&self, feedback: &Feedback) -> bool {
        if !self.ratings.is_empty() && !self.ratings.contains(&feedback.rating) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| feedback.tags.contains(t)) {
            return false;
        }
        match self.has_correction {
            Some(wanted) => feedback.has_correction() == wanted,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AdapterConfig {
        AdapterConfig {
            base_model: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            lora: LoraConfig {
                r: 16,
                alpha: 32,
                dropout: 0.05,
                target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            },
            training: TrainingParams {
                epochs: 3,
                batch_size: 4,
                learning_rate: 2e-4,
                seed: 42,
            },
        }
    }

    #[test]
    fn adapter_config_bounds() {
        assert!(valid_config().validate().is_ok());

        let mut cfg = valid_config();
        cfg.base_model = "gpt-2".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.lora.r = 128;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.lora.target_modules = vec!["lm_head".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.0.contains("lm_head"));

        let mut cfg = valid_config();
        cfg.lora.target_modules.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.training.learning_rate = 1e-2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn adapter_config_wire_shape() {
        let value = serde_json::to_value(valid_config()).unwrap();
        assert_eq!(value["lora"]["target_modules"][0], "q_proj");
        assert_eq!(value["training"]["seed"], 42);
    }

    #[test]
    fn successor_links_to_parent() {
        let org = Uuid::new_v4();
        let v0 = ModelVersion::bootstrap(org);
        let v1 = v0.successor();
        assert_eq!(v0.version, 0);
        assert_eq!(v0.parent_model_version_id, None);
        assert_eq!(v1.version, 1);
        assert_eq!(v1.parent_model_version_id, Some(v0.id));
        assert!(v1.is_open());
        assert!(v1.feedback_ids.is_empty());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            VersionStatus::CollectingFeedback,
            VersionStatus::TrainingRequested,
            VersionStatus::TrainingInProgress,
            VersionStatus::Ready,
            VersionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<VersionStatus>().unwrap(), status);
        }
        assert!("FINISHED".parse::<VersionStatus>().is_err());
    }

    #[test]
    fn new_feedback_validation() {
        let org = Uuid::new_v4();
        let version = Uuid::new_v4();
        let base = NewFeedback {
            prompt: "What is 2+2?".to_string(),
            model_response: "5".to_string(),
            corrected_response: Some("4".to_string()),
            rating: -1,
            tags: vec!["incorrect".to_string(), "incorrect".to_string()],
        };

        let fb = base.clone().into_feedback(org, version).unwrap();
        assert_eq!(fb.tags.len(), 1);
        assert_eq!(fb.model_version_id, version);

        let mut bad = base.clone();
        bad.rating = 2;
        assert!(bad.into_feedback(org, version).is_err());

        let mut bad = base;
        bad.tags = vec!["rude".to_string()];
        assert!(bad.into_feedback(org, version).is_err());
    }

    #[test]
    fn blank_correction_counts_as_missing() {
        let mut fb = NewFeedback {
            prompt: "p".to_string(),
            model_response: "r".to_string(),
            corrected_response: Some("   ".to_string()),
            rating: 0,
            tags: vec![],
        }
        .into_feedback(Uuid::new_v4(), Uuid::new_v4())
        .unwrap();
        assert!(!fb.has_correction());

        fb.corrected_response = None;
        assert!(!fb.has_correction());

        fb.corrected_response = Some("fixed".to_string());
        assert!(fb.has_correction());
    }

    #[test]
    fn filter_combines_criteria() {
        let fb = NewFeedback {
            prompt: "p".to_string(),
            model_response: "r".to_string(),
            corrected_response: Some("better".to_string()),
            rating: -1,
            tags: vec!["verbose".to_string()],
        }
        .into_feedback(Uuid::new_v4(), Uuid::new_v4())
        .unwrap();

        assert!(FeedbackFilter::default().matches(&fb));
        assert!(FeedbackFilter {
            ratings: vec![-1],
            tags: vec![FeedbackTag::Verbose, FeedbackTag::Unsafe],
            has_correction: Some(true),
        }
        .matches(&fb));
        assert!(!FeedbackFilter {
            ratings: vec![1],
            ..Default::default()
        }
        .matches(&fb));
        assert!(!FeedbackFilter {
            has_correction: Some(false),
            ..Default::default()
        }
        .matches(&fb));
    }
}
