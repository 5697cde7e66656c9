//! Human-in-the-loop fine-tuning: feedback intake, dataset curation, training dispatch
//! and the per-organization model version lineage that ties them together.

pub mod artifact;
pub mod config;
pub mod curation;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod store;

pub use artifact::{ArtifactError, ArtifactStore, HttpFallbackStore, LocalArtifactStore, MemoryArtifactStore, WriteMode};
pub use config::Config;
pub use curation::{CurationConfig, CurationPipeline, HttpSafetyFilter, SafetyFilter};
pub use dispatch::{HttpTrainingDispatcher, TrainingDispatcher, WaitPolicy};
pub use domain::{AdapterConfig, Feedback, FeedbackFilter, FeedbackTag, ModelVersion, NewFeedback, VersionStatus};
pub use error::{ErrorContext, ErrorKind, ForgeError, Result, Stage};
pub use lifecycle::{Promotion, TrainingProgress, TrainingStats, VersionLifecycleManager};
pub use store::{LifecycleStore, MemoryStore, PgStore};
