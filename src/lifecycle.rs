//! The ModelVersion state machine.
//!
//! ```text
//! COLLECTING_FEEDBACK -> TRAINING_REQUESTED -> TRAINING_IN_PROGRESS -> READY | FAILED
//! ```
//!
//! READY opens the successor version in the same store transaction. Every transition
//! is a compare-and-swap on the version's status and revision, so concurrent callers
//! racing on one version see exactly one winner and a `Conflict` for the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::curation::CurationPipeline;
use crate::dispatch::{JobHandle, JobStatus, RemoteError, TrainingArtifact, TrainingDispatcher, TrainingSubmission, WaitPolicy};
use crate::domain::{AdapterConfig, Feedback, FeedbackFilter, ModelVersion, NewFeedback, VersionStatus};
use crate::error::{ErrorContext, ForgeError, Result, Stage};
use crate::store::{LifecycleStore, StoreError};

/// Attempts for feedback_ids edits that lose a compare-and-swap to a concurrent edit.
const MAX_EDIT_ATTEMPTS: usize = 5;

/// A READY version and the successor it opened.
#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub version: ModelVersion,
    pub successor: ModelVersion,
}

/// Result of a single status check on a dispatched version.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingProgress {
    Running { version: ModelVersion },
    Ready(Promotion),
}

/// Latest version with the feedback rows it selected, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingStats {
    pub version: ModelVersion,
    pub feedback: Vec<Feedback>,
}

pub struct VersionLifecycleManager {
    store: Arc<dyn LifecycleStore>,
    artifacts: Arc<dyn ArtifactStore>,
    curation: CurationPipeline,
    dispatcher: Arc<dyn TrainingDispatcher>,
    wait: WaitPolicy,
}

impl VersionLifecycleManager {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        artifacts: Arc<dyn ArtifactStore>,
        curation: CurationPipeline,
        dispatcher: Arc<dyn TrainingDispatcher>,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            store,
            artifacts,
            curation,
            dispatcher,
            wait,
        }
    }

    // ─── Versions ─────────────────────────────────────────────────────────────

    /// Open the next version for `org_id`, or version 0 for an org without lineage.
    ///
    /// Only allowed when no version of the org is open or in training.
    pub async fn open_version(&self, org_id: Uuid) -> Result<ModelVersion> {
        let ctx = ErrorContext::new(Stage::OpenVersion).org(org_id);
        let versions = self.store.list_versions(org_id).await.map_err(|e| ctx.store(e))?;

        if let Some(busy) = versions.iter().find(|v| !v.status.is_terminal()) {
            return Err(ctx.version(busy.id).conflict(format!(
                "version {} of org {} is still {}",
                busy.version, org_id, busy.status
            )));
        }

        let next = match versions.first() {
            Some(latest) => latest.successor(),
            None => ModelVersion::bootstrap(org_id),
        };
        self.store
            .insert_version(&next)
            .await
            .map_err(|e| ctx.version(next.id).store(e))?;

        info!(org_id = %org_id, version_id = %next.id, "Opened model version {}", next.version);
        Ok(next)
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<ModelVersion> {
        self.load(version_id, ErrorContext::new(Stage::Query)).await
    }

    /// The org's version currently collecting feedback.
    pub async fn deployed_version(&self, org_id: Uuid) -> Result<Option<ModelVersion>> {
        self.store
            .open_version(org_id)
            .await
            .map_err(|e| ErrorContext::new(Stage::Query).org(org_id).store(e))
    }

    /// Highest version number regardless of status.
    pub async fn latest_version(&self, org_id: Uuid) -> Result<Option<ModelVersion>> {
        self.store
            .latest_version(org_id)
            .await
            .map_err(|e| ErrorContext::new(Stage::Query).org(org_id).store(e))
    }

    pub async fn list_versions(&self, org_id: Uuid) -> Result<Vec<ModelVersion>> {
        self.store
            .list_versions(org_id)
            .await
            .map_err(|e| ErrorContext::new(Stage::Query).org(org_id).store(e))
    }

    /// `version_id` followed by its ancestors down to version 0.
    pub async fn lineage(&self, version_id: Uuid) -> Result<Vec<ModelVersion>> {
        let ctx = ErrorContext::new(Stage::Query).version(version_id);
        let mut current = self.load(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);

        let mut chain = Vec::with_capacity(current.version as usize + 1);
        while current.version > 0 {
            let parent = self
                .store
                .version_by_number(current.org_id, current.version - 1)
                .await
                .map_err(|e| ctx.store(e))?
                .filter(|p| Some(p.id) == current.parent_model_version_id)
                .ok_or_else(|| {
                    ctx.storage(format!(
                        "lineage of org {} is broken below version {}",
                        current.org_id, current.version
                    ))
                })?;
            chain.push(std::mem::replace(&mut current, parent));
        }
        chain.push(current);
        Ok(chain)
    }

    // ─── Feedback ─────────────────────────────────────────────────────────────

    /// Validate and store feedback against the deployed version.
    pub async fn record_feedback(&self, org_id: Uuid, input: NewFeedback) -> Result<Feedback> {
        let ctx = ErrorContext::new(Stage::Intake).org(org_id);
        let deployed = self
            .deployed_version(org_id)
            .await?
            .ok_or_else(|| ctx.conflict(format!("org {} has no deployed version", org_id)))?;
        let ctx = ctx.version(deployed.id);

        let feedback = input
            .into_feedback(org_id, deployed.id)
            .map_err(|e| ctx.validation(e.0))?;
        self.store
            .insert_feedback(&feedback)
            .await
            .map_err(|e| ctx.store(e))?;

        debug!(org_id = %org_id, version_id = %deployed.id, "Recorded feedback {}", feedback.id);
        Ok(feedback)
    }

    /// Unclaimed feedback of the deployed version matching `filter`, newest first.
    pub async fn candidate_feedback(&self, org_id: Uuid, filter: &FeedbackFilter) -> Result<Vec<Feedback>> {
        let ctx = ErrorContext::new(Stage::Query).org(org_id);
        let deployed = self
            .deployed_version(org_id)
            .await?
            .ok_or_else(|| ctx.not_found(format!("org {} has no deployed version", org_id)))?;

        let claimed = self
            .store
            .claimed_feedback_ids(org_id)
            .await
            .map_err(|e| ctx.store(e))?;
        let rows = self
            .store
            .feedback_for_version(org_id, deployed.id)
            .await
            .map_err(|e| ctx.version(deployed.id).store(e))?;

        Ok(rows
            .into_iter()
            .filter(|fb| !claimed.contains(&fb.id) && filter.matches(fb))
            .collect())
    }

    pub async fn training_stats(&self, org_id: Uuid) -> Result<TrainingStats> {
        let ctx = ErrorContext::new(Stage::Query).org(org_id);
        let version = self
            .latest_version(org_id)
            .await?
            .ok_or_else(|| ctx.not_found(format!("org {} has no model versions", org_id)))?;
        let mut feedback = self
            .store
            .feedback_by_ids(org_id, &version.feedback_ids)
            .await
            .map_err(|e| ctx.version(version.id).store(e))?;
        feedback.sort_by_key(|fb| fb.created_at);
        Ok(TrainingStats { version, feedback })
    }

    pub async fn attach_feedback(&self, version_id: Uuid, feedback_id: Uuid) -> Result<ModelVersion> {
        let ctx = ErrorContext::new(Stage::Attach).version(version_id);
        for attempt in 1..=MAX_EDIT_ATTEMPTS {
            let current = self.load(version_id, ctx).await?;
            let ctx = ctx.org(current.org_id);
            ensure_open(&current, ctx)?;

            if current.feedback_ids.contains(&feedback_id) {
                return Err(ctx.conflict(format!("feedback {} is already attached", feedback_id)));
            }
            let feedback = self
                .store
                .get_feedback(feedback_id)
                .await
                .map_err(|e| ctx.store(e))?
                .ok_or_else(|| ctx.not_found(format!("feedback {} not found", feedback_id)))?;
            if feedback.org_id != current.org_id || feedback.model_version_id != current.id {
                return Err(ctx.conflict(format!(
                    "feedback {} was not recorded against version {}",
                    feedback_id, current.id
                )));
            }

            let mut next = current.clone();
            next.feedback_ids.push(feedback_id);
            match self.store.swap_version(&current, &next).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(msg)) if attempt < MAX_EDIT_ATTEMPTS => {
                    debug!(version_id = %version_id, "Retrying attach after concurrent edit: {}", msg);
                }
                Err(e) => return Err(ctx.store(e)),
            }
        }
        Err(ctx.conflict(format!("version {} kept changing during attach", version_id)))
    }

    pub async fn detach_feedback(&self, version_id: Uuid, feedback_id: Uuid) -> Result<ModelVersion> {
        let ctx = ErrorContext::new(Stage::Detach).version(version_id);
        for attempt in 1..=MAX_EDIT_ATTEMPTS {
            let current = self.load(version_id, ctx).await?;
            let ctx = ctx.org(current.org_id);
            ensure_open(&current, ctx)?;

            let mut next = current.clone();
            next.feedback_ids.retain(|id| *id != feedback_id);
            if next.feedback_ids.len() == current.feedback_ids.len() {
                return Err(ctx.not_found(format!("feedback {} is not attached", feedback_id)));
            }

            match self.store.swap_version(&current, &next).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(msg)) if attempt < MAX_EDIT_ATTEMPTS => {
                    debug!(version_id = %version_id, "Retrying detach after concurrent edit: {}", msg);
                }
                Err(e) => return Err(ctx.store(e)),
            }
        }
        Err(ctx.conflict(format!("version {} kept changing during detach", version_id)))
    }

    // ─── Training ─────────────────────────────────────────────────────────────

    /// Curate the attached feedback and move the version to TRAINING_REQUESTED.
    ///
    /// Any failure leaves the version collecting feedback, so the call can be retried.
    pub async fn request_training(&self, version_id: Uuid) -> Result<ModelVersion> {
        let ctx = ErrorContext::new(Stage::Curation).version(version_id);
        let current = self.load(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);
        ensure_open(&current, ctx)?;

        if current.feedback_ids.is_empty() {
            return Err(ctx.validation("no feedback attached"));
        }
        let rows = self
            .store
            .feedback_by_ids(current.org_id, &current.feedback_ids)
            .await
            .map_err(|e| ctx.store(e))?;
        if rows.len() != current.feedback_ids.len() {
            return Err(ctx.not_found(format!(
                "{} of {} attached feedback rows are missing",
                current.feedback_ids.len() - rows.len(),
                current.feedback_ids.len()
            )));
        }

        let published = self
            .curation
            .run(current.org_id, current.id, &rows)
            .await
            .map_err(|e| {
                warn!(org_id = %current.org_id, version_id = %version_id, stage = "curation", "Curation failed: {}", e);
                ctx.curation(e)
            })?;
        let row_count = i32::try_from(published.row_count)
            .map_err(|_| ctx.validation(format!("row count {} out of range", published.row_count)))?;

        let mut next = current.clone();
        next.status = VersionStatus::TrainingRequested;
        next.json_url = Some(published.url);
        next.row_count = Some(row_count);
        let stored = self
            .store
            .swap_version(&current, &next)
            .await
            .map_err(|e| ctx.store(e))?;

        info!(
            org_id = %stored.org_id,
            version_id = %stored.id,
            "Training requested for version {} with {} rows",
            stored.version,
            row_count
        );
        Ok(stored)
    }

    /// Lock `config`, dispatch, wait for the remote job and finalize.
    pub async fn configure_adapter(&self, version_id: Uuid, config: AdapterConfig) -> Result<Promotion> {
        let dispatched = self.submit_training(version_id, config).await?;
        self.await_training(dispatched.id).await
    }

    /// Lock `config`, move to TRAINING_IN_PROGRESS and submit the job without waiting.
    ///
    /// A submission error marks the version FAILED since the config is already locked.
    pub async fn submit_training(&self, version_id: Uuid, config: AdapterConfig) -> Result<ModelVersion> {
        let ctx = ErrorContext::new(Stage::Configure).version(version_id);
        let current = self.load(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);

        if current.status != VersionStatus::TrainingRequested || current.adapter_config.is_some() {
            return Err(ctx.conflict(format!(
                "version {} is {} and cannot be configured",
                current.version, current.status
            )));
        }
        config.validate().map_err(|e| ctx.validation(e.0))?;
        let dataset_url = current
            .json_url
            .clone()
            .ok_or_else(|| ctx.storage("version has no dataset url"))?;

        let mut locked = current.clone();
        locked.adapter_config = Some(config.clone());
        locked.status = VersionStatus::TrainingInProgress;
        locked.dispatched_at = Some(Utc::now());
        let locked = self
            .store
            .swap_version(&current, &locked)
            .await
            .map_err(|e| ctx.store(e))?;

        let ctx = ctx.at(Stage::Dispatch);
        let submission = TrainingSubmission {
            model_version_id: locked.id,
            dataset_url,
            adapter_config: config,
        };
        let handle = match self.dispatcher.submit(&submission).await {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_failed(&locked, ctx, &e.to_string()).await;
                return Err(ctx.remote(e));
            }
        };

        let mut submitted = locked.clone();
        submitted.training_job_id = Some(handle.job_id.clone());
        let stored = self
            .store
            .swap_version(&locked, &submitted)
            .await
            .map_err(|e| ctx.store(e))?;

        info!(
            org_id = %stored.org_id,
            version_id = %stored.id,
            "Submitted training job {} for version {}",
            handle.job_id,
            stored.version
        );
        Ok(stored)
    }

    /// Check the remote job once and finalize the version if the job is done.
    ///
    /// A job still running once the training deadline has passed fails the version.
    pub async fn poll_training(&self, version_id: Uuid) -> Result<TrainingProgress> {
        let ctx = ErrorContext::new(Stage::Training).version(version_id);
        let (current, handle) = self.in_flight(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);

        match self.dispatcher.poll(&handle).await {
            Ok(JobStatus::Pending) | Ok(JobStatus::Running) => {
                if self.time_left(&current).is_zero() {
                    return Err(self.expire(&current, ctx).await);
                }
                Ok(TrainingProgress::Running { version: current })
            }
            Ok(JobStatus::Succeeded(artifact)) => self.finalize(&current, artifact).await.map(TrainingProgress::Ready),
            Ok(JobStatus::Failed(reason)) => {
                self.mark_failed(&current, ctx, &reason).await;
                Err(ctx.remote(RemoteError::Execution(reason)))
            }
            // A failed status check says nothing about the job itself.
            Err(e) => Err(ctx.remote(e)),
        }
    }

    /// Wait for the remote job until the training deadline and finalize.
    pub async fn await_training(&self, version_id: Uuid) -> Result<Promotion> {
        let ctx = ErrorContext::new(Stage::Training).version(version_id);
        let (current, handle) = self.in_flight(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);

        let remaining = self.time_left(&current);
        if remaining.is_zero() {
            return Err(self.expire(&current, ctx).await);
        }
        let policy = WaitPolicy {
            timeout: remaining,
            ..self.wait.clone()
        };

        match self.dispatcher.wait(&handle, &policy).await {
            Ok(artifact) => self.finalize(&current, artifact).await,
            Err(e) => {
                self.mark_failed(&current, ctx, &e.to_string()).await;
                Err(ctx.remote(e))
            }
        }
    }

    /// A version in training together with its remote job.
    ///
    /// Without a job id the submission is still in flight: that is a conflict until the
    /// training deadline passes, after which the version is failed.
    async fn in_flight(&self, version_id: Uuid, ctx: ErrorContext) -> Result<(ModelVersion, JobHandle)> {
        let current = self.load(version_id, ctx).await?;
        let ctx = ctx.org(current.org_id);
        if current.status != VersionStatus::TrainingInProgress {
            return Err(ctx.conflict(format!(
                "version {} is {}, not training",
                current.version, current.status
            )));
        }
        match current.training_job_id.clone() {
            Some(job_id) => Ok((current, JobHandle { job_id })),
            None if self.time_left(&current).is_zero() => Err(self.expire(&current, ctx).await),
            None => Err(ctx.conflict(format!(
                "training submission for version {} is still pending",
                current.version
            ))),
        }
    }

    /// Time remaining before the training deadline of a dispatched version.
    fn time_left(&self, version: &ModelVersion) -> Duration {
        match version.dispatched_at {
            Some(at) => {
                let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
                self.wait.timeout.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    async fn expire(&self, current: &ModelVersion, ctx: ErrorContext) -> ForgeError {
        let err = RemoteError::Timeout(self.wait.timeout);
        self.mark_failed(current, ctx, &err.to_string()).await;
        ctx.remote(err)
    }

    /// Record the adapter, move to READY and open the successor atomically.
    async fn finalize(&self, current: &ModelVersion, artifact: TrainingArtifact) -> Result<Promotion> {
        let ctx = ErrorContext::new(Stage::Finalize)
            .org(current.org_id)
            .version(current.id);

        let bytes = match self.artifacts.get(&artifact.adapter_dir).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mark_failed(current, ctx, &e.to_string()).await;
                return Err(ctx.artifact(e));
            }
        };
        let digest = hex::encode(Sha256::digest(&bytes));

        let mut ready = current.clone();
        ready.status = VersionStatus::Ready;
        ready.adapter_url = Some(artifact.adapter_dir);
        ready.sha256 = Some(digest);
        let successor = current.successor();

        let version = self
            .store
            .swap_version_and_open(current, &ready, &successor)
            .await
            .map_err(|e| ctx.store(e))?;

        info!(
            org_id = %version.org_id,
            version_id = %version.id,
            "Version {} is READY ({} adapter files); opened version {}",
            version.version,
            artifact.files.len(),
            successor.version
        );
        Ok(Promotion { version, successor })
    }

    /// Best effort: a concurrent finalizer may already have moved the version on.
    async fn mark_failed(&self, current: &ModelVersion, ctx: ErrorContext, reason: &str) {
        error!(
            org_id = %current.org_id,
            version_id = %current.id,
            stage = %ctx.stage,
            "Training failed for version {}: {}",
            current.version,
            reason
        );
        let mut failed = current.clone();
        failed.status = VersionStatus::Failed;
        if let Err(e) = self.store.swap_version(current, &failed).await {
            warn!(version_id = %current.id, "Could not mark version FAILED: {}", e);
        }
    }

    async fn load(&self, version_id: Uuid, ctx: ErrorContext) -> Result<ModelVersion> {
        self.store
            .get_version(version_id)
            .await
            .map_err(|e| ctx.store(e))?
            .ok_or_else(|| ctx.not_found(format!("model version {} not found", version_id)))
    }
}

fn ensure_open(version: &ModelVersion, ctx: ErrorContext) -> Result<()> {
    if !version.is_open() {
        return Err(ctx.conflict(format!(
            "version {} is {}, not collecting feedback",
            version.version, version.status
        )));
    }
    Ok(())
}
