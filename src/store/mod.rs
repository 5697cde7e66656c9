//! Durable records for feedback rows and model versions.
//!
//! Every version write is a compare-and-swap on `(id, status, revision)`, so two
//! callers racing on the same transition cannot both succeed.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Feedback, ModelVersion};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A guard or uniqueness constraint rejected the write.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    /// A persisted row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert_feedback(&self, feedback: &Feedback) -> StoreResult<()>;

    async fn get_feedback(&self, id: Uuid) -> StoreResult<Option<Feedback>>;

    /// Rows for `ids` within `org_id`, in the order of `ids`. Unknown ids are skipped.
    async fn feedback_by_ids(&self, org_id: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Feedback>>;

    /// All rows recorded against a version, newest first.
    async fn feedback_for_version(&self, org_id: Uuid, version_id: Uuid) -> StoreResult<Vec<Feedback>>;
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Insert a fresh version. Fails with `Conflict` when `(org_id, version)` is taken
    /// or when the version is open and the org already has an open version.
    async fn insert_version(&self, version: &ModelVersion) -> StoreResult<()>;

    async fn get_version(&self, id: Uuid) -> StoreResult<Option<ModelVersion>>;

    /// The org's unique version in `COLLECTING_FEEDBACK`.
    async fn open_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>>;

    /// Lineage lookup through the `(org_id, version)` index.
    async fn version_by_number(&self, org_id: Uuid, version: i32) -> StoreResult<Option<ModelVersion>>;

    async fn latest_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>>;

    /// Newest first.
    async fn list_versions(&self, org_id: Uuid) -> StoreResult<Vec<ModelVersion>>;

    /// Feedback ids referenced by any version of the org.
    async fn claimed_feedback_ids(&self, org_id: Uuid) -> StoreResult<HashSet<Uuid>>;

    /// Replace `current` with `next` if the stored row still has `current`'s status and
    /// revision. Returns the stored row with its new revision.
    async fn swap_version(&self, current: &ModelVersion, next: &ModelVersion) -> StoreResult<ModelVersion>;

    /// Same as [`VersionStore::swap_version`], and insert `successor` in the same transaction.
    async fn swap_version_and_open(
        &self,
        current: &ModelVersion,
        next: &ModelVersion,
        successor: &ModelVersion,
    ) -> StoreResult<ModelVersion>;
}

/// Everything the lifecycle manager needs from persistence.
pub trait LifecycleStore: FeedbackStore + VersionStore {}

impl<T: FeedbackStore + VersionStore> LifecycleStore for T {}

fn stale(current: &ModelVersion) -> StoreError {
    StoreError::Conflict(format!(
        "model version {} changed concurrently (expected {} at revision {})",
        current.id, current.status, current.revision
    ))
}
