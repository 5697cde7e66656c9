use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{stale, FeedbackStore, StoreError, StoreResult, VersionStore};
use crate::domain::{Feedback, ModelVersion, VersionStatus};

/// In-process store with the same guarantees as the PostgreSQL one.
///
/// A single lock covers both tables, so every trait call is one transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    versions: HashMap<Uuid, ModelVersion>,
    by_number: BTreeMap<(Uuid, i32), Uuid>,
    feedback: HashMap<Uuid, Feedback>,
    // insertion order, used as a tiebreak for equal timestamps
    feedback_order: Vec<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    /// `replaced` is a version being swapped out of the open state in the same write.
    fn check_insert(&self, version: &ModelVersion, replaced: Option<Uuid>) -> StoreResult<()> {
        if self.versions.contains_key(&version.id) {
            return Err(StoreError::Conflict(format!("model version {} already exists", version.id)));
        }
        if self.by_number.contains_key(&(version.org_id, version.version)) {
            return Err(StoreError::Conflict(format!(
                "org {} already has version {}",
                version.org_id, version.version
            )));
        }
        let open_elsewhere = self
            .open_for(version.org_id)
            .map(|open| Some(open.id) != replaced)
            .unwrap_or(false);
        if version.is_open() && open_elsewhere {
            return Err(StoreError::Conflict(format!(
                "org {} already has a version collecting feedback",
                version.org_id
            )));
        }
        Ok(())
    }

    fn insert(&mut self, version: &ModelVersion) {
        self.by_number.insert((version.org_id, version.version), version.id);
        self.versions.insert(version.id, version.clone());
    }

    fn open_for(&self, org_id: Uuid) -> Option<&ModelVersion> {
        self.versions
            .values()
            .find(|v| v.org_id == org_id && v.status == VersionStatus::CollectingFeedback)
    }

    fn org_versions(&self, org_id: Uuid) -> impl Iterator<Item = &ModelVersion> {
        self.by_number
            .range((org_id, i32::MIN)..=(org_id, i32::MAX))
            .filter_map(|(_, id)| self.versions.get(id))
    }

    fn check_swap(&self, current: &ModelVersion, next: &ModelVersion) -> StoreResult<()> {
        if current.id != next.id {
            return Err(StoreError::Conflict("cannot swap different model versions".to_string()));
        }
        let stored = self
            .versions
            .get(&current.id)
            .ok_or_else(|| StoreError::NotFound(format!("model version {} not found", current.id)))?;
        if stored.status != current.status || stored.revision != current.revision {
            return Err(stale(current));
        }
        Ok(())
    }

    fn apply_swap(&mut self, current: &ModelVersion, next: &ModelVersion) -> ModelVersion {
        let mut stored = next.clone();
        stored.revision = current.revision + 1;
        self.versions.insert(stored.id, stored.clone());
        stored
    }
}

#[async_trait]
impl FeedbackStore for MemoryStore {
    async fn insert_feedback(&self, feedback: &Feedback) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.feedback.contains_key(&feedback.id) {
            return Err(StoreError::Conflict(format!("feedback {} already exists", feedback.id)));
        }
        state.feedback_order.push(feedback.id);
        state.feedback.insert(feedback.id, feedback.clone());
        Ok(())
    }

    async fn get_feedback(&self, id: Uuid) -> StoreResult<Option<Feedback>> {
        Ok(self.state.lock().await.feedback.get(&id).cloned())
    }

    async fn feedback_by_ids(&self, org_id: Uuid, ids: &[Uuid]) -> StoreResult<Vec<Feedback>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.feedback.get(id))
            .filter(|fb| fb.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn feedback_for_version(&self, org_id: Uuid, version_id: Uuid) -> StoreResult<Vec<Feedback>> {
        let state = self.state.lock().await;
        let mut rows: Vec<(usize, &Feedback)> = state
            .feedback_order
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| state.feedback.get(id).map(|fb| (idx, fb)))
            .filter(|(_, fb)| fb.org_id == org_id && fb.model_version_id == version_id)
            .collect();
        rows.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(rows.into_iter().map(|(_, fb)| fb.clone()).collect())
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn insert_version(&self, version: &ModelVersion) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_insert(version, None)?;
        state.insert(version);
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> StoreResult<Option<ModelVersion>> {
        Ok(self.state.lock().await.versions.get(&id).cloned())
    }

    async fn open_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>> {
        Ok(self.state.lock().await.open_for(org_id).cloned())
    }

    async fn version_by_number(&self, org_id: Uuid, version: i32) -> StoreResult<Option<ModelVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .by_number
            .get(&(org_id, version))
            .and_then(|id| state.versions.get(id))
            .cloned())
    }

    async fn latest_version(&self, org_id: Uuid) -> StoreResult<Option<ModelVersion>> {
        Ok(self.state.lock().await.org_versions(org_id).last().cloned())
    }

    async fn list_versions(&self, org_id: Uuid) -> StoreResult<Vec<ModelVersion>> {
        let state = self.state.lock().await;
        let mut versions: Vec<ModelVersion> = state.org_versions(org_id).cloned().collect();
        versions.reverse();
        Ok(versions)
    }

    async fn claimed_feedback_ids(&self, org_id: Uuid) -> StoreResult<HashSet<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .org_versions(org_id)
            .flat_map(|v| v.feedback_ids.iter().copied())
            .collect())
    }

    async fn swap_version(&self, current: &ModelVersion, next: &ModelVersion) -> StoreResult<ModelVersion> {
        let mut state = self.state.lock().await;
        state.check_swap(current, next)?;
        if next.is_open() && !current.is_open() && state.open_for(next.org_id).is_some() {
            return Err(StoreError::Conflict(format!(
                "org {} already has a version collecting feedback",
                next.org_id
            )));
        }
        Ok(state.apply_swap(current, next))
    }

    async fn swap_version_and_open(
        &self,
        current: &ModelVersion,
        next: &ModelVersion,
        successor: &ModelVersion,
    ) -> StoreResult<ModelVersion> {
        let mut state = self.state.lock().await;
        state.check_swap(current, next)?;
        if next.is_open() {
            return Err(StoreError::Conflict(
                "cannot open a successor while the parent is still collecting feedback".to_string(),
            ));
        }
        state.check_insert(successor, Some(current.id))?;
        let stored = state.apply_swap(current, next);
        state.insert(successor);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_open_version_per_org() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let v0 = ModelVersion::bootstrap(org);
        store.insert_version(&v0).await.unwrap();

        let mut rival = ModelVersion::bootstrap(org);
        rival.version = 1;
        let err = store.insert_version(&rival).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // another org is unaffected
        store.insert_version(&ModelVersion::bootstrap(Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn stale_swap_is_rejected() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let v0 = ModelVersion::bootstrap(org);
        store.insert_version(&v0).await.unwrap();

        let mut next = v0.clone();
        next.feedback_ids.push(Uuid::new_v4());
        let stored = store.swap_version(&v0, &next).await.unwrap();
        assert_eq!(stored.revision, 1);

        // same base revision again loses
        let mut other = v0.clone();
        other.feedback_ids.push(Uuid::new_v4());
        let err = store.swap_version(&v0, &other).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let current = store.get_version(v0.id).await.unwrap().unwrap();
        assert_eq!(current.feedback_ids, next.feedback_ids);
    }

    #[tokio::test]
    async fn swap_and_open_is_atomic() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let v0 = ModelVersion::bootstrap(org);
        store.insert_version(&v0).await.unwrap();

        let mut ready = v0.clone();
        ready.status = VersionStatus::Ready;
        let successor = v0.successor();

        // a successor colliding on the version number aborts the whole write
        let mut bad_successor = successor.clone();
        bad_successor.version = 0;
        assert!(store.swap_version_and_open(&v0, &ready, &bad_successor).await.is_err());
        assert_eq!(
            store.get_version(v0.id).await.unwrap().unwrap().status,
            VersionStatus::CollectingFeedback
        );

        store.swap_version_and_open(&v0, &ready, &successor).await.unwrap();
        let open = store.open_version(org).await.unwrap().unwrap();
        assert_eq!(open.id, successor.id);
        assert_eq!(store.latest_version(org).await.unwrap().unwrap().version, 1);
        let listed: Vec<i32> = store.list_versions(org).await.unwrap().iter().map(|v| v.version).collect();
        assert_eq!(listed, vec![1, 0]);
    }
}
