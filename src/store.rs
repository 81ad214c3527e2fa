//! Durable pipeline storage contract
//!
//! The whole pipeline record is saved atomically under optimistic versioning:
//! a save carries the version the caller loaded, and a mismatch yields
//! `Conflict` instead of a partial write. A crash between transitions can only
//! lose an unsaved in-memory change; a persisted snapshot is always internally
//! consistent.

use crate::pipeline::state::Pipeline;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Pipeline not found: {0}")]
    NotFound(Uuid),
    #[error("Version conflict on pipeline {pipeline_id}: expected {expected}, found {actual}")]
    Conflict {
        pipeline_id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("Pipeline already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("Storage failure: {0}")]
    Io(String),
}

/// Durable, per-pipeline-id serializable row store
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert a new pipeline record; returns its initial version
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError>;

    /// Load a pipeline and its current version
    async fn load(&self, pipeline_id: Uuid) -> Result<(Pipeline, u64), StoreError>;

    /// Atomically replace the whole record if `expected_version` still holds;
    /// returns the new version
    async fn save(&self, pipeline: &Pipeline, expected_version: u64) -> Result<u64, StoreError>;
}

/// In-memory store backing the service and tests
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    records: Arc<Mutex<HashMap<Uuid, (u64, Pipeline)>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pipelines
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&pipeline.id) {
            return Err(StoreError::AlreadyExists(pipeline.id));
        }
        records.insert(pipeline.id, (1, pipeline.clone()));
        Ok(1)
    }

    async fn load(&self, pipeline_id: Uuid) -> Result<(Pipeline, u64), StoreError> {
        let records = self.records.lock().await;
        records
            .get(&pipeline_id)
            .map(|(version, pipeline)| (pipeline.clone(), *version))
            .ok_or(StoreError::NotFound(pipeline_id))
    }

    async fn save(&self, pipeline: &Pipeline, expected_version: u64) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let entry = records
            .get_mut(&pipeline.id)
            .ok_or(StoreError::NotFound(pipeline.id))?;
        if entry.0 != expected_version {
            return Err(StoreError::Conflict {
                pipeline_id: pipeline.id,
                expected: expected_version,
                actual: entry.0,
            });
        }
        entry.0 += 1;
        entry.1 = pipeline.clone();
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{NewPipeline, PipelineStatus};
    use crate::registry::AgentRegistry;
    use crate::template::VariableBag;

    fn sample() -> Pipeline {
        Pipeline::create(
            NewPipeline {
                submission_id: "sub-1".to_string(),
                submission_kind: "essay".to_string(),
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                variables: VariableBag::new(),
            },
            &AgentRegistry::manual_correction(),
        )
    }

    #[tokio::test]
    async fn test_create_then_load() {
        let store = InMemoryStore::new();
        let pipeline = sample();

        let version = store.create(&pipeline).await.unwrap();
        assert_eq!(version, 1);

        let (loaded, loaded_version) = store.load(pipeline.id).await.unwrap();
        assert_eq!(loaded, pipeline);
        assert_eq!(loaded_version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryStore::new();
        let pipeline = sample();
        store.create(&pipeline).await.unwrap();

        let err = store.create(&pipeline).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(pipeline.id));
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let store = InMemoryStore::new();
        let mut pipeline = sample();
        store.create(&pipeline).await.unwrap();

        pipeline.status = PipelineStatus::Running;
        let version = store.save(&pipeline, 1).await.unwrap();
        assert_eq!(version, 2);

        let (loaded, loaded_version) = store.load(pipeline.id).await.unwrap();
        assert_eq!(loaded.status, PipelineStatus::Running);
        assert_eq!(loaded_version, 2);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = InMemoryStore::new();
        let pipeline = sample();
        store.create(&pipeline).await.unwrap();
        store.save(&pipeline, 1).await.unwrap();

        let err = store.save(&pipeline, 1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                pipeline_id: pipeline.id,
                expected: 1,
                actual: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_load_missing_pipeline() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.load(id).await.unwrap_err(), StoreError::NotFound(id));
    }
}
