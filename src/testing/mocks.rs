//! Mock implementations for testing
//!
//! Provides a scripted AI provider, a recording analytics sink, and a store
//! wrapper that checks pipeline invariants on every persisted snapshot.

use crate::analytics::{AnalyticsError, AnalyticsRecorder, PipelineRunRecord};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::pipeline::state::Pipeline;
use crate::store::{InMemoryStore, PipelineStore, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Scripted provider behavior
#[derive(Debug, Clone)]
enum Behavior {
    /// Always return this content
    Respond(String),
    /// Return the content after a fixed delay; used for overlap tests
    RespondDelayed { delay_ms: u64, content: String },
    /// Fail transiently `failures` times, then return the content
    TransientThen { failures: u32, content: String },
    /// Every call fails transiently
    AlwaysTransient,
    /// Every call fails with a clone of this error
    AlwaysFail(LlmError),
    /// Never resolve; used for cancellation and deadline tests
    Hang,
}

/// Mock AI provider with scripted outcomes
pub struct MockProvider {
    behavior: Behavior,
    usage: TokenUsage,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn single_response<S: Into<String>>(content: S) -> Self {
        Self::with_behavior(Behavior::Respond(content.into()))
    }

    pub fn delayed_response<S: Into<String>>(delay_ms: u64, content: S) -> Self {
        Self::with_behavior(Behavior::RespondDelayed {
            delay_ms,
            content: content.into(),
        })
    }

    pub fn failing_then_succeeding<S: Into<String>>(failures: u32, content: S) -> Self {
        Self::with_behavior(Behavior::TransientThen {
            failures,
            content: content.into(),
        })
    }

    pub fn always_transient() -> Self {
        Self::with_behavior(Behavior::AlwaysTransient)
    }

    pub fn always_failing(error: LlmError) -> Self {
        Self::with_behavior(Behavior::AlwaysFail(error))
    }

    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of completion calls received
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub async fn received_prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    fn response(&self, content: String, model: String) -> CompletionResponse {
        CompletionResponse {
            content,
            model,
            usage: self.usage,
            finish_reason: FinishReason::Stop,
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn available_models(&self) -> Vec<String> {
        vec!["test-model".to_string()]
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().await.push(request.prompt.clone());

        match &self.behavior {
            Behavior::Respond(content) => Ok(self.response(content.clone(), request.model)),
            Behavior::RespondDelayed { delay_ms, content } => {
                tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                Ok(self.response(content.clone(), request.model))
            }
            Behavior::TransientThen { failures, content } => {
                if call <= *failures {
                    Err(LlmError::ServerError(format!("scripted failure {call}")))
                } else {
                    Ok(self.response(content.clone(), request.model))
                }
            }
            Behavior::AlwaysTransient => {
                Err(LlmError::RateLimited(format!("scripted rate limit {call}")))
            }
            Behavior::AlwaysFail(error) => Err(error.clone()),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Analytics recorder that captures records in memory
#[derive(Debug, Default)]
pub struct RecordingRecorder {
    records: Mutex<Vec<PipelineRunRecord>>,
    should_fail: bool,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            should_fail: true,
        }
    }

    pub async fn records(&self) -> Vec<PipelineRunRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AnalyticsRecorder for RecordingRecorder {
    async fn record(&self, record: &PipelineRunRecord) -> Result<(), AnalyticsError> {
        if self.should_fail {
            return Err(AnalyticsError::RecordFailed(
                "scripted analytics failure".to_string(),
            ));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Store wrapper that checks pipeline invariants on every create and save,
/// so tests catch any transition that would persist an inconsistent snapshot.
#[derive(Debug, Default, Clone)]
pub struct SnapshotCheckingStore {
    inner: InMemoryStore,
    violations: Arc<Mutex<Vec<String>>>,
}

impl SnapshotCheckingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn violations(&self) -> Vec<String> {
        self.violations.lock().await.clone()
    }

    async fn check(&self, pipeline: &Pipeline) {
        if let Err(violation) = pipeline.check_invariants() {
            self.violations.lock().await.push(violation);
        }
    }
}

#[async_trait]
impl PipelineStore for SnapshotCheckingStore {
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        self.check(pipeline).await;
        self.inner.create(pipeline).await
    }

    async fn load(&self, pipeline_id: Uuid) -> Result<(Pipeline, u64), StoreError> {
        self.inner.load(pipeline_id).await
    }

    async fn save(&self, pipeline: &Pipeline, expected_version: u64) -> Result<u64, StoreError> {
        self.check(pipeline).await;
        self.inner.save(pipeline, expected_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_scripted_failures() {
        let provider = MockProvider::failing_then_succeeding(1, "ok");
        let request = CompletionRequest::new("p", "test-model");

        assert!(provider.complete(request.clone()).await.is_err());
        let response = provider.complete(request).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_provider_records_prompts() {
        let provider = MockProvider::single_response("ok");
        provider
            .complete(CompletionRequest::new("first", "m"))
            .await
            .unwrap();
        provider
            .complete(CompletionRequest::new("second", "m"))
            .await
            .unwrap();
        assert_eq!(provider.received_prompts().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_recording_recorder_failure_mode() {
        let recorder = RecordingRecorder::with_failure();
        let record = PipelineRunRecord {
            pipeline_id: Uuid::new_v4(),
            submission_id: "s".to_string(),
            submission_kind: "essay".to_string(),
            model: "m".to_string(),
            processing_time_ms: 10,
            cost_estimate: 0.0,
            recorded_at: chrono::Utc::now(),
        };
        assert!(recorder.record(&record).await.is_err());
        assert!(recorder.records().await.is_empty());
    }
}
