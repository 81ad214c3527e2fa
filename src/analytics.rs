//! Run analytics
//!
//! One record per completed pipeline: processing time, estimated cost, and
//! the submission category. Recording is best-effort; a failure here never
//! rolls back a completed correction.

use crate::config::CostConfig;
use crate::llm::provider::TokenUsage;
use crate::pipeline::state::Pipeline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Analytics record created once per completed pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub pipeline_id: Uuid,
    pub submission_id: String,
    /// Submission category (e.g. "essay")
    pub submission_kind: String,
    pub model: String,
    pub processing_time_ms: i64,
    pub cost_estimate: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PipelineRunRecord {
    /// Build the record for a completed pipeline. Returns `None` if the
    /// pipeline has no completion timestamp yet.
    pub fn from_completed(pipeline: &Pipeline, cost: &CostConfig) -> Option<Self> {
        Some(Self {
            pipeline_id: pipeline.id,
            submission_id: pipeline.submission_id.clone(),
            submission_kind: pipeline.submission_kind.clone(),
            model: pipeline.model.clone(),
            processing_time_ms: pipeline.processing_time_ms()?,
            cost_estimate: estimate_cost(&pipeline.total_usage(), cost),
            recorded_at: Utc::now(),
        })
    }
}

/// Per-1k-token cost estimate over a run's total usage
pub fn estimate_cost(usage: &TokenUsage, cost: &CostConfig) -> f64 {
    let prompt = usage.prompt_tokens as f64 / 1000.0 * cost.prompt_rate_per_1k;
    let completion = usage.completion_tokens as f64 / 1000.0 * cost.completion_rate_per_1k;
    prompt + completion
}

/// Analytics failures, logged and dropped by the caller
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalyticsError {
    #[error("Failed to record pipeline run: {0}")]
    RecordFailed(String),
}

/// Sink for completed-run records
#[async_trait]
pub trait AnalyticsRecorder: Send + Sync {
    async fn record(&self, record: &PipelineRunRecord) -> Result<(), AnalyticsError>;
}
