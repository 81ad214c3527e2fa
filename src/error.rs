//! Crate-level error taxonomy for the correction pipeline
//!
//! Registry and template errors indicate structural or input problems and are
//! surfaced immediately; `Busy` and the store's `Conflict` are recoverable by
//! re-reading state and retrying the request; only step execution carries an
//! automatic (bounded) retry, inside the executor.

use crate::analytics::AnalyticsError;
use crate::config::ConfigError;
use crate::llm::provider::LlmError;
use crate::pipeline::state::PipelineStatus;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::template::TemplateError;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for correction pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Analytics error: {0}")]
    Analytics(#[from] AnalyticsError),

    #[error("Pipeline {pipeline_id} deadlocked: no pending step is ready; steps: {dump}")]
    Deadlock { pipeline_id: Uuid, dump: String },

    #[error("Step '{agent_id}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        agent_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Pipeline {pipeline_id} is busy: another advance is in flight")]
    Busy { pipeline_id: Uuid },

    #[error("Pipeline {pipeline_id} is {status} and cannot be advanced")]
    TerminalPipeline {
        pipeline_id: Uuid,
        status: PipelineStatus,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Create a deadlock error carrying the full step dump for diagnosis
    pub fn deadlock(pipeline_id: Uuid, dump: String) -> Self {
        Self::Deadlock { pipeline_id, dump }
    }

    /// Create a step failure error
    pub fn step_failed<S: Into<String>, M: Into<String>>(
        agent_id: S,
        attempts: u32,
        message: M,
    ) -> Self {
        Self::StepFailed {
            agent_id: agent_id.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller should re-read state and retry the request
    /// (never the step itself)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Busy { .. } | PipelineError::Store(StoreError::Conflict { .. })
        )
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
