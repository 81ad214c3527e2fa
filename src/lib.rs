//! gradeflow - Manual Correction Pipeline
//!
//! Engine behind AI-assisted grading of student submissions: an ordered,
//! resumable chain of agent analysis steps (grammar → cohesion → theme →
//! final feedback) applied to one submission at a time.
//!
//! # Overview
//!
//! This crate provides:
//! - A validated agent registry with topological execution-order resolution
//! - Prompt template rendering that feeds earlier agents' output to later ones
//! - A pipeline state machine advanced one step per request, with durable
//!   whole-record persistence between transitions
//! - Step execution with bounded retry, backoff, cancellation, and deadlines
//! - Best-effort run analytics (latency and token-cost estimates)
//!
//! # Quick Start
//!
//! ```no_run
//! use gradeflow::config::PipelineConfig;
//! use gradeflow::pipeline::{NewPipeline, PipelineMachine};
//! use gradeflow::registry::AgentRegistry;
//! use gradeflow::service::CorrectionService;
//! use gradeflow::store::InMemoryStore;
//! use gradeflow::template::{PromptTemplateResolver, VariableBag};
//! use gradeflow::testing::mocks::{MockProvider, RecordingRecorder};
//! use std::sync::Arc;
//!
//! # async fn demo() -> gradeflow::PipelineResult<()> {
//! let config = PipelineConfig::from_file("gradeflow.toml")?;
//! let machine = PipelineMachine::new(
//!     Arc::new(AgentRegistry::manual_correction()),
//!     Arc::new(PromptTemplateResolver::manual_correction()),
//!     Arc::new(MockProvider::single_response("looks good")),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(RecordingRecorder::new()),
//!     &config,
//! );
//! let service = CorrectionService::new(machine);
//!
//! let mut variables = VariableBag::new();
//! variables.insert("submission_text".to_string(), "The essay.".to_string());
//! variables.insert("question_title".to_string(), "Q1".to_string());
//! variables.insert("question_statement".to_string(), "Discuss X.".to_string());
//!
//! let pipeline = service
//!     .create_pipeline(NewPipeline {
//!         submission_id: "sub-42".to_string(),
//!         submission_kind: "essay".to_string(),
//!         provider: "mock".to_string(),
//!         model: "test-model".to_string(),
//!         variables,
//!     })
//!     .await?;
//!
//! // Step-by-step, or service.run_to_completion(pipeline.id) for "run all"
//! let pipeline = service.advance_step(pipeline.id).await?;
//! println!("{}", pipeline.status);
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod store;
pub mod template;
pub mod testing;

pub use analytics::{AnalyticsRecorder, PipelineRunRecord};
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{
    NewPipeline, Pipeline, PipelineMachine, PipelineStatus, PipelineStep, StepStatus,
};
pub use registry::{Agent, AgentRegistry, AgentRole};
pub use service::CorrectionService;
pub use store::{InMemoryStore, PipelineStore};
pub use template::{PromptTemplateResolver, VariableBag};
