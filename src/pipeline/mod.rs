//! Pipeline state machine and step execution
//!
//! One pipeline is the resumable correction run for a single submission:
//! an ordered list of agent steps, a status, and the single-step transition
//! rule that advances it.

pub mod executor;
pub mod machine;
pub mod state;

pub use executor::{CancelReason, StepExecutor, StepFailure, StepOutcome};
pub use machine::PipelineMachine;
pub use state::{NewPipeline, Pipeline, PipelineStatus, PipelineStep, StepStatus};
