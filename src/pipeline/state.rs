//! Pipeline and step records
//!
//! These are the durable shapes the persistence adapter stores: the whole
//! pipeline record is saved atomically, so any persisted snapshot satisfies
//! the step invariants checked here.

use crate::llm::provider::TokenUsage;
use crate::registry::AgentRegistry;
use crate::template::VariableBag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status of one pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,
    /// Prompt rendered, provider call in flight
    Active,
    /// Finished with a response
    Completed,
    /// Failed definitively; detail kept for audit
    Error,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether this step satisfies the dependencies of later steps
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Status of a whole pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, no step executed yet
    Idle,
    /// At least one step activated, none failed
    Running,
    /// Every step completed; immutable except analytics linkage
    Completed,
    /// A step failed definitively; restart means a fresh pipeline
    Error,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One step of a pipeline, owned exclusively by that pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// References an agent in the registry snapshot the run was built from
    pub agent_id: String,
    /// Position in the resolved execution order
    pub order: usize,
    pub status: StepStatus,
    /// Rendered prompt, set when the step becomes active
    pub prompt: Option<String>,
    /// AI output, set on successful completion
    pub response: Option<String>,
    /// Failure detail, set on error
    pub error: Option<String>,
    /// Provider token usage, set on successful completion
    pub usage: Option<TokenUsage>,
    /// Provider attempts consumed by the last execution of this step
    pub attempts: u32,
}

impl PipelineStep {
    fn pending(agent_id: String, order: usize) -> Self {
        Self {
            agent_id,
            order,
            status: StepStatus::Pending,
            prompt: None,
            response: None,
            error: None,
            usage: None,
            attempts: 0,
        }
    }

    /// Clear execution artifacts, reverting to a clean pending step.
    /// Used when an in-flight call is cancelled or times out.
    pub fn reset_to_pending(&mut self) {
        self.status = StepStatus::Pending;
        self.prompt = None;
        self.response = None;
        self.error = None;
        self.usage = None;
        self.attempts = 0;
    }
}

/// Inputs for creating a fresh pipeline run
#[derive(Debug, Clone)]
pub struct NewPipeline {
    /// The student response being analyzed
    pub submission_id: String,
    /// Category used by analytics (e.g. "essay", "short-answer")
    pub submission_kind: String,
    pub provider: String,
    pub model: String,
    /// Base template variables: submission text, question metadata
    pub variables: VariableBag,
}

/// One correction run for one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub submission_id: String,
    pub submission_kind: String,
    pub provider: String,
    pub model: String,
    pub status: PipelineStatus,
    /// Index of the last activated step; 0 before any activation
    pub current_step_index: usize,
    /// Execution order fixed at creation from the registry's topological sort
    pub steps: Vec<PipelineStep>,
    /// Base template variables captured at creation
    pub variables: VariableBag,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// Create a fresh pipeline with all steps pending, in registry order
    pub fn create(params: NewPipeline, registry: &AgentRegistry) -> Self {
        let now = Utc::now();
        let steps = registry
            .execution_order()
            .into_iter()
            .enumerate()
            .map(|(order, agent)| PipelineStep::pending(agent.id.clone(), order))
            .collect();

        Self {
            id: Uuid::new_v4(),
            submission_id: params.submission_id,
            submission_kind: params.submission_kind,
            provider: params.provider,
            model: params.model,
            status: PipelineStatus::Idle,
            current_step_index: 0,
            steps,
            variables: params.variables,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Steps currently marked active (the invariant allows at most one)
    pub fn active_step_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Active)
            .count()
    }

    /// Whether every step is completed
    pub fn all_steps_completed(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    }

    /// Completed-step responses keyed by agent id, for template variables
    pub fn completed_responses(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| Some((s.agent_id.as_str(), s.response.as_deref()?)))
            .collect()
    }

    /// Total token usage across completed steps
    pub fn total_usage(&self) -> TokenUsage {
        self.steps
            .iter()
            .filter_map(|s| s.usage.as_ref())
            .fold(TokenUsage::default(), |acc, u| acc.add(u))
    }

    /// Wall-clock processing time, once completed
    pub fn processing_time_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }

    /// Check the persisted-snapshot invariants. Violations indicate a bug in
    /// the transition logic, not bad input.
    pub fn check_invariants(&self) -> Result<(), String> {
        let active = self.active_step_count();
        if active > 1 {
            return Err(format!("{active} steps active, at most 1 allowed"));
        }
        if self.status == PipelineStatus::Completed {
            for step in &self.steps {
                if step.status != StepStatus::Completed || step.response.is_none() {
                    return Err(format!(
                        "completed pipeline has unfinished step '{}'",
                        step.agent_id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Human-readable step dump for deadlock diagnostics
    pub fn step_dump(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("#{} {} [{}]", s.order, s.agent_id, s.status))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
