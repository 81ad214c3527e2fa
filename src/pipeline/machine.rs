//! Pipeline state machine
//!
//! Owns the single-step transition rule. "Run all" is nothing but repeated
//! application of this rule, so batch and step-by-step execution behave
//! identically. Every transition is persisted as a whole record before and
//! after the provider call, so a reload mid-step sees the active step with
//! its prompt rather than an unexplained gap.

use crate::analytics::{AnalyticsRecorder, PipelineRunRecord};
use crate::config::{CostConfig, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::llm::provider::{CompletionRequest, LlmProvider};
use crate::pipeline::executor::{CancelReason, StepExecutor, StepOutcome};
use crate::pipeline::state::{NewPipeline, Pipeline, PipelineStatus, StepStatus};
use crate::registry::AgentRegistry;
use crate::store::PipelineStore;
use crate::template::{PromptTemplateResolver, VariableBag};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drives pipelines through their lifecycle, one step transition per call
pub struct PipelineMachine {
    registry: Arc<AgentRegistry>,
    templates: Arc<PromptTemplateResolver>,
    executor: StepExecutor,
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn PipelineStore>,
    analytics: Arc<dyn AnalyticsRecorder>,
    cost: CostConfig,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    step_timeout: Duration,
}

impl PipelineMachine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        templates: Arc<PromptTemplateResolver>,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn PipelineStore>,
        analytics: Arc<dyn AnalyticsRecorder>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            registry,
            templates,
            executor: StepExecutor::new(config.retry.clone(), config.step_timeout()),
            provider,
            store,
            analytics,
            cost: config.cost.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            step_timeout: config.step_timeout(),
        }
    }

    /// Create and persist a fresh pipeline, steps pending in registry order
    pub async fn create(&self, params: NewPipeline) -> PipelineResult<Pipeline> {
        let pipeline = Pipeline::create(params, &self.registry);
        self.store.create(&pipeline).await?;
        info!(
            pipeline_id = %pipeline.id,
            submission_id = %pipeline.submission_id,
            steps = pipeline.steps.len(),
            "Created correction pipeline"
        );
        Ok(pipeline)
    }

    /// Load a pipeline as persisted
    pub async fn get(&self, pipeline_id: Uuid) -> PipelineResult<Pipeline> {
        Ok(self.store.load(pipeline_id).await?.0)
    }

    /// Apply one step transition: activate the next ready step, call the
    /// provider, fold the outcome back, and persist.
    ///
    /// Cancellation (flag or step deadline) reverts the step to pending and
    /// returns the pipeline unchanged in substance; a definitive step failure
    /// persists the error state and surfaces it to the caller.
    pub async fn advance(
        &self,
        pipeline_id: Uuid,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<Pipeline> {
        let (mut pipeline, version) = self.store.load(pipeline_id).await?;

        if pipeline.status.is_terminal() {
            return Err(PipelineError::TerminalPipeline {
                pipeline_id,
                status: pipeline.status,
            });
        }
        let version = if pipeline.active_step_count() > 0 {
            if !self.active_step_is_stale(&pipeline) {
                // Another driver is mid-step; the caller should re-read and retry
                return Err(PipelineError::Busy { pipeline_id });
            }
            // The activating driver crashed after persisting the activation:
            // its step deadline has passed, so the call cannot still be in
            // flight. Reclaim the step and carry on.
            warn!(pipeline_id = %pipeline_id, "Reclaiming stale active step from a crashed driver");
            Self::revert_active_steps(&mut pipeline);
            pipeline.updated_at = Utc::now();
            self.store.save(&pipeline, version).await?
        } else {
            version
        };

        let step_index = match self.next_ready_step(&pipeline)? {
            Some(index) => index,
            None => {
                return Err(PipelineError::internal(format!(
                    "pipeline {pipeline_id} has no pending steps but is not terminal"
                )))
            }
        };
        let agent_id = pipeline.steps[step_index].agent_id.clone();

        let variables = self.variables_for(&pipeline);
        let prompt = match self.templates.render(&agent_id, &variables) {
            Ok(prompt) => prompt,
            Err(error) => {
                // Template/data mismatch is structural: fail the step and the
                // pipeline without touching the provider.
                warn!(pipeline_id = %pipeline_id, agent_id = %agent_id, %error, "Prompt render failed");
                let step = &mut pipeline.steps[step_index];
                step.status = StepStatus::Error;
                step.error = Some(error.to_string());
                pipeline.status = PipelineStatus::Error;
                pipeline.updated_at = Utc::now();
                self.store.save(&pipeline, version).await?;
                return Err(error.into());
            }
        };

        // Persist the activation before calling out, so concurrent readers
        // see the step in progress with its prompt.
        {
            let step = &mut pipeline.steps[step_index];
            step.status = StepStatus::Active;
            step.prompt = Some(prompt.clone());
        }
        pipeline.status = PipelineStatus::Running;
        pipeline.current_step_index = step_index;
        pipeline.updated_at = Utc::now();
        let version = self.store.save(&pipeline, version).await?;

        debug!(pipeline_id = %pipeline_id, agent_id = %agent_id, order = step_index, "Step activated");

        let mut request = CompletionRequest::new(prompt, pipeline.model.clone());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        let outcome = self
            .executor
            .execute(request, Arc::clone(&self.provider), cancel)
            .await;

        match outcome {
            StepOutcome::Completed { response, attempts } => {
                {
                    let step = &mut pipeline.steps[step_index];
                    step.status = StepStatus::Completed;
                    step.response = Some(response.content);
                    step.usage = Some(response.usage);
                    step.attempts = attempts;
                }
                let finished = pipeline.all_steps_completed();
                if finished {
                    pipeline.status = PipelineStatus::Completed;
                    pipeline.completed_at = Some(Utc::now());
                }
                pipeline.updated_at = Utc::now();
                self.store.save(&pipeline, version).await?;
                info!(
                    pipeline_id = %pipeline_id,
                    agent_id = %agent_id,
                    attempts,
                    finished,
                    "Step completed"
                );
                if finished {
                    self.record_run(&pipeline).await;
                }
                Ok(pipeline)
            }
            StepOutcome::Failed(failure) => {
                let message = failure.error.to_string();
                {
                    let step = &mut pipeline.steps[step_index];
                    step.status = StepStatus::Error;
                    step.error = Some(message.clone());
                    step.attempts = failure.attempts;
                }
                pipeline.status = PipelineStatus::Error;
                pipeline.updated_at = Utc::now();
                self.store.save(&pipeline, version).await?;
                warn!(
                    pipeline_id = %pipeline_id,
                    agent_id = %agent_id,
                    attempts = failure.attempts,
                    error = %message,
                    "Step failed; pipeline moved to error"
                );
                Err(PipelineError::step_failed(agent_id, failure.attempts, message))
            }
            StepOutcome::Cancelled(reason) => {
                Self::revert_active_steps(&mut pipeline);
                pipeline.updated_at = Utc::now();
                self.store.save(&pipeline, version).await?;
                match reason {
                    CancelReason::Requested => {
                        info!(pipeline_id = %pipeline_id, agent_id = %agent_id, "Step cancelled, reverted to pending")
                    }
                    CancelReason::Timeout => {
                        warn!(pipeline_id = %pipeline_id, agent_id = %agent_id, "Step deadline elapsed, reverted to pending")
                    }
                }
                Ok(pipeline)
            }
        }
    }

    /// Revert any active step to pending and restore the pipeline status and
    /// step index to match the completed work. Used when an in-flight call is
    /// cancelled, deadline-expired, or reclaimed after a crash.
    fn revert_active_steps(pipeline: &mut Pipeline) {
        for step in &mut pipeline.steps {
            if step.status == StepStatus::Active {
                step.reset_to_pending();
            }
        }
        let any_completed = pipeline
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Completed);
        pipeline.status = if any_completed {
            PipelineStatus::Running
        } else {
            PipelineStatus::Idle
        };
        pipeline.current_step_index = pipeline
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.order)
            .max()
            .unwrap_or(0);
    }

    /// Lowest-order pending step whose dependencies are all completed.
    /// Pending steps with no ready candidate means the registry invariants
    /// were violated: fatal, reported with the full step dump.
    fn next_ready_step(&self, pipeline: &Pipeline) -> PipelineResult<Option<usize>> {
        let completed: HashSet<&str> = pipeline
            .steps
            .iter()
            .filter(|s| s.status.satisfies_dependencies())
            .map(|s| s.agent_id.as_str())
            .collect();

        let mut any_pending = false;
        for (index, step) in pipeline.steps.iter().enumerate() {
            if step.status != StepStatus::Pending {
                continue;
            }
            any_pending = true;
            let agent = self.registry.get(&step.agent_id).ok_or_else(|| {
                PipelineError::internal(format!(
                    "step references unknown agent '{}'",
                    step.agent_id
                ))
            })?;
            if agent
                .depends_on
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
            {
                return Ok(Some(index));
            }
        }

        if any_pending {
            Err(PipelineError::deadlock(pipeline.id, pipeline.step_dump()))
        } else {
            Ok(None)
        }
    }

    /// A persisted active step is stale once it has outlived the step
    /// deadline: whichever driver activated it, its executor has given up by
    /// now, so the step can safely be reclaimed.
    fn active_step_is_stale(&self, pipeline: &Pipeline) -> bool {
        (Utc::now() - pipeline.updated_at)
            .to_std()
            .map_or(false, |age| age > self.step_timeout)
    }

    /// Base variables plus every completed step's response keyed by agent id
    fn variables_for(&self, pipeline: &Pipeline) -> VariableBag {
        let mut variables = pipeline.variables.clone();
        for (agent_id, response) in pipeline.completed_responses() {
            variables.insert(agent_id.to_string(), response.to_string());
        }
        variables
    }

    /// Best-effort analytics on completion; never fails the grading workflow
    async fn record_run(&self, pipeline: &Pipeline) {
        let Some(record) = PipelineRunRecord::from_completed(pipeline, &self.cost) else {
            warn!(pipeline_id = %pipeline.id, "Completed pipeline missing completion timestamp");
            return;
        };
        if let Err(error) = self.analytics.record(&record).await {
            warn!(pipeline_id = %pipeline.id, %error, "Analytics recording failed");
        } else {
            debug!(
                pipeline_id = %pipeline.id,
                processing_time_ms = record.processing_time_ms,
                cost_estimate = record.cost_estimate,
                "Run recorded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::store::InMemoryStore;
    use crate::testing::mocks::{MockProvider, RecordingRecorder};

    fn test_config() -> PipelineConfig {
        PipelineConfig::from_toml(
            r#"
step_timeout_secs = 5

[llm]
provider = "mock"
model = "test-model"
api_key_env = "TEST_KEY"

[retry]
max_attempts = 3
base_delay_ms = 1
max_delay_ms = 4
jitter = false
"#,
        )
        .unwrap()
    }

    fn machine_with(
        provider: Arc<MockProvider>,
        store: Arc<dyn PipelineStore>,
        analytics: Arc<RecordingRecorder>,
    ) -> PipelineMachine {
        PipelineMachine::new(
            Arc::new(AgentRegistry::manual_correction()),
            Arc::new(PromptTemplateResolver::manual_correction()),
            provider,
            store,
            analytics,
            &test_config(),
        )
    }

    fn params() -> NewPipeline {
        let mut variables = VariableBag::new();
        variables.insert("submission_text".to_string(), "The essay text.".to_string());
        variables.insert("question_title".to_string(), "Q1".to_string());
        variables.insert("question_statement".to_string(), "Discuss X".to_string());
        NewPipeline {
            submission_id: "sub-1".to_string(),
            submission_kind: "essay".to_string(),
            provider: "mock".to_string(),
            model: "test-model".to_string(),
            variables,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_first_advance_completes_grammar() {
        let provider = Arc::new(MockProvider::single_response("analysis"));
        let analytics = Arc::new(RecordingRecorder::new());
        let machine = machine_with(provider, Arc::new(InMemoryStore::new()), analytics);

        let pipeline = machine.create(params()).await.unwrap();
        let pipeline = machine.advance(pipeline.id, &mut no_cancel()).await.unwrap();

        assert_eq!(pipeline.status, PipelineStatus::Running);
        assert_eq!(pipeline.steps[0].status, StepStatus::Completed);
        assert_eq!(pipeline.steps[0].response.as_deref(), Some("analysis"));
        assert!(pipeline.steps[0].prompt.is_some());
        assert_eq!(pipeline.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_later_prompt_contains_prior_response() {
        let provider = Arc::new(MockProvider::single_response("grammar findings"));
        let machine = machine_with(
            Arc::clone(&provider),
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::new()),
        );

        let pipeline = machine.create(params()).await.unwrap();
        machine.advance(pipeline.id, &mut no_cancel()).await.unwrap();
        machine.advance(pipeline.id, &mut no_cancel()).await.unwrap();

        let prompts = provider.received_prompts().await;
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("grammar findings"));
    }

    #[tokio::test]
    async fn test_advance_on_terminal_pipeline_rejected() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let machine = machine_with(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::new()),
        );

        let pipeline = machine.create(params()).await.unwrap();
        for _ in 0..4 {
            machine.advance(pipeline.id, &mut no_cancel()).await.unwrap();
        }

        let err = machine
            .advance(pipeline.id, &mut no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TerminalPipeline { .. }));
    }

    #[tokio::test]
    async fn test_step_failure_moves_pipeline_to_error() {
        let provider = Arc::new(MockProvider::always_transient());
        let machine = machine_with(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::new()),
        );

        let created = machine.create(params()).await.unwrap();
        let err = machine
            .advance(created.id, &mut no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { attempts: 3, .. }));

        let stored = machine.get(created.id).await.unwrap();
        assert_eq!(stored.status, PipelineStatus::Error);
        assert_eq!(stored.steps[0].status, StepStatus::Error);
        assert!(stored.steps[0].error.is_some());
        assert_eq!(stored.steps[0].attempts, 3);
        // No further steps were attempted
        assert_eq!(stored.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_variable_fails_pipeline_before_provider_call() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let machine = machine_with(
            Arc::clone(&provider),
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::new()),
        );

        let mut bad_params = params();
        bad_params.variables.remove("submission_text");
        let created = machine.create(bad_params).await.unwrap();

        let err = machine
            .advance(created.id, &mut no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Template(_)));
        assert_eq!(provider.call_count(), 0);

        let stored = machine.get(created.id).await.unwrap();
        assert_eq!(stored.status, PipelineStatus::Error);
    }

    #[tokio::test]
    async fn test_cancellation_reverts_step_to_pending() {
        let provider = Arc::new(MockProvider::hanging());
        let machine = Arc::new(machine_with(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::new()),
        ));

        let created = machine.create(params()).await.unwrap();
        let (tx, mut rx) = watch::channel(false);
        let advancing = {
            let machine = Arc::clone(&machine);
            let id = created.id;
            tokio::spawn(async move { machine.advance(id, &mut rx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        let pipeline = advancing.await.unwrap().unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Idle);
        assert_eq!(pipeline.steps[0].status, StepStatus::Pending);
        assert!(pipeline.steps[0].prompt.is_none());
        assert!(pipeline.steps[0].response.is_none());
        assert!(pipeline.steps[0].error.is_none());
    }

    #[tokio::test]
    async fn test_analytics_recorded_exactly_once() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let analytics = Arc::new(RecordingRecorder::new());
        let machine = machine_with(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::clone(&analytics),
        );

        let pipeline = machine.create(params()).await.unwrap();
        for _ in 0..4 {
            machine.advance(pipeline.id, &mut no_cancel()).await.unwrap();
        }

        let records = analytics.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pipeline_id, pipeline.id);
        assert_eq!(records[0].submission_kind, "essay");
        assert!(records[0].processing_time_ms >= 0);
    }

    #[tokio::test]
    async fn test_analytics_failure_does_not_fail_completion() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let machine = machine_with(
            provider,
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingRecorder::with_failure()),
        );

        let created = machine.create(params()).await.unwrap();
        let mut last = created.clone();
        for _ in 0..4 {
            last = machine.advance(created.id, &mut no_cancel()).await.unwrap();
        }
        assert_eq!(last.status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn test_persisted_active_step_yields_busy() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let store = Arc::new(InMemoryStore::new());
        let machine = machine_with(
            provider,
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            Arc::new(RecordingRecorder::new()),
        );

        let created = machine.create(params()).await.unwrap();
        // Simulate another driver having persisted an active step
        let (mut pipeline, version) = store.load(created.id).await.unwrap();
        pipeline.steps[0].status = StepStatus::Active;
        pipeline.status = PipelineStatus::Running;
        store.save(&pipeline, version).await.unwrap();

        let err = machine
            .advance(created.id, &mut no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_stale_active_step_is_reclaimed() {
        let provider = Arc::new(MockProvider::single_response("analysis"));
        let store = Arc::new(InMemoryStore::new());
        let machine = machine_with(
            provider,
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            Arc::new(RecordingRecorder::new()),
        );

        let created = machine.create(params()).await.unwrap();
        // Driver crashed right after persisting the activation: the record
        // shows an active step whose age exceeds the step deadline
        let (mut pipeline, version) = store.load(created.id).await.unwrap();
        pipeline.steps[0].status = StepStatus::Active;
        pipeline.steps[0].prompt = Some("orphaned prompt".to_string());
        pipeline.status = PipelineStatus::Running;
        pipeline.updated_at = Utc::now() - chrono::Duration::seconds(60);
        store.save(&pipeline, version).await.unwrap();

        // The next advance reclaims the step and executes it normally
        let advanced = machine.advance(created.id, &mut no_cancel()).await.unwrap();
        assert_eq!(advanced.steps[0].status, StepStatus::Completed);
        assert_eq!(advanced.steps[0].response.as_deref(), Some("analysis"));
        assert_eq!(advanced.steps[1].status, StepStatus::Pending);
        assert_eq!(advanced.active_step_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_active_step_is_not_reclaimed() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let store = Arc::new(InMemoryStore::new());
        let machine = machine_with(
            provider,
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            Arc::new(RecordingRecorder::new()),
        );

        let created = machine.create(params()).await.unwrap();
        // Active step within the deadline: another driver may still be on it
        let (mut pipeline, version) = store.load(created.id).await.unwrap();
        pipeline.steps[0].status = StepStatus::Active;
        pipeline.status = PipelineStatus::Running;
        pipeline.updated_at = Utc::now();
        store.save(&pipeline, version).await.unwrap();

        let err = machine
            .advance(created.id, &mut no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Busy { .. }));
        let (stored, _) = store.load(created.id).await.unwrap();
        assert_eq!(stored.steps[0].status, StepStatus::Active);
    }

    #[tokio::test]
    async fn test_unready_pending_steps_report_deadlock() {
        let provider = Arc::new(MockProvider::single_response("x"));
        let store = Arc::new(InMemoryStore::new());
        let machine = machine_with(
            Arc::clone(&provider),
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            Arc::new(RecordingRecorder::new()),
        );

        let created = machine.create(params()).await.unwrap();
        // Corrupted record: first step errored but the pipeline was left
        // running, so the remaining pending steps can never become ready
        let (mut pipeline, version) = store.load(created.id).await.unwrap();
        pipeline.steps[0].status = StepStatus::Error;
        pipeline.steps[0].error = Some("earlier failure".to_string());
        pipeline.status = PipelineStatus::Running;
        store.save(&pipeline, version).await.unwrap();

        let err = machine
            .advance(created.id, &mut no_cancel())
            .await
            .unwrap_err();
        match err {
            PipelineError::Deadlock { pipeline_id, dump } => {
                assert_eq!(pipeline_id, created.id);
                assert!(dump.contains("#0 grammar-analysis [error]"));
                assert!(dump.contains("#1 cohesion-analysis [pending]"));
                assert!(dump.contains("#3 final-feedback [pending]"));
            }
            other => panic!("expected deadlock, got {other}"),
        }
        // Diagnosis only: nothing was executed or rewritten
        assert_eq!(provider.call_count(), 0);
    }
}
