//! Shared helpers for integration tests

use gradeflow::config::PipelineConfig;
use gradeflow::pipeline::{NewPipeline, PipelineMachine};
use gradeflow::registry::AgentRegistry;
use gradeflow::service::CorrectionService;
use gradeflow::store::PipelineStore;
use gradeflow::template::{PromptTemplateResolver, VariableBag};
use gradeflow::testing::mocks::{MockProvider, RecordingRecorder, SnapshotCheckingStore};
use std::sync::Arc;

/// Fast retry/backoff settings so failure-path tests finish quickly
pub fn test_config() -> PipelineConfig {
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
backoff_factor = 2.0
max_delay_ms = 4
jitter = false
"#,
    )
    .expect("test config is valid")
}

pub struct TestHarness {
    pub service: CorrectionService,
    pub provider: Arc<MockProvider>,
    pub store: Arc<SnapshotCheckingStore>,
    pub analytics: Arc<RecordingRecorder>,
}

/// Build a service over mocks, with every persisted snapshot invariant-checked
pub fn harness(provider: MockProvider) -> TestHarness {
    let provider = Arc::new(provider);
    let store = Arc::new(SnapshotCheckingStore::new());
    let analytics = Arc::new(RecordingRecorder::new());
    let machine = PipelineMachine::new(
        Arc::new(AgentRegistry::manual_correction()),
        Arc::new(PromptTemplateResolver::manual_correction()),
        Arc::clone(&provider) as Arc<dyn gradeflow::llm::LlmProvider>,
        Arc::clone(&store) as Arc<dyn PipelineStore>,
        Arc::clone(&analytics) as Arc<dyn gradeflow::AnalyticsRecorder>,
        &test_config(),
    );
    TestHarness {
        service: CorrectionService::new(machine),
        provider,
        store,
        analytics,
    }
}

pub fn essay_params() -> NewPipeline {
    let mut variables = VariableBag::new();
    variables.insert(
        "submission_text".to_string(),
        "The student essay under review.".to_string(),
    );
    variables.insert("question_title".to_string(), "Question 1".to_string());
    variables.insert(
        "question_statement".to_string(),
        "Discuss the assigned theme.".to_string(),
    );
    NewPipeline {
        submission_id: "sub-42".to_string(),
        submission_kind: "essay".to_string(),
        provider: "mock".to_string(),
        model: "test-model".to_string(),
        variables,
    }
}
