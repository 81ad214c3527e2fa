//! Operator-facing correction service
//!
//! Wraps the state machine with the operations the dashboard calls and
//! serializes concurrent advances against the same pipeline id: a second
//! request while one is in flight gets `Busy` instead of double-executing a
//! step. Distinct pipelines advance fully concurrently.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::machine::PipelineMachine;
use crate::pipeline::state::{NewPipeline, Pipeline};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// In-flight marker removed when the advance finishes, on any path
struct InFlightGuard {
    pipeline_id: Uuid,
    set: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.pipeline_id);
    }
}

/// Service owning the machine and the per-id in-flight set
pub struct CorrectionService {
    machine: Arc<PipelineMachine>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl CorrectionService {
    pub fn new(machine: PipelineMachine) -> Self {
        Self {
            machine: Arc::new(machine),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a manual correction run for a submission
    pub async fn create_pipeline(&self, params: NewPipeline) -> PipelineResult<Pipeline> {
        self.machine.create(params).await
    }

    /// Load the persisted state of a pipeline
    pub async fn get(&self, pipeline_id: Uuid) -> PipelineResult<Pipeline> {
        self.machine.get(pipeline_id).await
    }

    /// Advance one step ("run next step" in the dashboard)
    pub async fn advance_step(&self, pipeline_id: Uuid) -> PipelineResult<Pipeline> {
        let mut cancel = watch::channel(false).1;
        self.advance_step_with_cancel(pipeline_id, &mut cancel).await
    }

    /// Advance one step with an operator-held cancel flag
    pub async fn advance_step_with_cancel(
        &self,
        pipeline_id: Uuid,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<Pipeline> {
        let _guard = self.try_acquire(pipeline_id)?;
        self.machine.advance(pipeline_id, cancel).await
    }

    /// Run to a terminal state ("run all"): repeated single-step advance,
    /// stopping between steps if the caller cancels. There is no separate
    /// bulk execution path.
    pub async fn run_to_completion(&self, pipeline_id: Uuid) -> PipelineResult<Pipeline> {
        let mut cancel = watch::channel(false).1;
        self.run_to_completion_with_cancel(pipeline_id, &mut cancel)
            .await
    }

    pub async fn run_to_completion_with_cancel(
        &self,
        pipeline_id: Uuid,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<Pipeline> {
        let _guard = self.try_acquire(pipeline_id)?;

        let mut pipeline = self.machine.get(pipeline_id).await?;
        loop {
            if pipeline.status.is_terminal() || *cancel.borrow() {
                return Ok(pipeline);
            }
            pipeline = self.machine.advance(pipeline_id, cancel).await?;
        }
    }

    fn try_acquire(&self, pipeline_id: Uuid) -> PipelineResult<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(pipeline_id) {
            return Err(PipelineError::Busy { pipeline_id });
        }
        Ok(InFlightGuard {
            pipeline_id,
            set: Arc::clone(&self.in_flight),
        })
    }
}
