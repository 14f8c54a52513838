//! Execution Orchestrator
//!
//! Drives one execution from `PENDING` to a terminal state:
//!
//! 1. Moves the run to `RUNNING` and persists it
//! 2. For each step, in position order: checks for cancellation, marks
//!    the step `RUNNING`, resolves its inputs, runs it, records the result
//! 3. Stops at the first failure, skipping every later step
//! 4. Completes the run with the last step's output
//!
//! Every record change is persisted before the next one is made and a
//! fresh snapshot is published to progress subscribers after each persist.

use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::store::{PersistenceStore, StoreError};

use super::registry::ExecutionLease;
use super::resolver::{resolve, PriorOutputs};
use super::runner::{StepOutcome, StepRunner};
use super::state::{
    ExecutionId, ExecutionSnapshot, Failure, FailureKind, RunStatus, StepExecution, StepStatus,
    TransitionError, WorkflowExecution,
};

/// Errors that stop the orchestrator itself rather than the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    #[error("execution {id} is {status}, only PENDING executions can be advanced")]
    NotPending { id: ExecutionId, status: RunStatus },

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Mutable state for one run in progress.
struct Run<'a> {
    lease: &'a ExecutionLease,
    execution: WorkflowExecution,
    records: Vec<StepExecution>,
}

impl Run<'_> {
    fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot::project(&self.execution, &self.records)
    }
}

/// Advances executions through their steps.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn PersistenceStore>,
    runner: StepRunner,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PersistenceStore>, runner: StepRunner, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Runs the leased execution to a terminal state.
    ///
    /// Run and step failures are recorded on the execution; an `Err` means
    /// the orchestrator could not record progress at all. The lease is
    /// held for the whole run and released when this returns.
    pub async fn advance(&self, lease: ExecutionLease) -> Result<RunStatus, EngineError> {
        let id = lease.id();
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;

        if execution.status != RunStatus::Pending {
            warn!("Refusing to advance execution {} in state {}", id, execution.status);
            return Err(EngineError::NotPending {
                id,
                status: execution.status,
            });
        }

        let mut run = Run {
            lease: &lease,
            execution,
            records: Vec::new(),
        };

        match self.drive(&mut run).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!("Execution {} aborted: {}", id, e);
                self.abandon(&mut run, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut Run<'_>) -> Result<RunStatus, EngineError> {
        let id = run.execution.id;
        let timeout = self.config.step_timeout(&run.execution.settings);
        let ceiling = self.config.cost_ceiling(&run.execution.settings);

        run.execution.transition(RunStatus::Running)?;
        self.persist_execution(run).await?;

        info!(
            "Execution {} of '{}' started on '{}' ({} steps, timeout {:?}, cost ceiling {:?})",
            id,
            run.execution.workflow_id,
            self.runner.invoker_name(),
            run.execution.steps.len(),
            timeout,
            ceiling
        );

        let steps = run.execution.steps.clone();
        let mut prior = PriorOutputs::new();

        for step in &steps {
            // Read fresh at every boundary; cancellation is set from outside.
            if run.lease.is_cancelled() {
                return self.finish_cancelled(run, step.position).await;
            }

            let mut record = StepExecution::new(id, step);
            record.transition(StepStatus::Running)?;
            run.records.push(record);
            self.persist_step(run).await?;

            info!("Step {} '{}' started", step.position + 1, step.id);

            let input = match resolve(step, &run.execution.initial_input, &prior) {
                Ok(input) => input,
                Err(e) => {
                    error!("Step '{}' could not resolve inputs: {}", step.id, e);
                    let failure = Failure::new(e.kind(), e.to_string()).at_step(step.position);
                    return self.finish_failed(run, failure, None).await;
                }
            };

            if let Some(record) = run.records.last_mut() {
                record.resolved_input = Some(input.clone());
            }

            let outcome = self.runner.run(&step.template, &input, timeout).await;

            if let Some(failure) = outcome.failure() {
                let failure = failure.at_step(step.position);
                return self.finish_failed(run, failure, Some(outcome.duration())).await;
            }

            if let StepOutcome::Success {
                output,
                tokens,
                cost,
                duration,
            } = outcome
            {
                prior.record(step.position, StepStatus::Completed, Some(output.clone()));
                if let Some(record) = run.records.last_mut() {
                    record.complete(output, tokens, cost, duration)?;
                }
                run.execution.add_usage(tokens, cost);
                self.persist_step(run).await?;
                self.persist_execution(run).await?;

                info!(
                    "Step {} '{}' completed in {} ms ({} tokens, cost {:.4})",
                    step.position + 1,
                    step.id,
                    duration.as_millis(),
                    tokens,
                    cost
                );
            }

            if let Some(limit) = ceiling {
                if run.execution.total_cost > limit {
                    warn!(
                        "Execution {} exceeded its cost ceiling ({:.4} > {:.4})",
                        id, run.execution.total_cost, limit
                    );
                    let failure = Failure::new(
                        FailureKind::BudgetExceeded,
                        format!(
                            "total cost {:.4} exceeds ceiling {:.4}",
                            run.execution.total_cost, limit
                        ),
                    )
                    .at_step(step.position);
                    return self.finish_after_budget(run, failure).await;
                }
            }
        }

        // A cancel that arrived during the last step still wins.
        if run.lease.is_cancelled() {
            return self.finish_cancelled(run, steps.len()).await;
        }

        run.execution.final_output = run.records.last().and_then(|r| r.output.clone());
        run.execution.transition(RunStatus::Completed)?;
        self.persist_execution(run).await?;

        info!(
            "Execution {} completed ({} tokens, cost {:.4})",
            id, run.execution.total_tokens, run.execution.total_cost
        );
        Ok(RunStatus::Completed)
    }

    /// Fails the in-flight step and the run, skipping what remains.
    ///
    /// A cancel requested while the step was running takes precedence:
    /// the step keeps its failure but the run ends `CANCELLED`.
    async fn finish_failed(
        &self,
        run: &mut Run<'_>,
        failure: Failure,
        duration: Option<std::time::Duration>,
    ) -> Result<RunStatus, EngineError> {
        let next = match run.records.last_mut() {
            Some(record) => {
                record.fail(failure.clone(), duration)?;
                record.position + 1
            }
            None => 0,
        };
        self.persist_step(run).await?;

        let step_number = failure.step_position.map_or(next, |p| p + 1);
        if run.lease.is_cancelled() {
            warn!(
                "Step {} of execution {} failed after cancellation: {}",
                step_number, run.execution.id, failure.message
            );
            return self.finish_cancelled(run, next).await;
        }

        error!(
            "Execution {} failed at step {}: {}",
            run.execution.id,
            step_number,
            failure.message
        );

        self.skip_from(run, next).await?;
        run.execution.error = Some(failure);
        run.execution.transition(RunStatus::Failed)?;
        self.persist_execution(run).await?;
        Ok(RunStatus::Failed)
    }

    /// Fails the run after a successful step pushed it over budget.
    async fn finish_after_budget(
        &self,
        run: &mut Run<'_>,
        failure: Failure,
    ) -> Result<RunStatus, EngineError> {
        let next = run.records.len();
        if run.lease.is_cancelled() {
            return self.finish_cancelled(run, next).await;
        }

        self.skip_from(run, next).await?;
        run.execution.error = Some(failure);
        run.execution.transition(RunStatus::Failed)?;
        self.persist_execution(run).await?;
        Ok(RunStatus::Failed)
    }

    async fn finish_cancelled(
        &self,
        run: &mut Run<'_>,
        from: usize,
    ) -> Result<RunStatus, EngineError> {
        info!(
            "Execution {} cancelled before step {}",
            run.execution.id,
            from + 1
        );

        self.skip_from(run, from).await?;
        run.execution.error = Some(Failure::new(
            FailureKind::Cancelled,
            "execution was cancelled",
        ));
        run.execution.transition(RunStatus::Cancelled)?;
        self.persist_execution(run).await?;
        Ok(RunStatus::Cancelled)
    }

    /// Marks every step at or after `from` as `SKIPPED`.
    async fn skip_from(&self, run: &mut Run<'_>, from: usize) -> Result<(), EngineError> {
        let id = run.execution.id;
        let remaining: Vec<_> = run
            .execution
            .steps
            .iter()
            .filter(|s| s.position >= from)
            .cloned()
            .collect();

        for step in &remaining {
            let mut record = StepExecution::new(id, step);
            record.transition(StepStatus::Skipped)?;
            run.records.push(record);
            self.persist_step(run).await?;
            debug!("Step {} '{}' skipped", step.position + 1, step.id);
        }
        Ok(())
    }

    /// Best effort: records an orchestrator failure on the run.
    ///
    /// The in-flight step is failed, unstarted steps are skipped and every
    /// record is written again, so a terminal run never shows a step that
    /// is still `RUNNING` or missing.
    async fn abandon(&self, run: &mut Run<'_>, cause: &EngineError) {
        if run.execution.status.is_terminal() {
            return;
        }
        if run.execution.status == RunStatus::Pending
            && run.execution.transition(RunStatus::Running).is_err()
        {
            return;
        }

        let failure = Failure::new(FailureKind::Internal, cause.to_string());
        if let Some(record) = run.records.last_mut() {
            if record.status == StepStatus::Running {
                let failure = failure.clone().at_step(record.position);
                if let Err(e) = record.fail(failure, None) {
                    warn!("Could not fail step {}: {}", record.position + 1, e);
                }
            }
        }

        let id = run.execution.id;
        let next = run.records.len();
        for step in run.execution.steps.iter().filter(|s| s.position >= next) {
            let mut record = StepExecution::new(id, step);
            if record.transition(StepStatus::Skipped).is_ok() {
                run.records.push(record);
            }
        }

        for record in &run.records {
            if let Err(e) = self.store.put_step(record).await {
                error!("Could not record step {} of execution {}: {}", record.position + 1, id, e);
            }
        }

        run.execution.error = Some(failure);
        if run.execution.transition(RunStatus::Failed).is_ok() {
            if let Err(e) = self.persist_execution(run).await {
                error!("Could not record failure of execution {}: {}", id, e);
            }
        }
    }

    async fn persist_step(&self, run: &Run<'_>) -> Result<(), EngineError> {
        if let Some(record) = run.records.last() {
            self.store.put_step(record).await?;
        }
        run.lease.publish(run.snapshot());
        Ok(())
    }

    async fn persist_execution(&self, run: &Run<'_>) -> Result<(), EngineError> {
        self.store.put_execution(&run.execution).await?;
        run.lease.publish(run.snapshot());
        Ok(())
    }
}
