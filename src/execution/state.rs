//! Execution Records and State Machine
//!
//! Run-level and step-level lifecycle states, the records persisted for
//! each execution, and the read-only snapshot callers poll.
//!
//! ```text
//! run:  PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED
//! step: PENDING -> RUNNING -> COMPLETED | FAILED
//!       PENDING -> SKIPPED
//! ```
//!
//! Terminal states are final: every transition out of one is rejected.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::{InitialInput, StepDefinition, WorkflowDefinition, WorkflowSettings};

pub type ExecutionId = Uuid;

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {subject} transition {from} -> {to}")]
pub struct TransitionError {
    pub subject: &'static str,
    pub from: String,
    pub to: String,
}

/// Lifecycle of a whole execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns true for states no transition may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Checks whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a single step within an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Returns true for states no transition may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Checks whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// Ordering used to check that observed states never regress.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Skipped => 2,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// Classified reason a step or run did not complete.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingInitialValue,
    StepNotYetExecuted,
    UpstreamStepFailed,
    ForwardReference,
    Timeout,
    InvocationFailed,
    BudgetExceeded,
    Cancelled,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MissingInitialValue => "missing initial value",
            Self::StepNotYetExecuted => "step not yet executed",
            Self::UpstreamStepFailed => "upstream step failed",
            Self::ForwardReference => "forward reference",
            Self::Timeout => "timeout",
            Self::InvocationFailed => "invocation failed",
            Self::BudgetExceeded => "budget exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        };
        f.write_str(label)
    }
}

/// Error summary attached to a step or run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_position: Option<usize>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_position: None,
        }
    }

    pub fn at_step(mut self, position: usize) -> Self {
        self.step_position = Some(position);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step_position {
            Some(position) => write!(f, "step {}: {} ({})", position + 1, self.message, self.kind),
            None => write!(f, "{} ({})", self.message, self.kind),
        }
    }
}

/// One run of a workflow with concrete initial input.
///
/// The step list and settings are snapshotted at start, so later edits
/// to the definition never affect a running execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub steps: Vec<StepDefinition>,
    pub settings: WorkflowSettings,
    pub initial_input: InitialInput,
    pub status: RunStatus,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Creates a `PENDING` execution of a workflow.
    pub fn new(workflow: &WorkflowDefinition, initial_input: InitialInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            steps: workflow.steps.clone(),
            settings: workflow.settings.clone(),
            initial_input,
            status: RunStatus::Pending,
            total_tokens: 0,
            total_cost: 0.0,
            final_output: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Moves the run to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                subject: "run",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Adds one step's usage to the running totals.
    pub fn add_usage(&mut self, tokens: u64, cost: f64) {
        self.total_tokens += tokens;
        self.total_cost += cost;
        self.updated_at = Utc::now();
    }
}

/// Record of one step within an execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub position: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<InitialInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Creates a `PENDING` record for a step.
    pub fn new(execution_id: ExecutionId, step: &StepDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step.id.clone(),
            position: step.position,
            status: StepStatus::Pending,
            resolved_input: None,
            output: None,
            tokens: None,
            cost: None,
            duration_ms: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the step to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                subject: "step",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == StepStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Records a successful invocation and completes the step.
    pub fn complete(
        &mut self,
        output: String,
        tokens: u64,
        cost: f64,
        duration: Duration,
    ) -> Result<(), TransitionError> {
        self.transition(StepStatus::Completed)?;
        self.output = Some(output);
        self.tokens = Some(tokens);
        self.cost = Some(cost);
        self.duration_ms = Some(duration.as_millis() as u64);
        Ok(())
    }

    /// Records a failure and fails the step.
    pub fn fail(&mut self, failure: Failure, duration: Option<Duration>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(failure);
        self.duration_ms = duration.map(|d| d.as_millis() as u64);
        Ok(())
    }
}

/// Per-step view inside an [`ExecutionSnapshot`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    pub position: usize,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Read-only projection of an execution and its steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepSnapshot>,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Unfinished, with no live orchestrator and no recent update
    #[serde(default)]
    pub stale: bool,
}

impl ExecutionSnapshot {
    /// Builds a snapshot from an execution and whatever step records exist.
    ///
    /// Steps without a record yet are reported as `PENDING`.
    pub fn project(execution: &WorkflowExecution, records: &[StepExecution]) -> Self {
        let steps = execution
            .steps
            .iter()
            .map(|definition| {
                match records.iter().find(|r| r.position == definition.position) {
                    Some(record) => StepSnapshot {
                        position: record.position,
                        step_id: record.step_id.clone(),
                        status: record.status,
                        output: record.output.clone(),
                        tokens: record.tokens,
                        cost: record.cost,
                        duration_ms: record.duration_ms,
                        error: record.error.clone(),
                        started_at: record.started_at,
                        finished_at: record.finished_at,
                    },
                    None => StepSnapshot {
                        position: definition.position,
                        step_id: definition.id.clone(),
                        status: StepStatus::Pending,
                        output: None,
                        tokens: None,
                        cost: None,
                        duration_ms: None,
                        error: None,
                        started_at: None,
                        finished_at: None,
                    },
                }
            })
            .collect();

        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            steps,
            total_tokens: execution.total_tokens,
            total_cost: execution.total_cost,
            final_output: execution.final_output.clone(),
            error: execution.error.clone(),
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            stale: false,
        }
    }

    /// Returns the step at a position.
    pub fn step(&self, position: usize) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.position == position)
    }

    /// Counts steps in a given state.
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Checks that nothing observed in `earlier` has regressed here.
    pub fn is_progression_of(&self, earlier: &ExecutionSnapshot) -> bool {
        let run_ok = earlier.status == self.status
            || earlier.status.can_transition_to(self.status)
            || (earlier.status == RunStatus::Pending && self.status.is_terminal());

        run_ok
            && earlier.steps.iter().all(|before| {
                self.step(before.position).is_some_and(|after| {
                    after.status.rank() >= before.status.rank()
                        && (!before.status.is_terminal() || after.status == before.status)
                })
            })
    }
}
