//! Execution Gateway
//!
//! The operation surface callers use: register workflows, start and
//! cancel executions, read their status. Starting validates the
//! definition and the initial input synchronously, persists a `PENDING`
//! execution, and hands it to an [`Orchestrator`] on its own task.
//!
//! Failures inside a running execution are never returned from here;
//! they are recorded on the execution and visible through
//! [`Gateway::get_status`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::invoker::StepInvoker;
use crate::monitoring::progress::ProgressReceiver;
use crate::store::{PersistenceStore, StoreError};
use crate::workflow::{
    check_resolvable, validate_definition, InitialInput, UnresolvedVariable, ValidationError,
    WorkflowDefinition,
};

use super::orchestrator::Orchestrator;
use super::registry::{ExecutionRegistry, RegistryError};
use super::runner::StepRunner;
use super::state::{ExecutionId, ExecutionSnapshot, WorkflowExecution};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("invalid workflow definition: {}", join(.0))]
    InvalidDefinition(Vec<ValidationError>),

    #[error("unresolvable mapping: {}", join(.0))]
    UnresolvableMapping(Vec<UnresolvedVariable>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Public entry point of the engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use promptchain::{EchoInvoker, EngineConfig, Gateway, MemoryStore};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = promptchain::load_workflow("chain.yaml")?;
/// let gateway = Gateway::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(EchoInvoker::new()),
///     EngineConfig::default(),
/// );
/// gateway.register_workflow(&workflow).await?;
///
/// let mut input = promptchain::InitialInput::new();
/// input.insert("text".to_string(), "hello".to_string());
/// let id = gateway.start(&workflow.id, input).await?;
/// let snapshot = gateway.wait_for_completion(id).await?;
/// println!("{}", snapshot.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn PersistenceStore>,
    registry: ExecutionRegistry,
    orchestrator: Orchestrator,
    config: Arc<EngineConfig>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        invoker: Arc<dyn StepInvoker>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let orchestrator = Orchestrator::new(store.clone(), StepRunner::new(invoker), config.clone());
        Self {
            store,
            registry: ExecutionRegistry::new(),
            orchestrator,
            config,
        }
    }

    /// Validates and stores a workflow definition.
    pub async fn register_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), GatewayError> {
        validate_definition(workflow, self.config.strict_mappings())
            .map_err(GatewayError::InvalidDefinition)?;
        self.store.put_workflow(workflow).await?;
        info!(
            "Registered workflow '{}' ({} steps)",
            workflow.id,
            workflow.len()
        );
        Ok(())
    }

    /// Starts a new execution and returns its id immediately.
    ///
    /// No record is created if the definition is invalid or a template
    /// variable cannot be resolved from `initial_input`.
    pub async fn start(
        &self,
        workflow_id: &str,
        initial_input: InitialInput,
    ) -> Result<ExecutionId, GatewayError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| GatewayError::WorkflowNotFound(workflow_id.to_string()))?;

        validate_definition(&workflow, false).map_err(GatewayError::InvalidDefinition)?;

        if let Err(unresolved) =
            check_resolvable(&workflow, &initial_input, self.config.strict_mappings())
        {
            for variable in &unresolved {
                warn!("Cannot start '{}': {}", workflow_id, variable);
            }
            return Err(GatewayError::UnresolvableMapping(unresolved));
        }

        let execution = WorkflowExecution::new(&workflow, initial_input);
        let id = execution.id;
        self.store.put_execution(&execution).await?;

        let lease = self
            .registry
            .claim(id, ExecutionSnapshot::project(&execution, &[]))?;

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.advance(lease).await {
                Ok(status) => debug!("Execution {} finished {}", id, status),
                Err(e) => error!("Execution {} could not be advanced: {}", id, e),
            }
        });

        info!(
            "Started execution {} of workflow '{}' ({} active)",
            id,
            workflow_id,
            self.registry.active_count()
        );
        Ok(id)
    }

    /// Requests cancellation. A no-op for executions already terminal.
    pub async fn cancel(&self, id: ExecutionId) -> Result<(), GatewayError> {
        if self.registry.cancel(id) {
            return Ok(());
        }

        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(GatewayError::ExecutionNotFound(id))?;

        if execution.status.is_terminal() {
            debug!("Execution {} already {}, ignoring cancel", id, execution.status);
        } else {
            warn!(
                "Execution {} is {} but has no active orchestrator, nothing to cancel",
                id, execution.status
            );
        }
        Ok(())
    }

    /// Reads the execution and its steps as currently persisted.
    pub async fn get_status(&self, id: ExecutionId) -> Result<ExecutionSnapshot, GatewayError> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(GatewayError::ExecutionNotFound(id))?;
        self.snapshot_of(&execution).await
    }

    /// Progress feed for an execution that is still active.
    pub fn subscribe(&self, id: ExecutionId) -> Option<ProgressReceiver> {
        self.registry.subscribe(id)
    }

    /// Waits for the execution to finish and returns its final snapshot.
    ///
    /// Returns the persisted state as-is if no orchestrator is driving it.
    pub async fn wait_for_completion(&self, id: ExecutionId) -> Result<ExecutionSnapshot, GatewayError> {
        if let Some(mut progress) = self.registry.subscribe(id) {
            if progress.wait_terminal().await.is_some() {
                debug!("Execution {} reached a terminal state", id);
            }
        }
        self.get_status(id).await
    }

    /// Executions of a workflow, newest first.
    pub async fn list_executions(&self, workflow_id: &str) -> Result<Vec<ExecutionSnapshot>, GatewayError> {
        let executions = self.store.list_executions(workflow_id).await?;
        let mut snapshots = Vec::with_capacity(executions.len());
        for execution in &executions {
            snapshots.push(self.snapshot_of(execution).await?);
        }
        Ok(snapshots)
    }

    async fn snapshot_of(&self, execution: &WorkflowExecution) -> Result<ExecutionSnapshot, GatewayError> {
        let steps = self.store.list_steps(execution.id).await?;
        let mut snapshot = ExecutionSnapshot::project(execution, &steps);
        snapshot.stale = !self.registry.is_active(execution.id)
            && is_stale(execution, Utc::now(), self.config.stale_after);
        Ok(snapshot)
    }
}

/// A non-terminal execution nobody has updated for `threshold`.
fn is_stale(execution: &WorkflowExecution, now: DateTime<Utc>, threshold: Duration) -> bool {
    if execution.status.is_terminal() {
        return false;
    }
    (now - execution.updated_at)
        .to_std()
        .map(|age| age > threshold)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::{FailureKind, RunStatus, StepStatus};
    use crate::invoker::InvokerError;
    use crate::store::MemoryStore;
    use crate::test_support::{input, summarize_translate, two_step_workflow, ScriptedInvoker};
    use crate::workflow::validator::UnresolvedReason;
    use crate::workflow::{SourceRef, StepDefinition};

    async fn gateway_with(invoker: ScriptedInvoker, config: EngineConfig) -> (Gateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(store.clone(), Arc::new(invoker), config);
        gateway.register_workflow(&two_step_workflow()).await.unwrap();
        gateway.register_workflow(&summarize_translate()).await.unwrap();
        (gateway, store)
    }

    async fn gateway(invoker: ScriptedInvoker) -> (Gateway, Arc<MemoryStore>) {
        gateway_with(invoker, EngineConfig::default()).await
    }

    fn chain(id: &str, len: usize) -> WorkflowDefinition {
        let mut steps = vec![StepDefinition::new("s1", 0, "Begin with {{text}}")];
        for position in 1..len {
            steps.push(
                StepDefinition::new(format!("s{}", position + 1), position, "Continue {{prev}}")
                    .map_input("prev", SourceRef::StepOutput(position - 1)),
            );
        }
        WorkflowDefinition::from_steps(id, steps)
    }

    #[tokio::test]
    async fn test_two_step_chain_completes() {
        let invoker = ScriptedInvoker::new()
            .respond("Summarize: hello", "a greeting", 12, 0.01)
            .respond("Shorten: a greeting", "hi", 4, 0.005);
        let (gateway, _) = gateway(invoker).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();
        let snapshot = gateway.wait_for_completion(id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.count(StepStatus::Completed), 2);
        assert_eq!(snapshot.steps[0].output.as_deref(), Some("a greeting"));
        assert_eq!(snapshot.final_output.as_deref(), Some("hi"));
        assert_eq!(snapshot.total_tokens, 16);
        assert!((snapshot.total_cost - 0.015).abs() < 1e-9);
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_resolved_inputs_are_recorded() {
        let (gateway, store) = gateway(ScriptedInvoker::new().respond("Summarize: hello", "S", 1, 0.0)).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();
        gateway.wait_for_completion(id).await.unwrap();

        let steps = store.list_steps(id).await.unwrap();
        assert_eq!(steps[0].resolved_input.as_ref().unwrap()["text"], "hello");
        assert_eq!(steps[1].resolved_input.as_ref().unwrap()["summary"], "S");
    }

    #[tokio::test]
    async fn test_missing_input_creates_nothing() {
        let (gateway, store) = gateway(ScriptedInvoker::new()).await;

        let err = gateway
            .start("summarize-shorten", InitialInput::new())
            .await
            .unwrap_err();

        match err {
            GatewayError::UnresolvableMapping(unresolved) => {
                assert_eq!(unresolved.len(), 1);
                assert_eq!(unresolved[0].variable, "text");
                assert_eq!(unresolved[0].position, 0);
                assert_eq!(
                    unresolved[0].reason,
                    UnresolvedReason::MissingInitialValue {
                        name: "text".to_string()
                    }
                );
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(store.list_executions("summarize-shorten").await.unwrap().is_empty());
        assert_eq!(gateway.registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_step_timeout_fails_run() {
        let invoker = ScriptedInvoker::new()
            .respond("Summarize: hello", "greeting", 7, 0.02)
            .delay("Shorten: greeting", Duration::from_secs(3600));
        let (gateway, _) = gateway(invoker).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();
        let snapshot = gateway.wait_for_completion(id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.steps[0].status, StepStatus::Completed);
        assert_eq!(snapshot.steps[1].status, StepStatus::Failed);
        assert_eq!(
            snapshot.steps[1].error.as_ref().unwrap().kind,
            FailureKind::Timeout
        );
        assert_eq!(snapshot.total_tokens, 7);
        assert!((snapshot.total_cost - 0.02).abs() < 1e-9);
        assert_eq!(snapshot.error.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let (invoker, gate) = ScriptedInvoker::new()
            .respond("Summarize: hello", "greeting", 3, 0.0)
            .gated("Summarize: hello");
        let (gateway, _) = gateway(invoker).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();

        gate.entered().await;
        gateway.cancel(id).await.unwrap();
        gate.release();

        let snapshot = gateway.wait_for_completion(id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert_eq!(snapshot.steps[0].status, StepStatus::Completed);
        assert_eq!(snapshot.steps[0].output.as_deref(), Some("greeting"));
        assert_eq!(snapshot.steps[1].status, StepStatus::Skipped);
        assert!(snapshot.final_output.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_execution() {
        let (gateway, store) = gateway(ScriptedInvoker::new()).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();
        // The orchestrator task has not been polled yet.
        assert_eq!(gateway.get_status(id).await.unwrap().status, RunStatus::Pending);
        gateway.cancel(id).await.unwrap();

        let snapshot = gateway.wait_for_completion(id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert_eq!(snapshot.count(StepStatus::Skipped), 2);

        let steps = store.list_steps(id).await.unwrap();
        assert!(steps.iter().all(|s| s.resolved_input.is_none() && s.output.is_none()));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_after_completion() {
        let (gateway, _) = gateway(ScriptedInvoker::new()).await;
        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();
        let before = gateway.wait_for_completion(id).await.unwrap();

        gateway.cancel(id).await.unwrap();
        gateway.cancel(id).await.unwrap();

        let after = gateway.get_status(id).await.unwrap();
        assert_eq!(before.status, RunStatus::Completed);
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let (gateway, _) = gateway(ScriptedInvoker::new()).await;
        let err = gateway.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_successful_run_has_n_completed_steps_in_order() {
        let (gateway, store) = gateway(ScriptedInvoker::new()).await;
        let workflow = chain("long", 5);
        gateway.register_workflow(&workflow).await.unwrap();

        let id = gateway.start("long", input(&[("text", "x")])).await.unwrap();
        let snapshot = gateway.wait_for_completion(id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        let steps = store.list_steps(id).await.unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps.iter().map(|s| s.position).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(
            snapshot.final_output.as_deref(),
            Some("Continue Continue Continue Continue Begin with x")
        );
    }

    #[tokio::test]
    async fn test_failure_at_k_skips_later_steps() {
        let invoker = ScriptedInvoker::new().fail(
            "Continue Begin with x",
            InvokerError::Api {
                status: 500,
                message: "boom".to_string(),
            },
        );
        let (gateway, store) = gateway(invoker).await;
        gateway.register_workflow(&chain("four", 4)).await.unwrap();

        let id = gateway.start("four", input(&[("text", "x")])).await.unwrap();
        let snapshot = gateway.wait_for_completion(id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        let steps = store.list_steps(id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        for later in &steps[2..] {
            assert_eq!(later.status, StepStatus::Skipped);
            assert!(later.resolved_input.is_none());
            assert!(later.output.is_none());
        }
    }

    #[tokio::test]
    async fn test_status_is_monotonic_while_running() {
        let (invoker, gate) = ScriptedInvoker::new().gated("Shorten: Summarize: hello");
        let (gateway, _) = gateway(invoker).await;

        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();

        let mut seen = vec![gateway.get_status(id).await.unwrap()];
        gate.entered().await;
        seen.push(gateway.get_status(id).await.unwrap());
        seen.push(gateway.get_status(id).await.unwrap());
        gate.release();
        seen.push(gateway.wait_for_completion(id).await.unwrap());
        seen.push(gateway.get_status(id).await.unwrap());

        assert_eq!(seen[1].steps[1].status, StepStatus::Running);
        assert_eq!(seen[1], seen[2]);
        for pair in seen.windows(2) {
            assert!(pair[1].is_progression_of(&pair[0]));
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_terminal_snapshot() {
        let (invoker, gate) = ScriptedInvoker::new().gated("Summarize: hello");
        let (gateway, _) = gateway(invoker).await;
        let id = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap();

        let mut progress = gateway.subscribe(id).unwrap();
        gate.entered().await;
        assert_eq!(progress.current().status, RunStatus::Running);
        gate.release();

        let terminal = progress.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, RunStatus::Completed);
        assert!(gateway.subscribe(id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (gateway, _) = gateway(ScriptedInvoker::new()).await;
        let err = gateway.start("missing", InitialInput::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkflowNotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definition() {
        let (gateway, _) = gateway(ScriptedInvoker::new()).await;
        let workflow =
            WorkflowDefinition::from_steps("single", vec![StepDefinition::new("only", 0, "{{x}}")]);

        let err = gateway.register_workflow(&workflow).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidDefinition(_)));
        assert!(err.to_string().contains("at least 2"));
    }

    #[tokio::test]
    async fn test_strict_mode_reports_unmapped_variables() {
        let store = Arc::new(MemoryStore::new());
        let mut config = EngineConfig::default();
        config.set_strict_mappings(true);
        let gateway = Gateway::new(store.clone(), Arc::new(ScriptedInvoker::new()), config);

        // Stored directly so strict registration does not reject it first.
        store.put_workflow(&two_step_workflow()).await.unwrap();

        let err = gateway
            .start("summarize-shorten", input(&[("text", "hello")]))
            .await
            .unwrap_err();
        match err {
            GatewayError::UnresolvableMapping(unresolved) => {
                assert_eq!(unresolved[0].reason, UnresolvedReason::Unmapped);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let (gateway, _) = gateway(ScriptedInvoker::new()).await;

        let first = gateway
            .start("summarize-shorten", input(&[("text", "a")]))
            .await
            .unwrap();
        gateway.wait_for_completion(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = gateway
            .start("summarize-shorten", input(&[("text", "b")]))
            .await
            .unwrap();
        gateway.wait_for_completion(second).await.unwrap();

        let listed = gateway.list_executions("summarize-shorten").await.unwrap();
        assert_eq!(
            listed.iter().map(|s| s.execution_id).collect::<Vec<_>>(),
            vec![second, first]
        );
        assert!(gateway.list_executions("summarize-translate").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_running_execution_is_stale() {
        let (gateway, store) = gateway(ScriptedInvoker::new()).await;

        let mut execution = WorkflowExecution::new(&two_step_workflow(), input(&[("text", "x")]));
        execution.transition(RunStatus::Running).unwrap();
        execution.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.put_execution(&execution).await.unwrap();

        let snapshot = gateway.get_status(execution.id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Running);
        assert!(snapshot.stale);

        // Cancelling an orphan is accepted but changes nothing.
        gateway.cancel(execution.id).await.unwrap();
        assert_eq!(
            gateway.wait_for_completion(execution.id).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[test]
    fn test_is_stale_threshold() {
        let mut execution = WorkflowExecution::new(&two_step_workflow(), InitialInput::new());
        let now = execution.updated_at + chrono::Duration::seconds(30);

        assert!(!is_stale(&execution, now, Duration::from_secs(60)));
        assert!(is_stale(&execution, now, Duration::from_secs(10)));

        execution.transition(RunStatus::Running).unwrap();
        execution.transition(RunStatus::Completed).unwrap();
        let later = execution.updated_at + chrono::Duration::hours(1);
        assert!(!is_stale(&execution, later, Duration::from_secs(10)));
    }
}
