//! In-memory record store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::execution::state::{ExecutionId, StepExecution, WorkflowExecution};
use crate::workflow::WorkflowDefinition;

use super::{PersistenceStore, StoreError};

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
    steps: RwLock<HashMap<Uuid, StepExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn put_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        self.workflows
            .write()
            .map_err(poisoned)?
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn put_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.executions
            .write()
            .map_err(poisoned)?
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions: Vec<_> = self
            .executions
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    async fn put_step(&self, step: &StepExecution) -> Result<(), StoreError> {
        self.steps
            .write()
            .map_err(poisoned)?
            .insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepExecution>, StoreError> {
        Ok(self.steps.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepExecution>, StoreError> {
        let mut steps: Vec<_> = self
            .steps
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }
}
