//! Persistence
//!
//! Durable storage for workflow definitions, executions and step records.
//! Every `put` is atomic for a single record; the engine never needs a
//! cross-record transaction because each execution has a single writer.
//!
//! - [`memory`]: in-process store for tests and embedding
//! - [`file`]: one JSON file per record on local disk

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::execution::state::{ExecutionId, StepExecution, WorkflowExecution};
use crate::workflow::WorkflowDefinition;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Record store consumed by the engine.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn put_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn put_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Executions of a workflow, newest first.
    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn put_step(&self, step: &StepExecution) -> Result<(), StoreError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<StepExecution>, StoreError>;

    /// Step records of an execution in position order.
    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepExecution>, StoreError>;
}
