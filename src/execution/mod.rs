//! Workflow Execution Module
//!
//! Runs prompt chains: resolves each step's inputs, invokes it, records
//! the result and finalizes the run. Steps of one execution run strictly
//! in order; separate executions run on independent tasks.
//!
//! # Architecture
//!
//! - [`gateway`]: Public start/cancel/status surface
//! - [`orchestrator`]: Drives one execution through its steps
//! - [`registry`]: At most one active orchestrator per execution
//! - [`resolver`]: Template variable resolution
//! - [`runner`]: Individual step execution under a timeout
//! - [`state`]: Records, lifecycle states and snapshots

pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod state;

pub use gateway::{Gateway, GatewayError};
pub use orchestrator::{EngineError, Orchestrator};
pub use registry::{ExecutionLease, ExecutionRegistry, RegistryError};
pub use resolver::{resolve, PriorOutputs, ResolutionError, ResolvedInput};
pub use runner::{StepOutcome, StepRunner};
pub use state::{
    ExecutionId, ExecutionSnapshot, Failure, FailureKind, RunStatus, StepExecution, StepSnapshot,
    StepStatus, WorkflowExecution,
};
