//! PromptChain - Prompt Workflow Execution Engine
//!
//! Runs user-defined chains of prompt steps in order. Each step's
//! template variables are resolved from the run's initial input or from
//! earlier steps' outputs, the rendered prompt is sent to a completion
//! backend, and every step's output, token usage and cost is recorded.
//! Runs can be cancelled between steps and capped by an aggregate cost
//! ceiling.
//!
//! # Architecture
//!
//! The library is organized into six modules:
//!
//! - [`workflow`]: Definitions, prompt templates, YAML parsing, validation
//! - [`execution`]: Resolver, step runner, orchestrator, registry, gateway
//! - [`invoker`]: Completion backends steps are sent to
//! - [`store`]: Durable records of definitions, executions and steps
//! - [`monitoring`]: Progress feeds and execution timelines
//! - [`config`]: Engine defaults and backend settings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use promptchain::{load_workflow, EngineConfig, FileStore, Gateway, HttpInvoker, InitialInput};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("chain.yaml")?;
//!
//!     // Create the gateway over a store and a backend
//!     let store = FileStore::open(".promptchain").await?;
//!     let gateway = Gateway::new(
//!         Arc::new(store),
//!         Arc::new(HttpInvoker::from_env()),
//!         EngineConfig::default(),
//!     );
//!     gateway.register_workflow(&workflow).await?;
//!
//!     // Run it
//!     let mut input = InitialInput::new();
//!     input.insert("text".to_string(), "Rust is a systems language.".to_string());
//!     let id = gateway.start(&workflow.id, input).await?;
//!     let snapshot = gateway.wait_for_completion(id).await?;
//!
//!     println!("{}: {:?}", snapshot.status, snapshot.final_output);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod execution;
pub mod invoker;
pub mod monitoring;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{EngineConfig, InvokerConfig};
pub use execution::{ExecutionId, ExecutionSnapshot, Gateway, GatewayError, RunStatus, StepStatus};
pub use invoker::{EchoInvoker, HttpInvoker, StepInvoker};
pub use store::{FileStore, MemoryStore, PersistenceStore};
pub use workflow::model::{InitialInput, SourceRef, StepDefinition, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PromptChain";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "PromptChain");
    }

    #[test]
    fn test_module_exports_step() {
        let step = StepDefinition::new("summarize", 0, "Summarize {{text}}");
        assert_eq!(step.id, "summarize");
        assert_eq!(step.required_variables(), vec!["text"]);
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::from_steps("empty", Vec::new());
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
