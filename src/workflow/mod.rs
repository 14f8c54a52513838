//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating prompt-chain workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepDefinition, WorkflowDefinition, SourceRef)
//! - [`template`]: Prompt templates and placeholder rendering
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural validation and pre-start resolvability checks

pub mod model;
pub mod parser;
pub mod template;
pub mod validator;

pub use model::{InitialInput, SourceRef, StepDefinition, WorkflowDefinition, WorkflowSettings};
pub use parser::{load_initial_input, load_workflow, parse_workflow};
pub use template::PromptTemplate;
pub use validator::{check_resolvable, validate_definition, UnresolvedVariable, ValidationError};
