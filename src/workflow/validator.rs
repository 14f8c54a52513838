//! Workflow Validation
//!
//! Provides validation for workflow definitions including:
//! - Step field validation
//! - Position integrity (dense, 0-indexed, list ordered)
//! - Backward-only step output references
//! - Pre-start resolvability of every template variable

use std::collections::HashSet;
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use super::model::{InitialInput, SourceRef, StepDefinition, WorkflowDefinition, MIN_STEPS};

/// Structural problems in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Workflow has {0} step(s); at least 2 are required")]
    TooFewSteps(usize),
    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),
    #[error("Step at position {0} has an empty or whitespace-only ID")]
    EmptyStepId(usize),
    #[error("Step '{0}' has an empty prompt template")]
    EmptyTemplate(String),
    #[error("Step '{step}' has position {found} but is listed at index {expected}")]
    PositionMismatch {
        step: String,
        expected: usize,
        found: usize,
    },
    #[error("Step '{step}' maps '{variable}' to {target}, which is not an earlier step")]
    ForwardReference {
        step: String,
        variable: String,
        target: SourceRef,
    },
    #[error("Step '{step}': variable '{variable}' has no explicit mapping")]
    UnmappedVariable { step: String, variable: String },
}

/// Why a variable cannot be resolved before an execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Initial input has no entry with this name
    MissingInitialValue { name: String },
    /// The referenced step does not precede this one
    InvalidStepReference { position: usize },
    /// Strict mode requires an explicit mapping
    Unmapped,
}

/// A variable that cannot be resolved for a given initial input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedVariable {
    pub position: usize,
    pub step_id: String,
    pub variable: String,
    #[serde(flatten)]
    pub reason: UnresolvedReason,
}

impl fmt::Display for UnresolvedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' (#{}) variable '{}': ", self.step_id, self.position + 1, self.variable)?;
        match &self.reason {
            UnresolvedReason::MissingInitialValue { name } => {
                write!(f, "initial input '{}' not provided", name)
            }
            UnresolvedReason::InvalidStepReference { position } => {
                write!(f, "step {} is not an earlier step", position + 1)
            }
            UnresolvedReason::Unmapped => write!(f, "no explicit mapping"),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &StepDefinition, index: usize, strict: bool) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId(index));
        return errors;
    }

    if step.position != index {
        errors.push(ValidationError::PositionMismatch {
            step: step.id.clone(),
            expected: index,
            found: step.position,
        });
    }

    if step.template.is_blank() {
        errors.push(ValidationError::EmptyTemplate(step.id.clone()));
    }

    let variables = step.required_variables();

    for variable in &variables {
        let source = step.source_for(variable);
        if let Some(referenced) = source.step_position() {
            if referenced >= index {
                errors.push(ValidationError::ForwardReference {
                    step: step.id.clone(),
                    variable: variable.to_string(),
                    target: source,
                });
            }
        } else if strict && !step.is_mapped(variable) {
            errors.push(ValidationError::UnmappedVariable {
                step: step.id.clone(),
                variable: variable.to_string(),
            });
        }
    }

    for mapped in step.input_mapping.keys() {
        if !variables.contains(&mapped.as_str()) {
            warn!(
                "Step '{}': mapping for '{}' is unused by its template",
                step.id, mapped
            );
        }
    }

    errors
}

/// Validates the structure of a workflow definition.
///
/// Performs the following checks:
/// 1. At least two steps
/// 2. No empty or duplicate step IDs
/// 3. Positions equal list indices
/// 4. Templates are not blank
/// 5. Step output references only point backwards
/// 6. In strict mode, every template variable is explicitly mapped
///
/// Returns every violation found, not just the first.
pub fn validate_definition(
    workflow: &WorkflowDefinition,
    strict: bool,
) -> Result<(), Vec<ValidationError>> {
    debug!("Validating workflow '{}' with {} steps", workflow.id, workflow.len());

    let mut errors = Vec::new();

    if workflow.len() < MIN_STEPS {
        errors.push(ValidationError::TooFewSteps(workflow.len()));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
        errors.extend(validate_step(step, index, strict));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    info!("Workflow '{}' validated: {} steps", workflow.id, workflow.len());
    Ok(())
}

/// Checks that every template variable can be resolved for this initial
/// input before any execution record is created.
///
/// Step output references are only checked for ordering; whether the
/// upstream step succeeds is decided at run time.
pub fn check_resolvable(
    workflow: &WorkflowDefinition,
    initial_input: &InitialInput,
    strict: bool,
) -> Result<(), Vec<UnresolvedVariable>> {
    let mut unresolved = Vec::new();

    for step in &workflow.steps {
        for variable in step.required_variables() {
            let reason = match step.source_for(variable) {
                _ if strict && !step.is_mapped(variable) => Some(UnresolvedReason::Unmapped),
                SourceRef::Initial(name) if !initial_input.contains_key(&name) => {
                    Some(UnresolvedReason::MissingInitialValue { name })
                }
                SourceRef::StepOutput(position) if position >= step.position => {
                    Some(UnresolvedReason::InvalidStepReference { position })
                }
                _ => None,
            };

            if let Some(reason) = reason {
                unresolved.push(UnresolvedVariable {
                    position: step.position,
                    step_id: step.id.clone(),
                    variable: variable.to_string(),
                    reason,
                });
            }
        }
    }

    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(unresolved)
    }
}
