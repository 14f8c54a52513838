//! Variable Resolution
//!
//! Maps a step's template variables to concrete values, reading from the
//! run's initial input and from earlier steps' recorded outputs. Pure and
//! deterministic: it never invokes a step.

use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use crate::workflow::{InitialInput, SourceRef, StepDefinition};

use super::state::{FailureKind, StepStatus};

/// Concrete values for every variable a step's template requires.
pub type ResolvedInput = BTreeMap<String, String>;

/// Why a step's inputs could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("variable '{variable}': initial input '{name}' was not provided")]
    MissingInitialValue { variable: String, name: String },

    #[error("variable '{variable}': step {} has not finished", .position + 1)]
    StepNotYetExecuted { variable: String, position: usize },

    #[error("variable '{variable}': step {} ended {status}", .position + 1)]
    UpstreamStepFailed {
        variable: String,
        position: usize,
        status: StepStatus,
    },

    #[error("variable '{variable}': step {} is not an earlier step", .position + 1)]
    ForwardReference { variable: String, position: usize },
}

impl ResolutionError {
    /// Classification recorded on the failed step.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingInitialValue { .. } => FailureKind::MissingInitialValue,
            Self::StepNotYetExecuted { .. } => FailureKind::StepNotYetExecuted,
            Self::UpstreamStepFailed { .. } => FailureKind::UpstreamStepFailed,
            Self::ForwardReference { .. } => FailureKind::ForwardReference,
        }
    }
}

/// Terminal state and output of an earlier step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorOutput {
    pub status: StepStatus,
    pub output: Option<String>,
}

/// Earlier steps' results keyed by position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorOutputs(BTreeMap<usize, PriorOutput>);

impl PriorOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the terminal result of the step at `position`.
    pub fn record(&mut self, position: usize, status: StepStatus, output: Option<String>) {
        self.0.insert(position, PriorOutput { status, output });
    }

    pub fn get(&self, position: usize) -> Option<&PriorOutput> {
        self.0.get(&position)
    }
}

/// Resolves every variable the step's template requires.
///
/// Unmapped variables default to initial input under the same name.
/// Step output references are re-checked against the step's own position
/// even though definitions are validated up front.
pub fn resolve(
    step: &StepDefinition,
    initial_input: &InitialInput,
    prior: &PriorOutputs,
) -> Result<ResolvedInput, ResolutionError> {
    let mut resolved = ResolvedInput::new();

    for variable in step.required_variables() {
        let value = match step.source_for(variable) {
            SourceRef::Initial(name) => initial_input
                .get(&name)
                .cloned()
                .ok_or_else(|| ResolutionError::MissingInitialValue {
                    variable: variable.to_string(),
                    name,
                })?,
            SourceRef::StepOutput(position) => {
                resolve_step_output(variable, position, step.position, prior)?
            }
        };

        resolved.insert(variable.to_string(), value);
    }

    debug!(
        "Step '{}' resolved {} variable(s): {:?}",
        step.id,
        resolved.len(),
        resolved.keys().collect::<Vec<_>>()
    );

    Ok(resolved)
}

fn resolve_step_output(
    variable: &str,
    position: usize,
    current: usize,
    prior: &PriorOutputs,
) -> Result<String, ResolutionError> {
    if position >= current {
        return Err(ResolutionError::ForwardReference {
            variable: variable.to_string(),
            position,
        });
    }

    let upstream = prior
        .get(position)
        .filter(|p| p.status.is_terminal())
        .ok_or_else(|| ResolutionError::StepNotYetExecuted {
            variable: variable.to_string(),
            position,
        })?;

    if upstream.status != StepStatus::Completed {
        return Err(ResolutionError::UpstreamStepFailed {
            variable: variable.to_string(),
            position,
            status: upstream.status,
        });
    }

    Ok(upstream.output.clone().unwrap_or_default())
}
