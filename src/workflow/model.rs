//! Workflow Data Model
//!
//! Core data structures representing a prompt chain and how each step's
//! template variables are bound.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: summarize-and-translate
//! prompts:
//!   summarize: "Summarize the following text:\n{{text}}"
//!   translate: "Translate to {{language}}:\n{{summary}}"
//! steps:
//!   - id: summarize
//!     prompt: summarize
//!   - id: translate
//!     prompt: translate
//!     inputs:
//!       summary: step.1.output
//!       language: input.language
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::template::PromptTemplate;

/// Initial input supplied by the caller when starting an execution.
pub type InitialInput = BTreeMap<String, String>;

/// Minimum number of steps a workflow must contain.
pub const MIN_STEPS: usize = 2;

/// Error returned when a source expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid source expression '{0}': expected 'input.<name>' or 'step.<n>.output'")]
pub struct SourceRefParseError(pub String);

/// Where a template variable takes its value from.
///
/// Serialized as a compact expression: `input.<name>` for initial input,
/// `step.<n>.output` for the output of the n-th step (1-based, as step
/// numbers are shown to users). Internally positions are 0-indexed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum SourceRef {
    /// Read from the run's initial input under this name.
    Initial(String),
    /// Read from the raw output of the step at this position.
    StepOutput(usize),
}

impl SourceRef {
    /// Returns the referenced step position, if any.
    pub fn step_position(&self) -> Option<usize> {
        match self {
            Self::StepOutput(position) => Some(*position),
            Self::Initial(_) => None,
        }
    }
}

impl FromStr for SourceRef {
    type Err = SourceRefParseError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = || SourceRefParseError(expr.to_string());
        let trimmed = expr.trim();

        if let Some(name) = trimmed.strip_prefix("input.") {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid());
            }
            return Ok(Self::Initial(name.to_string()));
        }

        let number = trimmed
            .strip_prefix("step.")
            .and_then(|rest| rest.strip_suffix(".output"))
            .ok_or_else(invalid)?;
        let number: usize = number.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }

        Ok(Self::StepOutput(number - 1))
    }
}

impl TryFrom<String> for SourceRef {
    type Error = SourceRefParseError;

    fn try_from(expr: String) -> Result<Self, Self::Error> {
        expr.parse()
    }
}

impl From<SourceRef> for String {
    fn from(source: SourceRef) -> Self {
        source.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial(name) => write!(f, "input.{}", name),
            Self::StepOutput(position) => write!(f, "step.{}.output", position + 1),
        }
    }
}

/// A single prompt invocation at a fixed position in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Identifier, unique within the workflow
    pub id: String,

    /// 0-indexed position in the chain
    pub position: usize,

    /// Name of the prompt this step was built from (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,

    /// Prompt template rendered for this step
    pub template: PromptTemplate,

    /// Explicit variable bindings; unmapped variables may default to
    /// initial input of the same name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, SourceRef>,
}

impl StepDefinition {
    /// Creates a step with no explicit bindings.
    ///
    /// # Example
    ///
    /// ```
    /// use promptchain::workflow::{SourceRef, StepDefinition};
    ///
    /// let step = StepDefinition::new("translate", 1, "Translate: {{summary}}")
    ///     .map_input("summary", SourceRef::StepOutput(0));
    /// assert_eq!(step.source_for("summary"), SourceRef::StepOutput(0));
    /// ```
    pub fn new(id: impl Into<String>, position: usize, template: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            position,
            prompt_name: None,
            template: PromptTemplate::new(template.into()),
            input_mapping: BTreeMap::new(),
        }
    }

    /// Binds a template variable to a source.
    pub fn map_input(mut self, variable: impl Into<String>, source: SourceRef) -> Self {
        self.input_mapping.insert(variable.into(), source);
        self
    }

    /// Returns the variables the template requires.
    pub fn required_variables(&self) -> Vec<&str> {
        self.template.variables()
    }

    /// Returns the effective source for a variable, defaulting to initial
    /// input under the same name when unmapped.
    pub fn source_for(&self, variable: &str) -> SourceRef {
        self.input_mapping
            .get(variable)
            .cloned()
            .unwrap_or_else(|| SourceRef::Initial(variable.to_string()))
    }

    /// Returns true if the variable has an explicit binding.
    pub fn is_mapped(&self, variable: &str) -> bool {
        self.input_mapping.contains_key(variable)
    }
}

/// Per-workflow execution settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowSettings {
    /// Wall-clock limit for a single step invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// Aggregate cost ceiling for one execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

/// An ordered chain of prompt steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Unique identifier
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Steps in position order
    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    /// Creates a workflow from steps, assigning positions from list order.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(position, mut step)| {
                step.position = position;
                step
            })
            .collect();

        Self {
            id: id.into(),
            name: None,
            steps,
            settings: WorkflowSettings::default(),
        }
    }

    /// Sets the per-step timeout.
    pub fn with_step_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.step_timeout_secs = Some(secs);
        self
    }

    /// Sets the aggregate cost ceiling.
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.settings.max_cost = Some(max_cost);
        self
    }

    /// Gets a step by position.
    pub fn step_at(&self, position: usize) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.position == position)
    }

    /// Returns the display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
