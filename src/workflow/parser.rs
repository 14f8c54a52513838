//! Workflow Parser
//!
//! Handles loading workflow definitions from YAML files. Prompt
//! references and source expressions are resolved here, once, so the
//! engine only ever sees typed definitions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use super::model::{InitialInput, SourceRef, StepDefinition, WorkflowDefinition, WorkflowSettings};
use super::template::PromptTemplate;
use super::validator::{validate_definition, ValidationError};

/// Errors raised while loading a workflow or input file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read '{path}': {source}. Check that the file exists and is readable.")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML: {0}. Check the file format.")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Step '{step}' references unknown prompt '{prompt}'")]
    UnknownPrompt { step: String, prompt: String },
    #[error("Step '{0}' needs exactly one of 'prompt' or 'template'")]
    TemplateSource(String),
    #[error("Input '{0}' must be a string, number or boolean")]
    NonScalarInput(String),
    #[error("Invalid workflow:\n{}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// On-disk shape of a workflow file.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct WorkflowFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    settings: WorkflowSettings,
    #[serde(default)]
    prompts: BTreeMap<String, String>,
    steps: Vec<StepEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct StepEntry {
    id: String,
    #[serde(default)]
    position: Option<usize>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, SourceRef>,
}

/// Parses a workflow definition from YAML text.
///
/// Step positions come from list order. An explicit `position` that
/// disagrees with the list index is reported by validation.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition, ParseError> {
    let file: WorkflowFile = serde_yaml::from_str(yaml)?;

    debug!(
        "Parsed workflow '{}': {} steps, {} prompts",
        file.id,
        file.steps.len(),
        file.prompts.len()
    );

    let mut steps = Vec::with_capacity(file.steps.len());

    for (index, entry) in file.steps.into_iter().enumerate() {
        let (prompt_name, template) = match (entry.prompt, entry.template) {
            (Some(name), None) => {
                let body = file.prompts.get(&name).ok_or_else(|| ParseError::UnknownPrompt {
                    step: entry.id.clone(),
                    prompt: name.clone(),
                })?;
                (Some(name), PromptTemplate::new(body.as_str()))
            }
            (None, Some(body)) => (None, PromptTemplate::new(body)),
            _ => return Err(ParseError::TemplateSource(entry.id)),
        };

        steps.push(StepDefinition {
            id: entry.id.trim().to_string(),
            position: entry.position.unwrap_or(index),
            prompt_name,
            template,
            input_mapping: entry.inputs,
        });
    }

    let workflow = WorkflowDefinition {
        id: file.id,
        name: file.name,
        steps,
        settings: file.settings,
    };

    validate_definition(&workflow, false).map_err(ParseError::Invalid)?;

    Ok(workflow)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use promptchain::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("chain.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml = read_file(path)?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_workflow(&yaml)
}

/// Parses a flat YAML mapping of initial input values.
///
/// Numbers and booleans are accepted and converted to their text form.
pub fn parse_initial_input(yaml: &str) -> Result<InitialInput, ParseError> {
    let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml)?;

    raw.into_iter()
        .map(|(name, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return Err(ParseError::NonScalarInput(name)),
            };
            Ok((name, text))
        })
        .collect()
}

/// Loads initial input values from a YAML file.
pub fn load_initial_input(path: impl AsRef<Path>) -> Result<InitialInput, ParseError> {
    parse_initial_input(&read_file(path.as_ref())?)
}

fn read_file(path: &Path) -> Result<String, ParseError> {
    fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}
