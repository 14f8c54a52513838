//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::invoker::{Invocation, InvokerError, StepInvoker};
use crate::workflow::{InitialInput, SourceRef, StepDefinition, WorkflowDefinition};

pub fn input(pairs: &[(&str, &str)]) -> InitialInput {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Summarize the initial `text`, then shorten the summary.
pub fn two_step_workflow() -> WorkflowDefinition {
    WorkflowDefinition::from_steps(
        "summarize-shorten",
        vec![
            StepDefinition::new("summarize", 0, "Summarize: {{text}}"),
            StepDefinition::new("shorten", 1, "Shorten: {{summary}}")
                .map_input("summary", SourceRef::StepOutput(0)),
        ],
    )
}

/// Summarize `text`, then translate the summary into `language`.
pub fn summarize_translate() -> WorkflowDefinition {
    WorkflowDefinition::from_steps(
        "summarize-translate",
        vec![
            StepDefinition::new("summarize", 0, "Summarize: {{text}}"),
            StepDefinition::new("translate", 1, "Translate to {{language}}: {{summary}}")
                .map_input("summary", SourceRef::StepOutput(0)),
        ],
    )
}

/// Lets a test hold an invocation open until it decides to release it.
#[derive(Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Resolves once the gated invocation has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct Script {
    response: Option<Result<Invocation, InvokerError>>,
    delay: Option<Duration>,
    gate: Option<Gate>,
}

/// Invoker answering from a per-prompt script.
///
/// Prompts without a scripted response are echoed back at one token per
/// word and zero cost.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: HashMap<String, Script>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prompt: &str, output: &str, tokens: u64, cost: f64) -> Self {
        self.scripts.entry(prompt.to_string()).or_default().response =
            Some(Ok(Invocation::new(output, tokens, cost)));
        self
    }

    pub fn fail(mut self, prompt: &str, error: InvokerError) -> Self {
        self.scripts.entry(prompt.to_string()).or_default().response = Some(Err(error));
        self
    }

    pub fn delay(mut self, prompt: &str, delay: Duration) -> Self {
        self.scripts.entry(prompt.to_string()).or_default().delay = Some(delay);
        self
    }

    pub fn gated(mut self, prompt: &str) -> (Self, Gate) {
        let gate = Gate::default();
        self.scripts.entry(prompt.to_string()).or_default().gate = Some(gate.clone());
        (self, gate)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<Invocation, InvokerError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        let script = self.scripts.get(prompt);
        if let Some(gate) = script.and_then(|s| s.gate.as_ref()) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(delay) = script.and_then(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }

        match script.and_then(|s| s.response.clone()) {
            Some(response) => response,
            None => {
                let tokens = prompt.split_whitespace().count() as u64;
                Ok(Invocation::new(prompt, tokens, 0.0))
            }
        }
    }
}
