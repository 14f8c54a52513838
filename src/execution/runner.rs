//! Individual Step Execution
//!
//! Renders a step's prompt from its resolved input, sends it to the
//! configured [`StepInvoker`] under a wall-clock timeout, and converts
//! the result into a [`StepOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::invoker::{InvokerError, StepInvoker};
use crate::workflow::PromptTemplate;

use super::resolver::ResolvedInput;
use super::state::{Failure, FailureKind};

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success {
        output: String,
        tokens: u64,
        cost: f64,
        duration: Duration,
    },
    Timeout {
        limit: Duration,
        duration: Duration,
    },
    InvocationFailed {
        detail: String,
        duration: Duration,
    },
}

impl StepOutcome {
    /// Wall-clock time spent on the step.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Success { duration, .. }
            | Self::Timeout { duration, .. }
            | Self::InvocationFailed { duration, .. } => *duration,
        }
    }

    /// Failure to record for the step, `None` on success.
    pub fn failure(&self) -> Option<Failure> {
        match self {
            Self::Success { .. } => None,
            Self::Timeout { limit, .. } => Some(Failure::new(
                FailureKind::Timeout,
                format!("step timed out after {} s", limit.as_secs_f64()),
            )),
            Self::InvocationFailed { detail, .. } => {
                Some(Failure::new(FailureKind::InvocationFailed, detail.clone()))
            }
        }
    }
}

/// Runs steps against a completion backend.
#[derive(Clone)]
pub struct StepRunner {
    invoker: Arc<dyn StepInvoker>,
}

impl StepRunner {
    pub fn new(invoker: Arc<dyn StepInvoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker_name(&self) -> &str {
        self.invoker.name()
    }

    /// Renders and invokes one step.
    ///
    /// On timeout the in-flight invocation future is dropped, which
    /// aborts the call for backends that support cancellation.
    pub async fn run(
        &self,
        template: &PromptTemplate,
        input: &ResolvedInput,
        timeout: Duration,
    ) -> StepOutcome {
        let started = Instant::now();

        let prompt = match template.render(input) {
            Ok(prompt) => prompt,
            Err(e) => {
                error!("Could not render prompt: {}", e);
                return StepOutcome::InvocationFailed {
                    detail: format!("could not render prompt: {}", e),
                    duration: started.elapsed(),
                };
            }
        };

        debug!(
            "Invoking '{}' with {} char prompt (timeout {:?})",
            self.invoker.name(),
            prompt.len(),
            timeout
        );

        let result = tokio::time::timeout(timeout, self.invoker.invoke(&prompt, timeout)).await;
        let duration = started.elapsed();

        match result {
            Ok(Ok(invocation)) => StepOutcome::Success {
                output: invocation.output,
                tokens: invocation.tokens,
                cost: invocation.cost,
                duration,
            },
            Ok(Err(InvokerError::Timeout)) | Err(_) => {
                warn!("Invocation timed out after {:?}", duration);
                StepOutcome::Timeout {
                    limit: timeout,
                    duration,
                }
            }
            Ok(Err(e)) => {
                error!("Invocation failed: {}", e);
                StepOutcome::InvocationFailed {
                    detail: e.to_string(),
                    duration,
                }
            }
        }
    }
}
