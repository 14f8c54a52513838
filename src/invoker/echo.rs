//! Dry-run invoker that echoes the rendered prompt back.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{Invocation, InvokerError, StepInvoker};

/// Returns each prompt unchanged as the step output.
///
/// Token count is the number of whitespace-separated words; cost is zero.
/// Useful for previewing how a chain renders without calling a backend.
#[derive(Debug, Clone, Default)]
pub struct EchoInvoker;

impl EchoInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepInvoker for EchoInvoker {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<Invocation, InvokerError> {
        let tokens = prompt.split_whitespace().count() as u64;
        debug!("Echoing prompt ({} words)", tokens);
        Ok(Invocation::new(prompt, tokens, 0.0))
    }
}
