//! Step Invokers
//!
//! The completion backend a step's rendered prompt is sent to. The engine
//! is agnostic to what sits behind [`StepInvoker`]; usage and cost are
//! taken verbatim from the [`Invocation`] the backend returns.
//!
//! - [`echo`]: dry-run backend returning the prompt itself
//! - [`http`]: OpenAI-compatible chat completions over HTTP

pub mod echo;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use echo::EchoInvoker;
pub use http::HttpInvoker;

/// Result of one successful completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub output: String,
    pub tokens: u64,
    pub cost: f64,
}

impl Invocation {
    pub fn new(output: impl Into<String>, tokens: u64, cost: f64) -> Self {
        Self {
            output: output.into(),
            tokens,
            cost,
        }
    }
}

/// Failure reported by a completion backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("rate limited by backend")]
    RateLimited,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("backend timed out")]
    Timeout,
}

/// A completion backend steps are executed against.
///
/// Implementations should respect `timeout` where they can; the step
/// runner also enforces it by dropping the in-flight future.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Sends a rendered prompt and returns the generated text and usage.
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<Invocation, InvokerError>;
}
