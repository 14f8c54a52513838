//! Prompt Templates
//!
//! A prompt template is plain text with `{{ name }}` placeholders.
//! Rendering is a single left-to-right pass: substituted values are
//! copied verbatim and never rescanned, so a value containing `{{x}}`
//! cannot trigger a second substitution.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Errors produced while rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("no value supplied for template variable '{0}'")]
    MissingVariable(String),
}

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Variable(&'a str),
}

/// A prompt template body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct PromptTemplate {
    body: String,
}

impl PromptTemplate {
    /// Creates a template from its body text.
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Returns the raw template body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns true if the body is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Returns the free variable names in order of first appearance.
    ///
    /// # Example
    ///
    /// ```
    /// use promptchain::workflow::PromptTemplate;
    ///
    /// let template = PromptTemplate::new("Translate {{ text }} into {{lang}}, keep {{text}}");
    /// assert_eq!(template.variables(), vec!["text", "lang"]);
    /// ```
    pub fn variables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        parse_segments(&self.body)
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Variable(name) if seen.insert(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Renders the template with the given values.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.body.len());

        for segment in parse_segments(&self.body) {
            match segment {
                Segment::Text(text) => rendered.push_str(text),
                Segment::Variable(name) => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingVariable(name.to_string()))?;
                    rendered.push_str(value);
                }
            }
        }

        Ok(rendered)
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}

impl From<&str> for PromptTemplate {
    fn from(body: &str) -> Self {
        Self::new(body)
    }
}

/// Checks whether a placeholder name is a valid identifier.
fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a template body into text and variable segments.
///
/// Anything between `{{` and `}}` that is not an identifier is kept as
/// literal text, as is an unterminated `{{`.
fn parse_segments(body: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find(OPEN) {
        let after_open = &rest[open + OPEN.len()..];
        let Some(close) = after_open.find(CLOSE) else {
            break;
        };

        let name = after_open[..close].trim();
        if is_identifier(name) {
            if open > 0 {
                segments.push(Segment::Text(&rest[..open]));
            }
            segments.push(Segment::Variable(name));
        } else {
            segments.push(Segment::Text(&rest[..open + OPEN.len() + close + CLOSE.len()]));
        }
        rest = &after_open[close + CLOSE.len()..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    segments
}
