//! Template error types.

/// Template source could not be parsed.
///
/// Raised at config-validation time; a tool with an unparseable template
/// never reaches the data plane.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("template parse error at offset {offset}: {message}")]
pub struct ParseError {
    /// Byte offset into the template source
    pub offset: usize,
    /// What went wrong
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Template evaluation failed at render time.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("template render failed at {step}: {cause}")]
pub struct RenderError {
    /// The action or function that failed
    pub step: String,
    /// Failure detail
    pub cause: String,
}

impl RenderError {
    pub(crate) fn new(step: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            cause: cause.into(),
        }
    }
}
