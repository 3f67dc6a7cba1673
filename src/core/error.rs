use std::fmt;

use thiserror::Error;

use crate::llm::BackendError;

/// Which stage of response parsing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailureKind {
    /// No decodable object literal was found where one was required.
    JsonExtraction,
    /// The decoded object lacks the expected root key and the object itself does not fit.
    KeyMissing,
    /// The value does not fit the declared return type.
    TypeCoercion,
}

impl fmt::Display for ParseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailureKind::JsonExtraction => f.write_str("JSON extraction failure"),
            ParseFailureKind::KeyMissing => f.write_str("result key missing"),
            ParseFailureKind::TypeCoercion => f.write_str("type coercion failure"),
        }
    }
}

/// A response that could not be turned into the declared return value.
///
/// Carries the raw backend text and the expected schema so the failure can be diagnosed
/// without re-running the request.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}\nexpected schema: {schema}\n----------------------------------\nraw result:\n{raw_text}")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub detail: String,
    pub raw_text: String,
    pub schema: String,
}

impl ParseFailure {
    pub fn new(
        kind: ParseFailureKind,
        detail: impl Into<String>,
        raw_text: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raw_text: raw_text.into(),
            schema: schema.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Missing argument '{0}' for placeholder substitution")]
    MissingArgument(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error("Cyclic dependency detected at future task {0}")]
    CyclicDependency(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Could not convert result into the requested type: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl TaskError {
    /// The parse failure behind this error, if it is one.
    pub fn parse_failure(&self) -> Option<&ParseFailure> {
        match self {
            TaskError::Parse(failure) => Some(failure),
            _ => None,
        }
    }
}
