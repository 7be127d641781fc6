//! Error types for the prism engine.

pub mod similarity;

use crate::column::ColumnIdentity;

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum PrismError {
    /// Reading, writing or decoding a cache file failed.
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A metric, distill or model function was requested but never registered.
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    /// Prompt version not present in the prompt book.
    #[error("unknown prompt version: {prompt_id}")]
    UnknownPrompt { prompt_id: String },

    /// Requirement not attached to the given prompt.
    #[error("unknown requirement {requirement_id} in prompt {prompt_id}")]
    UnknownRequirement {
        prompt_id: String,
        requirement_id: String,
    },

    /// A filter predicate references a column the table does not have.
    #[error("undefined filter variable: {name}{}", suggestion_suffix(.suggestion))]
    UndefinedVariable {
        name: String,
        suggestion: Option<String>,
    },

    /// The grading client flagged a response as failed.
    #[error("grading request failed for {column}: {message}")]
    GradingFailed { column: String, message: String },

    /// A grading reply could not be parsed into a verdict.
    #[error("could not parse grading reply for {column} (row {row}): {message}")]
    GradingParse {
        column: String,
        row: String,
        message: String,
    },

    /// A registered function raised while computing a column.
    #[error("stage failed computing {column}: {message}")]
    Stage { column: String, message: String },

    /// An identical run is already in flight.
    #[error("a run for {column} is already in flight")]
    AlreadyRunning { column: String },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

impl PrismError {
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn stage(column: &ColumnIdentity, err: impl std::fmt::Display) -> Self {
        Self::Stage {
            column: column.to_string(),
            message: err.to_string(),
        }
    }

    /// Filter errors that callers turn into an empty slice instead of failing.
    pub fn is_undefined_variable(&self) -> bool {
        matches!(self, Self::UndefinedVariable { .. })
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::UnknownFunction { .. }
            | Self::UnknownPrompt { .. }
            | Self::UnknownRequirement { .. }
            | Self::UndefinedVariable { .. } => 1,
            Self::Cache { .. } => 3,
            Self::GradingFailed { .. } | Self::GradingParse { .. } | Self::Stage { .. } => 4,
            Self::AlreadyRunning { .. } => 5,
        }
    }
}

impl From<std::io::Error> for PrismError {
    fn from(err: std::io::Error) -> Self {
        Self::Cache {
            message: err.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type PrismResult<T> = Result<T, PrismError>;
