// Engine Errors
// Configuration failures (fatal to a run) and step execution failures (fatal to a job)

use crate::parser::error::ParseError;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for loading and expanding pipelines
pub type EngineResult<T> = Result<T, ConfigError>;

/// Malformed template, matrix or pipeline file.
///
/// Always surfaced before any job starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("matrix axis '{axis}' of job '{job}' has no values")]
    EmptyAxis { job: String, axis: String },

    #[error("matrix axis '{axis}' of job '{job}' lists '{value}' more than once")]
    DuplicateAxisValue {
        job: String,
        axis: String,
        value: String,
    },

    #[error("matrix axis '{axis}' of job '{job}' references undefined variable '{variable}'")]
    UndefinedVariable {
        job: String,
        axis: String,
        variable: String,
    },

    #[error("instance name '{name}' from job '{job}' is used more than once in the run")]
    DuplicateInstance { job: String, name: String },

    #[error("matrix of job '{job}' expands to {count} instances (limit is {limit})")]
    MatrixTooLarge {
        job: String,
        count: usize,
        limit: usize,
    },

    #[error("invalid condition '{condition}' on step '{step}': {message}")]
    InvalidCondition {
        step: String,
        condition: String,
        message: String,
    },

    #[error("template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("job '{job}': {message}")]
    InvalidJob { job: String, message: String },
}

impl ConfigError {
    pub(crate) fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_job(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.into(),
            message: message.into(),
        }
    }
}

/// Why a step's command did not succeed
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for '{shell}': {source}")]
    Wait {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with code {0}")]
    NonZeroExit(i32),

    #[error("process was terminated by a signal")]
    Terminated,

    #[error("step timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("step reported failure via task.complete")]
    ReportedFailure,
}
