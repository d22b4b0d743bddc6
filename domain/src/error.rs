use std::path::PathBuf;

use crate::model::vo::JobId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidResources {
    #[error("a job needs at least one core")]
    ZeroCores,
    #[error("workdir {0:?} is not absolute")]
    RelativeWorkdir(PathBuf),
    #[error("workdir {0:?} does not exist")]
    MissingWorkdir(PathBuf),
    #[error("{0:?} is not a valid environment variable name")]
    EnvironmentName(String),
}

/// Rendering failures. Always fatal to the submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("no template registered as `{0}`")]
    UnknownTemplate(String),
    #[error("template `{template}` references unknown variable `{variable}`")]
    UnknownVariable { template: String, variable: String },
    #[error("template `{template}` requires `{variable}`, which the job does not provide")]
    MissingVariable { template: String, variable: String },
    #[error("block variable `{variable}` must stand alone on its line in template `{template}`")]
    MisplacedBlock { template: String, variable: String },
    #[error("value of `{variable}` contains characters that are not allowed in a job script")]
    UnsafeValue { variable: String },
    #[error("unterminated placeholder in template `{template}` at line {line}")]
    Syntax { template: String, line: usize },
}

/// Errors raised by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Timeouts and connectivity failures, safe to retry
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The backend refused a well-formed request
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

impl AdapterError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Permanent submission outcome, surfaced to the caller and attached to the failed job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    InvalidResources(#[from] InvalidResources),
    #[error("backend rejected the job: {0}")]
    Rejected(String),
    #[error("no confirmation after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors returned by the caller-facing dispatch operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("job `{0}` is not registered")]
    UnknownJob(JobId),
    #[error("job `{job}` depends on `{dependency}`, which is not registered")]
    UnknownDependency { job: JobId, dependency: JobId },
    #[error("job `{0}` would create a dependency cycle")]
    DependencyCycle(JobId),
    #[error("job `{0}` has already been submitted")]
    AlreadySubmitted(JobId),
    #[error("no backend named `{0}`")]
    UnknownBackend(String),
    #[error("backend `{0}` is registered twice")]
    DuplicateBackend(String),
    #[error("job `{job}` is invalid: {reason}")]
    InvalidDescriptor { job: JobId, reason: String },
    /// The job is registered as `Failed`; the error is also attached to its record.
    #[error("job `{job}` could not be submitted: {source}")]
    Submission { job: JobId, source: SubmissionError },
}
