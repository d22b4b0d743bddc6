use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::vo::{BackendHandle, JobDescriptor, JobId};

/// Lifecycle of a job, one authoritative copy per job in the registry.
#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// Created, dependencies unmet or not yet submitted
    #[default]
    Pending,
    /// Handed to a backend, handle assigned
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The backend can no longer account for the job
    Lost,
}

impl JobState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Lost)
    }

    /// Submitted and not yet terminal, i.e. something the poller has to look at.
    #[inline]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Queued | Self::Running)
    }

    /// Terminal without success; dependents of such a job can never run.
    #[inline]
    pub const fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Lost)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;
        match self {
            Completed | Failed | Cancelled | Lost => false,
            Pending => matches!(next, Submitted | Failed | Cancelled),
            Submitted => !matches!(next, Pending | Submitted),
            // Queued and Running may oscillate freely.
            Queued | Running => !matches!(next, Pending | Submitted),
        }
    }
}

/// Why a job ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobFailure {
    Template { message: String },
    Submission { message: String },
    Backend { exit_code: Option<i32>, reason: String },
    Dependency { dependency: JobId },
    Lost { reason: String },
}

/// Result metadata, the only part of a record that may change after a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub exit_code: Option<i32>,
    pub failure: Option<JobFailure>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.submitted_at?)
    }
}

/// Counters used to turn missing or failed status reports into a definitive state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub not_found_polls: u32,
    pub first_not_found: Option<DateTime<Utc>>,
    pub transient_failures: u32,
    /// A NotFound could not be resolved by policy and is waiting for an operator
    pub ambiguous: bool,
}

impl Reconciliation {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A registry entry. State and handle live in the same value so they are always replaced
/// together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub descriptor: Arc<JobDescriptor>,
    /// Name of the configured backend the job was routed to
    pub backend: String,
    pub state: JobState,
    pub handle: Option<BackendHandle>,
    #[serde(default)]
    pub result: JobResult,
    #[serde(default)]
    pub reconciliation: Reconciliation,
    /// Submission attempts made so far; non-zero means the backend may already know the job
    #[serde(default)]
    pub submit_attempts: u32,
    /// Set while a submission is in flight
    #[serde(skip)]
    pub claimed: bool,
    /// Bumped whenever a pending record is replaced by a newer submit of the same id
    #[serde(skip)]
    pub generation: u64,
}

impl JobRecord {
    pub fn new(descriptor: Arc<JobDescriptor>, backend: impl Into<String>) -> Self {
        Self {
            descriptor,
            backend: backend.into(),
            state: JobState::Pending,
            handle: None,
            result: JobResult::default(),
            reconciliation: Reconciliation::default(),
            submit_attempts: 0,
            claimed: false,
            generation: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> &JobId {
        &self.descriptor.id
    }
}
