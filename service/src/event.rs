use domain::model::entity::JobState;
use domain::model::vo::{BackendHandle, JobId};

/// Notifications for whoever watches the dispatch layer from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    StateChanged { job: JobId, from: JobState, to: JobState },
    /// `job` can never run because `dependency` ended unsuccessfully.
    DependencyCancelled { job: JobId, dependency: JobId },
    /// The backend keeps answering NotFound and the policy says to hold the job.
    ReconciliationAmbiguity { job: JobId, handle: BackendHandle, polls: u32 },
    SubmissionFailed { job: JobId, reason: String },
    /// The backend refused to stop the job.
    CancelRejected { job: JobId, handle: BackendHandle },
}

impl DispatchEvent {
    pub fn job(&self) -> &JobId {
        match self {
            Self::StateChanged { job, .. }
            | Self::DependencyCancelled { job, .. }
            | Self::ReconciliationAmbiguity { job, .. }
            | Self::SubmissionFailed { job, .. }
            | Self::CancelRejected { job, .. } => job,
        }
    }
}
