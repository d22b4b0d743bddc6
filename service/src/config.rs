use std::time::Duration;

use infrastructure::retry::Backoff;

/// What to conclude when a backend stops reporting a job it accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// Keep the last known state and flag the record for an operator.
    #[default]
    Hold,
    /// Mark the job `Lost` after this many consecutive NotFound polls.
    Lost { after: u32 },
    /// Treat the job as `Completed` once NotFound has persisted for `grace`, for schedulers
    /// that forget finished jobs quickly.
    Completed { grace: Duration },
}

/// Per-backend knobs of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPolicy {
    pub poll_interval: Duration,
    /// Upper bound for every single adapter call
    pub call_timeout: Duration,
    pub retry: Backoff,
    /// Consecutive transient status failures before a job is declared `Lost`
    pub failure_budget: u32,
    pub not_found: NotFoundPolicy,
    /// Whether the workdir must exist on this host. Off when the backend runs elsewhere.
    pub check_workdir: bool,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            retry: Backoff::default(),
            failure_budget: 5,
            not_found: NotFoundPolicy::Hold,
            check_workdir: true,
        }
    }
}
