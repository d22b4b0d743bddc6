use crate::error::AdapterError;
use crate::model::vo::{BackendHandle, BackendKind, ResourceSpec, SubmissionArtifact};

/// What a backend says about one of its jobs, translated into the common vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Queued,
    Running,
    Completed { exit_code: Option<i32> },
    Failed { exit_code: Option<i32>, reason: String },
    /// The backend no longer knows the handle. Not an adapter failure.
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only jobs submitted under this correlation tag
    pub tag: Option<String>,
}

impl ListFilter {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self { tag: Some(tag.into()) }
    }
}

/// Translation layer between the dispatch core and one scheduler family.
///
/// Implementations are stateless per call as far as the core is concerned. Cancellation is
/// best effort everywhere: `cancel` returning `true` only means the stop signal was accepted.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError>;

    async fn status(&self, handle: &BackendHandle) -> Result<BackendStatus, AdapterError>;

    /// Status of several jobs, answers in the same order as `handles`.
    ///
    /// Adapters that can answer with one scheduler call should override this.
    async fn status_many(
        &self,
        handles: &[BackendHandle],
    ) -> Vec<Result<BackendStatus, AdapterError>> {
        futures::future::join_all(handles.iter().map(|handle| self.status(handle))).await
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError>;
}
