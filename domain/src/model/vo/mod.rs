pub mod job;
pub mod resources;

#[rustfmt::skip]
pub use self::{
    job::{BackendHandle, BackendKind, JobDescriptor, JobId, SubmissionArtifact},
    resources::ResourceSpec,
};
