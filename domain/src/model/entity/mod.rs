pub mod job;

#[rustfmt::skip]
pub use self::job::{JobFailure, JobRecord, JobResult, JobState, Reconciliation};
