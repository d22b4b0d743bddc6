use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::ResourceSpec;

const TAG_PREFIX_LEN: usize = 40;
const TAG_HASH_LEN: usize = 12;

/// Caller-assigned or generated job identity, stable for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Arc<str>);

impl JobId {
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheduler-safe name used as the backend job name, and to find the job again with
    /// `list` when a submission times out.
    ///
    /// The readable part is lossy and capped, so a hash of the raw id keeps tags of distinct
    /// jobs apart.
    pub fn correlation_tag(&self) -> String {
        let safe: String = self
            .0
            .chars()
            .take(TAG_PREFIX_LEN)
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let hash = blake3::hash(self.0.as_bytes()).to_hex();
        format!("jq-{safe}-{}", &hash[..TAG_HASH_LEN])
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// A unit of work plus what it needs and what it waits for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct JobDescriptor {
    #[builder(default = JobId::generate(), setter(into))]
    pub id: JobId,
    /// Command lines, run in order
    pub commands: Vec<String>,
    #[builder(setter(transform = |resources: ResourceSpec| Arc::new(resources)))]
    pub resources: Arc<ResourceSpec>,
    /// Jobs that must complete successfully before this one is submitted
    #[builder(default)]
    #[serde(default)]
    pub dependencies: BTreeSet<JobId>,
    /// Configured backend name; the default backend is used when absent
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub backend_hint: Option<String>,
}

impl JobDescriptor {
    #[inline]
    pub fn correlation_tag(&self) -> String {
        self.id.correlation_tag()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Slurm,
    Pbs,
    Lsf,
    Local,
}

/// Identifier a backend assigned to a submitted job, plus the kind of adapter that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    pub kind: BackendKind,
    pub id: Arc<str>,
}

impl BackendHandle {
    pub fn new(kind: BackendKind, id: impl Into<Arc<str>>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// The literal payload handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionArtifact {
    pub job_id: JobId,
    pub template_id: String,
    /// Backend job name, also the key for `list` lookups
    pub tag: String,
    pub content: String,
    /// BLAKE3 hex digest of `content`
    pub digest: String,
}
