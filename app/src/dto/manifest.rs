use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use domain::model::vo::{JobDescriptor, JobId, ResourceSpec};
use serde::*;

/// One entry of a job manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestJob {
    #[serde(default, skip_serializing)]
    pub id: Option<String>,
    pub commands: Vec<String>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Configured backend name
    #[serde(default)]
    pub backend: Option<String>,
}

impl ManifestJob {
    /// Entries without an id are named after their content, so loading the same manifest
    /// again after a restart finds the jobs already tracked instead of running them twice.
    pub fn job_id(&self) -> serde_json::Result<JobId> {
        let Some(id) = &self.id else {
            // Field order is fixed and the maps are ordered, so the encoding is stable.
            let canonical = serde_json::to_vec(self)?;
            let hash = blake3::hash(&canonical).to_hex();
            return Ok(JobId::from(format!("job-{}", &hash[..16])));
        };
        Ok(JobId::from(id.as_str()))
    }
}

impl TryFrom<ManifestJob> for JobDescriptor {
    type Error = serde_json::Error;

    fn try_from(job: ManifestJob) -> Result<Self, Self::Error> {
        let id = job.job_id()?;
        let ManifestJob { commands, resources, dependencies, backend, .. } = job;
        let builder = JobDescriptor::builder()
            .id(id)
            .commands(commands)
            .resources(resources)
            .dependencies(dependencies.into_iter().map(JobId::from).collect());
        Ok(match backend {
            Some(backend) => builder.backend_hint(backend).build(),
            None => builder.build(),
        })
    }
}

pub fn parse_manifest(json: &[u8]) -> serde_json::Result<Vec<JobDescriptor>> {
    let jobs: Vec<ManifestJob> = serde_json::from_slice(json)?;
    jobs.into_iter().map(JobDescriptor::try_from).collect()
}

/// Reads a JSON array of jobs. Order matters: a job may only depend on jobs listed before it.
pub async fn load_manifest(path: impl AsRef<Path>) -> anyhow::Result<Vec<JobDescriptor>> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Cannot read job manifest {}", path.display()))?;
    parse_manifest(&bytes).with_context(|| format!("Malformed job manifest {}", path.display()))
}
