use std::collections::HashMap;

use domain::error::AdapterError;
use domain::model::vo::{BackendHandle, BackendKind, ResourceSpec, SubmissionArtifact};
use domain::service::{BackendAdapter, BackendStatus, ListFilter};

use super::{SlurmJob, SACCT_FORMAT};
use crate::infrastructure::command::{MaybeSsh, ScriptInput, SshConfig};
use crate::infrastructure::service::job_scheduler::{failure, run, stage_script, stderr, stdout};

/// How far back `sacct` looks when searching jobs by name.
const LOOKBACK: &str = "now-7days";

pub struct SlurmClient {
    ssh: Option<SshConfig>,
    jobscript: String,
}

impl SlurmClient {
    pub fn new(ssh: Option<SshConfig>, jobscript: String) -> Self {
        Self { ssh, jobscript }
    }

    async fn sacct(&self, args: &[&str]) -> Result<Vec<SlurmJob>, AdapterError> {
        let out = run(self.command("sacct").args(["-PXn", "-o", SACCT_FORMAT]).args(args)).await?;
        if !out.status.success() {
            return Err(AdapterError::Transient(format!(
                "sacct exited with {}: {}",
                out.status,
                stderr(&out).trim()
            )));
        }
        SlurmJob::parse_all(&out.stdout)
            .map_err(|e| AdapterError::Transient(format!("unreadable sacct output: {e}")))
    }
}

impl AsRef<Option<SshConfig>> for SlurmClient {
    fn as_ref(&self) -> &Option<SshConfig> {
        &self.ssh
    }
}

#[async_trait::async_trait]
impl BackendAdapter for SlurmClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        let script = stage_script(self, artifact, resources, &self.jobscript).await?;
        let workdir = &resources.workdir;

        let mut sbatch = self
            .in_workdir("sbatch", workdir, &script, ScriptInput::Argument)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;
        let out = run(&mut sbatch).await?;
        if !out.status.success() {
            return Err(failure("sbatch", &out));
        }

        let stdout = stdout(&out);
        let id = SlurmJob::parse_job_id(&stdout).ok_or_else(|| {
            AdapterError::Transient(format!("unexpected sbatch output: {}", stdout.trim()))
        })?;
        tracing::debug!(job_id = %artifact.job_id, slurm_id = %id, "Submitted to slurm");
        Ok(BackendHandle::new(BackendKind::Slurm, id))
    }

    async fn status(&self, handle: &BackendHandle) -> Result<BackendStatus, AdapterError> {
        let mut statuses = self.status_many(std::slice::from_ref(handle)).await;
        statuses.pop().unwrap_or(Ok(BackendStatus::NotFound))
    }

    async fn status_many(
        &self,
        handles: &[BackendHandle],
    ) -> Vec<Result<BackendStatus, AdapterError>> {
        if handles.is_empty() {
            return vec![];
        }
        let ids = handles.iter().map(|handle| &*handle.id).collect::<Vec<_>>().join(",");
        match self.sacct(&["-j", &ids]).await {
            Ok(jobs) => {
                let by_id: HashMap<_, _> =
                    jobs.iter().map(|job| (job.job_id.as_str(), job.status())).collect();
                handles
                    .iter()
                    .map(|handle| Ok(by_id.get(&*handle.id).cloned().unwrap_or(BackendStatus::NotFound)))
                    .collect()
            }
            Err(e) => handles.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError> {
        let out = run(self.command("scancel").arg(&*handle.id)).await?;
        if out.status.success() {
            return Ok(true);
        }
        let err = failure("scancel", &out);
        let message = stderr(&out);
        if !err.is_transient()
            && (message.contains("Invalid job id") || message.contains("already completing"))
        {
            return Ok(false);
        }
        Err(err)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        let name = filter.tag.as_ref().map(|tag| format!("--name={tag}"));
        let mut args = vec!["-S", LOOKBACK];
        args.extend(name.as_deref());
        let jobs = self.sacct(&args).await?;
        Ok(jobs
            .iter()
            .filter(|job| filter.tag.as_ref().map_or(true, |tag| &job.job_name == tag))
            .map(SlurmJob::handle)
            .collect())
    }
}
