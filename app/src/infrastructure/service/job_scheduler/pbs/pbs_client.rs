use domain::error::AdapterError;
use domain::model::vo::{BackendHandle, BackendKind, ResourceSpec, SubmissionArtifact};
use domain::service::{BackendAdapter, BackendStatus, ListFilter};

use super::{PbsJob, PbsJobs};
use crate::infrastructure::command::{MaybeSsh, ScriptInput, SshConfig};
use crate::infrastructure::service::job_scheduler::{failure, run, stage_script, stderr, stdout};

pub struct PbsClient {
    ssh: Option<SshConfig>,
    jobscript: String,
}

impl PbsClient {
    pub fn new(ssh: Option<SshConfig>, jobscript: String) -> Self {
        Self { ssh, jobscript }
    }

    /// `qstat` exits non-zero when any of `ids` is unknown but still prints the others.
    async fn qstat(&self, ids: &[&str]) -> Result<PbsJobs, AdapterError> {
        let out = run(self.command("qstat").args(["-xfF", "json"]).args(ids)).await?;
        let message = stderr(&out);
        let unknown_only = message
            .lines()
            .filter(|line| !line.trim().is_empty())
            .all(|line| line.contains("Unknown Job Id"));
        if !out.status.success() && (message.trim().is_empty() || !unknown_only) {
            return Err(AdapterError::Transient(format!(
                "qstat exited with {}: {}",
                out.status,
                message.trim()
            )));
        }
        PbsJobs::parse(&out.stdout)
            .map_err(|e| AdapterError::Transient(format!("unreadable qstat output: {e}")))
    }
}

impl AsRef<Option<SshConfig>> for PbsClient {
    fn as_ref(&self) -> &Option<SshConfig> {
        &self.ssh
    }
}

#[async_trait::async_trait]
impl BackendAdapter for PbsClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Pbs
    }

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        let script = stage_script(self, artifact, resources, &self.jobscript).await?;
        let workdir = &resources.workdir;

        let mut qsub = self
            .in_workdir("qsub", workdir, &script, ScriptInput::Argument)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;
        let out = run(&mut qsub).await?;
        if !out.status.success() {
            return Err(failure("qsub", &out));
        }

        let stdout = stdout(&out);
        let id = PbsJob::parse_job_id(&stdout).ok_or_else(|| {
            AdapterError::Transient(format!("unexpected qsub output: {}", stdout.trim()))
        })?;
        tracing::debug!(job_id = %artifact.job_id, pbs_id = %id, "Submitted to pbs");
        Ok(BackendHandle::new(BackendKind::Pbs, id))
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
        let ids: Vec<_> = handles.iter().map(|handle| &*handle.id).collect();
        match self.qstat(&ids).await {
            Ok(jobs) => handles
                .iter()
                .map(|handle| Ok(jobs.find(&handle.id).map_or(BackendStatus::NotFound, PbsJob::status)))
                .collect(),
            Err(e) => handles.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError> {
        let out = run(self.command("qdel").arg(&*handle.id)).await?;
        if out.status.success() {
            return Ok(true);
        }
        let err = failure("qdel", &out);
        let message = stderr(&out);
        if !err.is_transient()
            && (message.contains("Unknown Job Id")
                || message.contains("Request invalid for state of job")
                || message.contains("Job has finished"))
        {
            return Ok(false);
        }
        Err(err)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        let jobs = self.qstat(&[]).await?;
        Ok(jobs.named(filter.tag.as_deref()))
    }
}
