use domain::error::AdapterError;
use domain::model::vo::{BackendHandle, BackendKind, ResourceSpec, SubmissionArtifact};
use domain::service::{BackendAdapter, BackendStatus, ListFilter};

use super::{LsfJob, LsfJobs};
use crate::infrastructure::command::{MaybeSsh, ScriptInput, SshConfig};
use crate::infrastructure::service::job_scheduler::{failure, run, stage_script, stderr, stdout};

pub struct LsfClient {
    ssh: Option<SshConfig>,
    jobscript: String,
}

impl LsfClient {
    pub fn new(ssh: Option<SshConfig>, jobscript: String) -> Self {
        Self { ssh, jobscript }
    }

    /// `bjobs` exits non-zero when nothing matched, which is an empty answer here.
    async fn bjobs(&self, args: &[&str]) -> Result<LsfJobs, AdapterError> {
        let out = run(self.command("bjobs").args(["-a", "-w"]).args(args)).await?;
        let message = stderr(&out);
        let nothing_found = message
            .lines()
            .filter(|line| !line.trim().is_empty())
            .all(|line| line.contains("not found") || line.contains("No job found"));
        if !out.status.success() && (message.trim().is_empty() || !nothing_found) {
            return Err(AdapterError::Transient(format!(
                "bjobs exited with {}: {}",
                out.status,
                message.trim()
            )));
        }
        LsfJobs::new(&out.stdout)
            .map_err(|e| AdapterError::Transient(format!("unreadable bjobs output: {e}")))
    }
}

impl AsRef<Option<SshConfig>> for LsfClient {
    fn as_ref(&self) -> &Option<SshConfig> {
        &self.ssh
    }
}

#[async_trait::async_trait]
impl BackendAdapter for LsfClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Lsf
    }

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        let script = stage_script(self, artifact, resources, &self.jobscript).await?;
        let workdir = &resources.workdir;

        // bsub reads the embedded #BSUB directives only from stdin.
        let mut bsub = self.in_workdir("bsub", workdir, &script, ScriptInput::Stdin).map_err(|e| {
            AdapterError::Rejected(format!("cannot open {}: {e}", script.display()))
        })?;
        let out = run(&mut bsub).await?;
        if !out.status.success() {
            return Err(failure("bsub", &out));
        }

        let stdout = stdout(&out);
        let id = LsfJob::parse_job_id(&stdout).map_err(|_| {
            AdapterError::Transient(format!("unexpected bsub output: {}", stdout.trim()))
        })?;
        tracing::debug!(job_id = %artifact.job_id, lsf_id = %id, "Submitted to lsf");
        Ok(BackendHandle::new(BackendKind::Lsf, id))
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
        match self.bjobs(&ids).await {
            Ok(jobs) => handles
                .iter()
                .map(|handle| Ok(jobs.find(&handle.id).map_or(BackendStatus::NotFound, LsfJob::status)))
                .collect(),
            Err(e) => handles.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError> {
        let out = run(self.command("bkill").arg(&*handle.id)).await?;
        let message = stderr(&out);
        if message.contains("already finished") || message.contains("is not found") {
            return Ok(false);
        }
        if out.status.success() {
            return Ok(true);
        }
        Err(failure("bkill", &out))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        let jobs = match &filter.tag {
            Some(tag) => self.bjobs(&["-J", tag.as_str()]).await?,
            None => self.bjobs(&[]).await?,
        };
        Ok(jobs.jobs.iter().map(LsfJob::handle).collect())
    }
}
