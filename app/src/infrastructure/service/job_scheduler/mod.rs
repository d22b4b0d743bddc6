pub mod local;
pub mod lsf;
pub mod pbs;
pub mod slurm;

use std::path::{Path, PathBuf};
use std::process::Output;

use domain::error::AdapterError;
use domain::model::vo::{ResourceSpec, SubmissionArtifact};
use tokio::process::Command;

use crate::infrastructure::command::{Scp, SshConfig};

#[rustfmt::skip]
pub use self::{
    local::LocalPool,
    lsf::LsfClient,
    pbs::PbsClient,
    slurm::SlurmClient,
};

/// Scheduler or ssh messages that mean "try again later".
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "Connection refused",
    "Connection reset",
    "Connection closed",
    "Temporarily unavailable",
    "temporarily unavailable",
    "try again",
    "Unable to contact",
];

/// Exit code ssh itself uses for connection errors.
const SSH_FAILURE: i32 = 255;

/// Writes the rendered script into the workdir on the scheduler host and returns its path.
/// The file is named after the job's tag, so jobs sharing a workdir keep their own scripts.
/// Behind the ssh proxy the script is written to a local temporary file and copied over.
pub async fn stage_script<Ctx>(
    ctx: &Ctx,
    artifact: &SubmissionArtifact,
    resources: &ResourceSpec,
    jobscript: &str,
) -> Result<PathBuf, AdapterError>
where
    Ctx: AsRef<Option<SshConfig>>,
{
    let name = script_name(artifact, jobscript);
    let target = resources.workdir.join(&name);
    let local = std::env::temp_dir().join(&name);

    let Some(mut upload) = ctx.upload(&local, &target) else {
        write_script(&target, &artifact.content).await.map_err(|e| {
            AdapterError::Rejected(format!("cannot write {}: {e}", target.display()))
        })?;
        return Ok(target);
    };

    write_script(&local, &artifact.content)
        .await
        .map_err(|e| AdapterError::Transient(format!("cannot write {}: {e}", local.display())))?;
    let out = run(&mut upload).await;
    let _ = tokio::fs::remove_file(&local).await;

    let out = out?;
    if !out.status.success() {
        return Err(failure("scp", &out));
    }
    Ok(target)
}

/// `<tag>.<jobscript>`, e.g. `jq-equil-3f2a9c01b7de.job.sh`.
fn script_name(artifact: &SubmissionArtifact, jobscript: &str) -> String {
    format!("{}.{jobscript}", artifact.tag)
}

async fn write_script(path: &Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, content).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

/// Runs a scheduler command. Failing to even start it counts as transient.
pub async fn run(command: &mut Command) -> Result<Output, AdapterError> {
    command.output().await.map_err(|e| AdapterError::Transient(e.to_string()))
}

/// Classifies a failed scheduler command.
pub fn failure(what: &str, out: &Output) -> AdapterError {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let message = format!("{what} exited with {}: {}", out.status, stderr.trim());

    if out.status.code() == Some(SSH_FAILURE)
        || TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker))
    {
        AdapterError::Transient(message)
    } else {
        AdapterError::Rejected(message)
    }
}

#[inline]
pub fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[inline]
pub fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}
