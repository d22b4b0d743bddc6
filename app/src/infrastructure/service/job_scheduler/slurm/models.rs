use domain::model::vo::{BackendHandle, BackendKind};
use domain::service::BackendStatus;
use serde::*;

/// Columns requested from `sacct`, in this order.
pub const SACCT_FORMAT: &str = "JobID,JobName,State,ExitCode";

/// One `sacct -PXn` row.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmJob {
    #[serde(rename = "JobID")]
    pub job_id: String,
    #[serde(rename = "JobName")]
    pub job_name: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "ExitCode")]
    pub exit_code: String,
}

impl SlurmJob {
    /// Parses header-less, `|`-separated `sacct` output.
    pub fn parse_all(out: &[u8]) -> Result<Vec<Self>, csv::Error> {
        csv::ReaderBuilder::new()
            .delimiter(b'|')
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .from_reader(out)
            .deserialize()
            .collect()
    }

    /// `sbatch` answers `Submitted batch job <id>`, optionally followed by `on cluster <name>`.
    pub fn parse_job_id(out: &str) -> Option<String> {
        out.lines()
            .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_owned)
    }

    pub fn handle(&self) -> BackendHandle {
        BackendHandle::new(BackendKind::Slurm, self.job_id.as_str())
    }

    pub fn status(&self) -> BackendStatus {
        // `CANCELLED by 1000` carries the canceller's uid.
        let state = self.state.split_whitespace().next().unwrap_or_default();
        match state {
            "PENDING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESV_DEL_HOLD"
            | "SUSPENDED" => BackendStatus::Queued,
            "RUNNING" | "COMPLETING" | "CONFIGURING" | "RESIZING" | "SIGNALING" | "STAGE_OUT" => {
                BackendStatus::Running
            }
            "COMPLETED" => BackendStatus::Completed { exit_code: self.exit_code() },
            _ => BackendStatus::Failed {
                exit_code: self.exit_code(),
                reason: self.state.clone(),
            },
        }
    }

    /// `ExitCode` is `<code>:<signal>`.
    fn exit_code(&self) -> Option<i32> {
        self.exit_code.split(':').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn deserialize() {
        let out = indoc! {"
            4242|jq-equil|COMPLETED|0:0
            4243|jq-prod|RUNNING|0:0
            4244|jq-bad|FAILED|2:0
            4245|jq-gone|CANCELLED by 1000|0:15
            4246|jq-wait|PENDING|0:0
        "};
        let jobs = SlurmJob::parse_all(out.as_bytes()).unwrap();
        let statuses: Vec<_> = jobs.iter().map(SlurmJob::status).collect();
        assert_eq!(
            statuses,
            [
                BackendStatus::Completed { exit_code: Some(0) },
                BackendStatus::Running,
                BackendStatus::Failed { exit_code: Some(2), reason: "FAILED".to_owned() },
                BackendStatus::Failed {
                    exit_code: Some(0),
                    reason: "CANCELLED by 1000".to_owned()
                },
                BackendStatus::Queued,
            ]
        );
        assert_eq!(jobs[0].job_name, "jq-equil");
        assert_eq!(jobs[0].handle(), BackendHandle::new(BackendKind::Slurm, "4242"));
    }

    #[test]
    fn empty_output_has_no_jobs() {
        assert!(SlurmJob::parse_all(b"").unwrap().is_empty());
    }

    #[test]
    fn parse_job_id() {
        assert_eq!(SlurmJob::parse_job_id("Submitted batch job 4242\n").as_deref(), Some("4242"));
        assert_eq!(
            SlurmJob::parse_job_id("Submitted batch job 17 on cluster cpu\n").as_deref(),
            Some("17")
        );
        assert_eq!(SlurmJob::parse_job_id("sbatch: error: oops"), None);
    }
}
