use std::collections::HashMap;

use domain::model::vo::{BackendHandle, BackendKind};
use domain::service::BackendStatus;
use serde::*;

/// `qstat -xfF json` output.
#[derive(Debug, Default, Deserialize)]
pub struct PbsJobs {
    #[serde(rename = "Jobs", default)]
    pub jobs: HashMap<String, PbsJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PbsJob {
    #[serde(rename = "Job_Name")]
    pub job_name: String,
    pub job_state: String,
    #[serde(rename = "Exit_status", default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl PbsJobs {
    pub fn parse(out: &[u8]) -> serde_json::Result<Self> {
        if out.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(out)
    }

    /// Looks a job up by the id `qsub` printed. Servers may answer with a different suffix, so
    /// only the sequence number has to match.
    pub fn find(&self, id: &str) -> Option<&PbsJob> {
        self.jobs.get(id).or_else(|| {
            let seq = sequence_number(id);
            self.jobs.iter().find(|(key, _)| sequence_number(key) == seq).map(|(_, job)| job)
        })
    }

    /// Handles of the jobs named `name`, sorted by id.
    pub fn named(&self, name: Option<&str>) -> Vec<BackendHandle> {
        let mut ids: Vec<_> = self
            .jobs
            .iter()
            .filter(|(_, job)| name.map_or(true, |name| job.job_name == name))
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| BackendHandle::new(BackendKind::Pbs, id)).collect()
    }
}

impl PbsJob {
    /// `qsub` prints the full job id, e.g. `1234.server`.
    pub fn parse_job_id(out: &str) -> Option<String> {
        let id = out.lines().map(str::trim).find(|line| !line.is_empty())?;
        (!id.contains(char::is_whitespace)).then(|| id.to_owned())
    }

    pub fn status(&self) -> BackendStatus {
        match self.job_state.as_str() {
            "Q" | "H" | "W" | "T" | "S" | "U" => BackendStatus::Queued,
            "R" | "E" | "B" => BackendStatus::Running,
            "F" | "X" => match self.exit_status {
                Some(0) => BackendStatus::Completed { exit_code: Some(0) },
                exit_code => BackendStatus::Failed {
                    exit_code,
                    reason: self.comment.clone().unwrap_or_else(|| "job finished unsuccessfully".to_owned()),
                },
            },
            _ => BackendStatus::NotFound,
        }
    }
}

fn sequence_number(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}
