use anyhow::Context;
use domain::model::vo::{BackendHandle, BackendKind};
use domain::service::BackendStatus;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug)]
pub struct LsfJobs {
    pub jobs: Vec<LsfJob>,
}

#[derive(Debug, Deserialize)]
pub struct LsfJob {
    #[serde(rename = "JOBID")]
    pub id: String,
    #[serde(rename = "STAT")]
    pub state: String,
    #[serde(rename = "USER")]
    pub user: String,
    #[serde(rename = "JOB_NAME")]
    pub job_name: String,
}

impl LsfJob {
    /// `bsub` answers `Job <id> is submitted to queue <queue>.`
    #[inline]
    pub fn parse_job_id(s: &str) -> anyhow::Result<String> {
        let e_str = "Id parse error";
        Ok(s.lines()
            .find_map(|line| line.trim().strip_prefix("Job <"))
            .context(e_str)?
            .split_once('>')
            .context(e_str)?
            .0
            .to_string())
    }

    pub fn handle(&self) -> BackendHandle {
        BackendHandle::new(BackendKind::Lsf, self.id.as_str())
    }

    pub fn status(&self) -> BackendStatus {
        match self.state.as_str() {
            "PEND" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" => BackendStatus::Queued,
            "RUN" | "PROV" => BackendStatus::Running,
            "DONE" => BackendStatus::Completed { exit_code: Some(0) },
            "EXIT" => BackendStatus::Failed {
                exit_code: None,
                reason: "job exited with a non-zero status".to_owned(),
            },
            _ => BackendStatus::NotFound,
        }
    }
}

impl LsfJobs {
    /// Parses `bjobs -a -w` output. Columns are whitespace separated, only the submit and start
    /// times contain blanks.
    pub fn new(s: &[u8]) -> anyhow::Result<Self> {
        let text = String::from_utf8_lossy(s);
        let lines: Vec<String> = text
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with("---"))
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();
        if lines.len() < 2 {
            return Ok(Self { jobs: vec![] });
        }

        let re = Regex::new(r"[A-Z][a-z]{2} [0-3]?[0-9] [0-2][0-9]:[0-5][0-9]")?;
        let t = re.replace_all(&lines.join("\n"), "xx").to_string();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .flexible(true)
            .from_reader(t.as_bytes());
        Ok(Self {
            jobs: reader
                .deserialize()
                .map(|record| {
                    let job: LsfJob = record?;
                    Ok(job)
                })
                .collect::<anyhow::Result<Vec<LsfJob>>>()?,
        })
    }

    pub fn find(&self, id: &str) -> Option<&LsfJob> {
        self.jobs.iter().find(|job| job.id == id)
    }
}
