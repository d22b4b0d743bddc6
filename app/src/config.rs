use std::collections::BTreeMap;
use std::time::Duration;

use domain::model::vo::BackendKind;
use infrastructure::retry::Backoff;
use serde::*;
use service::prelude::*;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_log_level")]
    pub log_level: String,

    #[serde(default = "AppConfig::default_backend")]
    pub default_backend: String,

    /// Directory holding the checkpoint file
    #[serde(default = "AppConfig::default_save_path")]
    pub save_path: String,

    /// Seconds between two checkpoints
    #[serde(default = "AppConfig::default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Seconds between two progress reports while waiting
    #[serde(default = "AppConfig::default_report_interval")]
    pub report_interval: u64,

    /// JSON manifest of jobs to submit on startup
    #[serde(default = "Default::default")]
    pub jobs_file: Option<String>,

    #[serde(default = "Default::default")]
    pub ssh_proxy: Option<SshProxyConfig>,

    #[serde(default = "AppConfig::default_backends")]
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshProxyConfig {
    pub host: String,

    pub username: String,

    #[serde(default = "SshProxyConfig::default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub r#type: BackendKind,

    /// Seconds between two status polls
    #[serde(default = "BackendConfig::default_poll_interval")]
    pub poll_interval: u64,

    /// Seconds one scheduler call may take
    #[serde(default = "BackendConfig::default_call_timeout")]
    pub call_timeout: u64,

    #[serde(default = "Default::default")]
    pub retry: RetryConfig,

    #[serde(default = "BackendConfig::default_failure_budget")]
    pub failure_budget: u32,

    #[serde(default = "Default::default")]
    pub not_found: NotFoundConfig,

    #[serde(default = "Default::default")]
    pub queue: Option<String>,

    /// Scheduler-side environment export list, e.g. `ALL`
    #[serde(default = "Default::default")]
    pub envvars: Option<String>,

    /// Shell lines run before the job's commands
    #[serde(default = "Default::default")]
    pub prerun: Vec<String>,

    #[serde(default = "Default::default")]
    pub output: Option<String>,

    #[serde(default = "Default::default")]
    pub error: Option<String>,

    #[serde(default = "BackendConfig::default_sentinel")]
    pub sentinel: String,

    /// Suffix of the rendered script in the job's workdir, after the job's tag
    #[serde(default = "BackendConfig::default_jobscript")]
    pub jobscript: String,

    /// LSF only: application profile
    #[serde(default = "Default::default")]
    pub app: Option<String>,

    /// LSF only: resource requirement strings, one `-R` each
    #[serde(default = "Default::default")]
    pub resources: Vec<String>,

    /// PBS only: restrict nodes to one cluster
    #[serde(default = "Default::default")]
    pub cluster: Option<String>,

    /// PBS only: local scratch per node, in MB
    #[serde(default = "Default::default")]
    pub scratch_local_mb: Option<u64>,

    /// Replaces the built-in template of the backend type
    #[serde(default = "Default::default")]
    pub template_path: Option<String>,

    /// Local pool only: CPUs shared by all local jobs. Defaults to the host's.
    #[serde(default = "Default::default")]
    pub max_cpu: Option<usize>,

    /// Local pool only: CPUs taken by one job
    #[serde(default = "BackendConfig::default_ncpu")]
    pub ncpu: usize,

    /// Local pool only: one job per listed device
    #[serde(default = "Default::default")]
    pub gpu_devices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "RetryConfig::default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum NotFoundConfig {
    #[default]
    Hold,
    Lost {
        after: u32,
    },
    /// `grace` in seconds
    Completed {
        grace: u64,
    },
}

impl AppConfig {
    pub fn default_log_level() -> String {
        "info".to_owned()
    }

    pub fn default_backend() -> String {
        "local".to_owned()
    }

    pub fn default_save_path() -> String {
        ".".to_owned()
    }

    pub fn default_checkpoint_interval() -> u64 {
        10
    }

    pub fn default_report_interval() -> u64 {
        60
    }

    pub fn default_backends() -> BTreeMap<String, BackendConfig> {
        BTreeMap::from([("local".to_owned(), BackendConfig::new(BackendKind::Local))])
    }
}

impl SshProxyConfig {
    pub fn default_port() -> u16 {
        22
    }
}

impl BackendConfig {
    pub fn new(r#type: BackendKind) -> Self {
        Self {
            r#type,
            poll_interval: Self::default_poll_interval(),
            call_timeout: Self::default_call_timeout(),
            retry: RetryConfig::default(),
            failure_budget: Self::default_failure_budget(),
            not_found: NotFoundConfig::default(),
            queue: None,
            envvars: None,
            prerun: vec![],
            output: None,
            error: None,
            sentinel: Self::default_sentinel(),
            jobscript: Self::default_jobscript(),
            app: None,
            resources: vec![],
            cluster: None,
            scratch_local_mb: None,
            template_path: None,
            max_cpu: None,
            ncpu: Self::default_ncpu(),
            gpu_devices: vec![],
        }
    }

    pub fn default_poll_interval() -> u64 {
        30
    }

    pub fn default_call_timeout() -> u64 {
        60
    }

    pub fn default_failure_budget() -> u32 {
        5
    }

    pub fn default_sentinel() -> String {
        "jobqueues.done".to_owned()
    }

    pub fn default_jobscript() -> String {
        "job.sh".to_owned()
    }

    pub fn default_ncpu() -> usize {
        1
    }

    /// Dispatch policy of this backend. `remote` disables the local workdir check.
    pub fn policy(&self, remote: bool) -> BackendPolicy {
        let not_found = match self.not_found {
            NotFoundConfig::Hold => NotFoundPolicy::Hold,
            NotFoundConfig::Lost { after } => NotFoundPolicy::Lost { after: after.max(1) },
            NotFoundConfig::Completed { grace } => NotFoundPolicy::Completed {
                grace: Duration::from_secs(grace),
            },
        };

        BackendPolicy {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            call_timeout: Duration::from_secs(self.call_timeout.max(1)),
            retry: Backoff::new(
                self.retry.max_retries,
                Duration::from_millis(self.retry.min_backoff_ms),
                Duration::from_millis(self.retry.max_backoff_ms),
            ),
            failure_budget: self.failure_budget.max(1),
            not_found,
            check_workdir: !remote || self.r#type == BackendKind::Local,
        }
    }

    pub fn bindings(&self) -> TemplateBindings {
        TemplateBindings {
            queue: self.queue.clone(),
            envvars: self.envvars.clone(),
            prerun: self.prerun.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            sentinel: self.sentinel.clone(),
            app: self.app.clone(),
            resources: self.resources.clone(),
            cluster: self.cluster.clone(),
            scratch_local_mb: self.scratch_local_mb,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            min_backoff_ms: Self::default_min_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn default_max_retries() -> u32 {
        3
    }

    pub fn default_min_backoff_ms() -> u64 {
        500
    }

    pub fn default_max_backoff_ms() -> u64 {
        10_000
    }
}

pub fn build_config(path: Option<&str>) -> Result<config::Config, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(path.unwrap_or("jobq")).required(path.is_some()))
        .add_source(config::Environment::with_prefix("JOBQ").separator("__"))
        .build()
}
