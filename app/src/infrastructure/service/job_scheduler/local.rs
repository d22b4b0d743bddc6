use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use domain::error::AdapterError;
use domain::model::vo::{BackendHandle, BackendKind, ResourceSpec, SubmissionArtifact};
use domain::service::{BackendAdapter, BackendStatus, ListFilter};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::command::SshConfig;
use crate::infrastructure::service::job_scheduler::stage_script;

/// A share of the host one job runs on. `device` pins the job to one GPU.
#[derive(Debug, Clone)]
struct Slot {
    device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalState {
    Queued,
    Running,
    Exited(Option<i32>),
    Cancelled,
    Crashed(String),
}

struct LocalJob {
    tag: String,
    state: LocalState,
    cancel: CancellationToken,
}

/// What a queued job needs once it gets a slot.
struct Launch {
    script: PathBuf,
    workdir: PathBuf,
    output: Option<PathBuf>,
    error: Option<PathBuf>,
}

impl Launch {
    /// Output files are opened here, when the job starts, so a queued job never truncates
    /// the output of one still running.
    fn command(&self, device: Option<&String>) -> std::io::Result<Command> {
        let mut command = Command::new("bash");
        command
            .arg(&self.script)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(stdio(self.output.as_deref())?)
            .stderr(stdio(self.error.as_deref())?)
            .kill_on_drop(true);
        if let Some(device) = device {
            command.env("CUDA_VISIBLE_DEVICES", device);
        }
        Ok(command)
    }
}

fn stdio(file: Option<&Path>) -> std::io::Result<Stdio> {
    match file {
        Some(file) => Ok(std::fs::File::create(file)?.into()),
        None => Ok(Stdio::null()),
    }
}

#[derive(Debug, Clone)]
pub struct LocalPoolConfig {
    /// CPUs shared by all jobs, defaults to the host's
    pub max_cpu: Option<usize>,
    /// CPUs taken by one job
    pub ncpu: usize,
    /// With devices listed, one job runs per device instead
    pub gpu_devices: Vec<String>,
    pub jobscript: String,
    /// Files in the workdir receiving the script's stdout and stderr
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs job scripts as child processes of this host, a fixed number at a time.
///
/// Handles are `<instance>-<n>`. The instance part is random per pool, so a handle restored
/// from an earlier run is never mistaken for a job of this one.
pub struct LocalPool {
    instance: String,
    jobs: Arc<DashMap<u64, LocalJob>>,
    slots_tx: flume::Sender<Slot>,
    slots_rx: flume::Receiver<Slot>,
    next_id: AtomicU64,
    config: LocalPoolConfig,
    ssh: Option<SshConfig>,
}

impl LocalPool {
    pub fn new(config: LocalPoolConfig) -> anyhow::Result<Self> {
        let slots: Vec<Slot> = if config.gpu_devices.is_empty() {
            let max_cpu = match config.max_cpu {
                Some(max_cpu) => max_cpu,
                None => std::thread::available_parallelism()?.get(),
            };
            anyhow::ensure!(config.ncpu > 0, "A local job needs at least one CPU");
            anyhow::ensure!(
                config.ncpu <= max_cpu,
                "A local job needs {} CPUs but only {max_cpu} may be used",
                config.ncpu
            );
            (0..max_cpu / config.ncpu).map(|_| Slot { device: None }).collect()
        } else {
            config
                .gpu_devices
                .iter()
                .map(|device| Slot { device: Some(device.clone()) })
                .collect()
        };
        tracing::info!(slots = slots.len(), "Local pool ready");

        let (slots_tx, slots_rx) = flume::unbounded();
        for slot in slots {
            slots_tx.send(slot)?;
        }
        let instance = uuid::Uuid::new_v4().simple().to_string()[..12].to_owned();
        Ok(Self {
            instance,
            jobs: Arc::new(DashMap::new()),
            slots_tx,
            slots_rx,
            next_id: AtomicU64::new(1),
            config,
            ssh: None,
        })
    }

    fn set_state(jobs: &DashMap<u64, LocalJob>, id: u64, state: LocalState) {
        if let Some(mut job) = jobs.get_mut(&id) {
            job.state = state;
        }
    }

    async fn run(
        jobs: Arc<DashMap<u64, LocalJob>>,
        slots: (flume::Sender<Slot>, flume::Receiver<Slot>),
        id: u64,
        launch: Launch,
        cancel: CancellationToken,
    ) {
        let (slots_tx, slots_rx) = slots;
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Self::set_state(&jobs, id, LocalState::Cancelled);
                return;
            }
            slot = slots_rx.recv_async() => match slot {
                Ok(slot) => slot,
                Err(e) => {
                    Self::set_state(&jobs, id, LocalState::Crashed(e.to_string()));
                    return;
                }
            },
        };

        let state = match launch.command(slot.device.as_ref()).and_then(|mut c| c.spawn()) {
            Ok(mut child) => {
                Self::set_state(&jobs, id, LocalState::Running);
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => LocalState::Exited(status.code()),
                        Err(e) => LocalState::Crashed(e.to_string()),
                    },
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(local_id = id, "Cannot kill local job: {e}");
                        }
                        LocalState::Cancelled
                    }
                }
            }
            Err(e) => LocalState::Crashed(e.to_string()),
        };
        tracing::debug!(local_id = id, ?state, "Local job ended");
        Self::set_state(&jobs, id, state);
        let _ = slots_tx.send(slot);
    }

    fn handle(&self, id: u64) -> BackendHandle {
        BackendHandle::new(BackendKind::Local, format!("{}-{id}", self.instance))
    }

    fn parse_id(&self, handle: &BackendHandle) -> Option<u64> {
        handle.id.strip_prefix(self.instance.as_str())?.strip_prefix('-')?.parse().ok()
    }
}

impl AsRef<Option<SshConfig>> for LocalPool {
    fn as_ref(&self) -> &Option<SshConfig> {
        &self.ssh
    }
}

#[async_trait::async_trait]
impl BackendAdapter for LocalPool {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        let script = stage_script(self, artifact, resources, &self.config.jobscript).await?;
        let workdir = &resources.workdir;
        let launch = Launch {
            script,
            workdir: workdir.clone(),
            output: self.config.output.as_ref().map(|file| workdir.join(file)),
            error: self.config.error.as_ref().map(|file| workdir.join(file)),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.jobs.insert(
            id,
            LocalJob {
                tag: artifact.tag.clone(),
                state: LocalState::Queued,
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(Self::run(
            self.jobs.clone(),
            (self.slots_tx.clone(), self.slots_rx.clone()),
            id,
            launch,
            cancel,
        ));
        tracing::debug!(job_id = %artifact.job_id, local_id = id, "Queued local job");
        Ok(self.handle(id))
    }

    async fn status(&self, handle: &BackendHandle) -> Result<BackendStatus, AdapterError> {
        let Some(job) = self.parse_id(handle).and_then(|id| self.jobs.get(&id)) else {
            return Ok(BackendStatus::NotFound);
        };
        Ok(match &job.state {
            LocalState::Queued => BackendStatus::Queued,
            LocalState::Running => BackendStatus::Running,
            LocalState::Exited(Some(0)) => BackendStatus::Completed { exit_code: Some(0) },
            LocalState::Exited(exit_code) => BackendStatus::Failed {
                exit_code: *exit_code,
                reason: match exit_code {
                    Some(code) => format!("script exited with {code}"),
                    None => "script was killed by a signal".to_owned(),
                },
            },
            LocalState::Cancelled => BackendStatus::Failed {
                exit_code: None,
                reason: "cancelled".to_owned(),
            },
            LocalState::Crashed(reason) => BackendStatus::Failed {
                exit_code: None,
                reason: reason.clone(),
            },
        })
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError> {
        let Some(job) = self.parse_id(handle).and_then(|id| self.jobs.get(&id)) else {
            return Ok(false);
        };
        match job.state {
            LocalState::Queued | LocalState::Running => {
                job.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        let mut ids: Vec<u64> = self
            .jobs
            .iter()
            .filter(|job| filter.tag.as_ref().map_or(true, |tag| &job.tag == tag))
            .map(|job| *job.key())
            .collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .map(|id| self.handle(id))
            .collect())
    }
}
