use domain::error::TemplateError;
use domain::model::vo::resources::is_env_name;
use domain::model::vo::JobDescriptor;

/// Backend-level values a template may reference next to the job's own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBindings {
    pub queue: Option<String>,
    /// Variables the scheduler should propagate, e.g. `ALL` for Slurm
    pub envvars: Option<String>,
    /// Lines run before the job's environment is exported
    pub prerun: Vec<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// File touched in the workdir when the script exits
    pub sentinel: String,
    /// LSF application profile
    pub app: Option<String>,
    /// LSF resource requirement strings, one `-R` each
    pub resources: Vec<String>,
    /// PBS: only select nodes of this cluster
    pub cluster: Option<String>,
    /// PBS: local scratch space per node
    pub scratch_local_mb: Option<u64>,
}

impl Default for TemplateBindings {
    fn default() -> Self {
        Self {
            queue: None,
            envvars: None,
            prerun: Vec::new(),
            output: None,
            error: None,
            sentinel: "jobqueues.done".to_owned(),
            app: None,
            resources: Vec::new(),
            cluster: None,
            scratch_local_mb: None,
        }
    }
}

/// The closed set of names a template can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Variable {
    JobId,
    /// The correlation tag, used as the scheduler-side job name
    JobName,
    Commands,
    Cores,
    Gpus,
    MemoryMb,
    /// `HH:MM:SS`
    Walltime,
    WalltimeMinutes,
    Workdir,
    Environment,
    Queue,
    Envvars,
    Prerun,
    Output,
    Error,
    Sentinel,
    App,
    /// `#BSUB -R` lines, one per resource requirement
    LsfResources,
    /// PBS `select` chunk: cores plus the optional scratch and cluster requests
    PbsSelect,
}

impl Variable {
    /// Block variables expand to whole lines.
    #[inline]
    pub const fn is_block(self) -> bool {
        matches!(self, Self::Commands | Self::Prerun | Self::Environment | Self::LsfResources)
    }

    pub(super) fn scalar(
        self,
        job: &JobDescriptor,
        bindings: &TemplateBindings,
    ) -> Result<Option<String>, TemplateError> {
        let resources = &job.resources;
        let value = match self {
            Self::JobId => Some(job.id.to_string()),
            Self::JobName => Some(job.correlation_tag()),
            Self::Cores => Some(resources.cores.to_string()),
            Self::Gpus => Some(resources.gpus.to_string()),
            Self::MemoryMb => resources.memory_mb().map(|mb| mb.to_string()),
            Self::Walltime => resources.walltime.map(|d| {
                let s = d.as_secs();
                format!("{:02}:{:02}:{:02}", s / 3600, s / 60 % 60, s % 60)
            }),
            Self::WalltimeMinutes => resources.walltime.map(|d| d.as_secs().div_ceil(60).to_string()),
            Self::Workdir => Some(resources.workdir.to_string_lossy().into_owned()),
            Self::Queue => bindings.queue.clone(),
            Self::Envvars => bindings.envvars.clone(),
            Self::Output => bindings.output.clone(),
            Self::Error => bindings.error.clone(),
            Self::Sentinel => Some(bindings.sentinel.clone()),
            Self::App => bindings.app.clone(),
            Self::PbsSelect => {
                let mut chunk = format!("1:ncpus={}", resources.cores);
                if let Some(mb) = bindings.scratch_local_mb {
                    chunk.push_str(&format!(":scratch_local={mb}MB"));
                }
                if let Some(cluster) = &bindings.cluster {
                    chunk.push_str(&format!(":cl_{cluster}=True"));
                }
                Some(chunk)
            }
            Self::Commands | Self::Prerun | Self::Environment | Self::LsfResources => None,
        };
        match value {
            Some(v) if !is_safe(&v) => Err(TemplateError::UnsafeValue { variable: self.to_string() }),
            v => Ok(v),
        }
    }

    pub(super) fn block(
        self,
        job: &JobDescriptor,
        bindings: &TemplateBindings,
    ) -> Result<Option<Vec<String>>, TemplateError> {
        let lines = match self {
            Self::Commands => job.commands.clone(),
            Self::Prerun => bindings.prerun.clone(),
            Self::Environment => job
                .resources
                .environment
                .iter()
                .filter(|(name, _)| is_env_name(name))
                .map(|(name, value)| format!("export {name}='{}'", value.replace('\'', r"'\''")))
                .collect(),
            Self::LsfResources => {
                if !bindings.resources.iter().all(|r| is_directive_safe(r)) {
                    return Err(TemplateError::UnsafeValue { variable: self.to_string() });
                }
                bindings.resources.iter().map(|r| format!("#BSUB -R \"{r}\"")).collect()
            }
            _ => return Ok(None),
        };
        Ok(Some(lines))
    }
}

/// Scalars end up inside directives and quoted strings, so anything that could end the line
/// or the quote is refused.
fn is_safe(value: &str) -> bool {
    !value
        .chars()
        .any(|c| c.is_control() || matches!(c, '"' | '\'' | '`' | '$' | ';' | '&' | '|' | '<' | '>' | '\\'))
}

/// `#BSUB` lines are comments to the shell; only the directive's own quoting must hold.
fn is_directive_safe(value: &str) -> bool {
    !value.chars().any(|c| c.is_control() || matches!(c, '"' | '\\'))
}
