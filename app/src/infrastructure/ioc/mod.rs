use std::sync::Arc;

use anyhow::Context;
use domain::model::vo::BackendKind;
use domain::service::BackendAdapter;
use service::prelude::*;

use crate::config::{AppConfig, BackendConfig};
use crate::infrastructure::command::SshConfig;
use crate::infrastructure::service::job_scheduler::local::LocalPoolConfig;
use crate::infrastructure::service::job_scheduler::{LocalPool, LsfClient, PbsClient, SlurmClient};

/// Builds the dispatch manager with one adapter and template per configured backend.
pub async fn build_manager(config: &AppConfig) -> anyhow::Result<DispatchManager> {
    anyhow::ensure!(
        config.backends.contains_key(&config.default_backend),
        "Default backend `{}` is not configured",
        config.default_backend
    );
    let ssh_config = config.ssh_proxy.as_ref().map(SshConfig::from);

    let mut manager = DispatchManager::new(&config.default_backend);
    for (name, backend) in &config.backends {
        let adapter = adapter(backend, ssh_config.clone())
            .with_context(|| format!("Cannot set up backend `{name}`"))?;
        let template = template(name, backend).await?;
        manager.register_backend(
            name,
            adapter,
            backend.policy(ssh_config.is_some()),
            template,
        )?;
        tracing::info!(backend = %name, kind = %backend.r#type, "Registered backend");
    }
    Ok(manager)
}

fn adapter(
    backend: &BackendConfig,
    ssh_config: Option<SshConfig>,
) -> anyhow::Result<Arc<dyn BackendAdapter>> {
    let jobscript = backend.jobscript.clone();
    Ok(match backend.r#type {
        BackendKind::Slurm => Arc::new(SlurmClient::new(ssh_config, jobscript)),
        BackendKind::Pbs => Arc::new(PbsClient::new(ssh_config, jobscript)),
        BackendKind::Lsf => Arc::new(LsfClient::new(ssh_config, jobscript)),
        BackendKind::Local => Arc::new(LocalPool::new(LocalPoolConfig {
            max_cpu: backend.max_cpu,
            ncpu: backend.ncpu,
            gpu_devices: backend.gpu_devices.clone(),
            jobscript,
            output: backend.output.clone(),
            error: backend.error.clone(),
        })?),
    })
}

/// The backend's template, registered under the backend's name.
async fn template(name: &str, backend: &BackendConfig) -> anyhow::Result<ScriptTemplate> {
    let template = match &backend.template_path {
        Some(path) => {
            let source = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Cannot read template {path}"))?;
            ScriptTemplate::parse(name, &source, backend.bindings())?
        }
        None => ScriptTemplate::builtin(name, backend.r#type, backend.bindings())?,
    };
    Ok(template)
}
