mod docker;
mod process;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Child;

use crate::config::CoordinatorConfig;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

/// A launched builder child plus whatever teardown its isolation mode
/// requires.
pub struct SandboxHandle {
    pub child: Child,
    pub cleanup: SandboxCleanup,
}

pub enum SandboxCleanup {
    /// Remove the named container. Best-effort and detached: container
    /// removal can take seconds and must not hold up the worker.
    Container { name: String },
    /// Remove the ephemeral working directory of a direct builder run.
    WorkDir { path: std::path::PathBuf },
}

impl SandboxCleanup {
    pub async fn run(self) {
        match self {
            SandboxCleanup::Container { name } => {
                tokio::spawn(async move {
                    let result = tokio::process::Command::new("docker")
                        .args(["rm", "-f", &name])
                        .output()
                        .await;
                    if let Err(err) = result {
                        tracing::warn!(container = %name, error = %err, "container removal failed");
                    }
                });
            }
            SandboxCleanup::WorkDir { path } => {
                if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "work dir removal failed");
                }
            }
        }
    }
}

/// Launches builder children in some isolation boundary. The job id doubles
/// as the container name in sandboxed mode, so it must be unique per run.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn launch(&self, job_id: &str, memory_mb: u64) -> anyhow::Result<SandboxHandle>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &CoordinatorConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        if config.use_sandbox {
            Ok(Arc::new(DockerSandbox::new(config.sandbox_image.clone())))
        } else {
            Ok(Arc::new(ProcessSandbox::new(config.builder_command.clone())?))
        }
    }
}
