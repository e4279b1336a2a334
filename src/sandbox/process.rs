use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

use crate::sandbox::{SandboxBackend, SandboxCleanup, SandboxHandle};

/// Runs the builder directly, without a container. Development and test
/// use only; there is no isolation beyond an ephemeral working directory,
/// which also keeps parallel runs from stomping on each other's files.
pub struct ProcessSandbox {
    program: String,
    args: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(command: Vec<String>) -> anyhow::Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .context("builder command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, job_id: &str, _memory_mb: u64) -> anyhow::Result<SandboxHandle> {
        let work_dir = std::env::temp_dir().join(format!("pg-builder-{job_id}"));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .context("failed to create builder work dir")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                return Err(err).context("failed to spawn builder");
            }
        };

        Ok(SandboxHandle {
            child,
            cleanup: SandboxCleanup::WorkDir { path: work_dir },
        })
    }
}
