use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

use crate::sandbox::{SandboxBackend, SandboxCleanup, SandboxHandle};

/// Runs the builder inside a Docker container with networking disabled and
/// a hard memory cap. Setting memory-swap to the same value as memory
/// forbids swap, so the cap is a real ceiling.
pub struct DockerSandbox {
    image: String,
}

impl DockerSandbox {
    pub fn new(image: String) -> Self {
        Self { image }
    }

    fn run_args(&self, job_id: &str, memory_mb: u64) -> Vec<String> {
        let memory = format!("{memory_mb}m");
        vec![
            "run".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            job_id.to_string(),
            "--net".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            self.image.clone(),
        ]
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, job_id: &str, memory_mb: u64) -> anyhow::Result<SandboxHandle> {
        let mut cmd = Command::new("docker");
        cmd.args(self.run_args(job_id, memory_mb))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().context("failed to spawn docker sandbox")?;
        Ok(SandboxHandle {
            child,
            cleanup: SandboxCleanup::Container {
                name: job_id.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_isolate_network_and_cap_memory() {
        let sandbox = DockerSandbox::new("playground".to_string());
        let args = sandbox.run_args("playpen_7", 600);

        assert_eq!(
            args,
            [
                "run",
                "-i",
                "--name",
                "playpen_7",
                "--net",
                "none",
                "--memory",
                "600m",
                "--memory-swap",
                "600m",
                "playground",
            ]
        );
    }
}
