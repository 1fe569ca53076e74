//! Bash-command task execution.

use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::Executable;
use crate::core::models::TaskInstance;

/// Runs a fixed bash command in a scratch directory.
///
/// stderr is streamed into the log line by line. `on_kill` forwards
/// SIGTERM to the child so interactive cancellation stops the command, not
/// just the worker.
pub struct BashTask {
    command: String,
    child_pid: Mutex<Option<u32>>,
}

impl BashTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child_pid: Mutex::new(None),
        }
    }

    fn set_child_pid(&self, pid: Option<u32>) {
        if let Ok(mut guard) = self.child_pid.lock() {
            *guard = pid;
        }
    }
}

#[async_trait]
impl Executable for BashTask {
    async fn run(&self, instance: &TaskInstance) -> anyhow::Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("taskflowtmp")
            .tempdir()
            .context("failed to create scratch directory")?;
        let script = scratch.path().join(format!("task_{}.sh", instance.id));
        tokio::fs::write(&script, &self.command)
            .await
            .context("failed to write command script")?;

        info!(id = instance.id, command = %self.command, "running bash command");

        let mut child = Command::new("bash")
            .arg(&script)
            .current_dir(scratch.path())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn bash")?;
        self.set_child_pid(child.id());

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .context("failed reading command stderr")?
            {
                info!(id = instance.id, "{line}");
            }
        }

        let status = child.wait().await.context("failed waiting for bash")?;
        self.set_child_pid(None);

        info!(id = instance.id, code = ?status.code(), "bash command exited");
        if !status.success() {
            bail!("bash command exited with {status}");
        }
        Ok(())
    }

    fn on_kill(&self) {
        let pid = self.child_pid.lock().ok().and_then(|guard| *guard);
        if let Some(pid) = pid {
            info!(pid, "sending SIGTERM to bash child");
            let result = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status();
            if let Err(e) = result {
                warn!(pid, error = %e, "failed to signal bash child");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::models::Task;

    fn instance() -> TaskInstance {
        Task::builder()
            .name("bash_task")
            .build()
            .new_instance(Utc::now(), false)
    }

    #[tokio::test]
    async fn successful_command_returns_ok() {
        let task = BashTask::new("true");
        assert!(task.run(&instance()).await.is_ok());
    }

    #[tokio::test]
    async fn failing_command_returns_error() {
        let task = BashTask::new("exit 3");
        assert!(task.run(&instance()).await.is_err());
    }

    #[tokio::test]
    async fn stderr_is_consumed_without_blocking() {
        let task = BashTask::new("echo to-stderr >&2");
        assert!(task.run(&instance()).await.is_ok());
    }
}
