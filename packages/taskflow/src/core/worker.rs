//! Execution of a pulled task instance.
//!
//! The worker never chooses its own instance; the CLI loop pulls one and
//! hands it over. Execution is bracketed by a termination-signal trap: on
//! SIGTERM/SIGINT the executor's `on_kill` hook runs and the process exits
//! non-zero, leaving the row `running` until timeout-stealing reaps it.

use chrono::Utc;
use tracing::{error, info};

use super::models::{InstanceStatus, TaskInstance};
use super::registry::Taskflow;
use super::store::Store;
use crate::tasks::Executable;

pub struct Worker {
    store: Store,
}

impl Worker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run one task instance to a terminal transition. Returns `true` on
    /// success; failures (including an unregistered task name, which is a
    /// configuration problem) are routed through the store's fail
    /// transition and may leave the row in `retry`.
    pub async fn execute(&self, taskflow: &Taskflow, instance: TaskInstance) -> bool {
        let executor = match taskflow.get_task(&instance.task_name) {
            Some(registered) => registered.executor.clone(),
            None => {
                error!(task = %instance.task_name, id = instance.id, "task is not registered");
                self.fail(taskflow, &instance).await;
                return false;
            }
        };
        let Some(executor) = executor else {
            error!(task = %instance.task_name, id = instance.id, "task has no executor");
            self.fail(taskflow, &instance).await;
            return false;
        };

        info!(task = %instance.task_name, id = instance.id, "executing task instance");

        let kill_hook = executor.clone();
        let signal_trap = tokio::spawn(async move {
            termination_signal().await;
            info!("termination signal received, running kill hook");
            kill_hook.on_kill();
            std::process::exit(1);
        });

        let result = executor.run(&instance).await;
        signal_trap.abort();

        match result {
            Ok(()) => {
                match self
                    .store
                    .succeed_task_instance(instance.id, Utc::now())
                    .await
                {
                    Ok(succeeded) => {
                        info!(task = %instance.task_name, id = instance.id, "task instance succeeded");
                        taskflow.monitor().task_success(&succeeded).await;
                        true
                    }
                    Err(e) => {
                        error!(id = instance.id, error = %e, "failed to record success");
                        false
                    }
                }
            }
            Err(e) => {
                error!(
                    task = %instance.task_name,
                    id = instance.id,
                    error = %e,
                    "error executing task instance"
                );
                self.fail(taskflow, &instance).await;
                false
            }
        }
    }

    async fn fail(&self, taskflow: &Taskflow, instance: &TaskInstance) {
        match self.store.fail_task_instance(instance.id, Utc::now()).await {
            Ok(failed) if failed.status == InstanceStatus::Retry => {
                info!(
                    task = %failed.task_name,
                    id = failed.id,
                    attempts = failed.attempts,
                    max_attempts = failed.max_attempts,
                    "task instance will retry"
                );
                taskflow.monitor().task_retry(&failed).await;
            }
            Ok(failed) => {
                taskflow.monitor().task_failed(&failed).await;
            }
            Err(e) => {
                error!(id = instance.id, error = %e, "failed to record failure");
            }
        }
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
