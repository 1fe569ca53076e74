//! Monitoring fan-out.
//!
//! The scheduler and workers report lifecycle signals here; the monitor
//! forwards each one to every configured destination. A destination that
//! errors is logged and skipped; observability never takes the engine
//! down.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::core::models::{TaskInstance, WorkflowInstance};

mod slack;

pub use slack::SlackMonitor;

/// A sink for lifecycle signals. All methods default to no-ops so a
/// destination implements only what it cares about.
#[async_trait]
pub trait MonitorDestination: Send + Sync {
    fn name(&self) -> &'static str;

    async fn heartbeat_scheduler(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn task_retry(&self, _task_instance: &TaskInstance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn task_failed(&self, _task_instance: &TaskInstance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn task_success(&self, _task_instance: &TaskInstance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn workflow_failed(&self, _workflow_instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    async fn workflow_success(&self, _workflow_instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Dispatches each signal to every destination, isolating failures.
#[derive(Default, Clone)]
pub struct Monitor {
    destinations: Vec<Arc<dyn MonitorDestination>>,
}

impl Monitor {
    pub fn new(destinations: Vec<Arc<dyn MonitorDestination>>) -> Self {
        Self { destinations }
    }

    pub async fn heartbeat_scheduler(&self) {
        for destination in &self.destinations {
            if let Err(e) = destination.heartbeat_scheduler().await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }

    pub async fn task_retry(&self, task_instance: &TaskInstance) {
        for destination in &self.destinations {
            if let Err(e) = destination.task_retry(task_instance).await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }

    pub async fn task_failed(&self, task_instance: &TaskInstance) {
        for destination in &self.destinations {
            if let Err(e) = destination.task_failed(task_instance).await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }

    pub async fn task_success(&self, task_instance: &TaskInstance) {
        for destination in &self.destinations {
            if let Err(e) = destination.task_success(task_instance).await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }

    pub async fn workflow_failed(&self, workflow_instance: &WorkflowInstance) {
        for destination in &self.destinations {
            if let Err(e) = destination.workflow_failed(workflow_instance).await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }

    pub async fn workflow_success(&self, workflow_instance: &WorkflowInstance) {
        for destination in &self.destinations {
            if let Err(e) = destination.workflow_success(workflow_instance).await {
                warn!(destination = destination.name(), error = %e, "monitor destination failed");
            }
        }
    }
}
