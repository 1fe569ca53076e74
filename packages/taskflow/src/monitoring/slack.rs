//! Slack incoming-webhook destination.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use super::MonitorDestination;
use crate::core::models::{TaskInstance, WorkflowInstance};

pub struct SlackMonitor {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackMonitor {
    pub fn new(webhook_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("failed to reach Slack webhook")?
            .error_for_status()
            .context("Slack webhook rejected the message")?;
        Ok(())
    }

    fn failure_attachment(kind: &str, name: &str, fields: serde_json::Value) -> serde_json::Value {
        json!({
            "attachments": [{
                "title": format!("{kind} Failure"),
                "text": format!("<!channel> A {} in Taskflow failed", kind.to_lowercase()),
                "color": "#ff0000",
                "fields": [
                    { "title": kind, "value": name, "short": false },
                    fields,
                ],
            }]
        })
    }
}

#[async_trait]
impl MonitorDestination for SlackMonitor {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn task_failed(&self, task_instance: &TaskInstance) -> anyhow::Result<()> {
        self.post(Self::failure_attachment(
            "Task",
            &task_instance.task_name,
            json!({
                "title": "Attempts",
                "value": format!("{}/{}", task_instance.attempts, task_instance.max_attempts),
            }),
        ))
        .await
    }

    async fn workflow_failed(&self, workflow_instance: &WorkflowInstance) -> anyhow::Result<()> {
        self.post(Self::failure_attachment(
            "Workflow",
            &workflow_instance.workflow_name,
            json!({ "title": "ID", "value": workflow_instance.id }),
        ))
        .await
    }

    async fn workflow_success(&self, workflow_instance: &WorkflowInstance) -> anyhow::Result<()> {
        self.post(json!({
            "attachments": [{
                "title": "Workflow Success",
                "color": "#36a64f",
                "fields": [
                    { "title": "Workflow", "value": workflow_instance.workflow_name, "short": false },
                    { "title": "ID", "value": workflow_instance.id },
                ],
            }]
        }))
        .await
    }
}
