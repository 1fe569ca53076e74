//! Adapter for an HTTP batch-execution service.
//!
//! The service exposes a job API: `POST /jobs` submits a named job against
//! a queue and definition and answers `{"jobId": …}`; `GET /jobs?ids=…`
//! reports per-job states. Remote states map onto queue statuses as:
//! `SUBMITTED`/`PENDING`/`RUNNABLE` → `pushed`, `STARTING`/`RUNNING` →
//! `running`, `SUCCEEDED` → `success`, `FAILED` → `failed`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::PushWorker;
use crate::core::error::{Result, TaskflowError};
use crate::core::models::{InstanceStatus, Task, TaskInstance};
use crate::core::registry::Taskflow;
use crate::core::store::Store;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_definition: Option<String>,
    parameters: HashMap<String, String>,
    environment: Vec<EnvironmentEntry>,
}

#[derive(Debug, Serialize)]
struct EnvironmentEntry {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeJobsResponse {
    jobs: Vec<RemoteJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteJob {
    job_id: String,
    status: String,
}

pub struct HttpBatchPushWorker {
    base_url: String,
    default_job_queue: Option<String>,
    default_job_definition: Option<String>,
    client: reqwest::Client,
}

impl HttpBatchPushWorker {
    pub fn new(
        base_url: impl Into<String>,
        default_job_queue: Option<String>,
        default_job_definition: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_job_queue,
            default_job_definition,
            client,
        })
    }

    fn job_name(task: &Task, instance: &TaskInstance) -> String {
        match (&task.workflow_name, instance.workflow_instance_id) {
            (Some(workflow), Some(workflow_instance_id)) => format!(
                "{workflow}__{workflow_instance_id}__{}__{}",
                task.name, instance.id
            ),
            _ => format!("{}__{}", task.name, instance.id),
        }
    }

    fn build_request(&self, task: &Task, instance: &TaskInstance) -> SubmitJobRequest {
        let mut parameters = HashMap::from([
            ("task".to_string(), task.name.clone()),
            ("task_instance".to_string(), instance.id.to_string()),
        ]);
        let mut environment = vec![
            EnvironmentEntry {
                name: "TASKFLOW_TASK".to_string(),
                value: task.name.clone(),
            },
            EnvironmentEntry {
                name: "TASKFLOW_TASK_INSTANCE_ID".to_string(),
                value: instance.id.to_string(),
            },
        ];

        if let (Some(workflow), Some(workflow_instance_id)) =
            (&task.workflow_name, instance.workflow_instance_id)
        {
            parameters.insert("workflow".to_string(), workflow.clone());
            parameters.insert(
                "workflow_instance".to_string(),
                workflow_instance_id.to_string(),
            );
            environment.push(EnvironmentEntry {
                name: "TASKFLOW_WORKFLOW".to_string(),
                value: workflow.clone(),
            });
            environment.push(EnvironmentEntry {
                name: "TASKFLOW_WORKFLOW_INSTANCE_ID".to_string(),
                value: workflow_instance_id.to_string(),
            });
        }

        SubmitJobRequest {
            job_name: Self::job_name(task, instance),
            job_queue: instance
                .param_str(task, "job_queue")
                .map(str::to_owned)
                .or_else(|| self.default_job_queue.clone()),
            job_definition: instance
                .param_str(task, "job_definition")
                .map(str::to_owned)
                .or_else(|| self.default_job_definition.clone()),
            parameters,
            environment,
        }
    }

    async fn submit_one(
        &self,
        store: &Store,
        task: &Task,
        dry_run: bool,
        instance: &TaskInstance,
    ) -> Result<()> {
        let request = self.build_request(task, instance);
        info!(
            job_name = %request.job_name,
            job_queue = ?request.job_queue,
            job_definition = ?request.job_definition,
            "submitting job"
        );

        if dry_run {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?
            .error_for_status()
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?
            .json::<SubmitJobResponse>()
            .await
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?;

        store
            .mark_pushed(instance.id, serde_json::json!({ "jobId": response.job_id }))
            .await?;

        Ok(())
    }

    fn map_status(remote: &str) -> Option<InstanceStatus> {
        match remote {
            "SUBMITTED" | "PENDING" | "RUNNABLE" => Some(InstanceStatus::Pushed),
            "STARTING" | "RUNNING" => Some(InstanceStatus::Running),
            "SUCCEEDED" => Some(InstanceStatus::Success),
            "FAILED" => Some(InstanceStatus::Failed),
            _ => None,
        }
    }
}

#[async_trait]
impl PushWorker for HttpBatchPushWorker {
    async fn submit(
        &self,
        store: &Store,
        taskflow: &Taskflow,
        dry_run: bool,
        instances: &[TaskInstance],
    ) -> Result<()> {
        for instance in instances {
            let Some(registered) = taskflow.get_task(&instance.task_name) else {
                error!(task = %instance.task_name, id = instance.id, "task not found");
                continue;
            };
            if let Err(e) = self
                .submit_one(store, &registered.task, dry_run, instance)
                .await
            {
                error!(
                    task = %instance.task_name,
                    id = instance.id,
                    error = %e,
                    "exception submitting task instance"
                );
            }
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        store: &Store,
        dry_run: bool,
        instances: &[TaskInstance],
    ) -> Result<()> {
        let mut by_job_id: HashMap<String, &TaskInstance> = HashMap::new();
        for instance in instances {
            match instance
                .push_state
                .as_ref()
                .and_then(|state| state.get("jobId"))
                .and_then(|job_id| job_id.as_str())
            {
                Some(job_id) => {
                    by_job_id.insert(job_id.to_string(), instance);
                }
                None => warn!(id = instance.id, "pushed task instance has no jobId"),
            }
        }
        if by_job_id.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = by_job_id.keys().map(String::as_str).collect();
        let response = self
            .client
            .get(format!("{}/jobs", self.base_url))
            .query(&[("ids", ids.join(","))])
            .send()
            .await
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?
            .error_for_status()
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?
            .json::<DescribeJobsResponse>()
            .await
            .map_err(|e| TaskflowError::RemoteExecutor(e.to_string()))?;

        for job in response.jobs {
            let Some(instance) = by_job_id.get(job.job_id.as_str()) else {
                warn!(job_id = %job.job_id, "remote job does not match a local instance");
                continue;
            };
            let Some(status) = Self::map_status(&job.status) else {
                warn!(job_id = %job.job_id, status = %job.status, "unknown remote job status");
                continue;
            };
            if instance.status == status {
                continue;
            }

            info!(
                id = instance.id,
                from = %instance.status,
                to = %status,
                "syncing remote status"
            );
            if !dry_run {
                store
                    .sync_remote_status(instance.id, status, Utc::now())
                    .await?;
            }
        }

        Ok(())
    }

    fn log_url(&self, instance: &TaskInstance) -> Option<String> {
        let job_id = instance.push_state.as_ref()?.get("jobId")?.as_str()?;
        Some(format!("{}/jobs/{job_id}/log", self.base_url))
    }
}
