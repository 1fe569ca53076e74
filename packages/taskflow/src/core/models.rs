//! Data model for workflow and task definitions and their persisted
//! instances.
//!
//! Definitions (`Workflow`, `Task`) are declared in code at startup and
//! upserted into the store; only their `active` flag is ever read back.
//! Instances are the durable queue rows the scheduler, pusher, and workers
//! coordinate through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle status shared by workflow and task instances.
///
/// `dequeued`, `failed`, and `success` are terminal; the partial unique
/// indexes only constrain rows in the remaining statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "instance_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Queued,
    Pushed,
    Running,
    Retry,
    Dequeued,
    Failed,
    Success,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Dequeued | Self::Failed | Self::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pushed => "pushed",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Dequeued => "dequeued",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Declaration order is dispatch order, so `ORDER BY
/// priority` in the pull statement returns critical work first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "instance_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Integer rank, lower dispatches first. Used to re-sort pulled rows
    /// in process.
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// A named, possibly recurring DAG of tasks.
///
/// The member tasks and their dependency sets live in the registry, not
/// here; the persisted row carries only the fields below.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Workflow {
    pub name: String,
    #[builder(default = false)]
    pub active: bool,
    #[builder(default, setter(strip_option))]
    pub title: Option<String>,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    /// Cron expression (standard 5-field). `None` means the workflow only
    /// runs when queued explicitly.
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,
    #[builder(default)]
    pub default_priority: TaskPriority,
    #[builder(default, setter(strip_option))]
    pub start_date: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub end_date: Option<DateTime<Utc>>,
    #[builder(default = 1)]
    pub concurrency: i32,
    /// Expected completion time in seconds, surfaced to monitoring only.
    #[builder(default, setter(strip_option))]
    pub sla: Option<i32>,
}

impl Workflow {
    /// Materialize a concrete instance of this workflow.
    pub fn new_instance(&self, run_at: DateTime<Utc>, scheduled: bool) -> WorkflowInstance {
        WorkflowInstance::builder()
            .workflow_name(self.name.clone())
            .scheduled(scheduled)
            .run_at(run_at)
            .priority(self.default_priority)
            .build()
    }
}

/// A named unit of work. Belongs to a workflow or stands alone.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    pub name: String,
    #[builder(default = false)]
    pub active: bool,
    /// Set by the registry when the task is added to a workflow.
    #[builder(default, setter(strip_option))]
    pub workflow_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub title: Option<String>,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,
    #[builder(default)]
    pub default_priority: TaskPriority,
    /// Retries after the first attempt; instances get
    /// `max_attempts = retries + 1`.
    #[builder(default = 0)]
    pub retries: i32,
    /// Seconds a pulled instance may hold its lock before it becomes
    /// stealable.
    #[builder(default = 300)]
    pub timeout: i32,
    /// Seconds a `retry` instance is ineligible for pull.
    #[builder(default = 300)]
    pub retry_delay: i32,
    #[builder(default, setter(strip_option))]
    pub params: Option<serde_json::Value>,
    /// Destination tag of the push worker that executes this task
    /// remotely. `None` means the task runs on a pull worker.
    #[builder(default, setter(strip_option))]
    pub push_destination: Option<String>,
    #[builder(default, setter(strip_option))]
    pub start_date: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub end_date: Option<DateTime<Utc>>,
}

impl Task {
    /// Materialize a concrete instance of this task. Execution settings are
    /// copied from the definition so the queue row is self-contained.
    pub fn new_instance(&self, run_at: DateTime<Utc>, scheduled: bool) -> TaskInstance {
        TaskInstance::builder()
            .task_name(self.name.clone())
            .scheduled(scheduled)
            .run_at(run_at)
            .priority(self.default_priority)
            .push(self.push_destination.is_some())
            .max_attempts(self.retries + 1)
            .timeout(self.timeout)
            .retry_delay(self.retry_delay)
            .build()
    }
}

// ============================================================================
// Instances
// ============================================================================

/// A materialized execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
pub struct WorkflowInstance {
    #[builder(default = 0)]
    pub id: i64,
    #[builder(setter(into))]
    pub workflow_name: String,
    /// `true` when produced by the cron materializer, `false` when queued
    /// by a user command.
    #[builder(default = false)]
    pub scheduled: bool,
    pub run_at: DateTime<Utc>,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub status: InstanceStatus,
    #[builder(default)]
    pub priority: TaskPriority,
    /// Idempotency key; at most one non-terminal instance per
    /// `(workflow_name, unique)`.
    #[builder(default, setter(strip_option, into))]
    pub unique: Option<String>,
    #[builder(default)]
    pub params: Option<serde_json::Value>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// A materialized execution of a task: the row the pull queue dispatches.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
pub struct TaskInstance {
    #[builder(default = 0)]
    pub id: i64,
    #[builder(setter(into))]
    pub task_name: String,
    #[builder(default, setter(strip_option))]
    pub workflow_instance_id: Option<i64>,
    #[builder(default = false)]
    pub scheduled: bool,
    pub run_at: DateTime<Utc>,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set on every pull and on retry; stealing and the retry window are
    /// both measured from here.
    #[builder(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, into))]
    pub worker_id: Option<String>,
    #[builder(default)]
    pub status: InstanceStatus,
    #[builder(default)]
    pub priority: TaskPriority,
    #[builder(default, setter(strip_option, into))]
    pub unique: Option<String>,
    #[builder(default)]
    pub params: Option<serde_json::Value>,
    /// Materialized from the task definition: `true` when execution is
    /// delegated to a push worker.
    #[builder(default = false)]
    pub push: bool,
    /// Free-form state returned by the remote executor, e.g. `{"jobId": …}`.
    #[builder(default)]
    pub push_state: Option<serde_json::Value>,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 1)]
    pub max_attempts: i32,
    #[builder(default = 300)]
    pub timeout: i32,
    #[builder(default = 300)]
    pub retry_delay: i32,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// String parameter lookup, instance params over task params.
    pub fn param_str<'a>(&'a self, task: &'a Task, key: &str) -> Option<&'a str> {
        param_lookup(&self.params, key).or_else(|| param_lookup(&task.params, key))
    }
}

fn param_lookup<'a>(params: &'a Option<serde_json::Value>, key: &str) -> Option<&'a str> {
    params.as_ref()?.get(key)?.as_str()
}
