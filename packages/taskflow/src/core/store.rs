//! Persistence layer: every SQL statement in the system lives here.
//!
//! The store is a thin, cloneable handle over a [`PgPool`]. Instances are
//! short-lived snapshots; callers re-read rows after a commit instead of
//! holding them across steps. Cross-process coordination happens entirely
//! through these statements, most importantly [`Store::pull`], the single
//! transactional statement that reserves work for a worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::{Result, TaskflowError};
use super::models::{InstanceStatus, Task, TaskInstance, Workflow, WorkflowInstance};

const WORKFLOW_INSTANCE_COLUMNS: &str = "id, workflow_name, scheduled, run_at, started_at, \
     ended_at, status, priority, \"unique\", params, created_at, updated_at";

const TASK_INSTANCE_COLUMNS: &str = "id, task_name, workflow_instance_id, scheduled, run_at, \
     started_at, ended_at, locked_at, worker_id, status, priority, \"unique\", params, push, \
     push_state, attempts, max_attempts, timeout, retry_delay, created_at, updated_at";

/// Database-backed store for definitions and instances.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Upsert a workflow definition. Every field is overwritten except
    /// `active`: the persisted flag wins so operators can disable a
    /// workflow without a deploy. Returns the persisted `active` value.
    pub async fn upsert_workflow_definition(&self, workflow: &Workflow) -> Result<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO workflows (
                name, active, title, description, concurrency, sla, schedule,
                default_priority, start_date, end_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                concurrency = EXCLUDED.concurrency,
                sla = EXCLUDED.sla,
                schedule = EXCLUDED.schedule,
                default_priority = EXCLUDED.default_priority,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date
            RETURNING active
            "#,
        )
        .bind(&workflow.name)
        .bind(workflow.active)
        .bind(&workflow.title)
        .bind(&workflow.description)
        .bind(workflow.concurrency)
        .bind(workflow.sla)
        .bind(&workflow.schedule)
        .bind(workflow.default_priority)
        .bind(workflow.start_date)
        .bind(workflow.end_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    /// Upsert a task definition; same `active` semantics as workflows.
    pub async fn upsert_task_definition(&self, task: &Task) -> Result<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO tasks (
                name, active, workflow_name, title, description, schedule,
                default_priority, retries, timeout, retry_delay, params,
                push_destination, start_date, end_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (name) DO UPDATE SET
                workflow_name = EXCLUDED.workflow_name,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                schedule = EXCLUDED.schedule,
                default_priority = EXCLUDED.default_priority,
                retries = EXCLUDED.retries,
                timeout = EXCLUDED.timeout,
                retry_delay = EXCLUDED.retry_delay,
                params = EXCLUDED.params,
                push_destination = EXCLUDED.push_destination,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date
            RETURNING active
            "#,
        )
        .bind(&task.name)
        .bind(task.active)
        .bind(&task.workflow_name)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.schedule)
        .bind(task.default_priority)
        .bind(task.retries)
        .bind(task.timeout)
        .bind(task.retry_delay)
        .bind(&task.params)
        .bind(&task.push_destination)
        .bind(task.start_date)
        .bind(task.end_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    /// Persisted `active` flags for the named workflows (read-only sync).
    pub async fn workflow_active_flags(&self, names: &[String]) -> Result<HashMap<String, bool>> {
        let rows = sqlx::query_as::<_, (String, bool)>(
            "SELECT name, active FROM workflows WHERE name = ANY($1)",
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Persisted `active` flags for the named tasks (read-only sync).
    pub async fn task_active_flags(&self, names: &[String]) -> Result<HashMap<String, bool>> {
        let rows = sqlx::query_as::<_, (String, bool)>(
            "SELECT name, active FROM tasks WHERE name = ANY($1)",
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    // ========================================================================
    // Instance inserts and reads
    // ========================================================================

    /// Insert a workflow instance. Fails with
    /// [`TaskflowError::UniqueConflict`] when a non-terminal instance with
    /// the same `(workflow_name, unique)` already exists.
    pub async fn insert_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance> {
        sqlx::query_as::<_, WorkflowInstance>(&format!(
            r#"
            INSERT INTO workflow_instances (
                workflow_name, scheduled, run_at, started_at, ended_at,
                status, priority, "unique", params
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {WORKFLOW_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(&instance.workflow_name)
        .bind(instance.scheduled)
        .bind(instance.run_at)
        .bind(instance.started_at)
        .bind(instance.ended_at)
        .bind(instance.status)
        .bind(instance.priority)
        .bind(&instance.unique)
        .bind(&instance.params)
        .fetch_one(&self.pool)
        .await
        .map_err(map_unique_conflict)
    }

    /// Insert a task instance; same unique-conflict semantics on
    /// `(task_name, unique)`.
    pub async fn insert_task_instance(&self, instance: &TaskInstance) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            INSERT INTO task_instances (
                task_name, workflow_instance_id, scheduled, run_at, started_at,
                ended_at, locked_at, worker_id, status, priority, "unique",
                params, push, push_state, attempts, max_attempts, timeout,
                retry_delay
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18)
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(&instance.task_name)
        .bind(instance.workflow_instance_id)
        .bind(instance.scheduled)
        .bind(instance.run_at)
        .bind(instance.started_at)
        .bind(instance.ended_at)
        .bind(instance.locked_at)
        .bind(&instance.worker_id)
        .bind(instance.status)
        .bind(instance.priority)
        .bind(&instance.unique)
        .bind(&instance.params)
        .bind(instance.push)
        .bind(&instance.push_state)
        .bind(instance.attempts)
        .bind(instance.max_attempts)
        .bind(instance.timeout)
        .bind(instance.retry_delay)
        .fetch_one(&self.pool)
        .await
        .map_err(map_unique_conflict)
    }

    pub async fn get_workflow_instance(&self, id: i64) -> Result<WorkflowInstance> {
        sqlx::query_as::<_, WorkflowInstance>(&format!(
            "SELECT {WORKFLOW_INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("workflow instance", id.to_string()))
    }

    pub async fn get_task_instance(&self, id: i64) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    // ========================================================================
    // Atomic pull
    // ========================================================================

    /// Reserve up to `max_tasks` eligible task instances for `worker_id`.
    ///
    /// A single transactional statement: eligible rows are selected with
    /// `FOR UPDATE SKIP LOCKED` (so concurrent pullers never see the same
    /// row), then flipped to `running` with the lock metadata and an
    /// incremented attempt counter. Eligibility is:
    ///
    /// - `run_at <= now` and `attempts < max_attempts`, and
    /// - `queued`, or `running` past its timeout (a stuck worker's row may
    ///   be stolen), or `retry` past its retry delay; both windows use
    ///   strict inequality.
    ///
    /// `push` filters both ways: pull workers (`push = false`) never see
    /// push tasks, and the pusher (`push = true`) sees only them. A
    /// non-empty `task_names` restricts dispatch to those tasks; an empty
    /// or absent list matches all.
    pub async fn pull(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        max_tasks: i64,
        task_names: Option<&[String]>,
        push: bool,
    ) -> Result<Vec<TaskInstance>> {
        let names: Option<Vec<String>> = task_names
            .filter(|names| !names.is_empty())
            .map(<[String]>::to_vec);

        let mut instances = sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            WITH eligible AS (
                SELECT id
                FROM task_instances
                WHERE run_at <= $2
                  AND attempts < max_attempts
                  AND (
                        status = 'queued'
                        OR (status = 'running' AND $2 > locked_at + timeout * INTERVAL '1 second')
                        OR (status = 'retry' AND $2 > locked_at + retry_delay * INTERVAL '1 second')
                  )
                  AND push = $4
                  AND ($5::text[] IS NULL OR task_name = ANY($5))
                ORDER BY priority, run_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task_instances t
            SET status = 'running',
                worker_id = $1,
                locked_at = $2,
                started_at = COALESCE(t.started_at, $2),
                attempts = t.attempts + 1,
                updated_at = now()
            FROM eligible
            WHERE t.id = eligible.id
            RETURNING {}
            "#,
            prefixed_task_instance_columns("t"),
        ))
        .bind(worker_id)
        .bind(now)
        .bind(max_tasks)
        .bind(push)
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE … RETURNING carries no ordering guarantee.
        instances.sort_by(|a, b| {
            (a.priority.as_i16(), a.run_at, a.id).cmp(&(b.priority.as_i16(), b.run_at, b.id))
        });

        Ok(instances)
    }

    // ========================================================================
    // Task instance transitions
    // ========================================================================

    /// Mark a task instance successful.
    pub async fn succeed_task_instance(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            UPDATE task_instances
            SET status = 'success', ended_at = $2, updated_at = now()
            WHERE id = $1
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    /// Fail a task instance. When attempts remain the row moves to `retry`
    /// with `locked_at = now` (the retry window is measured from here);
    /// otherwise it is terminally failed. Returns the updated row so the
    /// caller can tell which transition happened.
    pub async fn fail_task_instance(&self, id: i64, now: DateTime<Utc>) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            UPDATE task_instances
            SET status = CASE WHEN attempts < max_attempts
                              THEN 'retry'::instance_status
                              ELSE 'failed'::instance_status END,
                locked_at = CASE WHEN attempts < max_attempts THEN $2 ELSE locked_at END,
                ended_at = CASE WHEN attempts < max_attempts THEN ended_at ELSE $2 END,
                updated_at = now()
            WHERE id = $1
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    /// Cancel a still-queued task instance. Returns `false` when the row
    /// had already left `queued`.
    pub async fn dequeue_task_instance(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = 'dequeued', ended_at = $2, updated_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a still-queued workflow instance.
    pub async fn dequeue_workflow_instance(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'dequeued', ended_at = $2, updated_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Assign a worker and lock time without going through `pull`. Used by
    /// `run-task`, where the operator chose the instance explicitly; the
    /// attempt counter is left to the success/fail transition so it can
    /// never pass `max_attempts`.
    pub async fn assign_worker(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            UPDATE task_instances
            SET worker_id = $2, locked_at = $3, updated_at = now()
            WHERE id = $1
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    /// Bulk-fail every `running`/`retry` task instance that is past its
    /// timeout with no attempts left. Returns the number of rows reaped.
    pub async fn fail_timed_out(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = 'failed', ended_at = $1, updated_at = now()
            WHERE status IN ('running', 'retry')
              AND $1 > locked_at + timeout * INTERVAL '1 second'
              AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Push transitions
    // ========================================================================

    /// Record a remote submission: the instance moves to `pushed` and the
    /// executor's response is kept for reconciliation.
    pub async fn mark_pushed(
        &self,
        id: i64,
        push_state: serde_json::Value,
    ) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            UPDATE task_instances
            SET status = 'pushed', push_state = $2, updated_at = now()
            WHERE id = $1
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(push_state)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    /// Apply a status reported by a remote executor. Terminal statuses get
    /// an end timestamp.
    pub async fn sync_remote_status(
        &self,
        id: i64,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            UPDATE task_instances
            SET status = $2,
                ended_at = CASE WHEN $2 IN ('success', 'failed') THEN $3 ELSE ended_at END,
                updated_at = now()
            WHERE id = $1
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(status)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("task instance", id.to_string()))
    }

    /// Every push task instance awaiting reconciliation.
    pub async fn pushed_or_running_push_instances(&self) -> Result<Vec<TaskInstance>> {
        let instances = sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE push = true AND status IN ('pushed', 'running')
            ORDER BY id
            "#,
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    // ========================================================================
    // Workflow instance transitions and scheduler reads
    // ========================================================================

    /// Move a queued workflow instance to `running`. Returns `None` when
    /// another scheduler got there first.
    pub async fn start_workflow_instance(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>> {
        let instance = sqlx::query_as::<_, WorkflowInstance>(&format!(
            r#"
            UPDATE workflow_instances
            SET status = 'running', started_at = $2, updated_at = now()
            WHERE id = $1 AND status = 'queued'
            RETURNING {WORKFLOW_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(instance)
    }

    /// Terminally complete a workflow instance.
    pub async fn complete_workflow_instance(
        &self,
        id: i64,
        outcome: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<WorkflowInstance> {
        sqlx::query_as::<_, WorkflowInstance>(&format!(
            r#"
            UPDATE workflow_instances
            SET status = $2, ended_at = $3, updated_at = now()
            WHERE id = $1
            RETURNING {WORKFLOW_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(outcome)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskflowError::not_found("workflow instance", id.to_string()))
    }

    /// Workflow instances the scheduler should try to advance: running, or
    /// queued with `run_at` due.
    pub async fn queued_or_due_workflow_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>> {
        let instances = sqlx::query_as::<_, WorkflowInstance>(&format!(
            r#"
            SELECT {WORKFLOW_INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE status = 'running' OR (status = 'queued' AND run_at <= $1)
            ORDER BY id
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    /// All task instances belonging to a workflow instance.
    pub async fn task_instances_for_workflow(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>> {
        let instances = sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE workflow_instance_id = $1
            ORDER BY id
            "#,
        ))
        .bind(workflow_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    /// The most recent scheduler-created instance of a recurring workflow.
    pub async fn most_recent_scheduled_workflow_instance(
        &self,
        workflow_name: &str,
    ) -> Result<Option<WorkflowInstance>> {
        let instance = sqlx::query_as::<_, WorkflowInstance>(&format!(
            r#"
            SELECT {WORKFLOW_INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE workflow_name = $1 AND scheduled = true
            ORDER BY run_at DESC
            LIMIT 1
            "#,
        ))
        .bind(workflow_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(instance)
    }

    /// The most recent scheduler-created instance of a recurring task.
    pub async fn most_recent_scheduled_task_instance(
        &self,
        task_name: &str,
    ) -> Result<Option<TaskInstance>> {
        let instance = sqlx::query_as::<_, TaskInstance>(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE task_name = $1 AND scheduled = true
            ORDER BY run_at DESC
            LIMIT 1
            "#,
        ))
        .bind(task_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(instance)
    }
}

/// `23505` is Postgres's unique-violation code; with the partial indexes on
/// `(name, "unique")` it means another active instance holds this key.
fn map_unique_conflict(error: sqlx::Error) -> TaskflowError {
    match &error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            TaskflowError::UniqueConflict
        }
        _ => TaskflowError::Database(error),
    }
}

fn prefixed_task_instance_columns(prefix: &str) -> String {
    TASK_INSTANCE_COLUMNS
        .split(", ")
        .map(|column| format!("{prefix}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
