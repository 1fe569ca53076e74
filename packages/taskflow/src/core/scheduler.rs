//! The recurring scheduler.
//!
//! One [`Scheduler::run`] invocation materializes due recurrences of
//! workflows and standalone tasks, advances workflow DAGs, and reaps timed
//! out work. Many schedulers may run against the same database; the
//! idempotent `unique` keys and the queued→running guard keep them from
//! duplicating work. Every step and every per-definition iteration is
//! fault-isolated: an error is logged and the run continues.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::dag::toposort_levels;
use super::error::{Result, TaskflowError};
use super::models::{InstanceStatus, Task, TaskInstance, WorkflowInstance};
use super::registry::{Taskflow, WorkflowDefinition};
use super::store::Store;
use crate::cron::CronSchedule;

/// The idempotency key for scheduler-created instances; two schedulers
/// racing the same tick collide on the partial unique index.
fn scheduled_unique(run_at: DateTime<Utc>) -> String {
    format!("scheduled_{}", run_at.format("%Y-%m-%dT%H:%M:%S"))
}

pub struct Scheduler {
    store: Store,
    dry_run: bool,
    now_override: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            dry_run: false,
            now_override: None,
        }
    }

    /// Log planned actions without writing anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Pin `now`, for dry runs and tests.
    pub fn with_now_override(mut self, now_override: Option<DateTime<Utc>>) -> Self {
        self.now_override = now_override;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_override.unwrap_or_else(Utc::now)
    }

    /// One scheduler pass. Steps run in a fixed order; a failing step is
    /// logged and the remaining steps still run.
    pub async fn run(&self, taskflow: &Taskflow) {
        info!("starting scheduler run");

        debug!("scheduling recurring workflows");
        self.schedule_recurring_workflows(taskflow).await;

        debug!("advancing workflows");
        if let Err(e) = self.advance_workflows(taskflow).await {
            error!(error = %e, "failed to advance workflows");
        }

        debug!("scheduling recurring tasks");
        self.schedule_recurring_tasks(taskflow).await;

        debug!("failing timed out task instances");
        if let Err(e) = self.fail_timed_out().await {
            error!(error = %e, "failed to reap timed out task instances");
        }

        if !self.dry_run {
            taskflow.monitor().heartbeat_scheduler().await;
        }

        info!("scheduler run complete");
    }

    // ========================================================================
    // Recurring materialization
    // ========================================================================

    async fn schedule_recurring_workflows(&self, taskflow: &Taskflow) {
        for definition in taskflow.workflows() {
            let workflow = &definition.workflow;
            if !workflow.active || workflow.schedule.is_none() {
                continue;
            }
            debug!(workflow = %workflow.name, "scheduling recurring workflow");
            if let Err(e) = self.schedule_workflow_recurrence(taskflow, definition).await {
                warn!(workflow = %workflow.name, error = %e, "failed to schedule recurrence");
            }
        }
    }

    async fn schedule_recurring_tasks(&self, taskflow: &Taskflow) {
        for registered in taskflow.standalone_tasks() {
            let task = &registered.task;
            if !task.active || task.schedule.is_none() {
                continue;
            }
            debug!(task = %task.name, "scheduling recurring task");
            if let Err(e) = self.schedule_task_recurrence(task).await {
                warn!(task = %task.name, error = %e, "failed to schedule recurrence");
            }
        }
    }

    async fn schedule_workflow_recurrence(
        &self,
        taskflow: &Taskflow,
        definition: &WorkflowDefinition,
    ) -> Result<()> {
        let workflow = &definition.workflow;
        let schedule = match &workflow.schedule {
            Some(expression) => CronSchedule::parse(expression)?,
            None => return Ok(()),
        };

        let most_recent = self
            .store
            .most_recent_scheduled_workflow_instance(&workflow.name)
            .await?;
        let last = most_recent.as_ref().map(|instance| (instance.status, instance.run_at));

        let Some(next_run) = self.next_recurrence(&schedule, last) else {
            return Ok(());
        };

        if outside_window(next_run, workflow.start_date, workflow.end_date) {
            info!(workflow = %workflow.name, "not within its scheduled range");
            return Ok(());
        }

        self.queue_workflow(taskflow, definition, next_run).await
    }

    async fn schedule_task_recurrence(&self, task: &Task) -> Result<()> {
        let schedule = match &task.schedule {
            Some(expression) => CronSchedule::parse(expression)?,
            None => return Ok(()),
        };

        let most_recent = self
            .store
            .most_recent_scheduled_task_instance(&task.name)
            .await?;
        let last = most_recent.as_ref().map(|instance| (instance.status, instance.run_at));

        let Some(next_run) = self.next_recurrence(&schedule, last) else {
            return Ok(());
        };

        if outside_window(next_run, task.start_date, task.end_date) {
            info!(task = %task.name, "not within its scheduled range");
            return Ok(());
        }

        info!(task = %task.name, run_at = %next_run, "queuing task");
        if self.dry_run {
            return Ok(());
        }

        let mut instance = task.new_instance(next_run, true);
        instance.unique = Some(scheduled_unique(next_run));
        match self.store.insert_task_instance(&instance).await {
            Ok(_) => Ok(()),
            Err(TaskflowError::UniqueConflict) => {
                debug!(task = %task.name, "recurrence already queued by another scheduler");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Where the next recurrence lands, given the most recent scheduled
    /// instance:
    ///
    /// - none yet: the next tick after now. The first run is never a
    ///   backfill;
    /// - last one terminal: the tick after it, snapped forward to the most
    ///   recent elapsed tick so a scheduler that was offline for several
    ///   ticks emits only the latest missed one, not a backfill storm;
    /// - last one still active: nothing, it occupies the recurrence slot.
    fn next_recurrence(
        &self,
        schedule: &CronSchedule,
        last: Option<(InstanceStatus, DateTime<Utc>)>,
    ) -> Option<DateTime<Utc>> {
        let now = self.now();
        match last {
            None => schedule.next_after(now),
            Some((InstanceStatus::Success | InstanceStatus::Failed, last_run_at)) => {
                let mut next = schedule.next_after(last_run_at);
                if let Some(prev) = schedule.prev_before(now) {
                    if next.map_or(true, |tick| prev > tick) {
                        next = Some(prev);
                    }
                }
                next
            }
            Some(_) => None,
        }
    }

    async fn queue_workflow(
        &self,
        taskflow: &Taskflow,
        definition: &WorkflowDefinition,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let workflow = &definition.workflow;
        info!(workflow = %workflow.name, run_at = %run_at, "queuing workflow");
        if self.dry_run {
            return Ok(());
        }

        let mut instance = workflow.new_instance(run_at, true);
        instance.unique = Some(scheduled_unique(run_at));
        let instance = match self.store.insert_workflow_instance(&instance).await {
            Ok(instance) => instance,
            Err(TaskflowError::UniqueConflict) => {
                debug!(workflow = %workflow.name, "recurrence already queued by another scheduler");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // A catch-up tick may already be due; start it now instead of
        // waiting for the advancement pass of the next run.
        if instance.run_at <= self.now() {
            self.advance_one(taskflow, instance).await?;
        }

        Ok(())
    }

    // ========================================================================
    // Workflow advancement
    // ========================================================================

    async fn advance_workflows(&self, taskflow: &Taskflow) -> Result<()> {
        let instances = self
            .store
            .queued_or_due_workflow_instances(self.now())
            .await?;

        for instance in instances {
            debug!(
                workflow = %instance.workflow_name,
                id = instance.id,
                "checking workflow instance for advancement"
            );
            let name = instance.workflow_name.clone();
            if let Err(e) = self.advance_one(taskflow, instance).await {
                error!(workflow = %name, error = %e, "failed to advance workflow instance");
            }
        }

        Ok(())
    }

    async fn advance_one(&self, taskflow: &Taskflow, mut instance: WorkflowInstance) -> Result<()> {
        if instance.status == InstanceStatus::Queued {
            info!(
                workflow = %instance.workflow_name,
                id = instance.id,
                "starting workflow instance"
            );
            if !self.dry_run {
                match self
                    .store
                    .start_workflow_instance(instance.id, self.now())
                    .await?
                {
                    Some(started) => instance = started,
                    // Another scheduler started it; leave advancement to it.
                    None => return Ok(()),
                }
            }
        }

        self.queue_workflow_tasks(taskflow, &instance).await
    }

    /// Walk the workflow's dependency levels, queue missing tasks of the
    /// first incomplete level, and settle the instance's terminal status
    /// when every level (or any task) has resolved.
    async fn queue_workflow_tasks(
        &self,
        taskflow: &Taskflow,
        instance: &WorkflowInstance,
    ) -> Result<()> {
        let definition = taskflow
            .get_workflow(&instance.workflow_name)
            .ok_or_else(|| TaskflowError::not_found("workflow", &instance.workflow_name))?;
        let levels = toposort_levels(&definition.dependency_graph())?;

        let existing = self
            .store
            .task_instances_for_workflow(instance.id)
            .await?;
        let by_name: HashMap<&str, &TaskInstance> = existing
            .iter()
            .map(|task_instance| (task_instance.task_name.as_str(), task_instance))
            .collect();

        let mut complete_levels = 0;
        let mut failed = false;

        'levels: for level in &levels {
            let mut complete = 0;
            let mut to_queue = Vec::new();

            for task_name in level {
                match by_name.get(task_name.as_str()) {
                    Some(existing) if existing.status == InstanceStatus::Success => complete += 1,
                    Some(existing) if existing.status == InstanceStatus::Failed => {
                        failed = true;
                        break 'levels;
                    }
                    Some(_) => {}
                    None => to_queue.push(task_name.as_str()),
                }
            }

            if !to_queue.is_empty() && complete == level.len() {
                error!(
                    workflow = %instance.workflow_name,
                    id = instance.id,
                    "refusing to queue tasks into a completed workflow step"
                );
                return Ok(());
            }

            if !self.dry_run {
                for task_name in &to_queue {
                    self.queue_workflow_task(definition, task_name, instance)
                        .await?;
                }
            }

            if complete < level.len() {
                break;
            }
            complete_levels += 1;
        }

        if failed {
            info!(
                workflow = %instance.workflow_name,
                id = instance.id,
                "workflow instance failed"
            );
            if !self.dry_run {
                let completed = self
                    .store
                    .complete_workflow_instance(instance.id, InstanceStatus::Failed, self.now())
                    .await?;
                taskflow.monitor().workflow_failed(&completed).await;
            }
        } else if complete_levels == levels.len() {
            info!(
                workflow = %instance.workflow_name,
                id = instance.id,
                "workflow instance succeeded"
            );
            if !self.dry_run {
                let completed = self
                    .store
                    .complete_workflow_instance(instance.id, InstanceStatus::Success, self.now())
                    .await?;
                taskflow.monitor().workflow_success(&completed).await;
            }
        }

        Ok(())
    }

    async fn queue_workflow_task(
        &self,
        definition: &WorkflowDefinition,
        task_name: &str,
        workflow_instance: &WorkflowInstance,
    ) -> Result<()> {
        let registered = definition
            .get_task(task_name)
            .ok_or_else(|| TaskflowError::not_found("task", task_name))?;

        let run_at = self.now();
        let mut task_instance = registered.task.new_instance(run_at, true);
        task_instance.workflow_instance_id = Some(workflow_instance.id);
        task_instance.priority = workflow_instance.priority;
        task_instance.unique = Some(scheduled_unique(run_at));

        info!(
            workflow = %definition.workflow.name,
            task = %task_name,
            run_at = %run_at,
            "queuing workflow task"
        );

        match self.store.insert_task_instance(&task_instance).await {
            Ok(_) => Ok(()),
            Err(TaskflowError::UniqueConflict) => {
                debug!(task = %task_name, "workflow task already queued by another scheduler");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    async fn fail_timed_out(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let reaped = self.store.fail_timed_out(self.now()).await?;
        if reaped > 0 {
            info!(count = reaped, "failed timed out task instances");
        }
        Ok(())
    }
}

fn outside_window(
    run_at: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
) -> bool {
    start_date.is_some_and(|start| run_at < start) || end_date.is_some_and(|end| run_at > end)
}
