//! The pusher: dispatches push task instances to remote executors and
//! reconciles their remote state back into the store.
//!
//! Instances are grouped by their task's `push_destination` tag; each
//! destination's adapter is invoked in isolation so one failing executor
//! never blocks the others.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::error::Result;
use super::models::TaskInstance;
use super::registry::Taskflow;
use super::store::Store;

/// The worker id stamped on rows pulled by the pusher.
const PUSHER_WORKER_ID: &str = "Pusher";

/// How many queued push instances a single run submits at most.
const MAX_PUSH_TASKS: i64 = 100;

pub struct Pusher {
    store: Store,
    dry_run: bool,
    now_override: Option<DateTime<Utc>>,
}

impl Pusher {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            dry_run: false,
            now_override: None,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_now_override(mut self, now_override: Option<DateTime<Utc>>) -> Self {
        self.now_override = now_override;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_override.unwrap_or_else(Utc::now)
    }

    /// One pusher pass: submit queued push instances, then reconcile the
    /// state of everything already submitted.
    pub async fn run(&self, taskflow: &Taskflow) {
        info!("starting pusher run");

        if let Err(e) = self.push_queued(taskflow).await {
            error!(error = %e, "failed to push queued task instances");
        }

        if let Err(e) = self.sync_states(taskflow).await {
            error!(error = %e, "failed to sync pushed task instance states");
        }

        info!("pusher run complete");
    }

    async fn push_queued(&self, taskflow: &Taskflow) -> Result<()> {
        let instances = self
            .store
            .pull(PUSHER_WORKER_ID, self.now(), MAX_PUSH_TASKS, None, true)
            .await?;

        for (destination, group) in group_by_destination(taskflow, instances) {
            info!(destination = %destination, count = group.len(), "pushing task instances");

            let Some(push_worker) = taskflow.get_push_worker(&destination) else {
                error!(destination = %destination, "no push worker registered for destination");
                continue;
            };
            if let Err(e) = push_worker
                .submit(&self.store, taskflow, self.dry_run, &group)
                .await
            {
                error!(destination = %destination, error = %e, "failed to push to destination");
            }
        }

        Ok(())
    }

    async fn sync_states(&self, taskflow: &Taskflow) -> Result<()> {
        let instances = self.store.pushed_or_running_push_instances().await?;

        for (destination, group) in group_by_destination(taskflow, instances) {
            info!(destination = %destination, count = group.len(), "syncing states");

            let Some(push_worker) = taskflow.get_push_worker(&destination) else {
                error!(destination = %destination, "no push worker registered for destination");
                continue;
            };
            if let Err(e) = push_worker
                .reconcile(&self.store, self.dry_run, &group)
                .await
            {
                error!(destination = %destination, error = %e, "failed to sync with destination");
            }
        }

        Ok(())
    }
}

fn group_by_destination(
    taskflow: &Taskflow,
    instances: Vec<TaskInstance>,
) -> HashMap<String, Vec<TaskInstance>> {
    let mut groups: HashMap<String, Vec<TaskInstance>> = HashMap::new();
    for instance in instances {
        let destination = taskflow
            .get_task(&instance.task_name)
            .and_then(|registered| registered.task.push_destination.clone());
        match destination {
            Some(destination) => groups.entry(destination).or_default().push(instance),
            None => warn!(
                task = %instance.task_name,
                id = instance.id,
                "push task instance has no push destination"
            ),
        }
    }
    groups
}
