//! Durable workflow and task scheduling over Postgres.
//!
//! Definitions (workflows as DAGs of tasks, standalone tasks) are declared
//! in code and synced into the database; the scheduler materializes cron
//! recurrences into queued instances and advances workflow steps; pull
//! workers and the pusher drain the instance queue with priority, timeout,
//! and retry guarantees. Any number of scheduler, pusher, and worker
//! processes may run against the same database; the row locks taken by
//! the pull statement are the only coordination.

pub mod cli;
pub mod config;
pub mod core;
pub mod cron;
pub mod monitoring;
pub mod push_workers;
pub mod tasks;

pub use crate::config::Config;
pub use crate::core::{
    InstanceStatus, Pusher, RegisteredTask, Result, Scheduler, Store, Task, TaskInstance,
    TaskPriority, Taskflow, TaskflowError, Worker, Workflow, WorkflowDefinition, WorkflowInstance,
};
pub use crate::cron::CronSchedule;
pub use crate::monitoring::{Monitor, MonitorDestination, SlackMonitor};
pub use crate::push_workers::{HttpBatchPushWorker, PushWorker};
pub use crate::tasks::{BashTask, Executable};
