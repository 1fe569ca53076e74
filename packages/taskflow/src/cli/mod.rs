//! Command-line surface.
//!
//! Embedders build a [`Taskflow`] with their definitions and hand it to
//! [`run`]; the shipped `taskflow` binary does the same with an empty
//! catalog, which is enough for schema setup and operating a database that
//! other processes define work in.

mod worker_id;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::Config;
use crate::core::models::TaskPriority;
use crate::core::{Pusher, Scheduler, Store, Taskflow, Worker};

pub use worker_id::derive_worker_id;

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "Durable workflow and task scheduling over Postgres")]
struct Cli {
    /// Database connection string; overrides SQL_ALCHEMY_CONNECTION
    #[arg(long, global = true)]
    sql_alchemy_connection: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema
    InitDb,

    /// Apply pending schema migrations
    MigrateDb,

    /// Run the scheduler loop; each iteration also runs the pusher
    Scheduler {
        #[arg(short = 'n', long, default_value_t = 10)]
        num_runs: u32,
        /// Seconds to pause between iterations
        #[arg(long, default_value_t = 5)]
        sleep: u64,
        /// Log planned actions without writing anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Pin "now" (format 2017-06-03T06:00:00, UTC)
        #[arg(long)]
        now_override: Option<String>,
    },

    /// Pull task instances and execute them
    PullWorker {
        #[arg(short = 'n', long, default_value_t = 10)]
        num_runs: u32,
        #[arg(long, default_value_t = 5)]
        sleep: u64,
        /// Comma-separated task names this worker is willing to run
        #[arg(long)]
        task_names: Option<String>,
        #[arg(long)]
        worker_id: Option<String>,
        #[arg(long)]
        now_override: Option<String>,
    },

    /// Execute one specific task instance
    RunTask {
        task_instance_id: i64,
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Insert a one-off task instance
    QueueTask {
        task_name: String,
        #[arg(long)]
        workflow_instance_id: Option<i64>,
        #[arg(long)]
        run_at: Option<String>,
        #[arg(long)]
        priority: Option<TaskPriority>,
        /// Instance params as a JSON object
        #[arg(long)]
        params: Option<String>,
    },

    /// Insert a one-off workflow instance
    QueueWorkflow {
        workflow_name: String,
        #[arg(long)]
        run_at: Option<String>,
        #[arg(long)]
        priority: Option<TaskPriority>,
    },
}

/// Parse arguments and run one command against the given catalog.
pub async fn run(mut taskflow: Taskflow) -> Result<()> {
    let cli = Cli::parse();

    let database_url = match &cli.sql_alchemy_connection {
        Some(url) => url.clone(),
        None => Config::from_env()?.database_url,
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    match cli.command {
        Commands::InitDb | Commands::MigrateDb => {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            info!("database schema is up to date");
        }

        Commands::Scheduler {
            num_runs,
            sleep,
            dry_run,
            now_override,
        } => {
            let now_override = parse_now_override(now_override.as_deref())?;
            let store = Store::new(pool);
            let scheduler = Scheduler::new(store.clone())
                .with_dry_run(dry_run)
                .with_now_override(now_override);
            let pusher = Pusher::new(store.clone())
                .with_dry_run(dry_run)
                .with_now_override(now_override);

            for n in 0..num_runs {
                if n > 0 && sleep > 0 {
                    tokio::time::sleep(Duration::from_secs(sleep)).await;
                }
                taskflow.sync(&store, false).await?;
                scheduler.run(&taskflow).await;
                pusher.run(&taskflow).await;
            }
        }

        Commands::PullWorker {
            num_runs,
            sleep,
            task_names,
            worker_id,
            now_override,
        } => {
            let now_override = parse_now_override(now_override.as_deref())?;
            let store = Store::new(pool);
            taskflow.sync(&store, false).await?;

            let worker_id = match worker_id {
                Some(id) => id,
                None => derive_worker_id().await,
            };
            let task_names: Option<Vec<String>> = task_names.map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect()
            });
            info!(worker_id = %worker_id, "starting pull worker");

            let worker = Worker::new(store.clone());
            for n in 0..num_runs {
                if n > 0 && sleep > 0 {
                    tokio::time::sleep(Duration::from_secs(sleep)).await;
                }
                let now = now_override.unwrap_or_else(Utc::now);
                let instances = store
                    .pull(&worker_id, now, 1, task_names.as_deref(), false)
                    .await?;
                if let Some(instance) = instances.into_iter().next() {
                    worker.execute(&taskflow, instance).await;
                }
            }
        }

        Commands::RunTask {
            task_instance_id,
            worker_id,
        } => {
            let store = Store::new(pool);
            taskflow.sync(&store, false).await?;

            let worker_id = match worker_id {
                Some(id) => id,
                None => derive_worker_id().await,
            };
            let instance = store
                .assign_worker(task_instance_id, &worker_id, Utc::now())
                .await?;

            let worker = Worker::new(store);
            if !worker.execute(&taskflow, instance).await {
                anyhow::bail!("task instance {task_instance_id} failed");
            }
        }

        Commands::QueueTask {
            task_name,
            workflow_instance_id,
            run_at,
            priority,
            params,
        } => {
            let store = Store::new(pool);
            taskflow.sync(&store, false).await?;

            let registered = taskflow
                .get_task(&task_name)
                .ok_or_else(|| anyhow!("task `{task_name}` not found"))?;
            let run_at = parse_now_override(run_at.as_deref())?.unwrap_or_else(Utc::now);

            let mut instance = registered.task.new_instance(run_at, false);
            instance.workflow_instance_id = workflow_instance_id;
            if let Some(priority) = priority {
                instance.priority = priority;
            }
            if let Some(params) = params {
                instance.params =
                    Some(serde_json::from_str(&params).context("--params must be valid JSON")?);
            }

            let inserted = store.insert_task_instance(&instance).await?;
            info!(id = inserted.id, task = %task_name, run_at = %run_at, "queued task instance");
        }

        Commands::QueueWorkflow {
            workflow_name,
            run_at,
            priority,
        } => {
            let store = Store::new(pool);
            taskflow.sync(&store, false).await?;

            let definition = taskflow
                .get_workflow(&workflow_name)
                .ok_or_else(|| anyhow!("workflow `{workflow_name}` not found"))?;
            let run_at = parse_now_override(run_at.as_deref())?.unwrap_or_else(Utc::now);

            let mut instance = definition.workflow.new_instance(run_at, false);
            if let Some(priority) = priority {
                instance.priority = priority;
            }

            let inserted = store.insert_workflow_instance(&instance).await?;
            info!(
                id = inserted.id,
                workflow = %workflow_name,
                run_at = %run_at,
                "queued workflow instance"
            );
        }
    }

    Ok(())
}

fn parse_now_override(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|value| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| naive.and_utc())
                .with_context(|| format!("invalid datetime `{value}`, expected 2017-06-03T06:00:00"))
        })
        .transpose()
}
