// A minimal embedding: one recurring workflow of bash tasks plus a
// standalone recurring task, handed to the stock CLI.
//
//     SQL_ALCHEMY_CONNECTION=postgres://localhost/taskflow \
//         cargo run --example echo_workflow -- init-db
//     cargo run --example echo_workflow -- scheduler -n 1
//     cargo run --example echo_workflow -- pull-worker -n 1

use std::sync::Arc;

use anyhow::Result;
use taskflow_core::{cli, BashTask, Task, Taskflow, Workflow, WorkflowDefinition};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn build_taskflow() -> Result<Taskflow> {
    let mut taskflow = Taskflow::new();

    let mut echo = WorkflowDefinition::new(
        Workflow::builder()
            .name("echo_workflow")
            .active(true)
            .schedule("0 6 * * *")
            .build(),
    );
    echo.add_task(
        Task::builder().name("say_hello").active(true).build(),
        &[],
        Some(Arc::new(BashTask::new("echo hello"))),
    )?;
    echo.add_task(
        Task::builder().name("say_world").active(true).build(),
        &[],
        Some(Arc::new(BashTask::new("echo world"))),
    )?;
    echo.add_task(
        Task::builder().name("say_goodbye").active(true).build(),
        &["say_hello", "say_world"],
        Some(Arc::new(BashTask::new("echo goodbye"))),
    )?;
    taskflow.add_workflow(echo)?;

    taskflow.add_task(
        Task::builder()
            .name("heartbeat")
            .active(true)
            .schedule("*/15 * * * *")
            .retries(1)
            .build(),
        Some(Arc::new(BashTask::new("date -u"))),
    )?;

    Ok(taskflow)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskflow_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run(build_taskflow()?).await
}
