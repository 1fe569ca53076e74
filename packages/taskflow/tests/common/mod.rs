//! Shared integration-test infrastructure.
//!
//! A single Postgres container is started on first use and reused by every
//! test in the binary; each test gets its own freshly migrated database so
//! whole-table assertions never race.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use taskflow_core::{
    Executable, InstanceStatus, Store, Task, TaskInstance, Taskflow, Workflow, WorkflowDefinition,
};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedInfra {
    base_url: String,
    // Keeps the container alive for the whole test run.
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();
static DB_COUNTER: AtomicU32 = AtomicU32::new(0);

impl SharedInfra {
    async fn init() -> Self {
        // Run tests with RUST_LOG=debug cargo test -- --nocapture to see
        // engine logs.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .expect("failed to start Postgres container");
        let host = postgres.get_host().await.expect("container has no host");
        let port = postgres
            .get_host_port_ipv4(5432)
            .await
            .expect("container has no mapped port");

        Self {
            base_url: format!("postgres://postgres:postgres@{host}:{port}"),
            _postgres: postgres,
        }
    }

    async fn get() -> &'static Self {
        SHARED_INFRA.get_or_init(Self::init).await
    }
}

pub struct TestDb {
    pub pool: PgPool,
    pub store: Store,
}

/// A fresh, migrated database on the shared container.
pub async fn test_db() -> TestDb {
    let infra = SharedInfra::get().await;
    let db_name = format!(
        "taskflow_test_{}_{}",
        std::process::id(),
        DB_COUNTER.fetch_add(1, Ordering::SeqCst)
    );

    let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
        .await
        .expect("failed to connect to admin database");
    sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
        .execute(&admin)
        .await
        .expect("failed to create test database");
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&format!("{}/{db_name}", infra.base_url))
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    TestDb {
        store: Store::new(pool.clone()),
        pool,
    }
}

pub fn dt(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .unwrap()
}

// ============================================================================
// Executors
// ============================================================================

pub struct NoopExecutable;

#[async_trait]
impl Executable for NoopExecutable {
    async fn run(&self, _instance: &TaskInstance) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct FailingExecutable;

#[async_trait]
impl Executable for FailingExecutable {
    async fn run(&self, _instance: &TaskInstance) -> anyhow::Result<()> {
        anyhow::bail!("task body raised")
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// `workflow1` with the diamond graph `{task1, task2} → task3 → task4` and
/// a daily 06:00 schedule.
pub fn diamond_workflow() -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new(
        Workflow::builder()
            .name("workflow1")
            .active(true)
            .schedule("0 6 * * *")
            .build(),
    );
    let task = |name: &str| Task::builder().name(name).active(true).build();
    definition
        .add_task(task("task1"), &[], Some(Arc::new(NoopExecutable)))
        .unwrap();
    definition
        .add_task(task("task2"), &[], Some(Arc::new(NoopExecutable)))
        .unwrap();
    definition
        .add_task(task("task3"), &["task1", "task2"], Some(Arc::new(NoopExecutable)))
        .unwrap();
    definition
        .add_task(task("task4"), &["task3"], Some(Arc::new(NoopExecutable)))
        .unwrap();
    definition
}

pub fn diamond_taskflow() -> Taskflow {
    let mut taskflow = Taskflow::new();
    taskflow.add_workflow(diamond_workflow()).unwrap();
    taskflow
}

pub async fn set_task_statuses(pool: &PgPool, task_names: &[&str], status: InstanceStatus) {
    let names: Vec<String> = task_names.iter().map(|name| name.to_string()).collect();
    sqlx::query("UPDATE task_instances SET status = $1 WHERE task_name = ANY($2)")
        .bind(status)
        .bind(&names)
        .execute(pool)
        .await
        .expect("failed to update task statuses");
}

pub async fn all_task_instances(store: &Store, workflow_instance_id: i64) -> Vec<TaskInstance> {
    store
        .task_instances_for_workflow(workflow_instance_id)
        .await
        .expect("failed to load task instances")
}
