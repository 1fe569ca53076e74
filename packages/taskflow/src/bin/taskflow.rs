// Bare CLI entry with an empty catalog. Deployments with their own
// workflows embed the library and call `cli::run` with a populated one;
// see examples/echo_workflow.rs.

use anyhow::Result;
use taskflow_core::{cli, Taskflow};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskflow_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run(Taskflow::new()).await
}
