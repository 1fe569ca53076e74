//! Task execution capability.
//!
//! A task definition names *what* runs; an [`Executable`] is *how* it
//! runs. Implementations are registered alongside their definition at
//! process start, and the worker dispatches to them by task name.

use async_trait::async_trait;

use crate::core::models::TaskInstance;

mod bash;

pub use bash::BashTask;

/// Something a pull worker can run.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Execute one instance. An error routes the instance through the
    /// store's fail transition (retry or terminal failure).
    async fn run(&self, instance: &TaskInstance) -> anyhow::Result<()>;

    /// Called from the termination-signal trap while `run` is in flight.
    /// The process exits right after, so this should only signal or clean
    /// up external resources.
    fn on_kill(&self) {}
}
