//! Push-worker capability: adapters that hand task instances to a remote
//! executor and reconcile the remote state back into the store.
//!
//! Adapters are registered on the registry under a destination tag; a task
//! definition opts in by naming that tag as its `push_destination`. Only
//! the pusher calls these.

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::models::TaskInstance;
use crate::core::registry::Taskflow;
use crate::core::store::Store;

mod http_batch;

pub use http_batch::HttpBatchPushWorker;

#[async_trait]
pub trait PushWorker: Send + Sync {
    /// Submit freshly pulled instances to the remote executor. For each
    /// instance the adapter issues the remote submission, stores the
    /// executor's response as `push_state`, and moves the row to `pushed`.
    /// With `dry_run` the adapter logs what it would submit and writes
    /// nothing.
    async fn submit(
        &self,
        store: &Store,
        taskflow: &Taskflow,
        dry_run: bool,
        instances: &[TaskInstance],
    ) -> Result<()>;

    /// Map the remote executor's state of each instance back onto a queue
    /// status and commit the changes. Adapters may batch remote calls but
    /// must keep per-instance status consistent on failure.
    async fn reconcile(
        &self,
        store: &Store,
        dry_run: bool,
        instances: &[TaskInstance],
    ) -> Result<()>;

    /// Where a human can read this instance's remote logs, if anywhere.
    /// Used by notification destinations.
    fn log_url(&self, _instance: &TaskInstance) -> Option<String> {
        None
    }
}
