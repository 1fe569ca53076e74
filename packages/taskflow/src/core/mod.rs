//! The scheduling/dispatch core: data model, store, registry, scheduler,
//! pusher, and worker.

pub mod dag;
pub mod error;
pub mod models;
pub mod pusher;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use error::{Result, TaskflowError};
pub use models::{InstanceStatus, Task, TaskInstance, TaskPriority, Workflow, WorkflowInstance};
pub use pusher::Pusher;
pub use registry::{RegisteredTask, Taskflow, WorkflowDefinition};
pub use scheduler::Scheduler;
pub use store::Store;
pub use worker::Worker;
