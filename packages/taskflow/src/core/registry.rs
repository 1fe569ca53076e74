//! Process-wide catalog of declared workflows and tasks.
//!
//! The [`Taskflow`] registry is built once in `main` and passed explicitly
//! to the scheduler, pusher, and workers rather than held as an ambient
//! singleton. It maps task names to both the persisted definition and the
//! executor that runs it, holds the push-worker adapters keyed by
//! destination tag, and owns the monitoring fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::dag::toposort_levels;
use super::error::{Result, TaskflowError};
use super::models::{Task, Workflow};
use super::store::Store;
use crate::monitoring::Monitor;
use crate::push_workers::PushWorker;
use crate::tasks::Executable;

/// A task as the registry knows it: the persisted definition, its upstream
/// dependency names, and the executor that runs it locally (push tasks have
/// no executor).
pub struct RegisteredTask {
    pub task: Task,
    pub dependencies: HashSet<String>,
    pub executor: Option<Arc<dyn Executable>>,
}

/// A workflow definition together with its member tasks.
pub struct WorkflowDefinition {
    pub workflow: Workflow,
    tasks: HashMap<String, RegisteredTask>,
}

impl WorkflowDefinition {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            tasks: HashMap::new(),
        }
    }

    /// Add a member task. `depends_on` names must belong to this workflow;
    /// they are checked when the workflow is registered.
    pub fn add_task(
        &mut self,
        mut task: Task,
        depends_on: &[&str],
        executor: Option<Arc<dyn Executable>>,
    ) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(TaskflowError::InvalidDefinition(format!(
                "task `{}` is already registered in workflow `{}`",
                task.name, self.workflow.name
            )));
        }

        let mut dependencies = HashSet::new();
        for dep in depends_on {
            if *dep == task.name {
                return Err(TaskflowError::InvalidDefinition(format!(
                    "task `{}` cannot depend on itself",
                    task.name
                )));
            }
            if !dependencies.insert((*dep).to_string()) {
                return Err(TaskflowError::InvalidDefinition(format!(
                    "task `{}` lists dependency `{dep}` twice",
                    task.name
                )));
            }
        }

        task.workflow_name = Some(self.workflow.name.clone());
        self.tasks.insert(
            task.name.clone(),
            RegisteredTask {
                task,
                dependencies,
                executor,
            },
        );

        Ok(())
    }

    pub fn get_task(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &RegisteredTask> {
        self.tasks.values()
    }

    /// Task name → upstream task names, the input to the level sort.
    pub fn dependency_graph(&self) -> HashMap<String, HashSet<String>> {
        self.tasks
            .iter()
            .map(|(name, registered)| (name.clone(), registered.dependencies.clone()))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        for registered in self.tasks.values() {
            for dep in &registered.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(TaskflowError::InvalidDefinition(format!(
                        "task `{}` depends on unknown task `{dep}` in workflow `{}`",
                        registered.task.name, self.workflow.name
                    )));
                }
            }
        }
        // A cyclic graph is unschedulable; reject it here rather than at
        // advancement time.
        toposort_levels(&self.dependency_graph())?;
        Ok(())
    }
}

/// The registry itself.
#[derive(Default)]
pub struct Taskflow {
    workflows: HashMap<String, WorkflowDefinition>,
    tasks: HashMap<String, RegisteredTask>,
    push_workers: HashMap<String, Arc<dyn PushWorker>>,
    monitor: Monitor,
}

impl Taskflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Register a workflow and its member tasks. Dependency references are
    /// resolved and the graph is checked for cycles now, so a bad
    /// definition is fatal at startup instead of at advancement time.
    pub fn add_workflow(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let name = definition.workflow.name.clone();
        if self.workflows.contains_key(&name) {
            return Err(TaskflowError::InvalidDefinition(format!(
                "workflow `{name}` is already registered"
            )));
        }
        for task in definition.tasks.keys() {
            if self.task_name_in_use(task) {
                return Err(TaskflowError::InvalidDefinition(format!(
                    "task `{task}` is already registered"
                )));
            }
        }
        definition.validate()?;

        debug!(workflow = %name, tasks = definition.tasks.len(), "registered workflow");
        self.workflows.insert(name, definition);
        Ok(())
    }

    pub fn add_workflows(
        &mut self,
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<()> {
        for definition in definitions {
            self.add_workflow(definition)?;
        }
        Ok(())
    }

    /// Register a standalone task. Tasks that belong to a workflow are
    /// registered through the workflow, never individually.
    pub fn add_task(&mut self, task: Task, executor: Option<Arc<dyn Executable>>) -> Result<()> {
        if task.workflow_name.is_some() {
            return Err(TaskflowError::InvalidDefinition(format!(
                "task `{}` belongs to a workflow; register the workflow instead",
                task.name
            )));
        }
        if self.task_name_in_use(&task.name) {
            return Err(TaskflowError::InvalidDefinition(format!(
                "task `{}` is already registered",
                task.name
            )));
        }

        debug!(task = %task.name, "registered task");
        self.tasks.insert(
            task.name.clone(),
            RegisteredTask {
                task,
                dependencies: HashSet::new(),
                executor,
            },
        );
        Ok(())
    }

    pub fn add_tasks(
        &mut self,
        tasks: impl IntoIterator<Item = (Task, Option<Arc<dyn Executable>>)>,
    ) -> Result<()> {
        for (task, executor) in tasks {
            self.add_task(task, executor)?;
        }
        Ok(())
    }

    /// Register a push-worker adapter under its destination tag.
    pub fn add_push_worker(&mut self, destination: impl Into<String>, worker: Arc<dyn PushWorker>) {
        self.push_workers.insert(destination.into(), worker);
    }

    pub fn get_push_worker(&self, destination: &str) -> Option<Arc<dyn PushWorker>> {
        self.push_workers.get(destination).cloned()
    }

    pub fn get_workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name)
    }

    /// Look up a task by name: standalone tasks first, then every
    /// workflow's members.
    pub fn get_task(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name).or_else(|| {
            self.workflows
                .values()
                .find_map(|definition| definition.get_task(name))
        })
    }

    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }

    pub fn standalone_tasks(&self) -> impl Iterator<Item = &RegisteredTask> {
        self.tasks.values()
    }

    fn task_name_in_use(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
            || self
                .workflows
                .values()
                .any(|definition| definition.get_task(name).is_some())
    }

    /// Upsert every definition into the store and merge the persisted
    /// `active` flags back into the catalog. With `read_only` no writes are
    /// made and only the flags are read.
    pub async fn sync(&mut self, store: &Store, read_only: bool) -> Result<()> {
        if read_only {
            let workflow_names: Vec<String> = self.workflows.keys().cloned().collect();
            let flags = store.workflow_active_flags(&workflow_names).await?;
            for (name, definition) in &mut self.workflows {
                if let Some(active) = flags.get(name) {
                    definition.workflow.active = *active;
                }
            }

            let task_names: Vec<String> = self
                .tasks
                .keys()
                .cloned()
                .chain(
                    self.workflows
                        .values()
                        .flat_map(|definition| definition.tasks.keys().cloned()),
                )
                .collect();
            let flags = store.task_active_flags(&task_names).await?;
            let apply = |registered: &mut RegisteredTask| {
                if let Some(active) = flags.get(&registered.task.name) {
                    registered.task.active = *active;
                }
            };
            self.tasks.values_mut().for_each(apply);
            for definition in self.workflows.values_mut() {
                definition.tasks.values_mut().for_each(apply);
            }

            return Ok(());
        }

        for definition in self.workflows.values_mut() {
            definition.workflow.active =
                store.upsert_workflow_definition(&definition.workflow).await?;
            for registered in definition.tasks.values_mut() {
                registered.task.active = store.upsert_task_definition(&registered.task).await?;
            }
        }
        for registered in self.tasks.values_mut() {
            registered.task.active = store.upsert_task_definition(&registered.task).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(Workflow::builder().name(name).active(true).build())
    }

    fn task(name: &str) -> Task {
        Task::builder().name(name).active(true).build()
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut definition = workflow("workflow1");
        let err = definition
            .add_task(task("task1"), &["task1"], None)
            .unwrap_err();
        assert!(matches!(err, TaskflowError::InvalidDefinition(_)));
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let mut definition = workflow("workflow1");
        definition.add_task(task("task1"), &[], None).unwrap();
        let err = definition
            .add_task(task("task2"), &["task1", "task1"], None)
            .unwrap_err();
        assert!(matches!(err, TaskflowError::InvalidDefinition(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected_at_registration() {
        let mut definition = workflow("workflow1");
        definition
            .add_task(task("task1"), &["missing"], None)
            .unwrap();

        let mut taskflow = Taskflow::new();
        let err = taskflow.add_workflow(definition).unwrap_err();
        assert!(matches!(err, TaskflowError::InvalidDefinition(_)));
    }

    #[test]
    fn dependency_cycle_is_rejected_at_registration() {
        let mut definition = workflow("workflow1");
        definition.add_task(task("task1"), &["task2"], None).unwrap();
        definition.add_task(task("task2"), &["task1"], None).unwrap();

        let mut taskflow = Taskflow::new();
        assert!(taskflow.add_workflow(definition).is_err());
    }

    #[test]
    fn workflow_member_cannot_be_added_standalone() {
        let mut member = task("task1");
        member.workflow_name = Some("workflow1".to_string());

        let mut taskflow = Taskflow::new();
        let err = taskflow.add_task(member, None).unwrap_err();
        assert!(matches!(err, TaskflowError::InvalidDefinition(_)));
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut taskflow = Taskflow::new();
        taskflow.add_task(task("task1"), None).unwrap();
        assert!(taskflow.add_task(task("task1"), None).is_err());

        taskflow.add_workflow(workflow("workflow1")).unwrap();
        assert!(taskflow.add_workflow(workflow("workflow1")).is_err());
    }

    #[test]
    fn get_task_searches_standalone_then_workflows() {
        let mut taskflow = Taskflow::new();
        taskflow.add_task(task("standalone"), None).unwrap();

        let mut definition = workflow("workflow1");
        definition.add_task(task("member"), &[], None).unwrap();
        taskflow.add_workflow(definition).unwrap();

        assert!(taskflow.get_task("standalone").is_some());
        let member = taskflow.get_task("member").unwrap();
        assert_eq!(member.task.workflow_name.as_deref(), Some("workflow1"));
        assert!(taskflow.get_task("missing").is_none());
    }

    #[test]
    fn member_tasks_carry_the_workflow_name() {
        let mut definition = workflow("workflow1");
        definition.add_task(task("task1"), &[], None).unwrap();
        assert_eq!(
            definition.get_task("task1").unwrap().task.workflow_name.as_deref(),
            Some("workflow1")
        );
    }
}
