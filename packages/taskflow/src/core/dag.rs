//! Level-order topological sort for workflow task graphs.
//!
//! The graph maps each task name to the set of task names it depends on.
//! The result is a list of levels: every task in level *k+1* depends only
//! on tasks in levels `0..=k`, so tasks within a level may run in parallel.

use std::collections::{HashMap, HashSet};

use super::error::{Result, TaskflowError};

/// Sort a dependency graph into parallel execution levels.
///
/// Names that appear only as dependencies are treated as root tasks.
/// Levels and the tasks within them are returned in deterministic order.
///
/// # Errors
/// [`TaskflowError::InvalidDefinition`] when the graph contains a cycle.
pub fn toposort_levels(graph: &HashMap<String, HashSet<String>>) -> Result<Vec<Vec<String>>> {
    let mut remaining: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (name, deps) in graph {
        remaining
            .entry(name.as_str())
            .or_default()
            .extend(deps.iter().map(String::as_str));
        for dep in deps {
            remaining.entry(dep.as_str()).or_default();
        }
    }

    let mut resolved: HashSet<&str> = HashSet::new();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| resolved.contains(dep)))
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<&str> = remaining.keys().copied().collect();
            stuck.sort_unstable();
            return Err(TaskflowError::InvalidDefinition(format!(
                "dependency cycle among tasks: {}",
                stuck.join(", ")
            )));
        }

        ready.sort_unstable();
        for name in &ready {
            remaining.remove(name);
            resolved.insert(name);
        }
        levels.push(ready.into_iter().map(str::to_owned).collect());
    }

    Ok(levels)
}
