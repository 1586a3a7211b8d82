use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A named, weighted unit of work executed by virtual users.
///
/// The weight governs selection probability: a task with weight 20 runs
/// twice as often as one with weight 10. A zero-weight task is never
/// selected unless every task has weight zero, in which case selection is
/// uniform.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub weight: usize,
    pub func: TaskFn,
}

impl Task {
    pub fn new<N, F, Fut>(name: N, weight: usize, func: F) -> Self
    where
        N: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            func: Arc::new(move || Box::pin(func())),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Expands tasks into a flat selection plan, replicating each task by its
/// weight and shuffling once. Picking uniformly from the plan then honors
/// the weights. A zero weight sum falls back to the raw task list.
pub(crate) fn weighted_plan(tasks: &[Task]) -> Vec<Task> {
    let total_weight: usize = tasks.iter().map(|task| task.weight).sum();
    if total_weight == 0 {
        return tasks.to_vec();
    }
    let mut plan = Vec::with_capacity(total_weight);
    for task in tasks {
        for _ in 0..task.weight {
            plan.push(task.clone());
        }
    }
    plan.shuffle(&mut thread_rng());
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    fn noop_task(name: &str, weight: usize) -> Task {
        Task::new(name, weight, || async {})
    }

    #[test]
    fn weighted_plan_replicates_by_weight() -> AppResult<()> {
        let tasks = vec![noop_task("light", 1), noop_task("heavy", 3)];
        let plan = weighted_plan(&tasks);
        if plan.len() != 4 {
            return Err(AppError::config(format!(
                "Unexpected plan length: {}",
                plan.len()
            )));
        }
        let heavy = plan.iter().filter(|task| task.name == "heavy").count();
        if heavy != 3 {
            return Err(AppError::config(format!(
                "Expected 3 heavy slots, got {}",
                heavy
            )));
        }
        Ok(())
    }

    #[test]
    fn weighted_plan_zero_sum_is_uniform() -> AppResult<()> {
        let tasks = vec![noop_task("a", 0), noop_task("b", 0)];
        let plan = weighted_plan(&tasks);
        if plan.len() != 2 {
            return Err(AppError::config(format!(
                "Zero-weight plan should mirror the task list, got {} entries",
                plan.len()
            )));
        }
        Ok(())
    }

    #[test]
    fn weighted_plan_skips_zero_weight_among_weighted() -> AppResult<()> {
        let tasks = vec![noop_task("never", 0), noop_task("always", 2)];
        let plan = weighted_plan(&tasks);
        if plan.iter().any(|task| task.name == "never") {
            return Err(AppError::config("Zero-weight task leaked into the plan"));
        }
        Ok(())
    }
}
