use crate::{Error, Result, Scheduler, Task, TaskOrder};
use parking_lot::Mutex;
use std::sync::Arc;

/// Scheduler running tasks on multiple CPU threads with [rayon](https://github.com/rayon-rs/rayon).
///
/// Tasks are spawned in a rayon scope, either on the global pool or on a dedicated pool. A task
/// calling [`execute`](Scheduler::execute) again spawns into the same pool and the waiting
/// thread keeps stealing work, so recursive splitting doesn't starve the pool.
#[derive(Clone, Debug, Default)]
pub struct ThreadPool {
    pool: Option<Arc<rayon::ThreadPool>>,
    order: TaskOrder,
}

impl ThreadPool {
    /// Creates a [`ThreadPool`] scheduler using rayon's global pool.
    #[inline]
    pub fn global() -> Self {
        Self::default()
    }

    /// Creates a [`ThreadPool`] scheduler with its own pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mdevents-worker-{i}"))
            .build()
            .map_err(|e| Error::invalid("threads", e.to_string()))?;

        Ok(Self {
            pool: Some(Arc::new(pool)),
            order: TaskOrder::default(),
        })
    }

    /// Sets the order in which tasks are started.
    #[inline]
    pub fn with_order(mut self, order: TaskOrder) -> Self {
        self.order = order;
        self
    }

    fn run_all<'s>(&self, tasks: Vec<Task<'s>>) -> Result<()> {
        let first_error = Mutex::new(None);
        let first_error_ref = &first_error;
        let run = |task: Task<'s>| {
            if let Err(error) = task.run() {
                first_error_ref.lock().get_or_insert(error);
            }
        };

        match self.order {
            // Rayon's scoped spawns are popped last-in first-out by the spawning thread.
            TaskOrder::Lifo => rayon::scope(|scope| {
                for task in tasks {
                    scope.spawn(move |_| run(task));
                }
            }),
            order => rayon::scope_fifo(|scope| {
                for task in order.arrange(tasks) {
                    scope.spawn_fifo(move |_| run(task));
                }
            }),
        }

        first_error.into_inner().map_or(Ok(()), Err)
    }
}

impl Scheduler for ThreadPool {
    fn execute<'s>(&self, tasks: Vec<Task<'s>>) -> Result<()> {
        if tasks.len() <= 1 {
            return tasks.into_iter().try_for_each(Task::run);
        }

        tracing::trace!(tasks = tasks.len(), "spawning tasks");
        match &self.pool {
            Some(pool) => pool.install(|| self.run_all(tasks)),
            None => self.run_all(tasks),
        }
    }

    #[inline]
    fn parallelism(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn runs_all_tasks_on_dedicated_pool() {
        let scheduler = ThreadPool::with_threads(4).unwrap();
        assert_eq!(scheduler.parallelism(), 4);

        let sum = AtomicU64::new(0);
        let tasks = (1..=100)
            .map(|i| {
                let sum = &sum;
                Task::new(i, move || {
                    sum.fetch_add(i, Ordering::Relaxed);
                    Ok(())
                })
            })
            .collect();

        scheduler.execute(tasks).unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn nested_execution_completes() {
        let scheduler = ThreadPool::with_threads(2)
            .unwrap()
            .with_order(TaskOrder::LargestCostFirst);
        let count = AtomicU64::new(0);

        let outer = (0..8)
            .map(|_| {
                let (count, scheduler) = (&count, &scheduler);
                Task::new(8, move || {
                    let inner = (0..8)
                        .map(|_| {
                            Task::new(1, move || {
                                count.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            })
                        })
                        .collect();
                    scheduler.execute(inner)
                })
            })
            .collect();

        scheduler.execute(outer).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn reports_error_after_all_tasks() {
        let count = AtomicU64::new(0);
        let tasks = (0..16)
            .map(|i| {
                let count = &count;
                Task::new(1, move || {
                    count.fetch_add(1, Ordering::Relaxed);
                    match i % 5 {
                        0 => Err(Error::Cancelled),
                        _ => Ok(()),
                    }
                })
            })
            .collect();

        let result = ThreadPool::global().with_order(TaskOrder::Lifo).execute(tasks);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(count.load(Ordering::Relaxed), 16);
    }
}
