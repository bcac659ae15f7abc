use crate::{Result, Scheduler, Task, TaskOrder};

/// Scheduler running tasks one after the other on the calling thread.
///
/// Useful for small trees, for deterministic debugging and when the `parallel` feature is
/// disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inline {
    /// Order in which the tasks run.
    pub order: TaskOrder,
}

impl Inline {
    /// Creates a new [`Inline`] scheduler running tasks in the given order.
    #[inline]
    pub const fn new(order: TaskOrder) -> Self {
        Self { order }
    }
}

impl Scheduler for Inline {
    #[inline]
    fn execute<'s>(&self, tasks: Vec<Task<'s>>) -> Result<()> {
        let mut first_error = None;

        for task in self.order.arrange(tasks) {
            if let Err(error) = task.run() {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    fn recorded(order: TaskOrder) -> Vec<u64> {
        let log = Mutex::new(Vec::new());
        let tasks = [3, 1, 4, 1, 5]
            .into_iter()
            .map(|cost| {
                let log = &log;
                Task::new(cost, move || {
                    log.lock().unwrap().push(cost);
                    Ok(())
                })
            })
            .collect();

        Inline::new(order).execute(tasks).unwrap();
        log.into_inner().unwrap()
    }

    #[test]
    fn runs_in_requested_order() {
        assert_eq!(recorded(TaskOrder::Fifo), vec![3, 1, 4, 1, 5]);
        assert_eq!(recorded(TaskOrder::Lifo), vec![5, 1, 4, 1, 3]);
        assert_eq!(recorded(TaskOrder::LargestCostFirst), vec![5, 4, 3, 1, 1]);
    }

    #[test]
    fn runs_every_task_and_reports_first_error() {
        let ran = Mutex::new(0);
        let tasks = (0..4)
            .map(|i| {
                let ran = &ran;
                Task::new(1, move || {
                    *ran.lock().unwrap() += 1;
                    match i {
                        1 => Err(Error::structure("first")),
                        2 => Err(Error::structure("second")),
                        _ => Ok(()),
                    }
                })
            })
            .collect();

        let error = Inline::default().execute(tasks).unwrap_err();
        assert_eq!(*ran.lock().unwrap(), 4);
        assert_eq!(error.to_string(), "tree structure violated: first");
    }
}
