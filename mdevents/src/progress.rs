use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of updates a [`Progress`] emits over a whole operation.
const UPDATES: u64 = 100;

/// A progress update sent on the channel of a [`Progress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Name of the operation.
    pub label: &'static str,
    /// Units of work done so far.
    pub done: u64,
    /// Total units of work, 0 if unknown.
    pub total: u64,
    /// Optional description of the current step.
    pub message: Option<String>,
}

/// Thread-safe progress reporter with advisory cancellation.
///
/// Reports are coalesced into at most about a hundred updates, logged at `debug` level and
/// optionally sent on a channel. Long operations check [`is_cancelled`](Progress::is_cancelled)
/// between blocks of work and stop with [`Error::Cancelled`](crate::Error::Cancelled).
#[derive(Debug)]
pub struct Progress {
    label: &'static str,
    total: AtomicU64,
    done: AtomicU64,
    emitted: AtomicU64,
    cancelled: AtomicBool,
    sender: Option<flume::Sender<ProgressUpdate>>,
}

impl Default for Progress {
    #[inline]
    fn default() -> Self {
        Self::silent()
    }
}

impl Progress {
    /// Creates a new [`Progress`] logging its updates.
    #[inline]
    pub fn new(label: &'static str, total: u64) -> Self {
        Self {
            label,
            total: AtomicU64::new(total),
            done: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            sender: None,
        }
    }

    /// Creates a new [`Progress`] that also sends its updates on the returned channel.
    pub fn channel(label: &'static str, total: u64) -> (Self, flume::Receiver<ProgressUpdate>) {
        let (sender, receiver) = flume::unbounded();
        let progress = Self {
            sender: Some(sender),
            ..Self::new(label, total)
        };
        (progress, receiver)
    }

    /// Creates a [`Progress`] for callers that don't follow progress.
    #[inline]
    pub fn silent() -> Self {
        Self::new("", 0)
    }

    /// Sets the total amount of work, once an operation knows it.
    #[inline]
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Returns the total amount of work.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the amount of work done so far.
    #[inline]
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Reports one unit of work.
    #[inline]
    pub fn report(&self, message: Option<&str>) {
        self.report_n(1, message);
    }

    /// Reports `n` units of work.
    pub fn report_n(&self, n: u64, message: Option<&str>) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        let total = self.total();
        if total == 0 {
            return;
        }

        let step = (total / UPDATES).max(1);
        let bucket = done / step;
        let previous = self.emitted.fetch_max(bucket, Ordering::Relaxed);
        if bucket <= previous {
            return;
        }

        tracing::debug!(label = self.label, done, total, message, "progress");
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is listening anymore.
            let _ = sender.send(ProgressUpdate {
                label: self.label,
                done,
                total,
                message: message.map(str::to_owned),
            });
        }
    }

    /// Asks the operations using this reporter to stop.
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if [`cancel`](Progress::cancel) was called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_coalesced() {
        let (progress, updates) = Progress::channel("adding events", 10_000);
        for _ in 0..10_000 {
            progress.report(None);
        }

        let updates: Vec<_> = updates.try_iter().collect();
        assert_eq!(updates.len(), 100);
        assert_eq!(updates.last().map(|u| u.done), Some(10_000));
        assert!(updates.windows(2).all(|w| w[0].done < w[1].done));
    }

    #[test]
    fn silent_progress_tracks_work_and_cancellation() {
        let progress = Progress::silent();
        progress.report_n(5, Some("ignored"));
        assert_eq!(progress.done(), 5);

        assert!(!progress.is_cancelled());
        progress.cancel();
        assert!(progress.is_cancelled());
    }
}
