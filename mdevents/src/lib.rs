#![warn(missing_docs)]
//! # mdevents
//!
//! mdevents stores very large numbers of weighted `D`-dimensional point events in a recursively
//! splitting box tree, and bins them into dense histograms.
//!
//! ## Goals
//!
//! The tree is built for write-once, bin-many workloads: events are appended in bulk, boxes that
//! hold too many events are split into grids of smaller boxes, and the resulting tree is then
//! binned, integrated and iterated many times. When a dataset does not fit in memory, the events
//! of leaf boxes can live in a backing file and be loaded on demand.
//!
//! ### The tree
//!
//! A [`LeafBox`] holds a flat, unordered collection of [`Event`]s inside its extents. When it
//! holds more events than the split threshold of the [`BoxController`], it is replaced by a
//! [`GridBox`] which divides its extents into a dense grid of equally sized cells, each holding a
//! new leaf. The fanout can differ between dimensions and is configured at runtime.
//!
//! Both kinds of boxes are variants of [`Node`], which caches the number of events, total signal
//! and total squared error of its subtree. Those caches are what make binning fast: a box that
//! lies entirely inside an output bin contributes its cached totals without visiting its events.
//!
//! ### Scheduling
//!
//! Bulk loading, splitting, cache refreshing and binning hand their work to a [`Scheduler`] as
//! [`Task`]s. [`sequential::Inline`] runs them on the calling thread and, with the `parallel`
//! feature, [`parallel::ThreadPool`] runs them on a [rayon](https://github.com/rayon-rs/rayon)
//! pool.
//!
//! ## Using mdevents
//!
//! ```
//! use mdevents::prelude::*;
//!
//! let dimensions = vec![
//!     Dimension::new("x", "m", 0.0, 10.0),
//!     Dimension::new("y", "m", 0.0, 10.0),
//! ];
//! let config = BoxControllerConfig::default()
//!     .with_split_into(5)
//!     .with_split_threshold(10);
//! let mut workspace = EventWorkspace::<2>::new(dimensions, config)?;
//!
//! // One event of weight 1 at the centre of every unit cell.
//! let events: Vec<_> = (0..100)
//!     .map(|i| Event::unit([(i % 10) as f32 + 0.5, (i / 10) as f32 + 0.5]))
//!     .collect();
//!
//! let scheduler = sequential::Inline::default();
//! workspace.add_many_events(&events, &scheduler, &Progress::silent())?;
//! workspace.refresh_cache(&scheduler)?;
//! assert_eq!(workspace.n_points(), 100);
//!
//! // Bin the central 6x6 region into a 3x6 histogram.
//! let histo = workspace.bin_to_histo(
//!     &BinningRequest::new(&[
//!         BinDimension::index(0, 2.0, 8.0, 3),
//!         BinDimension::index(1, 2.0, 8.0, 6),
//!     ]),
//!     &scheduler,
//!     &Progress::silent(),
//! )?;
//! assert!(histo.signal().iter().all(|&s| s == 2.0));
//! # Ok::<(), mdevents::Error>(())
//! ```

/// Dense histogram binning of a tree.
pub mod binning;
/// Splitting policy, id allocation and disk-backing state.
pub mod controller;
/// Error types.
pub mod error;
/// Events and records that can be stored as events.
pub mod event;
/// Region filters used to prune traversal and mask histograms.
pub mod implicit;
/// Flattened, filtered traversal of a tree.
pub mod iterator;
/// Schedulers running tasks on multiple CPU threads.
#[cfg(feature = "parallel")]
pub mod parallel;
/// Progress reporting and advisory cancellation.
pub mod progress;
/// Schedulers running tasks on the calling thread.
pub mod sequential;
/// Backing file of file-backed workspaces.
pub mod storage;
/// The box tree.
pub mod tree;
/// The workspace owning a tree.
pub mod workspace;

pub use controller::{BoxController, BoxControllerConfig, BoxControllerStats};
pub use error::{Error, Result};
pub use event::{Event, Measured, Totals};
pub use tree::{GridBox, LeafBox, Node};
pub use workspace::EventWorkspace;

/// Order in which a [`Scheduler`] starts the tasks it is given.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TaskOrder {
    /// First submitted, first started.
    #[default]
    Fifo,
    /// Last submitted, first started.
    Lifo,
    /// Most expensive first, which packs uneven tasks onto workers best.
    LargestCostFirst,
}

impl TaskOrder {
    /// Reorders the tasks in the order they should be started.
    #[inline]
    pub fn arrange(self, mut tasks: Vec<Task<'_>>) -> Vec<Task<'_>> {
        match self {
            Self::Fifo => {}
            Self::Lifo => tasks.reverse(),
            Self::LargestCostFirst => tasks.sort_by_key(|task| std::cmp::Reverse(task.cost)),
        }
        tasks
    }
}

/// A unit of work handed to a [`Scheduler`]: a subtree to split or refresh, a slice of a batch
/// of events, or a range of output bins.
pub struct Task<'s> {
    cost: u64,
    job: Box<dyn FnOnce() -> Result<()> + Send + 's>,
}

impl<'s> Task<'s> {
    /// Creates a new [`Task`] with the given cost estimate.
    #[inline]
    pub fn new<F>(cost: u64, job: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 's,
    {
        Self {
            cost,
            job: Box::new(job),
        }
    }

    /// Returns the cost estimate of the task.
    #[inline]
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Runs the task.
    #[inline]
    pub fn run(self) -> Result<()> {
        (self.job)()
    }
}

impl std::fmt::Debug for Task<'_> {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("cost", &self.cost)
            .field("job", &std::any::type_name::<dyn FnOnce() -> Result<()>>())
            .finish()
    }
}

/// Trait to run [`Task`]s, possibly concurrently.
///
/// Implementations must run every task to completion before returning, even when some of them
/// fail, and report the first error encountered. Tasks may themselves call
/// [`execute`](Scheduler::execute) on the same scheduler.
pub trait Scheduler: Sync {
    /// Runs all the tasks and waits for them to finish.
    fn execute<'s>(&self, tasks: Vec<Task<'s>>) -> Result<()>;

    /// Returns the number of tasks that can run at the same time.
    #[inline]
    fn parallelism(&self) -> usize {
        1
    }
}

/// Commonly used types, re-exported.
pub mod prelude {
    pub use crate::{
        binning::{BinDimension, BinningRequest, BinningStrategy, HistoWorkspace},
        controller::{BoxController, BoxControllerConfig},
        event::{Event, Measured, Totals},
        implicit::{BoxFunction, Contact, ImplicitFunction, PlaneFunction},
        iterator::BoxIterator,
        progress::Progress,
        sequential,
        tree::{BoundingBox, Cylinder, GridBox, LeafBox, Node, Sphere},
        workspace::{Dimension, EventWorkspace, ExperimentInfo, LoadMode},
        Error, Scheduler, Task, TaskOrder,
    };
    pub use mdevents_derive::Measured;

    #[cfg(feature = "parallel")]
    pub use crate::parallel;
}
