//! Splitting policy, id allocation and disk-backing state shared by every node of one workspace.

use crate::{
    error::{Error, Result},
    storage::DiskBuffer,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default number of events above which a box splits.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1000;

/// Default maximum depth of the tree.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Configuration of a [`BoxController`].
///
/// Per-dimension lists hold either one value, used for every dimension, or exactly one value per
/// dimension. They are validated against the dimensionality of the workspace when the
/// controller is created.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoxControllerConfig {
    /// Number of cells a box is split into along each dimension.
    pub split_into: Vec<usize>,
    /// Fanout used instead of `split_into` for the root split.
    pub split_top_into: Option<Vec<usize>>,
    /// Number of events above which a box splits.
    pub split_threshold: usize,
    /// Boxes at this depth never split.
    pub max_depth: usize,
    /// Number of events handed to one task by bulk loading.
    pub events_per_task: usize,
    /// Number of tasks run between two splitting passes by bulk loading.
    pub tasks_per_block: usize,
    /// Subtrees holding fewer points than this are split inline rather than as their own task.
    pub task_min_points: u64,
    /// Number of events that may stay loaded in a file-backed workspace before bulk loading
    /// writes leaves out and evicts them.
    pub memory_limit_events: u64,
}

impl Default for BoxControllerConfig {
    fn default() -> Self {
        Self {
            split_into: vec![2],
            split_top_into: None,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            events_per_task: 50_000,
            tasks_per_block: 8,
            task_min_points: 100_000,
            memory_limit_events: 50_000_000,
        }
    }
}

impl BoxControllerConfig {
    /// Sets the same fanout for every dimension.
    pub fn with_split_into(mut self, split: usize) -> Self {
        self.split_into = vec![split];
        self
    }

    /// Sets one fanout per dimension.
    pub fn with_split_into_per_dim(mut self, split: impl Into<Vec<usize>>) -> Self {
        self.split_into = split.into();
        self
    }

    /// Sets the fanout of the root split.
    pub fn with_split_top_into(mut self, split: impl Into<Vec<usize>>) -> Self {
        self.split_top_into = Some(split.into());
        self
    }

    /// Sets the number of events above which a box splits.
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Sets the maximum depth of the tree.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Sets the batching of bulk loading.
    pub fn with_batching(mut self, events_per_task: usize, tasks_per_block: usize) -> Self {
        self.events_per_task = events_per_task;
        self.tasks_per_block = tasks_per_block;
        self
    }

    /// Sets the subtree size under which splitting stays on the current task.
    pub fn with_task_min_points(mut self, points: u64) -> Self {
        self.task_min_points = points;
        self
    }

    /// Sets the loaded-event budget of a file-backed workspace.
    pub fn with_memory_limit(mut self, events: u64) -> Self {
        self.memory_limit_events = events;
        self
    }

    fn expand<const D: usize>(split: &[usize], what: &'static str) -> Result<[usize; D]> {
        let split: [usize; D] = match split.len() {
            1 => [split[0]; D],
            _ => {
                Error::check_len(D, split.len(), what)?;
                std::array::from_fn(|i| split[i])
            }
        };

        match split.iter().any(|&s| s == 0) {
            true => Err(Error::invalid(what, "split factors must be at least 1")),
            false => Ok(split),
        }
    }
}

/// Number of boxes of each kind at each depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct DepthCounts {
    leaves: Vec<usize>,
    grids: Vec<usize>,
}

impl DepthCounts {
    fn at(counts: &mut Vec<usize>, depth: usize) -> &mut usize {
        if counts.len() <= depth {
            counts.resize(depth + 1, 0);
        }
        &mut counts[depth]
    }
}

/// Snapshot of the bookkeeping of a [`BoxController`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoxControllerStats {
    /// Number of leaf boxes at each depth.
    pub leaf_boxes_by_depth: Vec<usize>,
    /// Number of grid boxes at each depth.
    pub grid_boxes_by_depth: Vec<usize>,
    /// Number of ids handed out so far.
    pub allocated_ids: u64,
    /// Whether the workspace has a backing file.
    pub file_backed: bool,
    /// Length of the event region of the backing file, in events.
    pub file_events: u64,
    /// Number of reclaimed blocks in the backing file.
    pub free_blocks: usize,
    /// Number of events currently loaded from, or waiting for, the backing file.
    pub loaded_events: u64,
}

impl BoxControllerStats {
    /// Returns the total number of leaf boxes.
    pub fn leaf_boxes(&self) -> usize {
        self.leaf_boxes_by_depth.iter().sum()
    }

    /// Returns the total number of grid boxes.
    pub fn grid_boxes(&self) -> usize {
        self.grid_boxes_by_depth.iter().sum()
    }

    /// Returns the total number of boxes.
    pub fn total_boxes(&self) -> usize {
        self.leaf_boxes() + self.grid_boxes()
    }
}

/// Policy and allocator shared by all the nodes of one workspace.
///
/// Nodes never own the controller: operations that need it take it as an argument.
#[derive(Debug)]
pub struct BoxController<const D: usize> {
    config: BoxControllerConfig,
    split_into: [usize; D],
    split_top_into: Option<[usize; D]>,
    next_id: AtomicU64,
    counts: Mutex<DepthCounts>,
    disk: RwLock<Option<Arc<DiskBuffer<D>>>>,
}

impl<const D: usize> BoxController<D> {
    /// Creates a new [`BoxController`] from a validated configuration.
    pub fn new(config: BoxControllerConfig) -> Result<Self> {
        if D == 0 {
            return Err(Error::invalid("dimensions", "a workspace needs at least one dimension"));
        }
        if config.split_threshold == 0 {
            return Err(Error::invalid("split_threshold", "must be at least 1"));
        }
        if config.events_per_task == 0 || config.tasks_per_block == 0 {
            return Err(Error::invalid("batching", "tasks must hold at least one event"));
        }

        let split_into = BoxControllerConfig::expand(&config.split_into, "split_into")?;
        let split_top_into = config
            .split_top_into
            .as_deref()
            .map(|split| BoxControllerConfig::expand(split, "split_top_into"))
            .transpose()?;

        Ok(Self {
            config,
            split_into,
            split_top_into,
            next_id: AtomicU64::new(0),
            counts: Mutex::new(DepthCounts::default()),
            disk: RwLock::new(None),
        })
    }

    /// Returns the configuration of the controller.
    #[inline]
    pub fn config(&self) -> &BoxControllerConfig {
        &self.config
    }

    /// Returns the number of events above which a box splits.
    #[inline]
    pub fn split_threshold(&self) -> usize {
        self.config.split_threshold
    }

    /// Returns the maximum depth of the tree.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Returns the fanout used to split a box at the given depth.
    #[inline]
    pub fn split_for_depth(&self, depth: usize) -> [usize; D] {
        match (depth, self.split_top_into) {
            (0, Some(top)) => top,
            _ => self.split_into,
        }
    }

    /// Returns `true` if a box at `depth` holding `n_points` events should split.
    #[inline]
    pub fn will_split(&self, n_points: u64, depth: usize) -> bool {
        n_points > self.config.split_threshold as u64 && depth < self.config.max_depth
    }

    /// Returns a fresh id. Ids are never reused.
    #[inline]
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims `count` consecutive ids and returns the first one.
    #[inline]
    pub fn claim_ids(&self, count: usize) -> u64 {
        self.next_id.fetch_add(count as u64, Ordering::Relaxed)
    }

    /// Returns the number of ids handed out so far.
    #[inline]
    pub fn allocated_ids(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Makes sure ids up to `next` are never handed out, used when restoring a saved tree.
    pub(crate) fn reserve_ids(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::Relaxed);
    }

    /// Records a new leaf box at `depth`.
    pub(crate) fn track_leaf(&self, depth: usize) {
        *DepthCounts::at(&mut self.counts.lock().leaves, depth) += 1;
    }

    /// Records a new grid box at `depth`, restored from a saved tree.
    pub(crate) fn track_grid(&self, depth: usize) {
        *DepthCounts::at(&mut self.counts.lock().grids, depth) += 1;
    }

    /// Records that a leaf at `depth` became a grid box with `children` leaves.
    pub(crate) fn track_split(&self, depth: usize, children: usize) {
        let mut counts = self.counts.lock();
        let leaves = DepthCounts::at(&mut counts.leaves, depth);
        *leaves = leaves.saturating_sub(1);
        *DepthCounts::at(&mut counts.grids, depth) += 1;
        *DepthCounts::at(&mut counts.leaves, depth + 1) += children;
    }

    /// Returns the backing file, if the workspace has one.
    #[inline]
    pub fn disk(&self) -> Option<Arc<DiskBuffer<D>>> {
        self.disk.read().clone()
    }

    /// Returns `true` if the workspace has a backing file.
    #[inline]
    pub fn is_file_backed(&self) -> bool {
        self.disk.read().is_some()
    }

    /// Attaches a backing file, returning the previous one.
    pub fn set_file(&self, disk: Option<Arc<DiskBuffer<D>>>) -> Option<Arc<DiskBuffer<D>>> {
        std::mem::replace(&mut *self.disk.write(), disk)
    }

    /// Returns a snapshot of the bookkeeping.
    pub fn stats(&self) -> BoxControllerStats {
        let counts = self.counts.lock().clone();
        let mut stats = BoxControllerStats {
            leaf_boxes_by_depth: counts.leaves,
            grid_boxes_by_depth: counts.grids,
            allocated_ids: self.allocated_ids(),
            ..Default::default()
        };

        if let Some(disk) = self.disk() {
            let (file_events, free_blocks) = disk.usage();
            stats.file_backed = true;
            stats.file_events = file_events;
            stats.free_blocks = free_blocks;
            stats.loaded_events = disk.loaded_events();
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_single_split_factor() {
        let config = BoxControllerConfig::default().with_split_into(4);
        let bc = BoxController::<3>::new(config).unwrap();
        assert_eq!(bc.split_for_depth(0), [4; 3]);
        assert_eq!(bc.split_for_depth(3), [4; 3]);
    }

    #[test]
    fn split_top_into_only_applies_to_root() {
        let config = BoxControllerConfig::default()
            .with_split_into_per_dim([2, 3])
            .with_split_top_into([10, 20]);
        let bc = BoxController::<2>::new(config).unwrap();

        assert_eq!(bc.split_for_depth(0), [10, 20]);
        assert_eq!(bc.split_for_depth(1), [2, 3]);
    }

    #[test]
    fn rejects_bad_configuration() {
        let zero = BoxControllerConfig::default().with_split_into_per_dim([2, 0, 2]);
        assert!(matches!(
            BoxController::<3>::new(zero),
            Err(Error::InvalidArgument { what: "split_into", .. })
        ));

        let mismatched = BoxControllerConfig::default().with_split_into_per_dim([2, 2]);
        assert!(matches!(
            BoxController::<3>::new(mismatched),
            Err(Error::DimensionMismatch { expected: 3, found: 2, .. })
        ));

        let threshold = BoxControllerConfig::default().with_split_threshold(0);
        assert!(BoxController::<3>::new(threshold).is_err());
    }

    #[test]
    fn will_split_respects_threshold_and_depth() {
        let config = BoxControllerConfig::default()
            .with_split_threshold(10)
            .with_max_depth(2);
        let bc = BoxController::<1>::new(config).unwrap();

        assert!(!bc.will_split(10, 0));
        assert!(bc.will_split(11, 0));
        assert!(bc.will_split(11, 1));
        assert!(!bc.will_split(1_000, 2));
    }

    #[test]
    fn ids_are_monotonic_and_contiguous() {
        let bc = BoxController::<2>::new(BoxControllerConfig::default()).unwrap();

        assert_eq!(bc.allocate_id(), 0);
        assert_eq!(bc.claim_ids(4), 1);
        assert_eq!(bc.allocate_id(), 5);
        bc.reserve_ids(3);
        assert_eq!(bc.allocate_id(), 6);
        bc.reserve_ids(100);
        assert_eq!(bc.allocate_id(), 100);
    }

    #[test]
    fn tracks_boxes_by_depth() {
        let bc = BoxController::<2>::new(BoxControllerConfig::default()).unwrap();
        bc.track_leaf(0);
        bc.track_split(0, 4);
        bc.track_split(1, 4);

        let stats = bc.stats();
        assert_eq!(stats.leaf_boxes_by_depth, vec![0, 3, 4]);
        assert_eq!(stats.grid_boxes_by_depth, vec![1, 1]);
        assert_eq!(stats.total_boxes(), 9);
        assert!(!stats.file_backed);
    }
}
