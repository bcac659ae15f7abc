use crate::{
    binning::Bin,
    controller::BoxController,
    error::{Error, Result},
    event::{Event, Totals},
    storage::DiskBuffer,
    tree::{BoundingBox, Divisions, LeafBox, Node},
    Scheduler, Task,
};
use std::array;

/// Returns the stride of each dimension in the linear child index and the number of children.
///
/// Dimension 0 varies fastest.
#[inline]
pub(crate) fn strides<const D: usize>(split: &[usize; D]) -> ([usize; D], usize) {
    let mut strides = [0; D];
    let mut count = 1;
    for (stride, &s) in strides.iter_mut().zip(split) {
        *stride = count;
        count *= s;
    }
    (strides, count)
}

/// An internal box of the tree, evenly dividing its extents in a dense grid of children.
///
/// The totals of a grid box are a cache: adding events below it leaves them stale until
/// [`Node::refresh_cache`] is called.
#[derive(Debug)]
pub struct GridBox<const D: usize> {
    id: u64,
    depth: usize,
    extents: BoundingBox<[f32; D]>,
    divisions: [Divisions; D],
    strides: [usize; D],
    children: Vec<Node<D>>,
    totals: Totals,
}

impl<const D: usize> GridBox<D> {
    /// Turns a leaf into a grid box, redistributing its events to new leaf children.
    ///
    /// The grid takes over the id of the leaf and the children get consecutive new ids. The leaf
    /// is left empty and any slot it had in the backing file is freed.
    pub fn from_leaf(leaf: &mut LeafBox<D>, controller: &BoxController<D>) -> Result<Self> {
        let depth = leaf.depth();
        let extents = *leaf.extents();
        let split = controller.split_for_depth(depth);
        let (strides, count) = strides(&split);

        let disk = controller.disk();
        let events = leaf.take_events(disk.as_deref())?;
        let first = controller.claim_ids(count);

        let mut grid = Self {
            id: leaf.id(),
            depth,
            extents,
            divisions: array::from_fn(|i| Divisions::new(extents.min[i], extents.max[i], split[i])),
            strides,
            children: Vec::with_capacity(count),
            totals: Totals::of(&events),
        };

        let mut buckets = vec![Vec::new(); count];
        for event in events {
            buckets[grid.child_index(&event.center)].push(event);
        }
        grid.children = buckets
            .into_iter()
            .enumerate()
            .map(|(index, events)| {
                let id = first + index as u64;
                Node::Leaf(LeafBox::from_events(id, depth + 1, grid.child_extents(index), events))
            })
            .collect();

        controller.track_split(depth, count);
        tracing::trace!(
            id = grid.id,
            depth,
            n_points = grid.totals.n_points,
            children = count,
            "split box"
        );

        Ok(grid)
    }

    /// Rebuilds a grid box from its children, as read from a backing file.
    pub(crate) fn restore(
        id: u64,
        depth: usize,
        extents: BoundingBox<[f32; D]>,
        split: [usize; D],
        children: Vec<Node<D>>,
        totals: Totals,
    ) -> Result<Self> {
        let (strides, count) = strides(&split);
        if count != children.len() {
            return Err(Error::structure(format!(
                "grid box {id} split {split:?} should have {count} children, found {}",
                children.len()
            )));
        }

        Ok(Self {
            id,
            depth,
            extents,
            divisions: array::from_fn(|i| Divisions::new(extents.min[i], extents.max[i], split[i])),
            strides,
            children,
            totals,
        })
    }

    /// Returns the id of the box.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the depth of the box, 0 for the root.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the extents of the box.
    #[inline]
    pub fn extents(&self) -> &BoundingBox<[f32; D]> {
        &self.extents
    }

    /// Returns the number of children along each dimension.
    #[inline]
    pub fn split(&self) -> [usize; D] {
        self.divisions.map(|d| d.n)
    }

    /// Returns the children, dimension 0 varying fastest.
    #[inline]
    pub fn children(&self) -> &[Node<D>] {
        &self.children
    }

    /// Returns the cached totals of the box.
    #[inline]
    pub fn totals(&self) -> Totals {
        self.totals
    }

    /// Returns the cached number of events below the box.
    #[inline]
    pub fn n_points(&self) -> u64 {
        self.totals.n_points
    }

    /// Returns the index of the child whose extents contain the position.
    ///
    /// Positions outside the box are clamped to the nearest child.
    #[inline]
    pub fn child_index(&self, position: &[f32; D]) -> usize {
        (0..D).fold(0, |index, i| {
            index + self.divisions[i].locate(position[i]) * self.strides[i]
        })
    }

    /// Returns the extents of the child at the given index.
    #[inline]
    pub fn child_extents(&self, index: usize) -> BoundingBox<[f32; D]> {
        let sub: [usize; D] = array::from_fn(|i| (index / self.strides[i]) % self.divisions[i].n);
        BoundingBox::new(
            array::from_fn(|i| self.divisions[i].bound(sub[i])),
            array::from_fn(|i| self.divisions[i].bound(sub[i] + 1)),
        )
    }

    /// Routes an event to the child containing it.
    #[inline]
    pub fn add_event(&self, event: Event<D>) {
        self.children[self.child_index(&event.center)].add_event(event);
    }

    /// Splits every descendant leaf holding too many events, in parallel for large subtrees.
    pub fn split_all_if_needed<S>(
        &mut self,
        controller: &BoxController<D>,
        scheduler: &S,
    ) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        let min_points = controller.config().task_min_points;
        let mut tasks = Vec::new();

        for child in &mut self.children {
            let n_points = child.n_points();
            let pending = match child {
                Node::Leaf(leaf) => controller.will_split(n_points, leaf.depth()),
                Node::Grid(_) => true,
            };

            match (pending, n_points >= min_points) {
                (false, _) => {}
                (true, true) => tasks.push(Task::new(n_points, move || {
                    child.split_all_if_needed(controller, scheduler)
                })),
                (true, false) => child.split_all_if_needed(controller, scheduler)?,
            }
        }

        scheduler.execute(tasks)
    }

    /// Recomputes the cached totals of every descendant, then of the box itself.
    pub fn refresh_cache<S>(&mut self, controller: &BoxController<D>, scheduler: &S) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        let min_points = controller.config().task_min_points;
        let mut tasks = Vec::new();

        for child in &mut self.children {
            match child {
                Node::Leaf(leaf) => leaf.refresh_cache(),
                Node::Grid(grid) => {
                    let cost = grid.totals.n_points;
                    if cost >= min_points {
                        tasks.push(Task::new(cost, move || {
                            grid.refresh_cache(controller, scheduler)
                        }));
                    } else {
                        grid.refresh_cache(controller, scheduler)?;
                    }
                }
            }
        }
        scheduler.execute(tasks)?;

        self.totals = self.children.iter().map(Node::totals).sum();
        Ok(())
    }

    /// Accumulates the events inside the bin, visiting only the children overlapping it.
    pub(crate) fn centerpoint_bin(
        &self,
        bin: &mut Bin<D>,
        disk: Option<&DiskBuffer<D>>,
    ) -> Result<()> {
        let ranges: [_; D] = array::from_fn(|i| {
            self.divisions[i].overlapping(bin.extents.min[i], bin.extents.max[i])
        });
        if ranges.iter().any(|range| range.is_empty()) {
            return Ok(());
        }

        let mut sub: [usize; D] = array::from_fn(|i| ranges[i].start);
        loop {
            let index: usize = (0..D).map(|i| sub[i] * self.strides[i]).sum();
            self.children[index].centerpoint_bin(bin, disk)?;

            let mut i = 0;
            loop {
                sub[i] += 1;
                if sub[i] < ranges[i].end {
                    break;
                }
                sub[i] = ranges[i].start;
                i += 1;
                if i == D {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controller::BoxControllerConfig, sequential::Inline};

    fn controller(split: usize, threshold: usize) -> BoxController<2> {
        BoxController::new(
            BoxControllerConfig::default()
                .with_split_into(split)
                .with_split_threshold(threshold)
                .with_max_depth(3),
        )
        .unwrap()
    }

    fn unit_square_leaf(controller: &BoxController<2>, events: usize) -> LeafBox<2> {
        let id = controller.allocate_id();
        controller.track_leaf(0);
        let events = (0..events)
            .map(|i| {
                let cell = [i % 10, i / 10 % 10];
                Event::unit(cell.map(|c| c as f32 * 0.1 + 0.05))
            })
            .collect();
        LeafBox::from_events(id, 0, BoundingBox::new([0.0; 2], [1.0; 2]), events)
    }

    #[test]
    fn split_distributes_events_and_ids() {
        let controller = controller(5, 10);
        let mut leaf = unit_square_leaf(&controller, 100);
        let grid = GridBox::from_leaf(&mut leaf, &controller).unwrap();

        assert_eq!(grid.id(), 0);
        assert_eq!(grid.children().len(), 25);
        assert_eq!(grid.n_points(), 100);
        assert_eq!(leaf.n_points(), 0);

        for (index, child) in grid.children().iter().enumerate() {
            assert_eq!(child.id(), 1 + index as u64);
            assert_eq!(child.depth(), 1);
            assert_eq!(child.n_points(), 4);
            let leaf = child.as_leaf().unwrap();
            for event in leaf.events(None).unwrap() {
                assert!(child.extents().contains(&event.center));
            }
        }

        let stats = controller.stats();
        assert_eq!(stats.leaf_boxes_by_depth, vec![0, 25]);
        assert_eq!(stats.grid_boxes_by_depth, vec![1]);
    }

    #[test]
    fn children_tile_the_parent() {
        let controller = controller(3, 10);
        let mut leaf = LeafBox::new(0, 0, BoundingBox::new([-1.3, 0.1], [2.9, 7.7]));
        let grid = GridBox::from_leaf(&mut leaf, &controller).unwrap();

        let volume: f64 = grid.children().iter().map(|c| c.extents().volume()).sum();
        let expected = grid.extents().volume();
        assert!((volume - expected).abs() <= 1e-6 * expected);

        for (index, child) in grid.children().iter().enumerate() {
            assert_eq!(grid.child_index(&child.extents().min), index);
            assert_eq!(grid.child_index(&child.extents().center()), index);
        }
    }

    #[test]
    fn recursive_split_and_refresh() {
        let controller = controller(2, 10);
        let mut root = Node::Leaf(unit_square_leaf(&controller, 100));
        let scheduler = Inline::default();

        root.split_all_if_needed(&controller, &scheduler).unwrap();
        root.refresh_cache(&controller, &scheduler).unwrap();
        assert_eq!(root.n_points(), 100);

        let mut stack = vec![&root];
        while let Some(node) = stack.pop() {
            match node {
                Node::Leaf(leaf) => {
                    assert!(leaf.n_points() <= 10 || leaf.depth() == controller.max_depth())
                }
                Node::Grid(grid) => {
                    let sum: u64 = grid.children().iter().map(Node::n_points).sum();
                    assert_eq!(sum, grid.n_points());
                    stack.extend(grid.children());
                }
            }
        }
    }

    #[test]
    fn refresh_hands_large_subtrees_to_the_scheduler() {
        let controller = BoxController::new(
            BoxControllerConfig::default()
                .with_split_into(2)
                .with_split_threshold(10)
                .with_task_min_points(1),
        )
        .unwrap();
        let mut root = Node::Leaf(unit_square_leaf(&controller, 100));
        let scheduler = Inline::default();
        root.split_all_if_needed(&controller, &scheduler).unwrap();
        root.refresh_cache(&controller, &scheduler).unwrap();
        assert!(root.children().iter().any(|child| !child.is_leaf()));

        for _ in 0..20 {
            root.add_event(Event::new(2.0, 4.0, [0.05, 0.05]));
        }
        assert_eq!(root.n_points(), 100);

        root.refresh_cache(&controller, &scheduler).unwrap();
        assert_eq!(root.n_points(), 120);
        assert_eq!(root.signal(), 140.0);
        assert_eq!(root.error_squared(), 180.0);
    }
}
