use crate::{
    binning::{self, BinDimension, BinningRequest, BinningStrategy, HistoWorkspace, Plan},
    controller::{BoxController, BoxControllerConfig, BoxControllerStats},
    error::{Error, Result},
    event::{Event, Measured, Totals},
    implicit::ImplicitFunction,
    iterator::BoxIterator,
    progress::Progress,
    storage::{DiskBuffer, FileSlot, Footer, NodeKind, NodeRow},
    tree::{BoundingBox, Centroid, Cylinder, GridBox, LeafBox, Node, Sphere},
    Scheduler, Task,
};
use std::{
    array,
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Descriptor of one axis of a workspace.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dimension {
    /// Name of the axis, unique within a workspace.
    pub name: String,
    /// Units of the coordinates along the axis.
    pub units: String,
    /// Lower bound of the axis.
    pub min: f32,
    /// Upper bound of the axis, excluded.
    pub max: f32,
}

impl Dimension {
    /// Creates a new [`Dimension`].
    pub fn new(name: impl Into<String>, units: impl Into<String>, min: f32, max: f32) -> Self {
        Self {
            name: name.into(),
            units: units.into(),
            min,
            max,
        }
    }
}

/// Metadata attached to a workspace. Stored and restored with the tree, never interpreted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExperimentInfo {
    /// Name of the experiment.
    pub name: String,
    /// Run number of the experiment.
    pub run_number: u64,
    /// Free-form key/value logs.
    pub logs: BTreeMap<String, String>,
}

impl ExperimentInfo {
    /// Creates a new [`ExperimentInfo`] without logs.
    pub fn new(name: impl Into<String>, run_number: u64) -> Self {
        Self {
            name: name.into(),
            run_number,
            logs: BTreeMap::new(),
        }
    }
}

/// How [`EventWorkspace::load`] treats the events of a saved tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadMode {
    /// Read every event into memory and close the file.
    #[default]
    InMemory,
    /// Keep the file as the backing file and load events on demand.
    FileBacked,
}

/// A `D`-dimensional event workspace: the dimensions, the box tree and its controller.
///
/// Structural operations (splitting, refreshing caches, bulk loading) take `&mut self`; queries
/// take `&self`. Queries rely on the cached totals of grid boxes, so call
/// [`refresh_cache`](Self::refresh_cache) after adding events and before binning or integrating.
#[derive(Debug)]
pub struct EventWorkspace<const D: usize> {
    dimensions: Vec<Dimension>,
    root: Node<D>,
    controller: BoxController<D>,
    experiment_infos: Vec<ExperimentInfo>,
}

impl<const D: usize> EventWorkspace<D> {
    /// Creates a new, empty [`EventWorkspace`] whose root box spans the dimensions.
    pub fn new(dimensions: Vec<Dimension>, config: BoxControllerConfig) -> Result<Self> {
        Error::check_len(D, dimensions.len(), "workspace dimensions")?;
        for dimension in &dimensions {
            let valid = dimension.min.is_finite()
                && dimension.max.is_finite()
                && dimension.min < dimension.max;
            if !valid {
                return Err(Error::invalid(
                    "dimension extents",
                    format!(
                        "'{}' spans [{}, {}), expected finite bounds with min < max",
                        dimension.name, dimension.min, dimension.max
                    ),
                ));
            }
        }

        let controller = BoxController::new(config)?;
        let extents = BoundingBox::new(
            array::from_fn(|i| dimensions[i].min),
            array::from_fn(|i| dimensions[i].max),
        );
        let root = Node::Leaf(LeafBox::new(controller.allocate_id(), 0, extents));
        controller.track_leaf(0);

        tracing::debug!(dimensions = D, ?extents, "created workspace");

        Ok(Self {
            dimensions,
            root,
            controller,
            experiment_infos: Vec::new(),
        })
    }

    /// Returns the descriptors of the dimensions.
    #[inline]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Returns the descriptor of dimension `index`.
    pub fn dimension(&self, index: usize) -> Result<&Dimension> {
        self.dimensions.get(index).ok_or(Error::DimensionNotFound {
            index,
            available: D,
        })
    }

    /// Returns the index of the dimension called `name`.
    pub fn dimension_index(&self, name: &str) -> Result<usize> {
        self.dimensions
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| Error::DimensionNameNotFound { name: name.into() })
    }

    /// Returns the extents of the workspace.
    #[inline]
    pub fn extents(&self) -> &BoundingBox<[f32; D]> {
        self.root.extents()
    }

    /// Returns the controller of the tree.
    #[inline]
    pub fn controller(&self) -> &BoxController<D> {
        &self.controller
    }

    /// Returns the root box.
    #[inline]
    pub fn root(&self) -> &Node<D> {
        &self.root
    }

    /// Returns the number of events, as of the last cache refresh for split trees.
    #[inline]
    pub fn n_points(&self) -> u64 {
        self.root.n_points()
    }

    /// Returns the total signal, as of the last cache refresh for split trees.
    #[inline]
    pub fn signal(&self) -> f64 {
        self.root.signal()
    }

    /// Returns the total squared error, as of the last cache refresh for split trees.
    #[inline]
    pub fn error_squared(&self) -> f64 {
        self.root.error_squared()
    }

    /// Returns a snapshot of the bookkeeping of the controller.
    #[inline]
    pub fn stats(&self) -> BoxControllerStats {
        self.controller.stats()
    }

    /// Returns `true` if the workspace has a backing file.
    #[inline]
    pub fn is_file_backed(&self) -> bool {
        self.controller.is_file_backed()
    }

    /// Returns the box with the given id.
    #[inline]
    pub fn get_box(&self, id: u64) -> Result<&Node<D>> {
        self.root.find(id)
    }

    /// Returns the metadata attached to the workspace.
    #[inline]
    pub fn experiment_infos(&self) -> &[ExperimentInfo] {
        &self.experiment_infos
    }

    /// Attaches metadata to the workspace, returning its index.
    pub fn add_experiment_info(&mut self, info: ExperimentInfo) -> usize {
        self.experiment_infos.push(info);
        self.experiment_infos.len() - 1
    }

    /// Adds an event, returning `false` if it lies outside the workspace.
    #[inline]
    pub fn add_event(&self, event: Event<D>) -> bool {
        let inside = self.extents().contains(&event.center);
        if inside {
            self.root.add_event(event);
        }
        inside
    }

    /// Adds events on the calling thread, returning how many were inside the workspace.
    ///
    /// Boxes are not split; call [`split_all_if_needed`](Self::split_all_if_needed) afterwards.
    pub fn add_events(&self, events: &[Event<D>]) -> usize {
        let added = events.iter().filter(|&&event| self.add_event(event)).count();
        warn_dropped(events.len(), added);
        added
    }

    /// Converts records with [`Measured`] and adds them, returning how many were inside the
    /// workspace.
    pub fn add_measured<M>(&self, records: &[M]) -> usize
    where
        M: Measured<Coordinates = [f32; D]>,
    {
        let added = records
            .iter()
            .filter(|record| self.add_event(record.to_event()))
            .count();
        warn_dropped(records.len(), added);
        added
    }

    /// Adds a large batch of events with the scheduler, returning how many were inside the
    /// workspace.
    ///
    /// The batch is added in blocks of `events_per_task * tasks_per_block` events. The events of
    /// a block are spread over tasks by contiguous slices, and boxes are split between blocks.
    /// A file-backed workspace writes out and evicts its leaves whenever the loaded events
    /// exceed the memory limit of the controller.
    pub fn add_many_events<S>(
        &mut self,
        events: &[Event<D>],
        scheduler: &S,
        progress: &Progress,
    ) -> Result<usize>
    where
        S: Scheduler + ?Sized,
    {
        let config = self.controller.config();
        let per_task = config.events_per_task;
        let per_block = per_task.saturating_mul(config.tasks_per_block);
        let memory_limit = config.memory_limit_events;

        progress.set_total(events.len() as u64);
        if self.root.is_leaf()
            && self
                .controller
                .will_split(self.root.n_points() + events.len() as u64, 0)
        {
            self.split_box()?;
        }

        let added = AtomicUsize::new(0);
        let mut pending = 0u64;

        for block in events.chunks(per_block) {
            if progress.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (root, counter) = (&self.root, &added);
            let extents = *root.extents();
            let tasks = block
                .chunks(per_task)
                .map(move |slice| {
                    Task::new(slice.len() as u64, move || {
                        let mut n = 0;
                        for &event in slice.iter().filter(|e| extents.contains(&e.center)) {
                            root.add_event(event);
                            n += 1;
                        }
                        counter.fetch_add(n, Ordering::Relaxed);
                        progress.report_n(slice.len() as u64, None);
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            tracing::debug!(events = block.len(), tasks = tasks.len(), "adding block of events");
            scheduler.execute(tasks)?;
            self.root.split_all_if_needed(&self.controller, scheduler)?;

            pending += block.len() as u64;
            if let Some(disk) = self.controller.disk() {
                if disk.loaded_events() + pending > memory_limit {
                    tracing::debug!(loaded = disk.loaded_events(), pending, "evicting leaves");
                    self.release_events()?;
                    pending = 0;
                }
            }
        }

        let added = added.into_inner();
        warn_dropped(events.len(), added);
        Ok(added)
    }

    /// Turns a root leaf into a grid box, returning `false` if the root is already split.
    pub fn split_box(&mut self) -> Result<bool> {
        self.root.split(&self.controller)
    }

    /// Splits every leaf holding more events than the split threshold.
    pub fn split_all_if_needed<S>(&mut self, scheduler: &S) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        self.root.split_all_if_needed(&self.controller, scheduler)
    }

    /// Recomputes the cached totals of every box.
    pub fn refresh_cache<S>(&mut self, scheduler: &S) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        self.root.refresh_cache(&self.controller, scheduler)
    }

    /// Creates a [`BoxIterator`] over the boxes of the tree.
    pub fn create_iterator(
        &self,
        max_depth: usize,
        leaf_only: bool,
        filter: Option<&dyn ImplicitFunction<D>>,
    ) -> BoxIterator<'_, D> {
        BoxIterator::new(&self.root, self.controller.disk(), max_depth, leaf_only, filter)
    }

    /// Bins the events of the workspace into a dense histogram.
    pub fn bin_to_histo<S>(
        &self,
        request: &BinningRequest<'_, D>,
        scheduler: &S,
        progress: &Progress,
    ) -> Result<HistoWorkspace>
    where
        S: Scheduler + ?Sized,
    {
        let (plan, mut histo) = Plan::new(request.dimensions, &self.dimensions, *self.extents())?;
        let disk = self.controller.disk();

        binning::bin_to_histo(
            &self.root,
            disk.as_deref(),
            &plan,
            request,
            &mut histo,
            scheduler,
            progress,
        )?;

        tracing::info!(bins = histo.len(), strategy = ?request.strategy, "binned workspace");
        Ok(histo)
    }

    /// Bins the events of the workspace by querying the tree once per output bin.
    pub fn centerpoint_bin_to_histo<S>(
        &self,
        dimensions: &[BinDimension],
        filter: Option<&dyn ImplicitFunction<D>>,
        scheduler: &S,
        progress: &Progress,
    ) -> Result<HistoWorkspace>
    where
        S: Scheduler + ?Sized,
    {
        let request = BinningRequest {
            dimensions,
            strategy: BinningStrategy::Centerpoint,
            filter,
        };
        self.bin_to_histo(&request, scheduler, progress)
    }

    /// Returns the totals of the events inside a sphere.
    pub fn integrate_sphere(&self, center: [f32; D], radius: f32) -> Result<Totals> {
        let disk = self.controller.disk();
        let sphere = Sphere::new(center, radius)?;
        self.root.integrate(&sphere, disk.as_deref())
    }

    /// Returns the totals of the events inside a cylinder.
    pub fn integrate_cylinder(
        &self,
        center: [f32; D],
        axis: [f32; D],
        radius: f32,
        length: f32,
    ) -> Result<Totals> {
        let cylinder = Cylinder::new(center, axis, radius, length)?;
        let disk = self.controller.disk();
        self.root.integrate(&cylinder, disk.as_deref())
    }

    /// Returns the signal-weighted centroid of the events inside a sphere, `None` if their total
    /// signal is zero.
    pub fn centroid_sphere(&self, center: [f32; D], radius: f32) -> Result<Option<[f64; D]>> {
        let sphere = Sphere::new(center, radius)?;
        let disk = self.controller.disk();
        let mut centroid = Centroid::default();
        self.root.centroid(&sphere, disk.as_deref(), &mut centroid)?;
        Ok(centroid.position())
    }

    /// Writes the workspace to a new file at `path`.
    ///
    /// The workspace keeps its current backing, if any. Saving to the path of the backing file
    /// is the same as [`flush_cache`](Self::flush_cache). Cached totals of grid boxes are saved
    /// as they are.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = self.controller.disk();
        if source.as_deref().is_some_and(|disk| disk.path() == path) {
            return self.flush_cache();
        }

        let target = DiskBuffer::<D>::create(path)?;
        let footer = self.footer(&target, &mut |leaf| {
            leaf.with_events(source.as_deref(), |events| {
                if events.is_empty() {
                    return Ok(FileSlot::default());
                }
                let slot = target.allocate(events.len() as u64);
                target.write_events(slot, events).map(|()| slot)
            })?
        })?;
        target.write_footer(&footer)?;
        target.flush()?;

        tracing::info!(path = %path.display(), boxes = footer.rows.len(), "saved workspace");
        Ok(())
    }

    /// Creates a backing file at `path` and writes every leaf to it.
    pub fn set_file_backed(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.controller.is_file_backed() {
            return Err(Error::invalid("backing file", "the workspace already has one"));
        }

        let path = path.as_ref();
        self.controller
            .set_file(Some(Arc::new(DiskBuffer::create(path)?)));
        self.flush_cache()?;

        tracing::info!(path = %path.display(), "workspace is file backed");
        Ok(())
    }

    /// Writes every modified leaf and the tree structure to the backing file.
    pub fn flush_cache(&self) -> Result<()> {
        let disk = self.controller.disk().ok_or(Error::NotFileBacked)?;
        self.root.for_each_leaf(&mut |leaf| leaf.save(&disk))?;
        self.write_structure(&disk)
    }

    /// Writes every leaf to the backing file and drops its events from memory.
    pub fn release_events(&self) -> Result<()> {
        let disk = self.controller.disk().ok_or(Error::NotFileBacked)?;
        self.root.for_each_leaf(&mut |leaf| leaf.release(&disk))?;
        self.write_structure(&disk)
    }

    /// Reads a workspace saved with [`save`](Self::save) or backed by a file.
    pub fn load(path: impl AsRef<Path>, mode: LoadMode) -> Result<Self> {
        let path = path.as_ref();
        let (disk, footer) = DiskBuffer::<D>::open(path)?;
        let Footer {
            dimensions,
            experiment_infos,
            config,
            next_id,
            rows,
            ..
        } = footer;
        Error::check_len(D, dimensions.len(), "saved dimensions")?;

        let controller = BoxController::new(config)?;
        controller.reserve_ids(next_id);

        let root = rows
            .iter()
            .find(|row| row.depth == 0)
            .ok_or_else(|| Error::structure("no root box"))?;
        let root = restore(root, &rows, &controller, &disk, mode)?;

        if mode == LoadMode::FileBacked {
            controller.set_file(Some(Arc::new(disk)));
        }

        tracing::info!(
            path = %path.display(),
            boxes = rows.len(),
            n_points = root.n_points(),
            ?mode,
            "loaded workspace"
        );

        Ok(Self {
            dimensions,
            root,
            controller,
            experiment_infos,
        })
    }

    fn write_structure(&self, disk: &DiskBuffer<D>) -> Result<()> {
        let footer = self.footer(disk, &mut |leaf| Ok(leaf.file_slot().unwrap_or_default()))?;
        disk.write_footer(&footer)?;
        disk.flush()
    }

    /// Builds the footer describing the tree, asking `slot_of` where the events of each leaf are.
    fn footer(
        &self,
        disk: &DiskBuffer<D>,
        slot_of: &mut dyn FnMut(&LeafBox<D>) -> Result<FileSlot>,
    ) -> Result<Footer<D>> {
        let mut rows = Vec::new();
        let mut stack = vec![&self.root];

        while let Some(node) = stack.pop() {
            let totals = node.totals();
            let (kind, events, children) = match node {
                Node::Leaf(leaf) => (NodeKind::Leaf, slot_of(leaf)?, (0, 0)),
                Node::Grid(grid) => {
                    let children = grid.children();
                    let first = children.first().map_or(0, Node::id);
                    let contiguous = children
                        .iter()
                        .zip(first..)
                        .all(|(child, id)| child.id() == id);
                    if !contiguous {
                        return Err(Error::structure(format!(
                            "children of grid box {} do not have contiguous ids",
                            grid.id()
                        )));
                    }
                    stack.extend(children);
                    (NodeKind::Grid, FileSlot::default(), (first, children.len() as u64))
                }
            };

            rows.push(NodeRow {
                id: node.id(),
                kind,
                depth: node.depth() as u32,
                events,
                signal: totals.signal,
                error_squared: totals.error_squared,
                n_points: totals.n_points,
                inverse_volume: node.inverse_volume(),
                extents: *node.extents(),
                children,
            });
        }
        rows.sort_unstable_by_key(|row| row.id);

        Ok(Footer {
            dimensions: self.dimensions.clone(),
            experiment_infos: self.experiment_infos.clone(),
            config: self.controller.config().clone(),
            next_id: self.controller.allocated_ids(),
            rows,
            free: disk.free_blocks(),
        })
    }
}

fn warn_dropped(total: usize, added: usize) {
    if added < total {
        tracing::warn!(dropped = total - added, "events outside the workspace were dropped");
    }
}

/// Rebuilds the subtree of `row` from the rows of a saved tree, sorted by id.
fn restore<const D: usize>(
    row: &NodeRow<D>,
    rows: &[NodeRow<D>],
    controller: &BoxController<D>,
    disk: &DiskBuffer<D>,
    mode: LoadMode,
) -> Result<Node<D>> {
    let depth = row.depth as usize;
    let totals = Totals {
        n_points: row.n_points,
        signal: row.signal,
        error_squared: row.error_squared,
    };

    match row.kind {
        NodeKind::Leaf => {
            controller.track_leaf(depth);
            let leaf = match mode {
                LoadMode::FileBacked => {
                    LeafBox::on_disk(row.id, depth, row.extents, totals, row.events)
                }
                LoadMode::InMemory => {
                    let mut events = Vec::new();
                    if row.events.count > 0 {
                        disk.read_events(row.events, &mut events)?;
                    }
                    LeafBox::from_events(row.id, depth, row.extents, events)
                }
            };
            Ok(Node::Leaf(leaf))
        }
        NodeKind::Grid => {
            let (first, count) = row.children;
            let end = first.checked_add(count).ok_or_else(|| {
                Error::structure(format!("children of grid box {} overflow the id range", row.id))
            })?;
            let children = (first..end)
                .map(|id| {
                    let child = rows
                        .binary_search_by_key(&id, |r| r.id)
                        .map(|i| &rows[i])
                        .map_err(|_| {
                            let reason = format!("child {id} of grid box {} is missing", row.id);
                            Error::structure(reason)
                        })?;
                    if row.depth.checked_add(1) != Some(child.depth) {
                        return Err(Error::structure(format!(
                            "child {id} of grid box {} is at depth {}",
                            row.id, child.depth
                        )));
                    }
                    restore(child, rows, controller, disk, mode)
                })
                .collect::<Result<Vec<_>>>()?;

            let first = children
                .first()
                .map(|child| *child.extents())
                .ok_or_else(|| Error::structure(format!("grid box {} has no children", row.id)))?;
            let split = array::from_fn(|i| {
                let width = row.extents.max[i] - row.extents.min[i];
                (width / (first.max[i] - first.min[i])).round() as usize
            });

            controller.track_grid(depth);
            GridBox::restore(row.id, depth, row.extents, split, children, totals).map(Node::Grid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{binning::BinDimension, sequential::Inline, tree::Residency};
    use tempfile::TempDir;

    fn workspace(threshold: usize) -> EventWorkspace<2> {
        let dimensions = vec![
            Dimension::new("x", "m", 0.0, 8.0),
            Dimension::new("y", "m", 0.0, 8.0),
        ];
        let config = BoxControllerConfig::default()
            .with_split_into(2)
            .with_split_threshold(threshold)
            .with_batching(16, 2)
            .with_task_min_points(32);
        EventWorkspace::new(dimensions, config).unwrap()
    }

    fn grid_events() -> Vec<Event<2>> {
        (0..64)
            .map(|i| Event::new(2.0, 4.0, [(i % 8) as f32 + 0.5, (i / 8) as f32 + 0.5]))
            .collect()
    }

    #[test]
    fn rejects_bad_dimensions() {
        let config = BoxControllerConfig::default();
        let one = vec![Dimension::new("x", "m", 0.0, 1.0)];
        assert!(matches!(
            EventWorkspace::<2>::new(one, config.clone()),
            Err(Error::DimensionMismatch { expected: 2, found: 1, .. })
        ));

        let inverted = vec![Dimension::new("x", "m", 1.0, 0.0)];
        assert!(EventWorkspace::<1>::new(inverted, config.clone()).is_err());

        let infinite = vec![Dimension::new("x", "m", 0.0, f32::INFINITY)];
        assert!(EventWorkspace::<1>::new(infinite, config).is_err());
    }

    #[test]
    fn dimension_lookup() {
        let workspace = workspace(4);
        assert_eq!(workspace.dimension_index("y").unwrap(), 1);
        assert!(workspace.dimension_index("z").unwrap_err().is_not_found());
        assert!(workspace.dimension(2).unwrap_err().is_not_found());
        assert_eq!(workspace.dimension(0).unwrap().units, "m");
    }

    #[test]
    fn events_outside_are_dropped() {
        let workspace = workspace(1000);
        let events = [
            Event::unit([1.0, 1.0]),
            Event::unit([8.0, 1.0]),
            Event::unit([-0.1, 1.0]),
        ];
        assert_eq!(workspace.add_events(&events), 1);
        assert_eq!(workspace.n_points(), 1);
    }

    #[test]
    fn bulk_add_splits_and_keeps_totals() {
        let mut workspace = workspace(4);
        let scheduler = Inline::default();
        let events = grid_events();

        let added = workspace
            .add_many_events(&events, &scheduler, &Progress::silent())
            .unwrap();
        workspace.refresh_cache(&scheduler).unwrap();

        assert_eq!(added, 64);
        assert_eq!(workspace.n_points(), 64);
        assert_eq!(workspace.signal(), 128.0);
        assert_eq!(workspace.error_squared(), 256.0);
        assert!(workspace.root().as_grid().is_some());
        assert!(workspace.stats().grid_boxes() > 1);
    }

    #[test]
    fn cancelled_bulk_add() {
        let mut workspace = workspace(4);
        let progress = Progress::silent();
        progress.cancel();

        let result = workspace.add_many_events(&grid_events(), &Inline::default(), &progress);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn integration_and_centroid() {
        let mut workspace = workspace(4);
        let scheduler = Inline::default();
        workspace
            .add_many_events(&grid_events(), &scheduler, &Progress::silent())
            .unwrap();
        workspace.refresh_cache(&scheduler).unwrap();

        // The centres of the 4 cells around (4, 4) are at distance sqrt(0.5).
        let totals = workspace.integrate_sphere([4.0, 4.0], 0.8).unwrap();
        assert_eq!(totals.n_points, 4);
        assert_eq!(totals.signal, 8.0);

        let centroid = workspace.centroid_sphere([4.0, 4.0], 0.8).unwrap().unwrap();
        assert!((centroid[0] - 4.0).abs() < 1e-9);
        assert!((centroid[1] - 4.0).abs() < 1e-9);
        assert_eq!(workspace.centroid_sphere([4.0, 4.0], 0.1).unwrap(), None);

        let totals = workspace
            .integrate_cylinder([4.0, 4.0], [1.0, 0.0], 0.6, 8.0)
            .unwrap();
        assert_eq!(totals.n_points, 16);
        assert!(workspace.integrate_sphere([4.0, 4.0], -1.0).is_err());
        assert!(workspace.centroid_sphere([4.0, 4.0], f32::NAN).is_err());
    }

    #[test]
    fn centerpoint_entry_point() {
        let mut workspace = workspace(4);
        let scheduler = Inline::default();
        workspace
            .add_many_events(&grid_events(), &scheduler, &Progress::silent())
            .unwrap();
        workspace.refresh_cache(&scheduler).unwrap();

        let histo = workspace
            .centerpoint_bin_to_histo(
                &[BinDimension::named("y", 0.0, 8.0, 2)],
                None,
                &scheduler,
                &Progress::silent(),
            )
            .unwrap();
        assert_eq!(histo.signal(), &[64.0, 64.0]);
        assert_eq!(histo.n_events(), &[32, 32]);
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workspace.mde");
        let scheduler = Inline::default();

        let mut workspace = workspace(4);
        workspace.add_experiment_info(ExperimentInfo::new("calibration", 12));
        workspace
            .add_many_events(&grid_events(), &scheduler, &Progress::silent())
            .unwrap();
        workspace.refresh_cache(&scheduler).unwrap();
        workspace.save(&path).unwrap();

        for mode in [LoadMode::InMemory, LoadMode::FileBacked] {
            let loaded = EventWorkspace::<2>::load(&path, mode).unwrap();
            assert_eq!(loaded.n_points(), 64);
            assert_eq!(loaded.signal(), workspace.signal());
            assert_eq!(loaded.experiment_infos(), workspace.experiment_infos());
            assert_eq!(loaded.stats().total_boxes(), workspace.stats().total_boxes());
            assert_eq!(loaded.is_file_backed(), mode == LoadMode::FileBacked);
            assert_eq!(
                loaded.controller().allocated_ids(),
                workspace.controller().allocated_ids()
            );
        }
    }

    #[test]
    fn save_rejects_scattered_child_ids() {
        let dir = TempDir::new().unwrap();
        let mut workspace = workspace(4);
        let halves = [
            LeafBox::new(1, 1, BoundingBox::new([0.0, 0.0], [4.0, 8.0])),
            LeafBox::new(3, 1, BoundingBox::new([4.0, 0.0], [8.0, 8.0])),
        ];
        let grid = GridBox::restore(
            0,
            0,
            *workspace.root.extents(),
            [2, 1],
            halves.map(Node::Leaf).into(),
            Totals::default(),
        )
        .unwrap();
        workspace.root = Node::Grid(grid);

        assert!(matches!(
            workspace.save(dir.path().join("scattered.mde")),
            Err(Error::Structure { .. })
        ));
    }

    #[test]
    fn file_backing() {
        let dir = TempDir::new().unwrap();
        let workspace = workspace(1000);
        assert!(matches!(workspace.flush_cache(), Err(Error::NotFileBacked)));

        workspace.add_events(&grid_events());
        workspace.set_file_backed(dir.path().join("backing.mde")).unwrap();
        assert!(workspace.is_file_backed());
        assert!(workspace.set_file_backed(dir.path().join("other.mde")).is_err());

        workspace.release_events().unwrap();
        let leaf = workspace.root().as_leaf().unwrap();
        assert_eq!(leaf.residency(), Residency::OnDisk);
        assert_eq!(workspace.stats().loaded_events, 0);

        let mut iterator = workspace.create_iterator(usize::MAX, true, None);
        assert_eq!(iterator.num_events().unwrap(), 64);
    }
}
