use crate::{
    error::{Error, Result},
    event::Event,
    implicit::ImplicitFunction,
    storage::DiskBuffer,
    tree::{BoundingBox, LeafBox, LeafData, Node, Residency},
};
use parking_lot::RwLockReadGuard;
use std::sync::Arc;

/// Events of the current position, materialised on first access.
enum Materialized<'a, const D: usize> {
    /// Events of a leaf, held in place. `evict` is set when the iterator loaded them from the
    /// backing file itself.
    Leaf {
        leaf: &'a LeafBox<D>,
        data: RwLockReadGuard<'a, LeafData<D>>,
        evict: bool,
    },
    /// Events gathered from every leaf below a grid box.
    Gathered(Vec<Event<D>>),
}

impl<const D: usize> Materialized<'_, D> {
    #[inline]
    fn events(&self) -> &[Event<D>] {
        match self {
            Self::Leaf { data, .. } => &data.events,
            Self::Gathered(events) => events,
        }
    }
}

/// A restartable traversal over a flattened, filtered list of boxes of a tree.
///
/// The list is computed once, at construction, in depth-first order. The iterator starts
/// positioned on the first box, if any. Event accessors load the events of the current box on
/// first use; events the iterator had to load from the backing file are dropped again when it
/// moves on.
///
/// While its events are materialised, the iterator holds a read lock on the current leaf. Adding
/// an event to that leaf from the same thread, for instance through
/// [`EventWorkspace::add_event`](crate::EventWorkspace::add_event), deadlocks. Drop the iterator
/// or [`advance`](Self::advance) it first.
///
/// ```
/// use mdevents::prelude::*;
///
/// let dimensions = vec![Dimension::new("x", "m", 0.0, 4.0)];
/// let mut workspace = EventWorkspace::<1>::new(dimensions, BoxControllerConfig::default())?;
/// workspace.add_events(&[Event::unit([0.5]), Event::unit([3.5])]);
///
/// let mut iterator = workspace.create_iterator(usize::MAX, true, None);
/// assert!(iterator.valid());
/// assert_eq!(iterator.num_events()?, 2);
/// assert_eq!(iterator.inner_position(1, 0)?, 3.5);
/// assert!(!iterator.advance());
/// # Ok::<(), mdevents::Error>(())
/// ```
pub struct BoxIterator<'a, const D: usize> {
    nodes: Vec<&'a Node<D>>,
    position: usize,
    disk: Option<Arc<DiskBuffer<D>>>,
    materialized: Option<Materialized<'a, D>>,
}

impl<'a, const D: usize> BoxIterator<'a, D> {
    /// Creates a new [`BoxIterator`] over the boxes of the tree rooted at `root`.
    ///
    /// Boxes deeper than `max_depth` are skipped and grid boxes at `max_depth` are visited as if
    /// they were leaves. With `leaf_only`, grid boxes above that depth are skipped. Subtrees
    /// outside the filter region are pruned; the filter is only tested against box extents.
    pub fn new(
        root: &'a Node<D>,
        disk: Option<Arc<DiskBuffer<D>>>,
        max_depth: usize,
        leaf_only: bool,
        filter: Option<&dyn ImplicitFunction<D>>,
    ) -> Self {
        let mut nodes = Vec::new();
        root.collect(&mut nodes, max_depth, leaf_only, filter);
        tracing::trace!(boxes = nodes.len(), max_depth, leaf_only, "created box iterator");

        Self {
            nodes,
            position: 0,
            disk,
            materialized: None,
        }
    }

    /// Returns the number of boxes visited by the iterator.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no box matched.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns all the boxes visited by the iterator.
    #[inline]
    pub fn nodes(&self) -> &[&'a Node<D>] {
        &self.nodes
    }

    /// Returns the current position.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns `true` if the iterator is positioned on a box.
    #[inline]
    pub fn valid(&self) -> bool {
        self.position < self.nodes.len()
    }

    /// Returns the current box.
    #[inline]
    pub fn node(&self) -> Option<&'a Node<D>> {
        self.nodes.get(self.position).copied()
    }

    /// Moves to the next box, returning `true` if there is one.
    #[inline]
    pub fn advance(&mut self) -> bool {
        self.advance_by(1)
    }

    /// Moves `skip` boxes forward, returning `true` if the iterator is still on a box.
    pub fn advance_by(&mut self, skip: usize) -> bool {
        self.jump_to(self.position.saturating_add(skip))
    }

    /// Moves to the box at `index`, returning `true` if there is one.
    pub fn jump_to(&mut self, index: usize) -> bool {
        if index != self.position {
            self.release();
            self.position = index.min(self.nodes.len());
        }
        self.valid()
    }

    /// Returns the extents of the current box.
    #[inline]
    pub fn extents(&self) -> Option<&'a BoundingBox<[f32; D]>> {
        self.node().map(Node::extents)
    }

    /// Returns the `2^D` corners of the current box.
    pub fn vertexes(&self) -> Option<Vec<[f32; D]>> {
        self.extents().map(|extents| extents.vertices().collect())
    }

    /// Returns the centre of the current box.
    #[inline]
    pub fn center(&self) -> Option<[f32; D]> {
        self.extents().map(BoundingBox::center)
    }

    /// Returns the total signal of the current box.
    #[inline]
    pub fn signal(&self) -> Option<f64> {
        self.node().map(Node::signal)
    }

    /// Returns the total error of the current box.
    #[inline]
    pub fn error(&self) -> Option<f64> {
        self.node().map(|node| node.error_squared().sqrt())
    }

    /// Returns the signal of the current box divided by its volume.
    #[inline]
    pub fn normalized_signal(&self) -> Option<f64> {
        self.node().map(Node::normalized_signal)
    }

    /// Returns the events of the current box, loading them if needed.
    pub fn events(&mut self) -> Result<&[Event<D>]> {
        if self.materialized.is_none() {
            self.materialized = Some(self.materialize()?);
        }
        Ok(self.materialized.as_ref().map_or(&[][..], Materialized::events))
    }

    /// Returns the number of events of the current box.
    #[inline]
    pub fn num_events(&mut self) -> Result<usize> {
        self.events().map(<[_]>::len)
    }

    /// Returns coordinate `dim` of event `index` of the current box.
    pub fn inner_position(&mut self, index: usize, dim: usize) -> Result<f32> {
        if dim >= D {
            return Err(Error::DimensionNotFound {
                index: dim,
                available: D,
            });
        }
        self.event(index).map(|event| event.center[dim])
    }

    /// Returns the signal of event `index` of the current box.
    #[inline]
    pub fn inner_signal(&mut self, index: usize) -> Result<f32> {
        self.event(index).map(|event| event.signal)
    }

    /// Returns the error of event `index` of the current box.
    #[inline]
    pub fn inner_error(&mut self, index: usize) -> Result<f32> {
        self.event(index).map(|event| event.error())
    }

    fn event(&mut self, index: usize) -> Result<Event<D>> {
        let events = self.events()?;
        events.get(index).copied().ok_or_else(|| {
            Error::invalid(
                "event index",
                format!("{index} is out of range for a box of {} events", events.len()),
            )
        })
    }

    fn materialize(&self) -> Result<Materialized<'a, D>> {
        let node = self
            .node()
            .ok_or_else(|| Error::invalid("iterator position", "the iterator is exhausted"))?;
        let disk = self.disk.as_deref();

        match node {
            Node::Leaf(leaf) => {
                let evict = match (disk, leaf.residency()) {
                    (Some(disk), Residency::OnDisk) => leaf.load(disk)?,
                    (None, Residency::OnDisk) => return Err(Error::NotFileBacked),
                    _ => false,
                };
                Ok(Materialized::Leaf {
                    leaf,
                    data: leaf.read_data(),
                    evict,
                })
            }
            Node::Grid(_) => {
                let mut events = Vec::new();
                node.for_each_leaf(&mut |leaf| {
                    leaf.with_events(disk, |e| events.extend_from_slice(e))
                })?;
                Ok(Materialized::Gathered(events))
            }
        }
    }

    fn release(&mut self) {
        if let Some(Materialized::Leaf { leaf, data, evict }) = self.materialized.take() {
            drop(data);
            if let (true, Some(disk)) = (evict, &self.disk) {
                leaf.evict_if_clean(disk);
            }
        }
    }
}

impl<const D: usize> Drop for BoxIterator<'_, D> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<const D: usize> std::fmt::Debug for BoxIterator<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxIterator")
            .field("len", &self.nodes.len())
            .field("position", &self.position)
            .field("materialized", &self.materialized.is_some())
            .finish()
    }
}
