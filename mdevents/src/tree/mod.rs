/// Bounding box related traits and types.
pub mod partition;

mod grid;
mod leaf;
mod shape;

pub use grid::GridBox;
pub use leaf::{LeafBox, Residency};
pub use partition::*;
pub use shape::{Cylinder, Shape, Sphere};

pub(crate) use grid::strides;
pub(crate) use leaf::LeafData;

use crate::{
    binning::Bin,
    controller::BoxController,
    error::{Error, Result},
    event::{Event, Totals},
    implicit::{Contact, ImplicitFunction},
    storage::DiskBuffer,
    Scheduler,
};

/// A box of the tree: either a leaf holding events or a grid box holding children.
#[derive(Debug)]
pub enum Node<const D: usize> {
    /// Box holding events.
    Leaf(LeafBox<D>),
    /// Box holding a grid of children.
    Grid(GridBox<D>),
}

impl<const D: usize> Node<D> {
    /// Returns the id of the box.
    #[inline]
    pub fn id(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.id(),
            Self::Grid(grid) => grid.id(),
        }
    }

    /// Returns the depth of the box, 0 for the root.
    #[inline]
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.depth(),
            Self::Grid(grid) => grid.depth(),
        }
    }

    /// Returns the extents of the box.
    #[inline]
    pub fn extents(&self) -> &BoundingBox<[f32; D]> {
        match self {
            Self::Leaf(leaf) => leaf.extents(),
            Self::Grid(grid) => grid.extents(),
        }
    }

    /// Returns the totals of the box. They are always current for leaves and cached for grid
    /// boxes.
    #[inline]
    pub fn totals(&self) -> Totals {
        match self {
            Self::Leaf(leaf) => leaf.totals(),
            Self::Grid(grid) => grid.totals(),
        }
    }

    /// Returns the number of events below the box.
    #[inline]
    pub fn n_points(&self) -> u64 {
        self.totals().n_points
    }

    /// Returns the total signal below the box.
    #[inline]
    pub fn signal(&self) -> f64 {
        self.totals().signal
    }

    /// Returns the total squared error below the box.
    #[inline]
    pub fn error_squared(&self) -> f64 {
        self.totals().error_squared
    }

    /// Returns `1 / volume` of the box.
    #[inline]
    pub fn inverse_volume(&self) -> f64 {
        self.extents().inverse_volume()
    }

    /// Returns the signal divided by the volume of the box.
    #[inline]
    pub fn normalized_signal(&self) -> f64 {
        self.signal() * self.inverse_volume()
    }

    /// Returns the children of the box, empty for leaves.
    #[inline]
    pub fn children(&self) -> &[Node<D>] {
        match self {
            Self::Leaf(_) => &[],
            Self::Grid(grid) => grid.children(),
        }
    }

    /// Returns `true` if the box is a leaf.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Returns the leaf, if the box is one.
    #[inline]
    pub fn as_leaf(&self) -> Option<&LeafBox<D>> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Grid(_) => None,
        }
    }

    /// Returns the grid box, if the box is one.
    #[inline]
    pub fn as_grid(&self) -> Option<&GridBox<D>> {
        match self {
            Self::Leaf(_) => None,
            Self::Grid(grid) => Some(grid),
        }
    }

    /// Adds an event to the leaf containing it. The caller is responsible for the event lying
    /// inside the extents.
    #[inline]
    pub fn add_event(&self, event: Event<D>) {
        match self {
            Self::Leaf(leaf) => leaf.add_event(event),
            Self::Grid(grid) => grid.add_event(event),
        }
    }

    /// Replaces a leaf by a grid box of new leaves. Returns `false` for grid boxes.
    pub fn split(&mut self, controller: &BoxController<D>) -> Result<bool> {
        let grid = match self {
            Self::Leaf(leaf) => GridBox::from_leaf(leaf, controller)?,
            Self::Grid(_) => return Ok(false),
        };
        *self = Self::Grid(grid);
        Ok(true)
    }

    /// Splits the box and its descendants until no leaf holds more events than the split
    /// threshold, or leaves reach the maximum depth.
    pub fn split_all_if_needed<S>(
        &mut self,
        controller: &BoxController<D>,
        scheduler: &S,
    ) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        let split = match self {
            Self::Leaf(leaf) => controller.will_split(leaf.n_points(), leaf.depth()),
            Self::Grid(grid) => return grid.split_all_if_needed(controller, scheduler),
        };

        match split {
            true => {
                self.split(controller)?;
                self.split_all_if_needed(controller, scheduler)
            }
            false => Ok(()),
        }
    }

    /// Recomputes the cached totals of the box and its descendants.
    pub fn refresh_cache<S>(&mut self, controller: &BoxController<D>, scheduler: &S) -> Result<()>
    where
        S: Scheduler + ?Sized,
    {
        match self {
            Self::Leaf(leaf) => {
                leaf.refresh_cache();
                Ok(())
            }
            Self::Grid(grid) => grid.refresh_cache(controller, scheduler),
        }
    }

    /// Accumulates the events of the box that lie inside the bin.
    ///
    /// Boxes entirely inside the bin contribute their cached totals.
    pub fn centerpoint_bin(&self, bin: &mut Bin<D>, disk: Option<&DiskBuffer<D>>) -> Result<()> {
        if self.extents().is_inside(&bin.extents) {
            bin.totals += self.totals();
            return Ok(());
        }

        match self {
            Self::Leaf(leaf) => leaf.centerpoint_bin(bin, disk),
            Self::Grid(grid) => grid.centerpoint_bin(bin, disk),
        }
    }

    /// Returns the totals of the events inside the shape.
    pub fn integrate(&self, shape: &impl Shape<D>, disk: Option<&DiskBuffer<D>>) -> Result<Totals> {
        match shape.classify(self.extents()) {
            Contact::Outside => Ok(Totals::default()),
            Contact::Contained => Ok(self.totals()),
            Contact::Touching => match self {
                Self::Leaf(leaf) => leaf.integrate(shape, disk),
                Self::Grid(grid) => grid
                    .children()
                    .iter()
                    .map(|child| child.integrate(shape, disk))
                    .sum(),
            },
        }
    }

    /// Accumulates the signal-weighted positions of the events inside the shape.
    pub fn centroid(
        &self,
        shape: &impl Shape<D>,
        disk: Option<&DiskBuffer<D>>,
        centroid: &mut Centroid<D>,
    ) -> Result<()> {
        if shape.classify(self.extents()) == Contact::Outside {
            return Ok(());
        }

        match self {
            Self::Leaf(leaf) => leaf.centroid(shape, disk, centroid),
            Self::Grid(grid) => grid
                .children()
                .iter()
                .try_for_each(|child| child.centroid(shape, disk, centroid)),
        }
    }

    /// Appends the boxes of the subtree in depth-first order.
    ///
    /// Grid boxes at `max_depth` are treated as leaves. Subtrees the filter says are outside
    /// its region are skipped.
    pub fn collect<'a>(
        &'a self,
        nodes: &mut Vec<&'a Node<D>>,
        max_depth: usize,
        leaf_only: bool,
        filter: Option<&dyn ImplicitFunction<D>>,
    ) {
        if filter.is_some_and(|f| f.box_contact(self.extents()) == Contact::Outside) {
            return;
        }

        match self {
            Self::Grid(grid) if grid.depth() < max_depth => {
                if !leaf_only {
                    nodes.push(self);
                }
                for child in grid.children() {
                    child.collect(nodes, max_depth, leaf_only, filter);
                }
            }
            _ => nodes.push(self),
        }
    }

    /// Calls `f` on every leaf of the subtree.
    pub fn for_each_leaf<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&LeafBox<D>) -> Result<()>,
    {
        match self {
            Self::Leaf(leaf) => f(leaf),
            Self::Grid(grid) => grid.children().iter().try_for_each(|c| c.for_each_leaf(f)),
        }
    }

    /// Returns the box with the given id.
    pub fn find(&self, id: u64) -> Result<&Node<D>> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.id() == id {
                return Ok(node);
            }
            stack.extend(node.children());
        }
        Err(Error::NodeNotFound { id })
    }
}

/// Running sums of signal and signal-weighted positions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid<const D: usize> {
    /// Sum of the signals.
    pub signal: f64,
    /// Sum of the positions weighted by their signal.
    pub weighted: [f64; D],
}

impl<const D: usize> Default for Centroid<D> {
    #[inline]
    fn default() -> Self {
        Self {
            signal: 0.0,
            weighted: [0.0; D],
        }
    }
}

impl<const D: usize> Centroid<D> {
    /// Accounts for one more event.
    #[inline]
    pub fn push(&mut self, event: &Event<D>) {
        let signal = f64::from(event.signal);
        self.signal += signal;
        for (w, &c) in self.weighted.iter_mut().zip(&event.center) {
            *w += signal * f64::from(c);
        }
    }

    /// Returns the signal-weighted mean position, or `None` without any signal.
    #[inline]
    pub fn position(&self) -> Option<[f64; D]> {
        (self.signal != 0.0).then(|| self.weighted.map(|w| w / self.signal))
    }
}
