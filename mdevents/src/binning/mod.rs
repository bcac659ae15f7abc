//! Binning turns the tree into a dense [`HistoWorkspace`] over a subset of its dimensions.
//!
//! Binned dimensions are axis aligned: each output axis evenly divides a range of one input
//! dimension. Input dimensions that are not binned are integrated over their full extent. Two
//! strategies compute the same histogram:
//!
//! - [`BinningStrategy::IterateEvents`] walks the leaves overlapping each chunk of the output and
//!   drops their events in the bins. A leaf lying entirely inside one bin contributes its totals
//!   without visiting its events.
//! - [`BinningStrategy::Centerpoint`] asks the tree for the totals of each bin, descending only
//!   into the boxes the bin partly overlaps.
//!
//! Both rely on the cached totals of grid boxes, so the tree must be refreshed after adding
//! events and before binning.

mod centerpoint;
mod histo;
mod iterate;

pub use histo::{masked, HistoDimension, HistoWorkspace};

use crate::{
    error::{Error, Result},
    event::Totals,
    implicit::ImplicitFunction,
    progress::Progress,
    storage::DiskBuffer,
    tree::{BoundingBox, Divisions, Node},
    workspace::Dimension,
    Scheduler,
};
use std::{array, ops::Range};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An axis-aligned region of input space accumulating the totals of the events inside it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bin<const D: usize> {
    /// Half-open region of the bin. Unbounded dimensions use infinite bounds.
    pub extents: BoundingBox<[f32; D]>,
    /// Totals of the events found so far.
    pub totals: Totals,
}

impl<const D: usize> Bin<D> {
    /// Creates a new empty [`Bin`].
    #[inline]
    pub fn new(extents: BoundingBox<[f32; D]>) -> Self {
        Self {
            extents,
            totals: Totals::default(),
        }
    }
}

/// Reference to a dimension of a workspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Axis {
    /// Dimension at the given index.
    Index(usize),
    /// Dimension with the given name.
    Name(String),
}

/// An output axis of a binning: a range of an input dimension evenly divided in bins.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BinDimension {
    /// The binned input dimension.
    pub axis: Axis,
    /// Lower edge of the first bin.
    pub min: f32,
    /// Upper edge of the last bin.
    pub max: f32,
    /// Number of bins.
    pub bins: usize,
}

impl BinDimension {
    /// Bins the input dimension at `index`.
    #[inline]
    pub fn index(index: usize, min: f32, max: f32, bins: usize) -> Self {
        Self {
            axis: Axis::Index(index),
            min,
            max,
            bins,
        }
    }

    /// Bins the input dimension called `name`.
    #[inline]
    pub fn named(name: impl Into<String>, min: f32, max: f32, bins: usize) -> Self {
        Self {
            axis: Axis::Name(name.into()),
            min,
            max,
            bins,
        }
    }
}

/// Algorithm used to fill the histogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinningStrategy {
    /// Walk the leaves overlapping each chunk of output and bin their events.
    #[default]
    IterateEvents,
    /// Query the tree for the totals of each bin.
    Centerpoint,
}

/// Parameters of a binning.
#[derive(Clone, Copy)]
pub struct BinningRequest<'f, const D: usize> {
    /// Output axes, the first varying fastest in the histogram arrays.
    pub dimensions: &'f [BinDimension],
    /// Algorithm used to fill the histogram.
    pub strategy: BinningStrategy,
    /// Bins whose centre is outside this region are masked.
    pub filter: Option<&'f dyn ImplicitFunction<D>>,
}

impl<'f, const D: usize> BinningRequest<'f, D> {
    /// Creates a new [`BinningRequest`] with the default strategy and no filter.
    #[inline]
    pub fn new(dimensions: &'f [BinDimension]) -> Self {
        Self {
            dimensions,
            strategy: BinningStrategy::default(),
            filter: None,
        }
    }

    /// Sets the strategy.
    #[inline]
    pub fn with_strategy(mut self, strategy: BinningStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the masking filter.
    #[inline]
    pub fn with_filter(mut self, filter: &'f dyn ImplicitFunction<D>) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl<const D: usize> std::fmt::Debug for BinningRequest<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinningRequest")
            .field("dimensions", &self.dimensions)
            .field("strategy", &self.strategy)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A validated binning: output axes resolved against the dimensions of a workspace.
#[derive(Clone, Debug)]
pub(crate) struct Plan<const D: usize> {
    axes: Vec<(usize, Divisions)>,
    strides: Vec<usize>,
    extents: BoundingBox<[f32; D]>,
}

impl<const D: usize> Plan<D> {
    /// Resolves and validates the output axes, returning the plan and the empty histogram.
    pub(crate) fn new(
        request: &[BinDimension],
        dimensions: &[Dimension],
        extents: BoundingBox<[f32; D]>,
    ) -> Result<(Self, HistoWorkspace)> {
        if request.is_empty() || request.len() > D {
            return Err(Error::invalid(
                "binning dimensions",
                format!("expected between 1 and {D} output dimensions, found {}", request.len()),
            ));
        }

        let mut outputs = Vec::with_capacity(request.len());
        let mut len = 1usize;
        for dimension in request {
            let source = match &dimension.axis {
                &Axis::Index(index) => (index < D).then_some(index).ok_or(Error::DimensionNotFound {
                    index,
                    available: D,
                })?,
                Axis::Name(name) => dimensions
                    .iter()
                    .position(|d| &d.name == name)
                    .ok_or_else(|| Error::DimensionNameNotFound { name: name.clone() })?,
            };

            if outputs.iter().any(|o: &HistoDimension| o.source == source) {
                return Err(Error::invalid(
                    "binning dimensions",
                    format!("dimension {source} is binned twice"),
                ));
            }
            if dimension.bins == 0 {
                return Err(Error::invalid("bins", "every output dimension needs at least one bin"));
            }
            let finite = dimension.min.is_finite() && dimension.max.is_finite();
            if !(finite && dimension.min < dimension.max) {
                return Err(Error::invalid(
                    "binning range",
                    format!("[{}, {}) is not a valid range", dimension.min, dimension.max),
                ));
            }
            len = len
                .checked_mul(dimension.bins)
                .ok_or_else(|| Error::invalid("bins", "too many bins"))?;

            outputs.push(HistoDimension {
                name: dimensions[source].name.clone(),
                units: dimensions[source].units.clone(),
                source,
                min: dimension.min,
                max: dimension.max,
                bins: dimension.bins,
            });
        }

        let histo = HistoWorkspace::new(outputs);
        let plan = Self {
            axes: histo
                .dimensions()
                .iter()
                .map(|d| (d.source, d.divisions()))
                .collect(),
            strides: histo.strides().to_vec(),
            extents,
        };

        Ok((plan, histo))
    }

    /// Returns the linear index of the bin containing the point.
    #[inline]
    fn bin_of(&self, point: &[f32; D]) -> Option<usize> {
        self.axes
            .iter()
            .zip(&self.strides)
            .try_fold(0, |linear, (&(source, divisions), &stride)| {
                divisions.index_of(point[source]).map(|k| linear + k * stride)
            })
    }

    /// Returns the linear index of the bin containing the whole box, if a single bin does.
    #[inline]
    fn box_bin(&self, extents: &BoundingBox<[f32; D]>) -> Option<usize> {
        self.axes
            .iter()
            .zip(&self.strides)
            .try_fold(0, |linear, (&(source, divisions), &stride)| {
                let (min, max) = (extents.min[source], extents.max[source]);
                if min < divisions.min || max > divisions.max {
                    return None;
                }
                let cells = divisions.overlapping(min, max);
                (cells.len() == 1).then(|| linear + cells.start * stride)
            })
    }

    #[inline]
    fn sub_index(&self, linear: usize, axis: usize) -> usize {
        (linear / self.strides[axis]) % self.axes[axis].1.n
    }

    /// Returns the region of input space covered by a bin.
    fn bin_extents(&self, linear: usize) -> BoundingBox<[f32; D]> {
        let mut extents = BoundingBox::everything();
        for (axis, &(source, divisions)) in self.axes.iter().enumerate() {
            let k = self.sub_index(linear, axis);
            extents.min[source] = divisions.bound(k);
            extents.max[source] = divisions.bound(k + 1);
        }
        extents
    }

    /// Returns the centre of a bin in input space, using the centre of the workspace along
    /// dimensions that aren't binned.
    fn bin_center(&self, linear: usize) -> [f32; D] {
        let mut center = self.extents.center();
        for (axis, &(source, divisions)) in self.axes.iter().enumerate() {
            center[source] = divisions.center(self.sub_index(linear, axis));
        }
        center
    }

    /// Returns the region of input space covered by the bins whose index along the slowest
    /// output axis is in `range`.
    fn slab(&self, range: Range<usize>) -> BoundingBox<[f32; D]> {
        let last = self.axes.len() - 1;
        let mut extents = BoundingBox::everything();
        for (axis, &(source, divisions)) in self.axes.iter().enumerate() {
            let (lo, hi) = match axis == last {
                true => (range.start, range.end),
                false => (0, divisions.n),
            };
            extents.min[source] = divisions.bound(lo);
            extents.max[source] = divisions.bound(hi);
        }
        extents
    }

    /// Returns the number of bins along the slowest output axis and its stride.
    fn slowest(&self) -> (usize, usize) {
        let last = self.axes.len() - 1;
        (self.axes[last].1.n, self.strides[last])
    }
}

/// Fills the histogram with the events of the tree and applies the mask.
pub(crate) fn bin_to_histo<const D: usize, S>(
    root: &Node<D>,
    disk: Option<&DiskBuffer<D>>,
    plan: &Plan<D>,
    request: &BinningRequest<'_, D>,
    histo: &mut HistoWorkspace,
    scheduler: &S,
    progress: &Progress,
) -> Result<()>
where
    S: Scheduler + ?Sized,
{
    progress.set_total(histo.len() as u64);
    tracing::debug!(
        bins = histo.len(),
        strategy = ?request.strategy,
        masked = request.filter.is_some(),
        "binning"
    );

    match request.strategy {
        BinningStrategy::IterateEvents => {
            iterate::bin_all(root, disk, plan, histo, scheduler, progress)?
        }
        BinningStrategy::Centerpoint => {
            centerpoint::bin_all(root, disk, plan, histo, scheduler, progress)?
        }
    }

    if let Some(filter) = request.filter {
        for linear in 0..histo.len() {
            if !filter.contains(&plan.bin_center(linear)) {
                histo.mask(linear);
            }
        }
    }

    Ok(())
}
