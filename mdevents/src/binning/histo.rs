use crate::{event::Totals, tree::Divisions};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Value given to the signal and error of masked bins.
///
/// A signalling NaN, so masked bins can be told apart from bins whose computation produced an
/// ordinary NaN.
#[inline]
pub fn masked() -> f64 {
    f64::from_bits(0x7FF4_0000_0000_0000)
}

/// An axis of a [`HistoWorkspace`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoDimension {
    /// Name of the axis, from the binned dimension.
    pub name: String,
    /// Units of the axis, from the binned dimension.
    pub units: String,
    /// Index of the binned dimension of the workspace.
    pub source: usize,
    /// Lower edge of the axis.
    pub min: f32,
    /// Upper edge of the axis.
    pub max: f32,
    /// Number of bins along the axis.
    pub bins: usize,
}

impl HistoDimension {
    /// Returns the width of one bin.
    #[inline]
    pub fn bin_width(&self) -> f32 {
        self.divisions().width()
    }

    /// Returns the centre of bin `k`.
    #[inline]
    pub fn bin_center(&self, k: usize) -> f32 {
        self.divisions().center(k)
    }

    /// Returns the edges of the bins, `bins + 1` values.
    pub fn bin_edges(&self) -> Vec<f32> {
        let divisions = self.divisions();
        (0..=self.bins).map(|k| divisions.bound(k)).collect()
    }

    #[inline]
    pub(crate) fn divisions(&self) -> Divisions {
        Divisions::new(self.min, self.max, self.bins)
    }
}

/// A dense N-dimensional histogram, the output of binning.
///
/// Arrays are stored with output dimension 0 varying fastest. Masked bins have a signalling
/// NaN signal and error, see [`masked`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoWorkspace {
    dimensions: Vec<HistoDimension>,
    strides: Vec<usize>,
    signal: Vec<f64>,
    error_squared: Vec<f64>,
    n_events: Vec<u64>,
}

impl HistoWorkspace {
    pub(crate) fn new(dimensions: Vec<HistoDimension>) -> Self {
        let mut strides = Vec::with_capacity(dimensions.len());
        let mut len = 1;
        for dimension in &dimensions {
            strides.push(len);
            len *= dimension.bins;
        }

        Self {
            dimensions,
            strides,
            signal: vec![0.0; len],
            error_squared: vec![0.0; len],
            n_events: vec![0; len],
        }
    }

    /// Returns the axes of the histogram.
    #[inline]
    pub fn dimensions(&self) -> &[HistoDimension] {
        &self.dimensions
    }

    /// Returns the stride of each axis in the linear bin index.
    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Returns the number of bins.
    #[inline]
    pub fn len(&self) -> usize {
        self.signal.len()
    }

    /// Returns `true` if the histogram has no bins.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.signal.is_empty()
    }

    /// Returns the total signal of each bin.
    #[inline]
    pub fn signal(&self) -> &[f64] {
        &self.signal
    }

    /// Returns the total squared error of each bin.
    #[inline]
    pub fn error_squared(&self) -> &[f64] {
        &self.error_squared
    }

    /// Returns the number of events in each bin.
    #[inline]
    pub fn n_events(&self) -> &[u64] {
        &self.n_events
    }

    /// Returns the linear index of the bin at the given per-axis indices.
    pub fn linear_index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.dimensions.len() {
            return None;
        }
        indices
            .iter()
            .zip(&self.dimensions)
            .zip(&self.strides)
            .try_fold(0, |linear, ((&k, dimension), &stride)| {
                (k < dimension.bins).then_some(linear + k * stride)
            })
    }

    /// Returns the per-axis indices of the bin at the given linear index.
    pub fn indices(&self, linear: usize) -> Vec<usize> {
        self.dimensions
            .iter()
            .zip(&self.strides)
            .map(|(dimension, &stride)| (linear / stride) % dimension.bins)
            .collect()
    }

    /// Returns the signal of the bin at the given per-axis indices.
    #[inline]
    pub fn signal_at(&self, indices: &[usize]) -> Option<f64> {
        self.linear_index(indices).map(|i| self.signal[i])
    }

    /// Returns the signal of each bin divided by the volume of a bin.
    pub fn normalized_signal(&self) -> Vec<f64> {
        let volume: f64 = self
            .dimensions
            .iter()
            .map(|d| f64::from(d.bin_width()))
            .product();
        self.signal.iter().map(|s| s / volume).collect()
    }

    /// Returns the centre of the bin along each axis.
    pub fn bin_center(&self, linear: usize) -> Vec<f32> {
        self.indices(linear)
            .into_iter()
            .zip(&self.dimensions)
            .map(|(k, dimension)| dimension.bin_center(k))
            .collect()
    }

    /// Returns `true` if the bin was masked.
    #[inline]
    pub fn is_masked(&self, linear: usize) -> bool {
        self.signal[linear].to_bits() == masked().to_bits()
    }

    /// Returns the total signal of the unmasked bins.
    pub fn total_signal(&self) -> f64 {
        (0..self.len())
            .filter(|&i| !self.is_masked(i))
            .map(|i| self.signal[i])
            .sum()
    }

    pub(crate) fn mask(&mut self, linear: usize) {
        self.signal[linear] = masked();
        self.error_squared[linear] = masked();
    }

    /// Splits the histogram in consecutive chunks of `len` bins.
    pub(crate) fn chunks_mut(&mut self, len: usize) -> impl Iterator<Item = HistoChunk<'_>> {
        self.signal
            .chunks_mut(len)
            .zip(self.error_squared.chunks_mut(len))
            .zip(self.n_events.chunks_mut(len))
            .enumerate()
            .map(move |(i, ((signal, error_squared), n_events))| HistoChunk {
                offset: i * len,
                signal,
                error_squared,
                n_events,
            })
    }
}

/// A mutable range of consecutive bins of a [`HistoWorkspace`].
#[derive(Debug)]
pub(crate) struct HistoChunk<'h> {
    pub(crate) offset: usize,
    signal: &'h mut [f64],
    error_squared: &'h mut [f64],
    n_events: &'h mut [u64],
}

impl HistoChunk<'_> {
    /// Returns the range of linear indices covered by the chunk.
    #[inline]
    pub(crate) fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.signal.len()
    }

    /// Adds totals to the bin at the given linear index, returning `false` if the bin is not in
    /// the chunk.
    #[inline]
    pub(crate) fn add(&mut self, linear: usize, totals: &Totals) -> bool {
        let Some(i) = linear.checked_sub(self.offset).filter(|&i| i < self.signal.len()) else {
            return false;
        };
        self.signal[i] += totals.signal;
        self.error_squared[i] += totals.error_squared;
        self.n_events[i] += totals.n_points;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histo() -> HistoWorkspace {
        HistoWorkspace::new(vec![
            HistoDimension {
                name: "x".into(),
                units: "m".into(),
                source: 0,
                min: 0.0,
                max: 4.0,
                bins: 4,
            },
            HistoDimension {
                name: "y".into(),
                units: "m".into(),
                source: 1,
                min: -1.0,
                max: 1.0,
                bins: 2,
            },
        ])
    }

    #[test]
    fn indexing_is_dimension_zero_fastest() {
        let histo = histo();
        assert_eq!(histo.len(), 8);
        assert_eq!(histo.strides(), &[1, 4]);
        assert_eq!(histo.linear_index(&[3, 1]), Some(7));
        assert_eq!(histo.linear_index(&[4, 0]), None);
        assert_eq!(histo.indices(6), vec![2, 1]);
        assert_eq!(histo.bin_center(6), vec![2.5, 0.5]);
        assert_eq!(histo.dimensions()[1].bin_edges(), vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn chunks_cover_histogram() {
        let mut histo = histo();
        let totals = Totals {
            n_points: 2,
            signal: 3.0,
            error_squared: 4.0,
        };

        for mut chunk in histo.chunks_mut(3) {
            for linear in chunk.range() {
                assert!(chunk.add(linear, &totals));
            }
            assert!(!chunk.add(chunk.range().end, &totals));
        }

        assert!(histo.signal().iter().all(|&s| s == 3.0));
        assert_eq!(histo.n_events().iter().sum::<u64>(), 16);
    }

    #[test]
    fn masked_bins_are_excluded() {
        let mut histo = histo();
        histo.signal[0] = 1.0;
        histo.signal[1] = 2.0;
        histo.mask(1);

        assert!(histo.is_masked(1));
        assert!(histo.signal()[1].is_nan());
        assert!(!f64::NAN.to_bits().eq(&masked().to_bits()));
        assert_eq!(histo.total_signal(), 1.0);
    }
}
