use std::ops::{Neg, Sub};

/// Trait for the element `infinity`.
pub trait Infinity {
    /// `infinity` (∞) value of the type.
    fn infinity() -> Self;
}

/// Trait to compute the midpoint of two numbers.
pub trait MidPoint {
    /// Returns the middle point of `self` and `rhs`.
    fn midpoint(self, rhs: Self) -> Self;
}

macro_rules! impl_floats {
    ($s: ty) => {
        impl Infinity for $s {
            #[inline]
            fn infinity() -> Self {
                Self::INFINITY
            }
        }

        impl MidPoint for $s {
            #[inline]
            fn midpoint(self, rhs: Self) -> Self {
                (self + rhs) / 2.0
            }
        }
    };
}

impl_floats!(f32);
impl_floats!(f64);

/// An axis-aligned bounding box using arrays.
///
/// Points are contained in the half-open region `min <= p < max`, so that the boxes of a
/// [`GridBox`](super::GridBox) tile their parent without overlapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox<A> {
    /// Minimum corner of the box.
    pub min: A,
    /// Maximum corner of the box.
    pub max: A,
}

impl<A> BoundingBox<A> {
    /// Creates a new [`BoundingBox`] with the given min and max values.
    #[inline]
    pub const fn new(min: A, max: A) -> Self {
        Self { min, max }
    }
}

impl<const D: usize, S> BoundingBox<[S; D]> {
    /// Returns a box covering all of space.
    #[inline]
    pub fn everything() -> Self
    where
        S: Neg<Output = S> + Infinity + Copy,
    {
        Self::new([-S::infinity(); D], [S::infinity(); D])
    }

    /// Returns the center of the [`BoundingBox`].
    #[inline]
    pub fn center(&self) -> [S; D]
    where
        S: MidPoint + Copy,
    {
        std::array::from_fn(|i| self.min[i].midpoint(self.max[i]))
    }

    /// Returns the size of the [`BoundingBox`].
    #[inline]
    pub fn size(&self) -> [S; D]
    where
        S: Sub<Output = S> + Copy,
    {
        std::array::from_fn(|i| self.max[i] - self.min[i])
    }

    /// Returns `true` if the position is inside the half-open box.
    #[inline]
    pub fn contains(&self, position: &[S; D]) -> bool
    where
        S: PartialOrd,
    {
        (0..D).all(|i| self.min[i] <= position[i] && position[i] < self.max[i])
    }

    /// Returns `true` if `self` lies entirely inside `other`.
    #[inline]
    pub fn is_inside(&self, other: &Self) -> bool
    where
        S: PartialOrd,
    {
        (0..D).all(|i| self.min[i] >= other.min[i] && self.max[i] <= other.max[i])
    }

    /// Returns `true` if the two half-open boxes share some volume.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool
    where
        S: PartialOrd,
    {
        (0..D).all(|i| self.min[i] < other.max[i] && other.min[i] < self.max[i])
    }

    /// Returns an iterator over the `2^D` corners of the box.
    ///
    /// Bit `i` of the corner index selects `max[i]` over `min[i]`.
    #[inline]
    pub fn vertices(&self) -> impl Iterator<Item = [S; D]> + '_
    where
        S: Copy,
    {
        (0..1usize << D).map(move |corner| {
            std::array::from_fn(|i| match corner & (1 << i) {
                0 => self.min[i],
                _ => self.max[i],
            })
        })
    }
}

impl<const D: usize> BoundingBox<[f32; D]> {
    /// Returns the volume of the box.
    #[inline]
    pub fn volume(&self) -> f64 {
        (0..D)
            .map(|i| f64::from(self.max[i]) - f64::from(self.min[i]))
            .product()
    }

    /// Returns `1 / volume`, the factor turning a signal into a signal density.
    #[inline]
    pub fn inverse_volume(&self) -> f64 {
        self.volume().recip()
    }

    /// Returns half of the length of the main diagonal of the box.
    #[inline]
    pub fn half_diagonal(&self) -> f64 {
        self.size()
            .into_iter()
            .map(|s| f64::from(s) * f64::from(s))
            .sum::<f64>()
            .sqrt()
            * 0.5
    }
}

/// The interval `[min, max)` evenly divided in `n` half-open cells.
///
/// Locating a coordinate always agrees with the cell bounds: `locate(v) == k` if and only if
/// `bound(k) <= v < bound(k + 1)` for coordinates inside the interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Divisions {
    /// Lower bound of the interval.
    pub min: f32,
    /// Upper bound of the interval.
    pub max: f32,
    /// Number of cells.
    pub n: usize,
    inverse_width: f32,
}

impl Divisions {
    /// Creates a new [`Divisions`] of `[min, max)` in `n` cells.
    #[inline]
    pub fn new(min: f32, max: f32, n: usize) -> Self {
        Self {
            min,
            max,
            n,
            inverse_width: n as f32 / (max - min),
        }
    }

    /// Returns the width of one cell.
    #[inline]
    pub fn width(&self) -> f32 {
        (self.max - self.min) / self.n as f32
    }

    /// Returns the lower bound of cell `k`, or `max` for `k == n`.
    #[inline]
    pub fn bound(&self, k: usize) -> f32 {
        match k >= self.n {
            true => self.max,
            false => self.min + (self.max - self.min) * (k as f32 / self.n as f32),
        }
    }

    /// Returns the centre of cell `k`.
    #[inline]
    pub fn center(&self, k: usize) -> f32 {
        (self.bound(k) + self.bound(k + 1)) * 0.5
    }

    /// Returns the cell containing `v`, clamped to the first and last cells.
    #[inline]
    pub fn locate(&self, v: f32) -> usize {
        // Float to integer casts saturate, negative and NaN offsets land in cell 0.
        let last = self.n - 1;
        let mut k = (((v - self.min) * self.inverse_width) as usize).min(last);
        while k > 0 && v < self.bound(k) {
            k -= 1;
        }
        while k < last && v >= self.bound(k + 1) {
            k += 1;
        }
        k
    }

    /// Returns the cell containing `v`, or `None` if `v` is outside `[min, max)`.
    #[inline]
    pub fn index_of(&self, v: f32) -> Option<usize> {
        (self.min <= v && v < self.max).then(|| self.locate(v))
    }

    /// Returns the range of cells overlapping the open-ended interval `[lo, hi)`.
    ///
    /// The range is empty if no cell overlaps it.
    #[inline]
    pub fn overlapping(&self, lo: f32, hi: f32) -> std::ops::Range<usize> {
        let first = match lo {
            lo if lo <= self.min => 0,
            lo if lo >= self.max => self.n,
            lo => self.locate(lo),
        };
        let past = match hi {
            hi if hi <= self.min => 0,
            hi if hi > self.max => self.n,
            hi => {
                let k = self.locate(hi);
                k + usize::from(self.bound(k) < hi)
            }
        };
        first..past.max(first)
    }
}
