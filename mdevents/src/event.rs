/// A single weighted point in `D`-dimensional space.
///
/// Events are plain values: they never know which box holds them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event<const D: usize> {
    /// Weight of the event.
    pub signal: f32,
    /// Squared uncertainty of the weight.
    pub error_squared: f32,
    /// Position of the event.
    pub center: [f32; D],
}

impl<const D: usize> Event<D> {
    /// Creates a new [`Event`].
    #[inline]
    pub const fn new(signal: f32, error_squared: f32, center: [f32; D]) -> Self {
        Self {
            signal,
            error_squared,
            center,
        }
    }

    /// Creates an [`Event`] of unit signal and unit error at the given position.
    #[inline]
    pub const fn unit(center: [f32; D]) -> Self {
        Self::new(1.0, 1.0, center)
    }

    /// Returns the uncertainty of the signal.
    #[inline]
    pub fn error(&self) -> f32 {
        self.error_squared.sqrt()
    }
}

impl<const D: usize> Default for Event<D> {
    #[inline]
    fn default() -> Self {
        Self::new(0.0, 0.0, [0.0; D])
    }
}

/// Trait for records that can be stored as an [`Event`].
///
/// It can be derived for structs with a `signal` field, an `error_squared` or `error` field and a
/// `center` or `coordinates` field:
///
/// ```
/// use mdevents::prelude::*;
///
/// #[derive(Measured)]
/// struct Neutron {
///     center: [f32; 3],
///     signal: f32,
///     error: f32,
///     tof: f64,
/// }
///
/// let n = Neutron { center: [1.0, 2.0, 3.0], signal: 2.0, error: 0.5, tof: 1e4 };
/// assert_eq!(n.to_event(), Event::new(2.0, 0.25, [1.0, 2.0, 3.0]));
/// ```
pub trait Measured {
    /// Coordinates type of the record, `[f32; D]` for a `D`-dimensional workspace.
    type Coordinates;

    /// Returns the weight of the record.
    fn signal(&self) -> f32;

    /// Returns the squared uncertainty of the weight.
    fn error_squared(&self) -> f32;

    /// Returns the position of the record.
    fn coordinates(&self) -> Self::Coordinates;

    /// Converts the record to an [`Event`].
    #[inline]
    fn to_event<const D: usize>(&self) -> Event<D>
    where
        Self: Measured<Coordinates = [f32; D]>,
    {
        Event::new(self.signal(), self.error_squared(), self.coordinates())
    }
}

impl<const D: usize> Measured for Event<D> {
    type Coordinates = [f32; D];

    #[inline]
    fn signal(&self) -> f32 {
        self.signal
    }

    #[inline]
    fn error_squared(&self) -> f32 {
        self.error_squared
    }

    #[inline]
    fn coordinates(&self) -> [f32; D] {
        self.center
    }
}

impl<const D: usize> Measured for ([f32; D], f32) {
    type Coordinates = [f32; D];

    #[inline]
    fn signal(&self) -> f32 {
        self.1
    }

    #[inline]
    fn error_squared(&self) -> f32 {
        self.1
    }

    #[inline]
    fn coordinates(&self) -> [f32; D] {
        self.0
    }
}

/// Sums of a set of events. Stored as `f64` so that billions of `f32` weights add up without
/// losing precision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Totals {
    /// Number of events.
    pub n_points: u64,
    /// Sum of the signals.
    pub signal: f64,
    /// Sum of the squared errors.
    pub error_squared: f64,
}

impl Totals {
    /// Returns the [`Totals`] of the given events.
    #[inline]
    pub fn of<const D: usize>(events: &[Event<D>]) -> Self {
        events.iter().fold(Self::default(), |mut totals, e| {
            totals.push(e);
            totals
        })
    }

    /// Accounts for one more event.
    #[inline]
    pub fn push<const D: usize>(&mut self, event: &Event<D>) {
        self.n_points += 1;
        self.signal += f64::from(event.signal);
        self.error_squared += f64::from(event.error_squared);
    }
}

impl std::ops::AddAssign for Totals {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.n_points += rhs.n_points;
        self.signal += rhs.signal;
        self.error_squared += rhs.error_squared;
    }
}

impl std::iter::Sum for Totals {
    #[inline]
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, t| {
            acc += t;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_is_unit_error_record() {
        let record = ([1.0, -1.0], 4.0);
        assert_eq!(record.to_event(), Event::new(4.0, 4.0, [1.0, -1.0]));
    }

    #[test]
    fn totals_accumulate_in_double_precision() {
        let events = vec![Event::new(0.1, 0.01, [0.0; 3]); 1_000_000];
        let totals = Totals::of(&events);

        assert_eq!(totals.n_points, 1_000_000);
        assert!((totals.signal - 100_000.0).abs() < 1e-2);
        assert!((totals.error_squared - 10_000.0).abs() < 1e-3);
    }

    #[test]
    fn totals_sum() {
        let a = Totals::of(&[Event::unit([0.0]), Event::unit([1.0])]);
        let b = Totals::of(&[Event::new(3.0, 2.0, [0.5])]);
        let sum: Totals = [a, b].into_iter().sum();

        assert_eq!(sum.n_points, 3);
        assert_eq!(sum.signal, 5.0);
        assert_eq!(sum.error_squared, 4.0);
    }
}
