use crate::{
    error::{Error, Result},
    tree::BoundingBox,
};

/// How a box relates to the region of an [`ImplicitFunction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Contact {
    /// The box is entirely outside the region.
    Outside,
    /// The box may be partly inside the region.
    Touching,
    /// The box is entirely inside the region.
    Contained,
}

/// Trait for regions of space described by a membership test.
///
/// Used to prune traversals with [`box_contact`](ImplicitFunction::box_contact) and to mask
/// histogram bins with [`contains`](ImplicitFunction::contains).
pub trait ImplicitFunction<const D: usize>: Sync {
    /// Returns `true` if the point is inside the region.
    fn contains(&self, point: &[f32; D]) -> bool;

    /// Returns how the given box relates to the region.
    ///
    /// The default implementation only detects contained boxes and reports everything else as
    /// touching, which never prunes anything.
    #[inline]
    fn box_contact(&self, extents: &BoundingBox<[f32; D]>) -> Contact {
        match extents.vertices().all(|vertex| self.contains(&vertex)) {
            true => Contact::Contained,
            false => Contact::Touching,
        }
    }
}

impl<const D: usize, F: ImplicitFunction<D> + ?Sized> ImplicitFunction<D> for &F {
    #[inline]
    fn contains(&self, point: &[f32; D]) -> bool {
        (**self).contains(point)
    }

    #[inline]
    fn box_contact(&self, extents: &BoundingBox<[f32; D]>) -> Contact {
        (**self).box_contact(extents)
    }
}

/// Intersection of a set of half-spaces `normal . (x - origin) >= 0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaneFunction<const D: usize> {
    planes: Vec<([f32; D], [f32; D])>,
}

impl<const D: usize> PlaneFunction<D> {
    /// Creates a new [`PlaneFunction`] without planes, containing everything.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the half-space on the side of `normal` of the plane through `origin`.
    ///
    /// Both vectors must have one component per dimension.
    pub fn add_plane(&mut self, normal: &[f32], origin: &[f32]) -> Result<&mut Self> {
        Error::check_len(D, normal.len(), "plane normal")?;
        Error::check_len(D, origin.len(), "plane origin")?;
        if normal.iter().all(|&n| n == 0.0) {
            return Err(Error::invalid("plane normal", "must be non-zero"));
        }

        let mut plane = ([0.0; D], [0.0; D]);
        plane.0.copy_from_slice(normal);
        plane.1.copy_from_slice(origin);
        self.planes.push(plane);
        Ok(self)
    }

    /// Returns the number of planes.
    #[inline]
    pub fn len(&self) -> usize {
        self.planes.len()
    }

    /// Returns `true` if the function has no planes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    #[inline]
    fn side(normal: &[f32; D], origin: &[f32; D], point: &[f32; D]) -> f32 {
        (0..D).map(|i| normal[i] * (point[i] - origin[i])).sum()
    }
}

impl<const D: usize> ImplicitFunction<D> for PlaneFunction<D> {
    #[inline]
    fn contains(&self, point: &[f32; D]) -> bool {
        self.planes
            .iter()
            .all(|(normal, origin)| Self::side(normal, origin, point) >= 0.0)
    }

    fn box_contact(&self, extents: &BoundingBox<[f32; D]>) -> Contact {
        let mut contained = true;
        for (normal, origin) in &self.planes {
            let inside = extents
                .vertices()
                .filter(|vertex| Self::side(normal, origin, vertex) >= 0.0)
                .count();
            match inside {
                0 => return Contact::Outside,
                n if n < 1 << D => contained = false,
                _ => {}
            }
        }

        match contained {
            true => Contact::Contained,
            false => Contact::Touching,
        }
    }
}

/// An axis-aligned half-open box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxFunction<const D: usize> {
    /// The region.
    pub extents: BoundingBox<[f32; D]>,
}

impl<const D: usize> BoxFunction<D> {
    /// Creates a new [`BoxFunction`].
    #[inline]
    pub const fn new(extents: BoundingBox<[f32; D]>) -> Self {
        Self { extents }
    }
}

impl<const D: usize> ImplicitFunction<D> for BoxFunction<D> {
    #[inline]
    fn contains(&self, point: &[f32; D]) -> bool {
        self.extents.contains(point)
    }

    #[inline]
    fn box_contact(&self, extents: &BoundingBox<[f32; D]>) -> Contact {
        if !extents.intersects(&self.extents) {
            Contact::Outside
        } else if extents.is_inside(&self.extents) {
            Contact::Contained
        } else {
            Contact::Touching
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_spaces() {
        let mut function = PlaneFunction::<2>::new();
        function
            .add_plane(&[1.0, 0.0], &[1.0, 0.0])
            .unwrap()
            .add_plane(&[-1.0, 0.0], &[3.0, 0.0])
            .unwrap();

        assert!(function.contains(&[2.0, 100.0]));
        assert!(!function.contains(&[0.5, 0.0]));
        assert!(!function.contains(&[3.5, 0.0]));

        let inside = BoundingBox::new([1.5, 0.0], [2.5, 1.0]);
        let across = BoundingBox::new([0.0, 0.0], [2.0, 1.0]);
        let outside = BoundingBox::new([4.0, 0.0], [5.0, 1.0]);
        assert_eq!(function.box_contact(&inside), Contact::Contained);
        assert_eq!(function.box_contact(&across), Contact::Touching);
        assert_eq!(function.box_contact(&outside), Contact::Outside);
    }

    #[test]
    fn plane_vectors_are_validated() {
        let mut function = PlaneFunction::<3>::new();
        assert!(matches!(
            function.add_plane(&[1.0, 0.0], &[0.0, 0.0, 0.0]),
            Err(Error::DimensionMismatch { expected: 3, found: 2, .. })
        ));
        assert!(function.add_plane(&[0.0; 3], &[0.0; 3]).is_err());
        assert!(function.is_empty());
    }

    #[test]
    fn box_function_contact() {
        let function = BoxFunction::new(BoundingBox::new([0.0; 2], [2.0; 2]));

        assert!(function.contains(&[1.5, 1.5]));
        assert!(!function.contains(&[2.0, 0.5]));
        assert_eq!(
            function.box_contact(&BoundingBox::new([1.2; 2], [1.8; 2])),
            Contact::Contained
        );
        assert_eq!(
            function.box_contact(&BoundingBox::new([2.0; 2], [2.8; 2])),
            Contact::Outside
        );
        assert_eq!(
            function.box_contact(&BoundingBox::new([1.0; 2], [4.0; 2])),
            Contact::Touching
        );
    }
}
