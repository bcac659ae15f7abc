use crate::{
    error::{Error, Result},
    implicit::Contact,
    tree::BoundingBox,
};

/// Trait for convex regions over which events can be integrated.
pub trait Shape<const D: usize>: Sync {
    /// Returns `true` if the point is inside the shape.
    fn contains(&self, point: &[f32; D]) -> bool;

    /// Returns the centre of the shape.
    fn center(&self) -> &[f32; D];

    /// Returns the radius of a sphere around [`center`](Shape::center) enclosing the shape.
    fn bounding_radius(&self) -> f64;

    /// Returns how the given box relates to the shape.
    ///
    /// Boxes farther away than the bounding radius are outside. Since shapes are convex, a box
    /// whose corners are all inside the shape is contained in it.
    #[inline]
    fn classify(&self, extents: &BoundingBox<[f32; D]>) -> Contact {
        if distance(self.center(), &extents.center()) - extents.half_diagonal()
            > self.bounding_radius()
        {
            Contact::Outside
        } else if extents.vertices().all(|vertex| self.contains(&vertex)) {
            Contact::Contained
        } else {
            Contact::Touching
        }
    }
}

fn distance<const D: usize>(a: &[f32; D], b: &[f32; D]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// An open ball.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere<const D: usize> {
    center: [f32; D],
    radius: f32,
}

impl<const D: usize> Sphere<D> {
    /// Creates a new [`Sphere`]. The radius must be finite and positive.
    pub fn new(center: [f32; D], radius: f32) -> Result<Self> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(Error::invalid(
                "sphere radius",
                format!("{radius} is not a finite positive radius"),
            ));
        }

        Ok(Self { center, radius })
    }

    /// Returns the radius of the sphere.
    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }
}

impl<const D: usize> Shape<D> for Sphere<D> {
    #[inline]
    fn contains(&self, point: &[f32; D]) -> bool {
        let radius = f64::from(self.radius);
        let distance_squared: f64 = point
            .iter()
            .zip(&self.center)
            .map(|(&p, &c)| (f64::from(p) - f64::from(c)).powi(2))
            .sum();
        distance_squared < radius * radius
    }

    #[inline]
    fn center(&self) -> &[f32; D] {
        &self.center
    }

    #[inline]
    fn bounding_radius(&self) -> f64 {
        f64::from(self.radius)
    }
}

/// A cylinder of finite length around an axis through its centre.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cylinder<const D: usize> {
    center: [f32; D],
    axis: [f64; D],
    radius: f32,
    length: f32,
}

impl<const D: usize> Cylinder<D> {
    /// Creates a new [`Cylinder`]. The axis doesn't need to be normalised but can't be zero.
    pub fn new(center: [f32; D], axis: [f32; D], radius: f32, length: f32) -> Result<Self> {
        let norm = axis.iter().map(|&a| f64::from(a).powi(2)).sum::<f64>().sqrt();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(Error::invalid("cylinder axis", "must be a finite non-zero vector"));
        }
        if !(radius > 0.0 && length > 0.0) {
            return Err(Error::invalid(
                "cylinder",
                format!("radius ({radius}) and length ({length}) must be positive"),
            ));
        }

        Ok(Self {
            center,
            axis: axis.map(|a| f64::from(a) / norm),
            radius,
            length,
        })
    }

    /// Returns the radius of the cylinder.
    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Returns the length of the cylinder along its axis.
    #[inline]
    pub fn length(&self) -> f32 {
        self.length
    }
}

impl<const D: usize> Shape<D> for Cylinder<D> {
    #[inline]
    fn contains(&self, point: &[f32; D]) -> bool {
        let offset: [f64; D] =
            std::array::from_fn(|i| f64::from(point[i]) - f64::from(self.center[i]));
        let along: f64 = offset.iter().zip(&self.axis).map(|(o, a)| o * a).sum();
        let squared: f64 = offset.iter().map(|o| o * o).sum();
        let (radius, half_length) = (f64::from(self.radius), f64::from(self.length) * 0.5);

        along.abs() < half_length && squared - along * along < radius * radius
    }

    #[inline]
    fn center(&self) -> &[f32; D] {
        &self.center
    }

    #[inline]
    fn bounding_radius(&self) -> f64 {
        let (radius, half_length) = (f64::from(self.radius), f64::from(self.length) * 0.5);
        radius.hypot(half_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_classifies_boxes() {
        let sphere = Sphere::new([0.0, 0.0], 2.0).unwrap();

        let inside = BoundingBox::new([-1.0, -1.0], [1.0, 1.0]);
        let across = BoundingBox::new([1.0, 1.0], [3.0, 3.0]);
        let outside = BoundingBox::new([5.0, 5.0], [6.0, 6.0]);

        assert_eq!(sphere.classify(&inside), Contact::Contained);
        assert_eq!(sphere.classify(&across), Contact::Touching);
        assert_eq!(sphere.classify(&outside), Contact::Outside);
    }

    #[test]
    fn cylinder_contains_points_along_axis() {
        let cylinder = Cylinder::new([0.0; 3], [0.0, 0.0, 2.0], 1.0, 4.0).unwrap();

        assert!(cylinder.contains(&[0.5, 0.0, 1.9]));
        assert!(!cylinder.contains(&[0.5, 0.0, 2.1]));
        assert!(!cylinder.contains(&[1.1, 0.0, 0.0]));
        assert_eq!(cylinder.bounding_radius(), 5.0f64.sqrt());
    }

    #[test]
    fn cylinder_rejects_degenerate_axis() {
        assert!(Cylinder::new([0.0; 2], [0.0; 2], 1.0, 1.0).is_err());
        assert!(Cylinder::new([0.0; 2], [1.0, 0.0], 0.0, 1.0).is_err());
    }

    #[test]
    fn sphere_rejects_bad_radius() {
        for radius in [-1.0, 0.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                Sphere::new([0.0; 2], radius),
                Err(Error::InvalidArgument { .. })
            ));
        }
    }
}
