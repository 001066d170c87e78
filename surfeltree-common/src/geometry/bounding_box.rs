use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// An axis aligned bounding box in surfel coordinates.
/// An Aabb can also be empty. An empty aabb is represented by
/// setting the minimum to f64::MAX and the maximum to f64::MIN.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Constructs an empty bounding box.
    pub fn empty() -> Self {
        Aabb {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    /// Construct a new AABB with the given bounds.
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Aabb { min, max }
    }

    /// The smallest bounding box containing all given positions.
    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a Point3<f64>>) -> Self {
        let mut aabb = Aabb::empty();
        for position in positions {
            aabb.extend(position);
        }
        aabb
    }

    /// Checks, if the bounding box is empty.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Check, if the given point is within the bounds.
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        (0..3).all(|i| self.min[i] <= point[i] && point[i] <= self.max[i])
    }

    /// Grow the bounding box, so that it contains the given position.
    pub fn extend(&mut self, position: &Point3<f64>) {
        for i in 0..3 {
            if self.min[i] > position[i] {
                self.min[i] = position[i];
            }
            if self.max[i] < position[i] {
                self.max[i] = position[i];
            }
        }
    }

    /// Grow the bounding box, so that it contains the other aabb.
    pub fn extend_aabb(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        self.extend(&other.min);
        self.extend(&other.max);
    }

    /// returns the center of the bounding box, or None if the bounding box is empty.
    pub fn center(&self) -> Option<Point3<f64>> {
        if self.is_empty() {
            None
        } else {
            Some(nalgebra::center(&self.min, &self.max))
        }
    }

    /// Edge lengths of the box. Zero for an empty box.
    pub fn extent(&self) -> Vector3<f64> {
        if self.is_empty() {
            Vector3::zeros()
        } else {
            self.max - self.min
        }
    }

    /// Index (0=x, 1=y, 2=z) of the longest edge. Ties prefer the lower axis.
    pub fn longest_axis(&self) -> usize {
        let extent = self.extent();
        let mut axis = 0;
        for i in 1..3 {
            if extent[i] > extent[axis] {
                axis = i;
            }
        }
        axis
    }

    /// Checks if the `other` bounding box is fully inside this bounding box.
    /// The empty box is contained in every box.
    pub fn contains_aabb(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        self.contains(&other.min) && self.contains(&other.max)
    }

    /// Moves the box by the given offset.
    pub fn translated(&self, offset: &Vector3<f64>) -> Self {
        if self.is_empty() {
            *self
        } else {
            Aabb::new(self.min + offset, self.max + offset)
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for Aabb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Aabb (empty)")
        } else {
            write!(
                f,
                "Aabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
                self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Aabb;
    use nalgebra::{point, vector};

    #[test]
    fn is_empty() {
        let aabb = Aabb::empty();
        assert!(aabb.is_empty());

        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        assert!(!aabb.is_empty());
    }

    #[test]
    fn contains() {
        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        assert!(aabb.contains(&point![2.0, 4.0, 1.0]));
        assert!(aabb.contains(&point![3.0, 4.5, 1.5]));
        assert!(aabb.contains(&point![4.0, 5.0, 2.0]));
        assert!(!aabb.contains(&point![1.5, 4.5, 1.5]));
        assert!(!aabb.contains(&point![4.5, 4.5, 1.5]));
        assert!(!aabb.contains(&point![3.0, 3.5, 1.5]));
        assert!(!aabb.contains(&point![3.0, 4.5, 2.5]));
    }

    #[test]
    fn extend() {
        let mut aabb = Aabb::empty();
        aabb.extend(&point![1.0, 2.0, 3.0]);
        assert_eq!(aabb.min, point![1.0, 2.0, 3.0]);
        assert_eq!(aabb.max, point![1.0, 2.0, 3.0]);
        aabb.extend(&point![3.0, 2.0, 1.0]);
        assert_eq!(aabb.min, point![1.0, 2.0, 1.0]);
        assert_eq!(aabb.max, point![3.0, 2.0, 3.0]);
    }

    #[test]
    fn extend_union() {
        let mut aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        let other = Aabb::new(point![2.0, 2.0, 2.0], point![3.0, 5.0, 3.0]);
        aabb.extend_aabb(&other);
        assert_eq!(aabb.min, point![2.0, 2.0, 1.0]);
        assert_eq!(aabb.max, point![4.0, 5.0, 3.0]);

        // extending by an empty box changes nothing
        aabb.extend_aabb(&Aabb::empty());
        assert_eq!(aabb.min, point![2.0, 2.0, 1.0]);
    }

    #[test]
    fn contains_other() {
        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        let other1 = Aabb::new(point![2.5, 4.5, 1.5], point![2.9, 4.9, 1.9]);
        let other2 = Aabb::new(point![1.5, 4.5, 1.5], point![2.9, 4.9, 1.9]);
        let other3 = Aabb::new(point![5.0, 1.0, 3.0], point![6.0, 2.0, 4.0]);
        assert!(aabb.contains_aabb(&other1));
        assert!(!aabb.contains_aabb(&other2));
        assert!(!aabb.contains_aabb(&other3));
        assert!(aabb.contains_aabb(&Aabb::empty()));
    }

    #[test]
    fn longest_axis() {
        let aabb = Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 3.0, 2.0]);
        assert_eq!(aabb.longest_axis(), 1);
        let cube = Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0]);
        assert_eq!(cube.longest_axis(), 0);
    }

    #[test]
    fn centre() {
        let aabb = Aabb::new(point![2.0, 4.0, 1.0], point![4.0, 5.0, 2.0]);
        assert_eq!(aabb.center(), Some(point![3.0, 4.5, 1.5]));
        assert_eq!(Aabb::empty().center(), None);
        assert_eq!(
            aabb.translated(&vector![-3.0, -4.5, -1.5]).center(),
            Some(point![0.0, 0.0, 0.0])
        );
    }
}
