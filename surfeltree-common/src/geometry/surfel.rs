use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// A point sample carrying position, colour, normal and radius.
///
/// Surfels are plain values: every modification returns a new surfel.
/// The zero normal is used as the "normal not (yet) known" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Surfel {
    position: Point3<f64>,
    color: [u8; 3],
    radius: f64,
    normal: Vector3<f32>,

    /// User supplied per point attribute, zero unless provenance values were attached.
    provenance: f32,
}

impl Surfel {
    pub fn new(position: Point3<f64>, color: [u8; 3], radius: f64, normal: Vector3<f32>) -> Self {
        debug_assert!(radius >= 0.0, "negative surfel radius");
        Surfel {
            position,
            color,
            radius,
            normal,
            provenance: 0.0,
        }
    }

    /// A surfel with only position and colour, as produced by raw scan formats.
    pub fn from_position(position: Point3<f64>, color: [u8; 3]) -> Self {
        Surfel::new(position, color, 0.0, Vector3::zeros())
    }

    #[inline]
    pub fn position(&self) -> &Point3<f64> {
        &self.position
    }

    #[inline]
    pub fn color(&self) -> [u8; 3] {
        self.color
    }

    #[inline]
    pub fn radius(&self) -> f64 {
        self.radius
    }

    #[inline]
    pub fn normal(&self) -> &Vector3<f32> {
        &self.normal
    }

    #[inline]
    pub fn provenance(&self) -> f32 {
        self.provenance
    }

    pub fn with_position(self, position: Point3<f64>) -> Self {
        Surfel { position, ..self }
    }

    pub fn with_radius(self, radius: f64) -> Self {
        debug_assert!(radius >= 0.0, "negative surfel radius");
        Surfel { radius, ..self }
    }

    pub fn with_normal(self, normal: Vector3<f32>) -> Self {
        Surfel { normal, ..self }
    }

    pub fn with_provenance(self, provenance: f32) -> Self {
        Surfel { provenance, ..self }
    }

    /// True, if the normal is not the zero sentinel.
    pub fn has_normal(&self) -> bool {
        self.normal != Vector3::zeros()
    }

    /// True, if normal and radius are both present.
    pub fn is_estimated(&self) -> bool {
        self.has_normal() && self.radius > 0.0
    }

    /// The normal widened to f64, for geometric computations.
    pub fn normal_f64(&self) -> Vector3<f64> {
        self.normal.cast::<f64>()
    }
}

/// Averages a set of surfels into a single one.
///
/// Position, colour and provenance are plain means. The normal is the normalised mean
/// normal (zero if the normals cancel out). The radius is chosen so that the disc around
/// the mean position covers every input disc.
pub fn merge_surfels(surfels: &[Surfel]) -> Option<Surfel> {
    if surfels.is_empty() {
        return None;
    }
    let n = surfels.len() as f64;
    let mut position = Vector3::zeros();
    let mut color = [0.0_f64; 3];
    let mut normal = Vector3::<f64>::zeros();
    let mut provenance = 0.0_f64;
    for surfel in surfels {
        position += surfel.position.coords;
        provenance += surfel.provenance as f64;
        for (c, value) in color.iter_mut().zip(surfel.color) {
            *c += value as f64;
        }
        normal += surfel.normal_f64();
    }
    let position = Point3::from(position / n);
    let normal = normal
        .try_normalize(1e-12)
        .map(|v| v.cast::<f32>())
        .unwrap_or_else(Vector3::zeros);
    let radius = surfels
        .iter()
        .map(|s| (s.position - position).norm() + s.radius)
        .fold(0.0, f64::max);
    let merged = Surfel::new(
        position,
        color.map(|c| (c / n).round().clamp(0.0, 255.0) as u8),
        radius,
        normal,
    );
    Some(merged.with_provenance((provenance / n) as f32))
}
