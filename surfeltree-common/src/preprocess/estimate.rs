//! Normal and radius estimation (stage 1).

use crate::geometry::surfel::Surfel;
use crate::preprocess::descriptor::{NormalComputation, RadiusComputation};
use crate::preprocess::neighbours::{Chunk, ChunkPlan, Neighbour};
use crate::span;
use crate::store::{StoreContext, StoreError, SurfelFile};
use log::{debug, info};
use nalgebra::{Matrix3, Point3, Vector2, Vector3};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Orientation towards the outside is ambiguous below this absolute dot product.
const AMBIGUOUS_ORIENTATION: f64 = 1e-6;

/// Surfels larger than this multiple of the median radius are split by [resample].
const RESAMPLE_THRESHOLD: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct EstimationSettings {
    pub number_of_neighbours: usize,
    pub normal_computation: NormalComputation,
    pub radius_computation: RadiusComputation,
    pub radius_multiplier: f64,
    pub recompute: bool,
    pub resample: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EstimationSummary {
    pub surfels: u64,
    pub estimated: u64,
    pub resampled: u64,
}

pub fn needs_estimation(surfel: &Surfel, recompute: bool) -> bool {
    recompute || !surfel.has_normal() || surfel.radius() <= 0.0
}

/// Normal of the least squares plane through the given points.
/// None for fewer than three points, or if the points do not span a plane.
pub fn fit_plane(points: &[Point3<f64>]) -> Option<Vector3<f64>> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let mut covariance = Matrix3::zeros();
    for p in points {
        let d = p.coords - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;
    let eigen = covariance.symmetric_eigen();
    let mut order = [0, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    // a line (or a single point) has two vanishing eigenvalues
    let largest = eigen.eigenvalues[order[2]].max(f64::MIN_POSITIVE);
    if eigen.eigenvalues[order[1]] <= 1e-12 * largest {
        return None;
    }
    eigen
        .eigenvectors
        .column(order[0])
        .into_owned()
        .try_normalize(1e-12)
}

pub fn average_distance(neighbours: &[Neighbour]) -> f64 {
    if neighbours.is_empty() {
        return 0.0;
    }
    neighbours.iter().map(|n| n.distance).sum::<f64>() / neighbours.len() as f64
}

/// Two unit vectors that span the plane orthogonal to `normal`.
pub fn tangent_basis(normal: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let helper = if normal.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let u = normal.cross(&helper).normalize();
    let v = normal.cross(&u).normalize();
    (u, v)
}

/// Radius of the disc with the same area as the Voronoi cell of `position` among its
/// neighbours, all projected onto the tangent plane. The cell is clipped to a square of
/// side `4 * max_neighbour_distance`.
/// None, if fewer than three neighbours are usable.
pub fn natural_neighbour_radius(
    position: &Point3<f64>,
    normal: &Vector3<f64>,
    neighbours: &[Point3<f64>],
) -> Option<f64> {
    let (u, v) = tangent_basis(normal);
    let projected: Vec<Vector2<f64>> = neighbours
        .iter()
        .map(|p| {
            let d = p - position;
            Vector2::new(d.dot(&u), d.dot(&v))
        })
        .filter(|q| q.norm_squared() > 1e-24)
        .collect();
    if projected.len() < 3 {
        return None;
    }
    let max_distance = neighbours
        .iter()
        .map(|p| (p - position).norm())
        .fold(0.0, f64::max);
    let half = 2.0 * max_distance;
    let mut cell = vec![
        Vector2::new(-half, -half),
        Vector2::new(half, -half),
        Vector2::new(half, half),
        Vector2::new(-half, half),
    ];
    for q in &projected {
        cell = clip_half_plane(&cell, q, q.norm_squared() / 2.0);
        if cell.is_empty() {
            return None;
        }
    }
    Some((polygon_area(&cell) / PI).sqrt())
}

/// Clips a convex polygon to the half plane `{x | x.dot(n) <= d}`.
fn clip_half_plane(polygon: &[Vector2<f64>], n: &Vector2<f64>, d: f64) -> Vec<Vector2<f64>> {
    let mut result = Vec::with_capacity(polygon.len() + 1);
    for (i, a) in polygon.iter().enumerate() {
        let b = &polygon[(i + 1) % polygon.len()];
        let da = a.dot(n) - d;
        let db = b.dot(n) - d;
        if da <= 0.0 {
            result.push(*a);
        }
        if (da < 0.0 && db > 0.0) || (da > 0.0 && db < 0.0) {
            let t = da / (da - db);
            result.push(a + (b - a) * t);
        }
    }
    result
}

fn polygon_area(polygon: &[Vector2<f64>]) -> f64 {
    let mut twice = 0.0;
    for (i, a) in polygon.iter().enumerate() {
        let b = &polygon[(i + 1) % polygon.len()];
        twice += a.x * b.y - b.x * a.y;
    }
    twice.abs() / 2.0
}

/// Flips the normal so that its largest component is positive.
fn canonical_orientation(normal: Vector3<f64>) -> Vector3<f64> {
    let largest = normal.iamax();
    if normal[largest] < 0.0 {
        -normal
    } else {
        normal
    }
}

struct Estimate {
    surfel: Surfel,

    /// Neighbourhood of a surfel whose orientation could not be decided yet.
    ambiguous: Option<Vec<usize>>,
}

/// Estimates normal and radius of every core surfel of the chunk that needs it.
/// Returns the core surfels in order.
pub fn estimate_chunk(chunk: &Chunk, settings: &EstimationSettings, center: &Point3<f64>) -> Vec<Surfel> {
    let _span = span!("estimate_chunk");
    let surfels = chunk.index.surfels();
    let mut estimates: Vec<Estimate> = (0..chunk.core_len())
        .into_par_iter()
        .map(|i| estimate_one(chunk, i, settings, center))
        .collect();

    // Orientation by majority vote of the already oriented neighbours. Halo surfels
    // only vote with the normal they were read with.
    let oriented: Vec<Option<Vector3<f64>>> = estimates
        .iter()
        .map(|e| match e.ambiguous {
            None => Some(e.surfel.normal_f64()),
            Some(_) => None,
        })
        .collect();
    for estimate in estimates.iter_mut() {
        let Some(neighbours) = estimate.ambiguous.take() else {
            continue;
        };
        let normal = estimate.surfel.normal_f64();
        let mut votes = 0_i64;
        for j in neighbours {
            let other = match oriented.get(j) {
                Some(Some(other)) => *other,
                Some(None) => continue,
                None => surfels[j].normal_f64(),
            };
            let dot = normal.dot(&other);
            if dot > 0.0 {
                votes += 1;
            } else if dot < 0.0 {
                votes -= 1;
            }
        }
        let normal = match votes {
            v if v > 0 => normal,
            v if v < 0 => -normal,
            _ => canonical_orientation(normal),
        };
        estimate.surfel = estimate.surfel.with_normal(normal.cast::<f32>());
    }
    estimates.into_iter().map(|e| e.surfel).collect()
}

fn estimate_one(chunk: &Chunk, i: usize, settings: &EstimationSettings, center: &Point3<f64>) -> Estimate {
    let surfel = chunk.index.surfels()[i];
    if !needs_estimation(&surfel, settings.recompute) {
        return Estimate {
            surfel,
            ambiguous: None,
        };
    }
    let neighbours = chunk.index.nearest(i, settings.number_of_neighbours);
    let mut positions: Vec<Point3<f64>> = neighbours
        .iter()
        .map(|n| *chunk.index.surfels()[n.index].position())
        .collect();

    let mut normal = surfel.normal_f64();
    let mut ambiguous = None;
    if settings.recompute || !surfel.has_normal() {
        positions.push(*surfel.position());
        let fitted = match settings.normal_computation {
            NormalComputation::PlaneFitting => fit_plane(&positions),
        };
        positions.pop();
        normal = match fitted {
            Some(fitted) => {
                let outward = surfel.position() - center;
                let dot = match outward.try_normalize(1e-12) {
                    Some(outward) => fitted.dot(&outward),
                    None => 0.0,
                };
                if dot.abs() < AMBIGUOUS_ORIENTATION {
                    ambiguous = Some(neighbours.iter().map(|n| n.index).collect());
                    fitted
                } else if dot < 0.0 {
                    -fitted
                } else {
                    fitted
                }
            }
            None => Vector3::zeros(),
        };
    }

    let mut radius = surfel.radius();
    if settings.recompute || radius <= 0.0 {
        let natural = match settings.radius_computation {
            RadiusComputation::NaturalNeighbours if normal != Vector3::zeros() => {
                natural_neighbour_radius(surfel.position(), &normal, &positions)
            }
            _ => None,
        };
        radius = natural.unwrap_or_else(|| average_distance(&neighbours)) * settings.radius_multiplier;
    }

    Estimate {
        surfel: surfel.with_normal(normal.cast::<f32>()).with_radius(radius),
        ambiguous,
    }
}

/// Replaces surfels that are much larger than the median of the batch by four smaller
/// ones. Returns the number of replaced surfels.
pub fn resample(surfels: &mut Vec<Surfel>) -> usize {
    let mut radii: Vec<f64> = surfels
        .iter()
        .map(|s| s.radius())
        .filter(|&r| r > 0.0)
        .collect();
    if radii.is_empty() {
        return 0;
    }
    let mid = radii.len() / 2;
    let (_, median, _) = radii.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let threshold = *median * RESAMPLE_THRESHOLD;

    let mut replaced = 0;
    let mut result = Vec::with_capacity(surfels.len());
    for surfel in surfels.drain(..) {
        if surfel.radius() <= threshold {
            result.push(surfel);
            continue;
        }
        replaced += 1;
        let half = surfel.radius() / 2.0;
        let (u, v) = match surfel.normal_f64().try_normalize(1e-12) {
            Some(normal) => tangent_basis(&normal),
            None => (Vector3::x(), Vector3::y()),
        };
        for offset in [u, -u, v, -v] {
            result.push(
                surfel
                    .with_position(surfel.position() + offset * half)
                    .with_radius(half),
            );
        }
    }
    *surfels = result;
    replaced
}

/// Stage 1: writes `output` with normal and radius for every surfel of `input`.
///
/// Surfels that already have both are copied unchanged, unless recomputation is
/// requested. If no surfel needs estimation, the file is copied.
pub fn estimate(
    input: &SurfelFile,
    output: &SurfelFile,
    ctx: &StoreContext,
    settings: &EstimationSettings,
    chunk_capacity: usize,
) -> Result<EstimationSummary, StoreError> {
    let _span = span!("estimate");
    let mut reader = input.open(ctx)?;
    let mut pending = 0_u64;
    for window in reader.scan() {
        pending += window?
            .iter()
            .filter(|s| needs_estimation(s, settings.recompute))
            .count() as u64;
    }
    if pending == 0 && !settings.resample {
        info!("All {} surfels have normal and radius.", reader.len());
        let surfels = input.copy_to(output)?;
        return Ok(EstimationSummary {
            surfels,
            ..Default::default()
        });
    }
    info!(
        "Estimating normal and radius for {} of {} surfels.",
        pending,
        reader.len()
    );

    let plan = ChunkPlan::new(&mut reader, chunk_capacity, settings.number_of_neighbours)?;
    let center = plan.bbox().center().unwrap_or_else(Point3::origin);
    let mut writer = output.create(ctx)?;
    let mut summary = EstimationSummary {
        estimated: pending,
        ..Default::default()
    };
    for c in 0..plan.len() {
        let chunk = plan.load(&mut reader, ctx, c)?;
        let mut surfels = estimate_chunk(&chunk, settings, &center);
        drop(chunk);
        if settings.resample {
            summary.resampled += resample(&mut surfels) as u64;
        }
        writer.append(&surfels)?;
        debug!("Estimated chunk {} of {}", c + 1, plan.len());
    }
    summary.surfels = writer.close()?;
    if settings.resample {
        info!("Resampled {} oversized surfels.", summary.resampled);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::store::RecordLayout;
    use nalgebra::{point, vector};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn settings(radius: RadiusComputation) -> EstimationSettings {
        EstimationSettings {
            number_of_neighbours: 8,
            normal_computation: NormalComputation::PlaneFitting,
            radius_computation: radius,
            radius_multiplier: 1.0,
            recompute: false,
            resample: false,
        }
    }

    #[test]
    fn plane_normal() {
        let points = [
            point![0.0, 0.0, 1.0],
            point![1.0, 0.0, 1.0],
            point![0.0, 1.0, 1.0],
            point![1.0, 1.0, 1.0],
        ];
        let normal = fit_plane(&points).unwrap();
        assert!((normal.z.abs() - 1.0).abs() < 1e-9);
        assert!(fit_plane(&points[..2]).is_none());
        let line = [point![0.0, 0.0, 0.0], point![1.0, 0.0, 0.0], point![2.0, 0.0, 0.0]];
        assert!(fit_plane(&line).is_none());
    }

    #[test]
    fn natural_neighbours_on_grid() {
        // the voronoi cell of a grid point is a unit square
        let neighbours = [
            point![1.0, 0.0, 0.0],
            point![-1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
            point![0.0, -1.0, 0.0],
            point![1.0, 1.0, 0.0],
        ];
        let r = natural_neighbour_radius(&point![0.0, 0.0, 0.0], &vector![0.0, 0.0, 1.0], &neighbours)
            .unwrap();
        assert!((r - (1.0 / PI).sqrt()).abs() < 1e-9);

        assert!(natural_neighbour_radius(
            &point![0.0, 0.0, 0.0],
            &vector![0.0, 0.0, 1.0],
            &neighbours[..2]
        )
        .is_none());
    }

    #[test]
    fn clip_square() {
        let square = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(2.0, 0.0),
            Vector2::new(2.0, 2.0),
            Vector2::new(0.0, 2.0),
        ];
        let clipped = clip_half_plane(&square, &Vector2::new(1.0, 0.0), 1.0);
        assert!((polygon_area(&clipped) - 2.0).abs() < 1e-12);
    }

    fn sphere_file(dir: &TempDir, ctx: &StoreContext) -> SurfelFile {
        let mut rng = StdRng::seed_from_u64(1);
        let surfels: Vec<Surfel> = (0..600)
            .map(|_| {
                let v = vector![
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0_f64)
                ]
                .normalize();
                Surfel::from_position(Point3::from(v * 10.0), [200; 3])
            })
            .collect();
        let file = SurfelFile::new(dir.path().join("sphere.bin"), RecordLayout::Surfel);
        file.write_all(ctx, &surfels).unwrap();
        file
    }

    #[test]
    fn sphere_normals_point_outwards() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 26, 0), 1 << 14);
        let input = sphere_file(&dir, &ctx);
        let output = SurfelFile::new(dir.path().join("sphere.bin_all"), RecordLayout::Surfel);
        for radius in [RadiusComputation::AverageDistance, RadiusComputation::NaturalNeighbours] {
            let summary = estimate(&input, &output, &ctx, &settings(radius), 10_000).unwrap();
            assert_eq!(summary.surfels, 600);
            assert_eq!(summary.estimated, 600);
            for s in output.read_all(&ctx).unwrap().iter() {
                assert!(s.is_estimated());
                let outward = s.position().coords.normalize();
                assert!(s.normal_f64().dot(&outward) > 0.8);
                assert!(s.radius() > 0.0 && s.radius() < 5.0);
            }
        }
    }

    #[test]
    fn chunked_estimation_keeps_every_surfel() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 26, 0), 1 << 14);
        let input = sphere_file(&dir, &ctx);
        let output = SurfelFile::new(dir.path().join("sphere.bin_all"), RecordLayout::Surfel);
        let summary = estimate(
            &input,
            &output,
            &ctx,
            &settings(RadiusComputation::AverageDistance),
            100,
        )
        .unwrap();
        assert_eq!(summary.surfels, 600);
        let mut xs: Vec<f64> = output.read_all(&ctx).unwrap().iter().map(|s| s.position().x).collect();
        let mut expected: Vec<f64> = input.read_all(&ctx).unwrap().iter().map(|s| s.position().x).collect();
        xs.sort_by(f64::total_cmp);
        expected.sort_by(f64::total_cmp);
        assert_eq!(xs, expected);
        assert_eq!(ctx.buffers.resident(), 0);
    }

    #[test]
    fn estimated_input_is_copied() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 26, 0), 1 << 14);
        let surfels = vec![
            Surfel::new(point![0.0, 0.0, 0.0], [1; 3], 0.5, vector![0.0, 0.0, 1.0]),
            Surfel::new(point![1.0, 0.0, 0.0], [2; 3], 0.5, vector![0.0, 0.0, 1.0]),
        ];
        let input = SurfelFile::new(dir.path().join("a.bin"), RecordLayout::Surfel);
        input.write_all(&ctx, &surfels).unwrap();
        let output = SurfelFile::new(dir.path().join("a.bin_all"), RecordLayout::Surfel);
        let summary = estimate(
            &input,
            &output,
            &ctx,
            &settings(RadiusComputation::AverageDistance),
            100,
        )
        .unwrap();
        assert_eq!(summary.estimated, 0);
        assert_eq!(output.read_all(&ctx).unwrap().surfels(), surfels.as_slice());
    }

    #[test]
    fn resample_splits_huge_surfels() {
        let mut surfels: Vec<Surfel> = (0..9)
            .map(|i| Surfel::new(point![i as f64, 0.0, 0.0], [0; 3], 1.0, vector![0.0, 0.0, 1.0]))
            .collect();
        surfels.push(Surfel::new(point![0.0, 5.0, 0.0], [0; 3], 10.0, vector![0.0, 0.0, 1.0]));
        assert_eq!(resample(&mut surfels), 1);
        assert_eq!(surfels.len(), 13);
        for s in &surfels[9..] {
            assert_eq!(s.radius(), 5.0);
            assert!(((s.position() - point![0.0, 5.0, 0.0]).norm() - 5.0).abs() < 1e-9);
        }
    }
}
