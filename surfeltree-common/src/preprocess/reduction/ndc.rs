//! Normal deviation clustering.
//!
//! Surfels are visited in Morton order and grouped into runs of spatially close
//! surfels, whose normals deviate less than a threshold angle from the mean normal of the
//! run. The threshold starts small and is doubled until the number of clusters fits the
//! target. Every cluster is merged into a single surfel.

use super::morton_code;
use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::{merge_surfels, Surfel};
use nalgebra::Vector3;
use std::ops::Range;

const INITIAL_THRESHOLD_DEGREES: f64 = 15.0;

fn morton_order(input: &[Surfel]) -> Vec<usize> {
    let bbox = Aabb::from_positions(input.iter().map(|s| s.position()));
    let extent = bbox.extent();
    let mut keyed: Vec<(u64, usize)> = input
        .iter()
        .enumerate()
        .map(|(i, s)| (morton_code(s.position(), &bbox.min, &extent), i))
        .collect();
    keyed.sort_unstable();
    keyed.into_iter().map(|(_, i)| i).collect()
}

/// Clusters as ranges of the given order.
fn clusters(input: &[Surfel], order: &[usize], target: usize) -> Vec<Range<usize>> {
    let capacity = input.len().div_ceil(target);
    let mut threshold = INITIAL_THRESHOLD_DEGREES;
    loop {
        let min_cos = threshold.to_radians().cos();
        let mut clusters = Vec::new();
        let mut start = 0;
        let mut normal_sum = Vector3::<f64>::zeros();
        for (pos, &i) in order.iter().enumerate() {
            let normal = input[i].normal_f64();
            let compatible = match (normal_sum.try_normalize(1e-12), normal.try_normalize(1e-12)) {
                (Some(mean), Some(n)) => mean.dot(&n) >= min_cos,
                _ => true,
            };
            if pos > start && (pos - start >= capacity || !compatible) {
                clusters.push(start..pos);
                start = pos;
                normal_sum = Vector3::zeros();
            }
            normal_sum += normal;
        }
        if start < order.len() {
            clusters.push(start..order.len());
        }
        if clusters.len() <= target || threshold >= 180.0 {
            return clusters;
        }
        threshold = (threshold * 2.0).min(180.0);
    }
}

pub fn reduce(input: &[Surfel], target: usize) -> Vec<Surfel> {
    let order = morton_order(input);
    clusters(input, &order, target)
        .into_iter()
        .filter_map(|range| {
            let members: Vec<Surfel> = order[range].iter().map(|&i| input[i]).collect();
            merge_surfels(&members)
        })
        .collect()
}

/// Like [reduce], but every output surfel gets the mean radius of all clusters.
pub fn reduce_constant(input: &[Surfel], target: usize) -> Vec<Surfel> {
    let merged = reduce(input, target);
    if merged.is_empty() {
        return merged;
    }
    let radius = merged.iter().map(|s| s.radius()).sum::<f64>() / merged.len() as f64;
    merged.into_iter().map(|s| s.with_radius(radius)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{point, vector};

    #[test]
    fn separates_by_normal() {
        // two interleaved sets with opposite normals on the same spot
        let mut input = Vec::new();
        for i in 0..8 {
            let normal = if i < 4 {
                vector![0.0, 0.0, 1.0]
            } else {
                vector![1.0, 0.0, 0.0]
            };
            input.push(Surfel::new(point![(i % 4) as f64 * 0.01, 0.0, 0.0], [0; 3], 0.1, normal));
        }
        let order: Vec<usize> = (0..8).collect();
        let clusters = clusters(&input, &order, 2);
        assert_eq!(clusters, vec![0..4, 4..8]);
    }

    #[test]
    fn threshold_grows_until_target_is_met() {
        let input: Vec<Surfel> = (0..9)
            .map(|i| {
                let angle = i as f64 * 0.5;
                Surfel::new(
                    point![i as f64, 0.0, 0.0],
                    [0; 3],
                    0.1,
                    vector![angle.cos() as f32, angle.sin() as f32, 0.0],
                )
            })
            .collect();
        let reduced = reduce(&input, 3);
        assert!(reduced.len() <= 3);
        let constant = reduce_constant(&input, 3);
        assert!(constant.windows(2).all(|w| w[0].radius() == w[1].radius()));
    }

    #[test]
    fn cluster_values_are_member_means() {
        let input: Vec<Surfel> = (0..10)
            .map(|i| {
                Surfel::new(point![i as f64, 0.0, 0.0], [0; 3], 0.5, vector![0.0, 0.0, 1.0])
                    .with_provenance(i as f32)
            })
            .collect();
        let reduced = reduce(&input, 5);
        let values: Vec<f32> = reduced.iter().map(|s| s.provenance()).collect();
        assert_eq!(values, vec![0.5, 2.5, 4.5, 6.5, 8.5]);
    }
}
