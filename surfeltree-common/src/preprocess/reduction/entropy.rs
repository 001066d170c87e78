//! Keeps the surfels with the lowest local entropy.
//!
//! The entropy of a surfel measures how much its neighbourhood deviates from a flat,
//! evenly sampled disc: the mean normal deviation against its neighbours plus the
//! relative variation of the neighbour distances. Surfels in smooth regions are the most
//! predictable ones and are kept; their radii grow to cover the dropped surfels.

use super::cover_radii;
use crate::geometry::surfel::Surfel;
use crate::preprocess::neighbours::NeighbourIndex;

const ENTROPY_NEIGHBOURS: usize = 8;

fn entropy(index: &NeighbourIndex, i: usize) -> f64 {
    let surfel = &index.surfels()[i];
    let neighbours = index.nearest(i, ENTROPY_NEIGHBOURS);
    if neighbours.is_empty() {
        return 0.0;
    }
    let n = neighbours.len() as f64;
    let normal = surfel.normal_f64().try_normalize(1e-12);
    let mut deviation = 0.0;
    for neighbour in &neighbours {
        let other = index.surfels()[neighbour.index].normal_f64().try_normalize(1e-12);
        if let (Some(a), Some(b)) = (normal, other) {
            deviation += 1.0 - a.dot(&b).abs();
        }
    }
    let mean = neighbours.iter().map(|n| n.distance).sum::<f64>() / n;
    let variance = neighbours
        .iter()
        .map(|n| (n.distance - mean).powi(2))
        .sum::<f64>()
        / n;
    let variation = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };
    deviation / n + variation
}

pub fn reduce(input: &[Surfel], target: usize) -> Vec<Surfel> {
    let index = NeighbourIndex::new(input.to_vec());
    let mut ranked: Vec<(f64, usize)> = (0..input.len()).map(|i| (entropy(&index, i), i)).collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    ranked.truncate(target);
    // keep the input order among the kept surfels
    ranked.sort_by_key(|&(_, i)| i);
    let kept = ranked.into_iter().map(|(_, i)| input[i]).collect();
    cover_radii(kept, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{point, vector};

    #[test]
    fn prefers_flat_regions() {
        let mut input = Vec::new();
        // flat grid
        for x in 0..6 {
            for y in 0..6 {
                input.push(Surfel::new(
                    point![x as f64, y as f64, 0.0],
                    [0; 3],
                    0.5,
                    vector![0.0, 0.0, 1.0],
                ));
            }
        }
        // noisy corner: alternating normals
        for i in 0..6 {
            let normal = if i % 2 == 0 {
                vector![1.0, 0.0, 0.0]
            } else {
                vector![0.0, 1.0, 0.0]
            };
            input.push(Surfel::new(point![20.0 + i as f64 * 0.3, 20.0, 0.0], [0; 3], 0.5, normal));
        }
        let kept = reduce(&input, 20);
        assert_eq!(kept.len(), 20);
        assert!(kept.iter().all(|s| s.position().x < 10.0));
    }
}
