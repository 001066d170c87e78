//! Subsampling strategies, that keep a subset of the input surfels.

use super::{cover_radii, ReductionContext};
use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::Surfel;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

/// Keeps the surfels at the even positions 0, 2, 4, ... The target count does not apply,
/// so the result has half the input size even when that exceeds it.
pub fn every_second(input: &[Surfel]) -> Vec<Surfel> {
    input.iter().step_by(2).copied().collect()
}

/// Draws `target` surfels uniformly, with replacement.
pub fn random(input: &[Surfel], target: usize, ctx: &ReductionContext) -> Vec<Surfel> {
    let mut rng = ctx.rng();
    let kept = (0..target)
        .map(|_| input[rng.gen_range(0..input.len())])
        .collect();
    cover_radii(kept, input)
}

/// Divides the bounding box of the input into equally sized cubic cells and takes one
/// random surfel per cell in round robin, until `target` surfels are taken.
pub fn spatially_subdivided_random(
    input: &[Surfel],
    target: usize,
    ctx: &ReductionContext,
) -> Vec<Surfel> {
    let bbox = Aabb::from_positions(input.iter().map(|s| s.position()));
    let extent = bbox.extent();
    let cells_per_axis = (target as f64).cbrt().ceil().max(1.0);
    let cell_size = extent.max() / cells_per_axis;

    let mut cells: BTreeMap<[i64; 3], Vec<usize>> = BTreeMap::new();
    for (i, surfel) in input.iter().enumerate() {
        let mut key = [0_i64; 3];
        if cell_size > 0.0 {
            for (axis, k) in key.iter_mut().enumerate() {
                *k = ((surfel.position()[axis] - bbox.min[axis]) / cell_size).floor() as i64;
            }
        }
        cells.entry(key).or_default().push(i);
    }

    let mut rng = ctx.rng();
    let mut members: Vec<Vec<usize>> = cells.into_values().collect();
    for cell in &mut members {
        cell.shuffle(&mut rng);
    }
    let mut kept = Vec::with_capacity(target);
    let mut round = 0;
    while kept.len() < target {
        let mut took_any = false;
        for cell in &members {
            if let Some(&i) = cell.get(round) {
                kept.push(input[i]);
                took_any = true;
                if kept.len() == target {
                    break;
                }
            }
        }
        if !took_any {
            break;
        }
        round += 1;
    }
    cover_radii(kept, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::reduction::tests::surface_patch;

    #[test]
    fn every_second_is_order_stable() {
        let input = surface_patch(7, 1);
        let kept = every_second(&input);
        assert_eq!(kept, vec![input[0], input[2], input[4], input[6]]);
    }

    #[test]
    fn spatially_random_spreads_over_cells() {
        // a dense cluster and a few far away surfels
        let mut input = surface_patch(500, 2);
        let far = surface_patch(5, 3)
            .into_iter()
            .map(|s| s.with_position(s.position() + nalgebra::vector![100.0, 0.0, 0.0]));
        input.extend(far);
        let ctx = ReductionContext { node_id: 0, seed: 0 };
        let kept = spatially_subdivided_random(&input, 20, &ctx);
        assert_eq!(kept.len(), 20);
        assert!(kept.iter().any(|s| s.position().x > 50.0));
    }
}
