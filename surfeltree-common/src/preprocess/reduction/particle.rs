//! Particle simulation: `target` particles start on random input surfels and repel each
//! other for a few iterations, which evens out their distribution. Afterwards every
//! particle is snapped back to its nearest input surfel.

use super::{cover_radii, ReductionContext};
use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::Surfel;
use crate::preprocess::neighbours::NeighbourIndex;
use nalgebra::{Point3, Vector3};

const ITERATIONS: usize = 8;
const REPULSION_NEIGHBOURS: usize = 6;

pub fn reduce(input: &[Surfel], target: usize, ctx: &ReductionContext) -> Vec<Surfel> {
    let mut rng = ctx.rng();
    let start = rand::seq::index::sample(&mut rng, input.len(), target).into_vec();
    let mut particles: Vec<Point3<f64>> = start.iter().map(|&i| *input[i].position()).collect();

    // interaction range: mean spacing of `target` particles on the bounding box surface
    let bbox = Aabb::from_positions(input.iter().map(|s| s.position()));
    let e = bbox.extent();
    let area = 2.0 * (e.x * e.y + e.y * e.z + e.z * e.x);
    let spacing = (area / target as f64).sqrt();
    if spacing <= 0.0 {
        return cover_radii(start.iter().map(|&i| input[i]).collect(), input);
    }
    let range = 2.0 * spacing;

    let inputs = NeighbourIndex::new(input.to_vec());
    for _ in 0..ITERATIONS {
        let index = NeighbourIndex::new(
            particles
                .iter()
                .map(|p| Surfel::from_position(*p, [0; 3]))
                .collect(),
        );
        particles = (0..particles.len())
            .map(|i| {
                let mut force = Vector3::zeros();
                for neighbour in index.nearest(i, REPULSION_NEIGHBOURS) {
                    if neighbour.distance >= range || neighbour.distance <= 0.0 {
                        continue;
                    }
                    let away = particles[i] - index.surfels()[neighbour.index].position();
                    force += away / neighbour.distance * (1.0 - neighbour.distance / range);
                }
                let moved = particles[i] + force * (0.25 * spacing);
                // stay on the surface
                match inputs.nearest_to(&moved, 1).first() {
                    Some(nearest) => *input[nearest.index].position(),
                    None => moved,
                }
            })
            .collect();
    }

    let mut chosen: Vec<usize> = particles
        .iter()
        .filter_map(|p| inputs.nearest_to(p, 1).first().map(|n| n.index))
        .collect();
    chosen.sort_unstable();
    chosen.dedup();
    cover_radii(chosen.into_iter().map(|i| input[i]).collect(), input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::reduction::tests::surface_patch;

    #[test]
    fn snaps_to_input() {
        let input = surface_patch(300, 9);
        let ctx = ReductionContext { node_id: 1, seed: 5 };
        let reduced = reduce(&input, 40, &ctx);
        assert!(!reduced.is_empty() && reduced.len() <= 40);
        for s in &reduced {
            assert!(input.iter().any(|i| i.position() == s.position()));
        }
    }
}
