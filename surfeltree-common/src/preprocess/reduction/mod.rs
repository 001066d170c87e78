//! Strategies that reduce the surfels of the children of a node to a representative set
//! for the node itself.
//!
//! The strategy is chosen once per build ([ReductionAlgorithm]). Every strategy is a pure
//! function of its input, the target count and the [ReductionContext]. The seeded ones
//! derive their random numbers from the node id, so repeated builds are identical.
//!
//! Surfels that are kept keep their provenance value; merged surfels get the mean value of
//! their members.

use crate::geometry::surfel::Surfel;
use crate::preprocess::descriptor::ReductionAlgorithm;
use crate::preprocess::neighbours::NeighbourIndex;
use crate::preprocess::tree::NodeId;
use rand::rngs::StdRng;
use rand::SeedableRng;

mod clustering;
mod entropy;
mod ndc;
mod pair;
mod particle;
mod sampling;

/// Per node input of a reduction, in addition to the surfels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionContext {
    pub node_id: NodeId,
    pub seed: u64,
}

impl ReductionContext {
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ self.node_id as u64)
    }
}

impl ReductionAlgorithm {
    /// Reduces `input` to (at most, see below) `target` surfels.
    ///
    /// Inputs that already have at most `target` surfels are returned unchanged, except by
    /// `every_second`, which always takes every second input surfel and may therefore
    /// exceed the target for large inputs.
    pub fn reduce(&self, input: &[Surfel], target: usize, ctx: &ReductionContext) -> Vec<Surfel> {
        let target = target.max(1);
        if *self == ReductionAlgorithm::EverySecond {
            return sampling::every_second(input);
        }
        if input.len() <= target {
            return input.to_vec();
        }
        match self {
            ReductionAlgorithm::Ndc | ReductionAlgorithm::NdcProv => ndc::reduce(input, target),
            ReductionAlgorithm::Constant => ndc::reduce_constant(input, target),
            ReductionAlgorithm::EverySecond => sampling::every_second(input),
            ReductionAlgorithm::Random => sampling::random(input, target, ctx),
            ReductionAlgorithm::SpatiallySubdividedRandom => {
                sampling::spatially_subdivided_random(input, target, ctx)
            }
            ReductionAlgorithm::Entropy => entropy::reduce(input, target),
            ReductionAlgorithm::ParticleSim => particle::reduce(input, target, ctx),
            ReductionAlgorithm::HierarchicalClustering => clustering::hierarchical(input, target),
            ReductionAlgorithm::KClustering => clustering::k_clustering(input, target),
            ReductionAlgorithm::Pair => pair::reduce(input, target),
        }
    }
}

/// Enlarges the radii of a subset of the input, so that every input surfel is covered by
/// the disc of its nearest kept surfel.
pub(crate) fn cover_radii(kept: Vec<Surfel>, input: &[Surfel]) -> Vec<Surfel> {
    if kept.is_empty() {
        return kept;
    }
    let mut radii: Vec<f64> = kept.iter().map(|s| s.radius()).collect();
    let index = NeighbourIndex::new(kept);
    for surfel in input {
        if let Some(nearest) = index.nearest_to(surfel.position(), 1).first() {
            let needed = nearest.distance + surfel.radius();
            if needed > radii[nearest.index] {
                radii[nearest.index] = needed;
            }
        }
    }
    index
        .surfels()
        .iter()
        .zip(radii)
        .map(|(s, r)| s.with_radius(r))
        .collect()
}

/// Morton code of a position, quantized to 21 bits per axis within the given bounds.
pub(crate) fn morton_code(
    position: &nalgebra::Point3<f64>,
    min: &nalgebra::Point3<f64>,
    extent: &nalgebra::Vector3<f64>,
) -> u64 {
    const MAX: f64 = ((1_u64 << 21) - 1) as f64;
    let mut code = 0_u64;
    for axis in 0..3 {
        let relative = if extent[axis] > 0.0 {
            (position[axis] - min[axis]) / extent[axis]
        } else {
            0.0
        };
        let quantized = (relative.clamp(0.0, 1.0) * MAX) as u64;
        code |= spread_bits(quantized) << axis;
    }
    code
}

/// Inserts two zero bits between each of the lower 21 bits.
fn spread_bits(value: u64) -> u64 {
    let mut x = value & 0x1f_ffff;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nalgebra::{point, vector, Vector3};
    use rand::Rng;

    /// Noisy samples of a slightly curved surface.
    pub fn surface_patch(n: usize, seed: u64) -> Vec<Surfel> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let x: f64 = rng.gen_range(0.0..4.0);
                let y: f64 = rng.gen_range(0.0..4.0);
                let z = 0.1 * (x * 1.5).sin() + rng.gen_range(-0.01..0.01);
                let normal = vector![-0.15 * (x * 1.5).cos(), 0.0, 1.0].normalize();
                Surfel::new(
                    point![x, y, z],
                    [rng.gen(), rng.gen(), rng.gen()],
                    rng.gen_range(0.05..0.1),
                    normal.cast::<f32>(),
                )
            })
            .collect()
    }

    const ALL: [ReductionAlgorithm; 11] = [
        ReductionAlgorithm::Ndc,
        ReductionAlgorithm::NdcProv,
        ReductionAlgorithm::Constant,
        ReductionAlgorithm::EverySecond,
        ReductionAlgorithm::Random,
        ReductionAlgorithm::Entropy,
        ReductionAlgorithm::ParticleSim,
        ReductionAlgorithm::HierarchicalClustering,
        ReductionAlgorithm::KClustering,
        ReductionAlgorithm::Pair,
        ReductionAlgorithm::SpatiallySubdividedRandom,
    ];

    fn ctx() -> ReductionContext {
        ReductionContext {
            node_id: 3,
            seed: 42,
        }
    }

    #[test]
    fn reduces_to_target() {
        let input = surface_patch(400, 1);
        for algo in ALL {
            let reduced = algo.reduce(&input, 100, &ctx());
            if algo == ReductionAlgorithm::EverySecond {
                assert_eq!(reduced.len(), 200);
            } else {
                assert!(
                    !reduced.is_empty() && reduced.len() <= 100,
                    "{algo}: {} surfels",
                    reduced.len()
                );
            }
            for s in &reduced {
                assert!(s.radius() >= 0.0 && s.radius().is_finite(), "{algo}");
                assert!(s.position().x > -1.0 && s.position().x < 5.0, "{algo}");
            }
        }
    }

    #[test]
    fn deterministic() {
        let input = surface_patch(300, 2);
        for algo in ALL {
            let a = algo.reduce(&input, 50, &ctx());
            let b = algo.reduce(&input, 50, &ctx());
            assert_eq!(a, b, "{algo}");
        }
    }

    #[test]
    fn seeded_strategies_depend_on_node() {
        let input = surface_patch(300, 3);
        let other = ReductionContext {
            node_id: 4,
            ..ctx()
        };
        let a = ReductionAlgorithm::Random.reduce(&input, 50, &ctx());
        let b = ReductionAlgorithm::Random.reduce(&input, 50, &other);
        assert_ne!(a, b);
    }

    #[test]
    fn small_inputs_pass_through() {
        let input = surface_patch(10, 4);
        for algo in ALL {
            let reduced = algo.reduce(&input, 10, &ctx());
            if algo == ReductionAlgorithm::EverySecond {
                assert_eq!(reduced, vec![input[0], input[2], input[4], input[6], input[8]]);
            } else {
                assert_eq!(reduced, input, "{algo}");
            }
        }
        assert!(ReductionAlgorithm::Pair.reduce(&[], 10, &ctx()).is_empty());
    }

    #[test]
    fn covering() {
        let input = surface_patch(200, 5);
        let kept = vec![input[0], input[1]];
        let covered = cover_radii(kept, &input);
        for s in &input {
            assert!(covered
                .iter()
                .any(|c| (c.position() - s.position()).norm() + s.radius() <= c.radius() + 1e-9));
        }
    }

    #[test]
    fn morton_order() {
        let min = point![0.0, 0.0, 0.0];
        let extent = Vector3::new(1.0, 1.0, 1.0);
        assert_eq!(morton_code(&min, &min, &extent), 0);
        assert_eq!(spread_bits(0b11), 0b1001);
        let x = morton_code(&point![1.0, 0.0, 0.0], &min, &extent);
        let y = morton_code(&point![0.0, 1.0, 0.0], &min, &extent);
        assert_eq!(y, x << 1);
    }

    #[test]
    fn provenance_is_carried() {
        // two halves of the patch with different values
        let input: Vec<Surfel> = surface_patch(400, 6)
            .into_iter()
            .map(|s| {
                let value = if s.position().x < 2.0 { 1.0 } else { 3.0 };
                s.with_provenance(value)
            })
            .collect();
        for algo in ALL {
            for s in algo.reduce(&input, 100, &ctx()) {
                let value = s.provenance();
                assert!((1.0..=3.0).contains(&value), "{algo}: {value}");
            }
        }
        // clusters inside one half keep its value
        let reduced = ReductionAlgorithm::NdcProv.reduce(&input, 100, &ctx());
        assert!(reduced.iter().any(|s| s.provenance() == 1.0));
        assert!(reduced.iter().any(|s| s.provenance() == 3.0));
    }
}
