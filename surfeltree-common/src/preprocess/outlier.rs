//! Statistical outlier removal (stage 3).

use crate::geometry::bounding_box::Aabb;
use crate::preprocess::neighbours::{ChunkPlan, INDEX_BYTES_PER_SURFEL};
use crate::preprocess::tree::Tree;
use crate::span;
use crate::store::{StoreContext, StoreError, SurfelFile};
use log::{debug, info};
use rayon::prelude::*;
use std::mem::size_of;

#[derive(Debug, Clone, Copy)]
pub struct OutlierSettings {
    /// Share of the surfels to remove, in `[0, 1)`.
    pub ratio: f64,
    pub neighbours: usize,
}

/// Removes the `ratio * N` surfels with the largest mean distance to their nearest
/// neighbours. Leaf ranges and bounds of `tree` are updated to the new surfel array.
///
/// Returns the number of removed surfels.
pub fn filter_outliers(
    tree: &mut Tree,
    input: &SurfelFile,
    output: &SurfelFile,
    ctx: &StoreContext,
    settings: &OutlierSettings,
) -> Result<u64, StoreError> {
    let _span = span!("filter_outliers");
    let mut reader = input.open(ctx)?;
    let len = reader.len();
    let remove = (settings.ratio * len as f64).floor() as u64;
    if remove == 0 {
        info!("No outliers to remove.");
        drop(reader);
        input.copy_to(output)?;
        return Ok(0);
    }

    // scores and indices are the only per surfel state kept in memory
    let scores_bytes = len as usize * (size_of::<f64>() + size_of::<u64>());
    let _scores_reservation = ctx.buffers.reserve(scores_bytes)?;
    let capacity = ChunkPlan::capacity_for(ctx)
        .saturating_sub(scores_bytes / INDEX_BYTES_PER_SURFEL)
        .max(16);
    let plan = ChunkPlan::new(&mut reader, capacity, settings.neighbours)?;
    let mut scores = vec![0.0_f64; len as usize];
    for c in 0..plan.len() {
        let chunk = plan.load(&mut reader, ctx, c)?;
        let chunk_scores: Vec<f64> = (0..chunk.core_len())
            .into_par_iter()
            .map(|i| {
                let neighbours = chunk.index.nearest(i, settings.neighbours);
                if neighbours.is_empty() {
                    0.0
                } else {
                    neighbours.iter().map(|n| n.distance).sum::<f64>() / neighbours.len() as f64
                }
            })
            .collect();
        for (&position, score) in chunk.core.iter().zip(chunk_scores) {
            scores[position as usize] = score;
        }
        debug!("Scored chunk {} of {}", c + 1, plan.len());
    }

    let mut removed: Vec<u64> = (0..len).collect();
    let by_score = |a: &u64, b: &u64| {
        scores[*b as usize]
            .total_cmp(&scores[*a as usize])
            .then(a.cmp(b))
    };
    removed.select_nth_unstable_by(remove as usize - 1, by_score);
    removed.truncate(remove as usize);
    removed.sort_unstable();
    drop(scores);

    let mut writer = output.create(ctx)?;
    let mut next = 0;
    for window in reader.scan() {
        let window = window?;
        let first = window.first();
        for (i, surfel) in window.iter().enumerate() {
            if removed.get(next) == Some(&(first + i as u64)) {
                next += 1;
            } else {
                writer.push(surfel)?;
            }
        }
    }
    let remaining = writer.close()?;
    debug_assert_eq!(remaining, len - remove);

    let shift = |position: u64| position - removed.partition_point(|&r| r < position) as u64;
    let mut reader = output.open(ctx)?;
    let mut empty_leaves = 0;
    for node in tree.nodes.iter_mut().filter(|n| n.is_leaf()) {
        node.surfels = shift(node.surfels.start)..shift(node.surfels.end);
        let mut bbox = Aabb::empty();
        for window in reader.windows(node.surfels.clone()) {
            for surfel in window?.iter() {
                bbox.extend(surfel.position());
            }
        }
        node.bbox = bbox;
        if node.surfels.is_empty() {
            empty_leaves += 1;
        }
    }
    tree.update_internal_bounds();
    if empty_leaves > 0 {
        debug!("{empty_leaves} leaves are empty after outlier removal");
    }
    info!("Removed {remove} of {len} surfels as outliers.");
    Ok(remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::geometry::surfel::Surfel;
    use crate::preprocess::partition::{partition, PartitionSettings};
    use crate::store::RecordLayout;
    use nalgebra::point;
    use tempfile::TempDir;

    /// A 30x30 grid in the plane z = 0 plus a few far away points.
    fn grid_with_outliers() -> Vec<Surfel> {
        let mut surfels: Vec<Surfel> = (0..900)
            .map(|i| Surfel::from_position(point![(i % 30) as f64, (i / 30) as f64, 0.0], [0; 3]))
            .collect();
        for (i, z) in [50.0, 80.0, -60.0].iter().enumerate() {
            surfels.insert(100 * (i + 1), Surfel::from_position(point![15.0, 15.0, *z], [255; 3]));
        }
        surfels
    }

    fn build(dir: &TempDir, ctx: &StoreContext) -> (Tree, SurfelFile) {
        let input = SurfelFile::new(dir.path().join("in.bin_all"), RecordLayout::Surfel);
        input.write_all(ctx, &grid_with_outliers()).unwrap();
        let leaves = SurfelFile::new(dir.path().join("in.kdnd_surfels"), RecordLayout::Surfel);
        let settings = PartitionSettings {
            max_fan_factor: 4,
            surfels_per_node: 50,
            translate_to_origin: false,
        };
        let tree = partition(&input, &leaves, ctx, dir.path(), &settings).unwrap();
        (tree, leaves)
    }

    #[test]
    fn removes_far_points() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 26, 0), 1 << 16);
        let (mut tree, leaves) = build(&dir, &ctx);
        let output = SurfelFile::new(dir.path().join("in.kdno_surfels"), RecordLayout::Surfel);
        let settings = OutlierSettings {
            ratio: 3.0 / 903.0 + 1e-9,
            neighbours: 8,
        };
        let removed = filter_outliers(&mut tree, &leaves, &output, &ctx, &settings).unwrap();
        assert_eq!(removed, 3);

        let surfels = output.read_all(&ctx).unwrap();
        assert_eq!(surfels.len(), 900);
        assert!(surfels.iter().all(|s| s.position().z == 0.0));
        assert_eq!(tree.leaf_surfel_count(), 900);
        assert_eq!(tree.check(), Ok(()));
        assert_eq!(tree.root().bbox.max.z, 0.0);
        for leaf in tree.leaves() {
            for s in &surfels[leaf.surfels.start as usize..leaf.surfels.end as usize] {
                assert!(leaf.bbox.contains(s.position()));
            }
        }
    }

    #[test]
    fn zero_ratio_copies() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 26, 0), 1 << 16);
        let (mut tree, leaves) = build(&dir, &ctx);
        let before = tree.clone();
        let output = SurfelFile::new(dir.path().join("in.kdno_surfels"), RecordLayout::Surfel);
        let settings = OutlierSettings {
            ratio: 0.0,
            neighbours: 8,
        };
        assert_eq!(filter_outliers(&mut tree, &leaves, &output, &ctx, &settings).unwrap(), 0);
        assert_eq!(tree, before);
        assert_eq!(output.len().unwrap(), 903);
    }
}
