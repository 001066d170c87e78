//! Top down construction of the tree (stage 2).
//!
//! A node is split into `fan_factor` children along the longest axis of its bounding box,
//! at count quantiles. Nodes that fit into a single window are split in memory by sorting.
//! Larger nodes stay on disk: one pass builds a histogram along the split axis, a second
//! pass distributes the surfels into one temporary file per child.
//! Leaves are written to the output in depth first order. Leaves may be empty when a
//! node holds fewer surfels than the fan factor.

use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::Surfel;
use crate::preprocess::histogram::{AxisHistogram, HISTOGRAM_BINS};
use crate::preprocess::tree::{NestedNode, Tree};
use crate::span;
use crate::store::{StoreContext, StoreError, SurfelFile, SurfelWriter};
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::path::Path;
use tempfile::TempPath;

#[derive(Debug, Clone, Copy)]
pub struct PartitionSettings {
    pub max_fan_factor: usize,
    pub surfels_per_node: usize,
    pub translate_to_origin: bool,
}

impl PartitionSettings {
    /// Fan factor of a tree over `len` surfels.
    pub fn fan_factor(&self, len: u64) -> usize {
        (len.div_ceil(self.surfels_per_node as u64) as usize).clamp(2, self.max_fan_factor)
    }

    /// Depth from which on nodes are no longer split.
    pub fn max_depth(&self, len: u64, fan_factor: usize) -> u32 {
        let ratio = len as f64 / self.surfels_per_node as f64;
        let levels = if ratio <= 1.0 {
            0
        } else {
            (ratio.ln() / (fan_factor as f64).ln()).ceil() as u32
        };
        2 * levels + 16
    }
}

/// Surfels of a node that is too large for memory.
struct NodeSource {
    file: SurfelFile,
    len: u64,
    bbox: Aabb,

    /// Added to every position on reading.
    offset: Vector3<f64>,

    /// Deletes the file once the node is split.
    _temp: Option<TempPath>,
}

struct Partitioner<'a> {
    ctx: &'a StoreContext,
    temp_dir: &'a Path,
    fan_factor: usize,
    surfels_per_node: usize,
    max_depth: u32,
    in_core_limit: u64,
    writer: SurfelWriter,
    oversized_leaves: usize,
    forced_splits: usize,
}

fn translate(surfel: &Surfel, offset: &Vector3<f64>) -> Surfel {
    surfel.with_position(surfel.position() + offset)
}

fn temp_io_error(dir: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: dir.to_owned(),
        source,
    }
}

/// Stage 2: partitions the surfels of `input` into a tree whose leaves are written to
/// `output`. Temporary files are created in `temp_dir`.
pub fn partition(
    input: &SurfelFile,
    output: &SurfelFile,
    ctx: &StoreContext,
    temp_dir: &Path,
    settings: &PartitionSettings,
) -> Result<Tree, StoreError> {
    let _span = span!("partition");
    let mut reader = input.open(ctx)?;
    let len = reader.len();
    let mut bbox = Aabb::empty();
    for window in reader.scan() {
        for surfel in window?.iter() {
            bbox.extend(surfel.position());
        }
    }
    drop(reader);

    let translation = match bbox.center() {
        Some(center) if settings.translate_to_origin => -center.coords,
        _ => Vector3::zeros(),
    };
    let fan_factor = settings.fan_factor(len);
    let max_depth = settings.max_depth(len, fan_factor);
    info!(
        "Partitioning {} surfels with fan factor {} (translation {:?})",
        len,
        fan_factor,
        translation.as_slice()
    );

    let mut partitioner = Partitioner {
        ctx,
        temp_dir,
        fan_factor,
        surfels_per_node: settings.surfels_per_node,
        max_depth,
        in_core_limit: ctx.window_len(),
        writer: output.create(ctx)?,
        oversized_leaves: 0,
        forced_splits: 0,
    };
    let root = partitioner.split_source(
        NodeSource {
            file: input.clone(),
            len,
            bbox: bbox.translated(&translation),
            offset: translation,
            _temp: None,
        },
        0,
    )?;
    let Partitioner {
        writer,
        oversized_leaves,
        forced_splits,
        ..
    } = partitioner;
    let written = writer.close()?;
    debug_assert_eq!(written, len);

    let tree = Tree::from_nested(root, fan_factor, settings.surfels_per_node, translation);
    if forced_splits > 0 {
        warn!("{forced_splits} nodes had to be split by file order (duplicate positions).");
    }
    if oversized_leaves > 0 {
        warn!("{oversized_leaves} leaves hold more than {} surfels.", settings.surfels_per_node);
    }
    info!(
        "Created tree with {} nodes, {} leaves and depth {}",
        tree.len(),
        tree.leaves().count(),
        tree.depth()
    );
    Ok(tree)
}

impl Partitioner<'_> {
    /// Decides whether a node with `len` surfels at `depth` becomes a leaf.
    ///
    /// Nodes with fewer surfels than the fan factor are still split, some of their
    /// children stay empty.
    fn is_leaf(&mut self, len: u64, depth: u32) -> bool {
        if len <= self.surfels_per_node as u64 {
            return true;
        }
        if depth >= self.max_depth {
            debug!("Oversized leaf with {len} surfels at depth {depth}");
            self.oversized_leaves += 1;
            return true;
        }
        false
    }

    fn leaf(&mut self, surfels: &[Surfel], bbox: Aabb) -> Result<NestedNode, StoreError> {
        let start = self.writer.len();
        self.writer.append(surfels)?;
        Ok(NestedNode {
            bbox,
            surfels: start..self.writer.len(),
            children: Vec::new(),
        })
    }

    fn split_in_core(&mut self, surfels: &mut [Surfel], depth: u32) -> Result<NestedNode, StoreError> {
        let bbox = Aabb::from_positions(surfels.iter().map(|s| s.position()));
        let len = surfels.len();
        if self.is_leaf(len as u64, depth) {
            return self.leaf(surfels, bbox);
        }
        let axis = bbox.longest_axis();
        surfels.sort_by(|a, b| a.position()[axis].total_cmp(&b.position()[axis]));
        let f = self.fan_factor;
        let mut children = Vec::with_capacity(f);
        for j in 0..f {
            let range = j * len / f..(j + 1) * len / f;
            children.push(self.split_in_core(&mut surfels[range], depth + 1)?);
        }
        Ok(NestedNode {
            bbox,
            surfels: 0..0,
            children,
        })
    }

    fn split_source(&mut self, source: NodeSource, depth: u32) -> Result<NestedNode, StoreError> {
        let _span = span!("Partitioner::split_source");
        if source.len <= self.in_core_limit {
            let reservation = self
                .ctx
                .buffers
                .reserve(StoreContext::bytes_for(source.len as usize))?;
            let mut surfels = Vec::with_capacity(source.len as usize);
            let mut reader = source.file.open(self.ctx)?;
            for window in reader.scan() {
                surfels.extend(window?.iter().map(|s| translate(s, &source.offset)));
            }
            drop(reader);
            drop(source);
            let node = self.split_in_core(&mut surfels, depth)?;
            drop(reservation);
            return Ok(node);
        }

        if self.is_leaf(source.len, depth) {
            let start = self.writer.len();
            let mut reader = source.file.open(self.ctx)?;
            for window in reader.scan() {
                let window = window?;
                for surfel in window.iter() {
                    self.writer.push(&translate(surfel, &source.offset))?;
                }
            }
            return Ok(NestedNode {
                bbox: source.bbox,
                surfels: start..self.writer.len(),
                children: Vec::new(),
            });
        }

        let children = self.distribute(&source)?;
        let bbox = source.bbox;
        drop(source);
        let mut nested = Vec::with_capacity(children.len());
        for child in children {
            nested.push(self.split_source(child, depth + 1)?);
        }
        Ok(NestedNode {
            bbox,
            surfels: 0..0,
            children: nested,
        })
    }

    /// Writes the surfels of an out of core node into one temporary file per child.
    fn distribute(&mut self, source: &NodeSource) -> Result<Vec<NodeSource>, StoreError> {
        let _span = span!("Partitioner::distribute");
        let f = self.fan_factor;
        let axis = source.bbox.longest_axis();
        let mut reader = source.file.open(self.ctx)?;

        let mut hist = AxisHistogram::new(source.bbox.min[axis], source.bbox.max[axis], HISTOGRAM_BINS);
        for window in reader.scan() {
            for surfel in window?.iter() {
                hist.add(surfel.position()[axis] + source.offset[axis]);
            }
        }
        let quantiles = hist.quantiles(f);
        let forced = quantiles.counts.contains(&0);
        if forced {
            self.forced_splits += 1;
            debug!("Forced split of a node with {} surfels", source.len);
        }

        let buffer_bytes = self.ctx.window_bytes / f;
        let mut paths = Vec::with_capacity(f);
        let mut writers = Vec::with_capacity(f);
        for _ in 0..f {
            let path = tempfile::Builder::new()
                .prefix("partition-")
                .suffix(".tmp")
                .tempfile_in(self.temp_dir)
                .map_err(|e| temp_io_error(self.temp_dir, e))?
                .into_temp_path();
            let file = SurfelFile::new(path.to_path_buf(), source.file.layout());
            writers.push(file.create_with_buffer(self.ctx, buffer_bytes)?);
            paths.push(path);
        }

        let mut bounds = vec![Aabb::empty(); f];
        for window in reader.scan() {
            let window = window?;
            let first = window.first();
            for (i, surfel) in window.iter().enumerate() {
                let surfel = translate(surfel, &source.offset);
                let child = if forced {
                    ((first + i as u64) * f as u64 / source.len) as usize
                } else {
                    hist.part_of(&quantiles, surfel.position()[axis])
                };
                bounds[child].extend(surfel.position());
                writers[child].push(&surfel)?;
            }
        }

        let mut children = Vec::with_capacity(f);
        for ((writer, path), bbox) in writers.into_iter().zip(paths).zip(bounds) {
            let file = writer.file().clone();
            let len = writer.close()?;
            children.push(NodeSource {
                file,
                len,
                bbox,
                offset: Vector3::zeros(),
                _temp: Some(path),
            });
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::store::RecordLayout;
    use nalgebra::point;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::mem::size_of;
    use tempfile::TempDir;

    fn settings(spn: usize, fan: usize) -> PartitionSettings {
        PartitionSettings {
            max_fan_factor: fan,
            surfels_per_node: spn,
            translate_to_origin: true,
        }
    }

    fn random_cube(ctx: &StoreContext, path: &Path, n: usize) -> SurfelFile {
        let mut rng = StdRng::seed_from_u64(7);
        let surfels: Vec<Surfel> = (0..n)
            .map(|_| {
                Surfel::from_position(
                    point![
                        rng.gen_range(10.0..11.0),
                        rng.gen_range(0.0..1.0),
                        rng.gen_range(0.0..1.0)
                    ],
                    [rng.gen(), 0, 0],
                )
            })
            .collect();
        let file = SurfelFile::new(path, RecordLayout::Surfel);
        file.write_all(ctx, &surfels).unwrap();
        file
    }

    fn check_leaves(tree: &Tree, output: &SurfelFile, ctx: &StoreContext, spn: u64) {
        assert_eq!(tree.check(), Ok(()));
        let surfels = output.read_all(ctx).unwrap();
        let mut covered = 0;
        for leaf in tree.leaves() {
            assert!(leaf.surfel_count() <= spn);
            for s in &surfels[leaf.surfels.start as usize..leaf.surfels.end as usize] {
                assert!(leaf.bbox.contains(s.position()));
            }
            covered += leaf.surfel_count();
        }
        assert_eq!(covered, surfels.len() as u64);
    }

    #[test]
    fn in_core_binary_tree() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 28, 0), 1 << 20);
        let input = random_cube(&ctx, &dir.path().join("in.bin_all"), 10_000);
        let output = SurfelFile::new(dir.path().join("out.kdnd_surfels"), RecordLayout::Surfel);
        let tree = partition(&input, &output, &ctx, dir.path(), &settings(1000, 2)).unwrap();
        assert_eq!(tree.fan_factor, 2);
        assert_eq!(tree.depth(), 4);
        assert_eq!(tree.leaves().count(), 16);
        check_leaves(&tree, &output, &ctx, 1000);
        // translated to the origin
        let root = tree.root().bbox;
        assert!(root.center().unwrap().coords.norm() < 1e-9);
        assert!((tree.translation.x + 10.5).abs() < 0.01);
    }

    #[test]
    fn out_of_core_matches_invariants() {
        let dir = TempDir::new().unwrap();
        // windows of 500 surfels: the upper levels are split on disk
        let ctx = StoreContext::new(BufferManager::new(1 << 28, 0), 500 * size_of::<Surfel>());
        let input = random_cube(&ctx, &dir.path().join("in.bin_all"), 5000);
        let output = SurfelFile::new(dir.path().join("out.kdnd_surfels"), RecordLayout::Surfel);
        let tree = partition(&input, &output, &ctx, dir.path(), &settings(100, 4)).unwrap();
        assert_eq!(tree.fan_factor, 4);
        check_leaves(&tree, &output, &ctx, 100);

        // temporary files are gone
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("partition-"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(ctx.buffers.resident(), 0);
    }

    #[test]
    fn nodes_smaller_than_the_fan_factor_are_split() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 28, 0), 1 << 20);
        let input = random_cube(&ctx, &dir.path().join("in.bin_all"), 400);
        let output = SurfelFile::new(dir.path().join("out.kdnd_surfels"), RecordLayout::Surfel);
        let tree = partition(&input, &output, &ctx, dir.path(), &settings(5, 8)).unwrap();
        assert_eq!(tree.fan_factor, 8);
        check_leaves(&tree, &output, &ctx, 5);
        assert!(tree.leaves().any(|l| l.surfel_count() == 0));
        assert_eq!(tree.leaf_surfel_count(), 400);
    }

    #[test]
    fn duplicate_positions_terminate() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 28, 0), 100 * size_of::<Surfel>());
        let surfels = vec![Surfel::from_position(point![1.0, 1.0, 1.0], [0; 3]); 1000];
        let input = SurfelFile::new(dir.path().join("dup.bin_all"), RecordLayout::Surfel);
        input.write_all(&ctx, &surfels).unwrap();
        let output = SurfelFile::new(dir.path().join("dup.kdnd_surfels"), RecordLayout::Surfel);
        let tree = partition(&input, &output, &ctx, dir.path(), &settings(10, 2)).unwrap();
        assert_eq!(tree.check(), Ok(()));
        assert_eq!(tree.leaf_surfel_count(), 1000);
        assert!(tree.leaves().all(|l| l.surfel_count() <= 10));
    }

    #[test]
    fn small_input_is_a_single_leaf() {
        let dir = TempDir::new().unwrap();
        let ctx = StoreContext::new(BufferManager::new(1 << 28, 0), 1 << 20);
        let input = random_cube(&ctx, &dir.path().join("in.bin_all"), 5);
        let output = SurfelFile::new(dir.path().join("out.kdnd_surfels"), RecordLayout::Surfel);
        let tree = partition(&input, &output, &ctx, dir.path(), &settings(5, 8)).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().surfels, 0..5);
    }
}
