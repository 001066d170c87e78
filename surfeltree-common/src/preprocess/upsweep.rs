//! Bottom up computation of the levels of detail (stage 4).
//!
//! Levels are processed from the deepest one up to the root. Every level is written to
//! its own temporary surfel file, in node id order. Since the children of consecutive
//! nodes are consecutive as well, the input of a batch of nodes is a single contiguous
//! range of the level below, which is read as one window and reduced in parallel.
//! At the end, the level files are concatenated root first.

use crate::geometry::surfel::Surfel;
use crate::preprocess::descriptor::{ReductionAlgorithm, RepRadius};
use crate::preprocess::reduction::ReductionContext;
use crate::preprocess::tree::{NodeId, NodeState, Tree};
use crate::span;
use crate::store::{RecordLayout, StoreContext, StoreError, SurfelFile, SurfelReader, SurfelWriter};
use log::{debug, info};
use rayon::prelude::*;
use std::ops::Range;
use std::path::Path;
use tempfile::TempPath;

#[derive(Debug, Clone, Copy)]
pub struct UpsweepSettings {
    pub reduction: ReductionAlgorithm,
    pub rep_radius: RepRadius,
    pub seed: u64,
}

/// Surfels of one tree level.
struct LevelFile {
    surfels: SurfelFile,
    _path: TempPath,
}

impl LevelFile {
    fn create(temp_dir: &Path, layout: RecordLayout) -> Result<Self, StoreError> {
        let path = tempfile::Builder::new()
            .prefix("level-")
            .suffix(".tmp")
            .tempfile_in(temp_dir)
            .map_err(|source| StoreError::Io {
                path: temp_dir.to_owned(),
                source,
            })?
            .into_temp_path();
        Ok(LevelFile {
            surfels: SurfelFile::new(path.to_path_buf(), layout),
            _path: path,
        })
    }
}

struct Upsweep<'a> {
    tree: &'a mut Tree,
    settings: &'a UpsweepSettings,
    states: Vec<NodeState>,

    /// Range of every node in the file of its level.
    local: Vec<Range<u64>>,
    window_len: u64,
}

/// Stage 4: computes the representative surfels of every internal node and the
/// representative radius of every node.
///
/// Leaves keep their surfels. The surfels of all nodes are written to `output`, level by
/// level starting at the root, and the node ranges of `tree` are updated accordingly.
/// The temporary level files use the record layout of `input`.
///
/// Returns the number of surfels in `output`.
pub fn upsweep(
    tree: &mut Tree,
    input: &SurfelFile,
    output: &SurfelFile,
    ctx: &StoreContext,
    temp_dir: &Path,
    settings: &UpsweepSettings,
) -> Result<u64, StoreError> {
    let _span = span!("upsweep");
    let depth = tree.depth();
    let node_count = tree.len();
    let mut upsweep = Upsweep {
        states: tree
            .nodes
            .iter()
            .map(|n| match n.is_leaf() {
                true => NodeState::Ready,
                false => NodeState::Pending,
            })
            .collect(),
        tree,
        settings,
        local: vec![0..0; node_count],
        window_len: ctx.window_len(),
    };

    // deepest level first
    let mut levels: Vec<LevelFile> = Vec::with_capacity(depth as usize + 1);
    let mut input_reader = input.open(ctx)?;
    for d in (0..=depth).rev() {
        let level = LevelFile::create(temp_dir, input.layout())?;
        let mut writer = level.surfels.create(ctx)?;
        let mut child_reader = match levels.last() {
            Some(below) => Some(below.surfels.open(ctx)?),
            None => None,
        };

        let mut batch = Vec::new();
        let mut batch_len = 0;
        for id in upsweep.tree.level(d) {
            if upsweep.tree.node(id).is_leaf() {
                if let Some(reader) = child_reader.as_mut() {
                    upsweep.reduce_batch(&batch, reader, &mut writer)?;
                }
                batch.clear();
                batch_len = 0;
                upsweep.copy_leaf(id, &mut input_reader, &mut writer)?;
                continue;
            }
            upsweep.mark_ready(id);
            let len = upsweep.input_range(id).end - upsweep.input_range(id).start;
            if !batch.is_empty() && batch_len + len > upsweep.window_len {
                if let Some(reader) = child_reader.as_mut() {
                    upsweep.reduce_batch(&batch, reader, &mut writer)?;
                }
                batch.clear();
                batch_len = 0;
            }
            batch.push(id);
            batch_len += len;
        }
        if let Some(reader) = child_reader.as_mut() {
            upsweep.reduce_batch(&batch, reader, &mut writer)?;
        }
        let level_len = writer.close()?;
        debug!("Level {d}: {level_len} surfels");
        levels.push(level);
    }
    drop(input_reader);
    debug_assert!(upsweep.states.iter().all(|s| *s == NodeState::Done));

    let Upsweep { tree, local, .. } = upsweep;
    let mut writer = output.create(ctx)?;
    for (d, level) in levels.iter().rev().enumerate() {
        let offset = writer.len();
        let mut reader = level.surfels.open(ctx)?;
        for window in reader.scan() {
            writer.append(&window?)?;
        }
        for id in tree.level(d as u32) {
            let range = &local[id as usize];
            tree.nodes[id as usize].surfels = offset + range.start..offset + range.end;
        }
    }
    let total = writer.close()?;
    info!(
        "Computed levels of detail: {} surfels in {} nodes ({})",
        total,
        tree.len(),
        settings.reduction
    );
    Ok(total)
}

impl Upsweep<'_> {
    /// Range of the input of an internal node in the file of the level below.
    fn input_range(&self, id: NodeId) -> Range<u64> {
        let children = self.tree.node(id).children();
        self.local[children.start as usize].start..self.local[children.end as usize - 1].end
    }

    fn mark_ready(&mut self, id: NodeId) {
        let children = self.tree.node(id).children();
        debug_assert!(children
            .clone()
            .all(|c| self.states[c as usize] == NodeState::Done));
        self.states[id as usize] = NodeState::Ready;
    }

    fn copy_leaf(
        &mut self,
        id: NodeId,
        input: &mut SurfelReader,
        writer: &mut SurfelWriter,
    ) -> Result<(), StoreError> {
        let range = self.tree.node(id).surfels.clone();
        let start = writer.len();
        let mut radii = Vec::with_capacity((range.end - range.start) as usize);
        for window in input.windows(range) {
            let window = window?;
            radii.extend(window.iter().map(|s| s.radius()));
            writer.append(&window)?;
        }
        self.local[id as usize] = start..writer.len();
        self.tree.nodes[id as usize].rep_radius = self.settings.rep_radius.compute(radii);
        self.states[id as usize] = NodeState::Done;
        Ok(())
    }

    fn reduce_batch(
        &mut self,
        batch: &[NodeId],
        children: &mut SurfelReader,
        writer: &mut SurfelWriter,
    ) -> Result<(), StoreError> {
        let (Some(&first), Some(&last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };
        let _span = span!("Upsweep::reduce_batch");
        let range = self.input_range(first).start..self.input_range(last).end;
        let window = children.read_window(range.clone())?;
        let target = self.tree.surfels_per_node;
        let reduced: Vec<Vec<Surfel>> = batch
            .par_iter()
            .map(|&id| {
                let input = self.input_range(id);
                let slice = (input.start - range.start) as usize..(input.end - range.start) as usize;
                let ctx = ReductionContext {
                    node_id: id,
                    seed: self.settings.seed,
                };
                self.settings.reduction.reduce(&window[slice], target, &ctx)
            })
            .collect();
        drop(window);

        for (&id, reduced) in batch.iter().zip(reduced) {
            let start = writer.len();
            writer.append(&reduced)?;
            self.local[id as usize] = start..writer.len();
            self.tree.nodes[id as usize].rep_radius = self
                .settings
                .rep_radius
                .compute(reduced.iter().map(|s| s.radius()));
            self.states[id as usize] = NodeState::Done;
        }
        debug!(
            "Reduced {} nodes from {} surfels",
            batch.len(),
            range.end - range.start
        );
        Ok(())
    }
}
