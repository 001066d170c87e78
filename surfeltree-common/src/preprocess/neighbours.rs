//! Nearest neighbour queries for estimation and outlier removal.
//!
//! Neighbourhoods are answered by an r-tree over a set of surfels held in memory. For
//! surfel arrays too large for the memory budget, the array is cut into slabs along its
//! longest axis (see [ChunkPlan]). Each [Chunk] indexes the surfels of one slab (its
//! core) together with a halo of surfels close to the slab boundaries, so neighbourhoods
//! near the boundaries stay mostly intact.

use crate::buffer::BufferReservation;
use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::Surfel;
use crate::preprocess::histogram::{AxisHistogram, Quantiles, HISTOGRAM_BINS};
use crate::span;
use crate::store::{StoreContext, StoreError, SurfelReader};
use log::debug;
use nalgebra::Point3;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::mem::size_of;

/// Estimated memory of one indexed surfel: the surfel itself plus its r-tree entry.
pub const INDEX_BYTES_PER_SURFEL: usize = size_of::<Surfel>() + 64;

type IndexEntry = GeomWithData<[f64; 3], usize>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    /// Index into [NeighbourIndex::surfels]
    pub index: usize,
    pub distance: f64,
}

pub struct NeighbourIndex {
    tree: RTree<IndexEntry>,
    surfels: Vec<Surfel>,
}

impl NeighbourIndex {
    pub fn new(surfels: Vec<Surfel>) -> Self {
        let entries = surfels
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let p = s.position();
                GeomWithData::new([p.x, p.y, p.z], i)
            })
            .collect();
        NeighbourIndex {
            tree: RTree::bulk_load(entries),
            surfels,
        }
    }

    pub fn surfels(&self) -> &[Surfel] {
        &self.surfels
    }

    pub fn len(&self) -> usize {
        self.surfels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfels.is_empty()
    }

    /// The `k` nearest neighbours of the given position, closest first.
    pub fn nearest_to(&self, position: &Point3<f64>, k: usize) -> Vec<Neighbour> {
        self.nearest_filtered(position, k, usize::MAX)
    }

    /// The `k` nearest neighbours of the surfel with the given index, closest first.
    /// The surfel itself is not part of its neighbourhood, other surfels at the same
    /// position are.
    pub fn nearest(&self, index: usize, k: usize) -> Vec<Neighbour> {
        let position = *self.surfels[index].position();
        self.nearest_filtered(&position, k, index)
    }

    fn nearest_filtered(&self, position: &Point3<f64>, k: usize, exclude: usize) -> Vec<Neighbour> {
        self.tree
            .nearest_neighbor_iter_with_distance_2(&[position.x, position.y, position.z])
            .filter(|(entry, _)| entry.data != exclude)
            .take(k)
            .map(|(entry, distance_2)| Neighbour {
                index: entry.data,
                distance: distance_2.sqrt(),
            })
            .collect()
    }
}

/// Indexed surfels of one slab.
pub struct Chunk {
    /// Positions in the surfel array of the core surfels. The core surfels are the first
    /// `core.len()` surfels of the index, in the same order.
    pub core: Vec<u64>,
    pub index: NeighbourIndex,
    _reservation: BufferReservation,
}

impl Chunk {
    pub fn core_len(&self) -> usize {
        self.core.len()
    }
}

#[derive(Debug, Clone)]
struct Slab {
    part: usize,
    sub: usize,
    subs: usize,
}

/// Division of a surfel array into chunks that each fit into the memory budget.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    len: u64,
    bbox: Aabb,
    capacity: usize,
    axis: usize,
    halo: f64,
    split: Option<(AxisHistogram, Quantiles)>,
    slabs: Vec<Slab>,
}

impl ChunkPlan {
    /// Number of surfels a chunk may hold, given the memory budget. Leaves room for a
    /// few windows of sequential access next to the chunk.
    pub fn capacity_for(ctx: &StoreContext) -> usize {
        let limit = ctx.buffers.limit();
        let reserved = 3 * ctx.window_bytes;
        (limit.saturating_sub(reserved) / INDEX_BYTES_PER_SURFEL).max(16)
    }

    /// Plans the chunks with one or two sequential passes over the data.
    pub fn new(reader: &mut SurfelReader, capacity: usize, k: usize) -> Result<Self, StoreError> {
        let _span = span!("ChunkPlan::new");
        let len = reader.len();
        let mut bbox = Aabb::empty();
        for window in reader.scan() {
            for surfel in window?.iter() {
                bbox.extend(surfel.position());
            }
        }
        let axis = bbox.longest_axis();
        let mut plan = ChunkPlan {
            len,
            bbox,
            capacity,
            axis,
            halo: halo_width(&bbox, len, k),
            split: None,
            slabs: vec![Slab {
                part: 0,
                sub: 0,
                subs: 1,
            }],
        };
        if len as usize <= capacity {
            return Ok(plan);
        }

        let core_capacity = (capacity / 2).max(1) as u64;
        let parts = len.div_ceil(core_capacity) as usize;
        let mut hist = AxisHistogram::new(bbox.min[axis], bbox.max[axis], HISTOGRAM_BINS);
        for window in reader.scan() {
            for surfel in window?.iter() {
                hist.add(surfel.position()[axis]);
            }
        }
        let quantiles = hist.quantiles(parts);
        plan.slabs.clear();
        for (part, &count) in quantiles.counts.iter().enumerate() {
            let subs = count.div_ceil(core_capacity) as usize;
            for sub in 0..subs {
                plan.slabs.push(Slab { part, sub, subs });
            }
        }
        debug!(
            "Neighbour search over {} surfels in {} chunks (halo {:.4})",
            len,
            plan.slabs.len(),
            plan.halo
        );
        plan.split = Some((hist, quantiles));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.slabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    /// Bounding box of the whole surfel array.
    pub fn bbox(&self) -> &Aabb {
        &self.bbox
    }

    /// Reads and indexes the given chunk.
    pub fn load(
        &self,
        reader: &mut SurfelReader,
        ctx: &StoreContext,
        chunk: usize,
    ) -> Result<Chunk, StoreError> {
        let _span = span!("ChunkPlan::load");
        let reservation = ctx
            .buffers
            .reserve(self.capacity.min(self.len as usize) * INDEX_BYTES_PER_SURFEL)?;
        let (hist, quantiles) = match &self.split {
            None => {
                let mut surfels = Vec::with_capacity(self.len as usize);
                for window in reader.scan() {
                    surfels.extend_from_slice(&window?);
                }
                return Ok(Chunk {
                    core: (0..self.len).collect(),
                    index: NeighbourIndex::new(surfels),
                    _reservation: reservation,
                });
            }
            Some(split) => split,
        };

        let slab = &self.slabs[chunk];
        let core_capacity = (self.capacity / 2).max(1);
        let (lower, upper) = self.slab_bounds(hist, quantiles, slab.part);
        let mut core = Vec::new();
        let mut core_surfels = Vec::new();
        let mut halo = Vec::new();
        let mut rank = 0_usize;
        for window in reader.scan() {
            let window = window?;
            let first = window.first();
            for (i, surfel) in window.iter().enumerate() {
                let value = surfel.position()[self.axis];
                let part = hist.part_of(quantiles, value);
                if part == slab.part {
                    if rank / core_capacity == slab.sub {
                        core.push(first + i as u64);
                        core_surfels.push(*surfel);
                    }
                    rank += 1;
                } else if value >= lower - self.halo
                    && value <= upper + self.halo
                    && halo.len() < self.capacity - core_capacity
                {
                    halo.push(*surfel);
                }
            }
        }
        if slab.subs > 1 {
            debug!(
                "Chunk {chunk} is part {} of {} of an overfull slab",
                slab.sub + 1,
                slab.subs
            );
        }
        core_surfels.extend(halo);
        Ok(Chunk {
            core,
            index: NeighbourIndex::new(core_surfels),
            _reservation: reservation,
        })
    }

    /// Coordinate range covered by the given part.
    fn slab_bounds(&self, hist: &AxisHistogram, quantiles: &Quantiles, part: usize) -> (f64, f64) {
        let lower = match part {
            0 => f64::NEG_INFINITY,
            p => hist.edge(quantiles.split_bins[p - 1]),
        };
        let upper = match quantiles.split_bins.get(part) {
            Some(&bin) => hist.edge(bin),
            None => f64::INFINITY,
        };
        (lower, upper)
    }
}

/// Width of the halo around a slab: a generous multiple of the mean surfel spacing.
fn halo_width(bbox: &Aabb, len: u64, k: usize) -> f64 {
    if len == 0 || bbox.is_empty() {
        return 0.0;
    }
    let extent = bbox.extent();
    let mut measure = 1.0;
    let mut dims = 0;
    for i in 0..3 {
        if extent[i] > 0.0 {
            measure *= extent[i];
            dims += 1;
        }
    }
    if dims == 0 {
        return 0.0;
    }
    let spacing = (measure / len as f64).powf(1.0 / dims as f64);
    2.0 * spacing * (k as f64).sqrt()
}
