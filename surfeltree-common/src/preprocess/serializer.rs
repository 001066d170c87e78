//! The persisted index (stage 5): the node table in `.bvh`, the surfels in `.lod`.
//!
//! All numbers are little endian. The `.bvh` file starts with a 64 byte header, followed
//! by one 96 byte record per node in id order:
//!
//! | offset | header field       | type     |
//! |--------|--------------------|----------|
//! | 0      | magic `SURFTREE`   | 8 bytes  |
//! | 8      | version            | u32      |
//! | 12     | fan factor         | u32      |
//! | 16     | surfels per node   | u32      |
//! | 20     | depth              | u32      |
//! | 24     | node count         | u64      |
//! | 32     | translation        | 3 x f64  |
//! | 56     | total surfels      | u64      |
//!
//! | offset | node field         | type     |
//! |--------|--------------------|----------|
//! | 0      | parent             | u32      |
//! | 4      | first child        | u32      |
//! | 8      | child count        | u32      |
//! | 12     | depth              | u32      |
//! | 16     | bbox min           | 3 x f64  |
//! | 40     | bbox max           | 3 x f64  |
//! | 64     | rep radius         | f64      |
//! | 72     | surfel offset      | u64      |
//! | 80     | surfel count       | u64      |
//! | 88     | reserved           | u64      |
//!
//! Missing parents and children are stored as `u32::MAX`.
//!
//! Builds with provenance values additionally write one little endian f32 per `.lod`
//! record to a separate file.

use crate::geometry::bounding_box::Aabb;
use crate::preprocess::tree::{Tree, TreeNode};
use crate::span;
use crate::store::{StoreContext, StoreError, SurfelFile};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use nalgebra::{Point3, Vector3};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"SURFTREE";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 64;
pub const NODE_RECORD_SIZE: u64 = 96;

const NONE: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{} is not a surfel tree index: {reason}", .path.display())]
    InvalidHeader {
        path: std::path::PathBuf,
        reason: String,
    },
}

impl IndexError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> IndexError + '_ {
        move |source| IndexError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeader {
    pub version: u32,
    pub fan_factor: u32,
    pub surfels_per_node: u32,
    pub depth: u32,
    pub node_count: u64,
    pub translation: Vector3<f64>,
    pub total_surfels: u64,
}

/// Node record of the persisted index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    pub parent: Option<u32>,
    pub first_child: Option<u32>,
    pub child_count: u32,
    pub depth: u32,
    pub bbox: Aabb,
    pub rep_radius: f64,

    /// Index of the first surfel in the `.lod` file.
    pub surfel_offset: u64,
    pub surfel_count: u64,
}

impl IndexHeader {
    fn of_tree(tree: &Tree, total_surfels: u64) -> Self {
        IndexHeader {
            version: VERSION,
            fan_factor: tree.fan_factor as u32,
            surfels_per_node: tree.surfels_per_node as u32,
            depth: tree.depth(),
            node_count: tree.len() as u64,
            translation: tree.translation,
            total_surfels,
        }
    }

    fn write(&self, wr: &mut impl Write) -> std::io::Result<()> {
        wr.write_all(MAGIC)?;
        wr.write_u32::<LittleEndian>(self.version)?;
        wr.write_u32::<LittleEndian>(self.fan_factor)?;
        wr.write_u32::<LittleEndian>(self.surfels_per_node)?;
        wr.write_u32::<LittleEndian>(self.depth)?;
        wr.write_u64::<LittleEndian>(self.node_count)?;
        for v in self.translation.iter() {
            wr.write_f64::<LittleEndian>(*v)?;
        }
        wr.write_u64::<LittleEndian>(self.total_surfels)?;
        Ok(())
    }

    fn read(rd: &mut impl Read, path: &Path) -> Result<Self, IndexError> {
        let mut magic = [0; 8];
        rd.read_exact(&mut magic).map_err(IndexError::io(path))?;
        if &magic != MAGIC {
            return Err(IndexError::InvalidHeader {
                path: path.to_owned(),
                reason: "wrong magic number".to_string(),
            });
        }
        let mut read = || -> std::io::Result<IndexHeader> {
            Ok(IndexHeader {
                version: rd.read_u32::<LittleEndian>()?,
                fan_factor: rd.read_u32::<LittleEndian>()?,
                surfels_per_node: rd.read_u32::<LittleEndian>()?,
                depth: rd.read_u32::<LittleEndian>()?,
                node_count: rd.read_u64::<LittleEndian>()?,
                translation: Vector3::new(
                    rd.read_f64::<LittleEndian>()?,
                    rd.read_f64::<LittleEndian>()?,
                    rd.read_f64::<LittleEndian>()?,
                ),
                total_surfels: rd.read_u64::<LittleEndian>()?,
            })
        };
        let header = read().map_err(IndexError::io(path))?;
        if header.version != VERSION {
            return Err(IndexError::InvalidHeader {
                path: path.to_owned(),
                reason: format!("unsupported version {}", header.version),
            });
        }
        Ok(header)
    }
}

impl IndexNode {
    fn of_node(node: &TreeNode) -> Self {
        IndexNode {
            parent: node.parent,
            first_child: node.first_child,
            child_count: node.child_count,
            depth: node.depth,
            bbox: node.bbox,
            rep_radius: node.rep_radius,
            surfel_offset: node.surfels.start,
            surfel_count: node.surfel_count(),
        }
    }

    fn write(&self, wr: &mut impl Write) -> std::io::Result<()> {
        wr.write_u32::<LittleEndian>(self.parent.unwrap_or(NONE))?;
        wr.write_u32::<LittleEndian>(self.first_child.unwrap_or(NONE))?;
        wr.write_u32::<LittleEndian>(self.child_count)?;
        wr.write_u32::<LittleEndian>(self.depth)?;
        for v in self.bbox.min.iter().chain(self.bbox.max.iter()) {
            wr.write_f64::<LittleEndian>(*v)?;
        }
        wr.write_f64::<LittleEndian>(self.rep_radius)?;
        wr.write_u64::<LittleEndian>(self.surfel_offset)?;
        wr.write_u64::<LittleEndian>(self.surfel_count)?;
        wr.write_u64::<LittleEndian>(0)?;
        Ok(())
    }

    fn read(rd: &mut impl Read) -> std::io::Result<Self> {
        let optional = |v: u32| if v == NONE { None } else { Some(v) };
        let parent = optional(rd.read_u32::<LittleEndian>()?);
        let first_child = optional(rd.read_u32::<LittleEndian>()?);
        let child_count = rd.read_u32::<LittleEndian>()?;
        let depth = rd.read_u32::<LittleEndian>()?;
        let mut coords = [0.0; 6];
        for c in &mut coords {
            *c = rd.read_f64::<LittleEndian>()?;
        }
        let node = IndexNode {
            parent,
            first_child,
            child_count,
            depth,
            bbox: Aabb::new(
                Point3::new(coords[0], coords[1], coords[2]),
                Point3::new(coords[3], coords[4], coords[5]),
            ),
            rep_radius: rd.read_f64::<LittleEndian>()?,
            surfel_offset: rd.read_u64::<LittleEndian>()?,
            surfel_count: rd.read_u64::<LittleEndian>()?,
        };
        rd.read_u64::<LittleEndian>()?;
        Ok(node)
    }
}

/// Copies the surfels to `lod`, re-encoding them if the layouts differ. With a
/// `provenance` path, the provenance value of every surfel is written there.
fn write_surfels(
    surfels: &SurfelFile,
    lod: &SurfelFile,
    provenance: Option<&Path>,
    ctx: &StoreContext,
) -> Result<u64, IndexError> {
    if surfels.layout() == lod.layout() && provenance.is_none() {
        return Ok(surfels.copy_to(lod)?);
    }
    let mut reader = surfels.open(ctx)?;
    let mut writer = lod.create(ctx)?;
    let mut values = match provenance {
        Some(path) => {
            let file = File::create(path).map_err(IndexError::io(path))?;
            Some((path, BufWriter::new(file)))
        }
        None => None,
    };
    for window in reader.scan() {
        let window = window?;
        writer.append(&window)?;
        if let Some((path, wr)) = values.as_mut() {
            for surfel in window.iter() {
                wr.write_f32::<LittleEndian>(surfel.provenance())
                    .map_err(IndexError::io(*path))?;
            }
        }
    }
    if let Some((path, mut wr)) = values {
        wr.flush().map_err(IndexError::io(path))?;
        info!("Wrote provenance values to {}", path.display());
    }
    Ok(writer.close()?)
}

/// Stage 5: writes the node table of `tree` to `bvh_path` and its surfels to `lod`.
pub fn serialize(
    tree: &Tree,
    surfels: &SurfelFile,
    bvh_path: &Path,
    lod: &SurfelFile,
    provenance: Option<&Path>,
    ctx: &StoreContext,
) -> Result<(), IndexError> {
    let _span = span!("serialize");
    let total = write_surfels(surfels, lod, provenance, ctx)?;

    let file = File::create(bvh_path).map_err(IndexError::io(bvh_path))?;
    let mut wr = BufWriter::new(file);
    let write = |wr: &mut BufWriter<File>| -> std::io::Result<()> {
        IndexHeader::of_tree(tree, total).write(wr)?;
        for node in &tree.nodes {
            IndexNode::of_node(node).write(wr)?;
        }
        wr.flush()
    };
    write(&mut wr).map_err(IndexError::io(bvh_path))?;
    info!(
        "Wrote index with {} nodes and {} surfels to {}",
        tree.len(),
        total,
        bvh_path.display()
    );
    Ok(())
}

/// Read access to the node table of a persisted index.
pub struct IndexReader {
    header: IndexHeader,
    rd: BufReader<File>,
    path: std::path::PathBuf,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path).map_err(IndexError::io(path))?;
        let mut rd = BufReader::new(file);
        let header = IndexHeader::read(&mut rd, path)?;
        Ok(IndexReader {
            header,
            rd,
            path: path.to_owned(),
        })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Reads a single node record, without touching any other.
    pub fn node(&mut self, id: u32) -> Result<IndexNode, IndexError> {
        let offset = HEADER_SIZE + NODE_RECORD_SIZE * id as u64;
        self.rd
            .seek(SeekFrom::Start(offset))
            .map_err(IndexError::io(&self.path))?;
        IndexNode::read(&mut self.rd).map_err(IndexError::io(&self.path))
    }

    pub fn nodes(&mut self) -> Result<Vec<IndexNode>, IndexError> {
        (0..self.header.node_count as u32)
            .map(|id| self.node(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::tree::tests::uneven_tree;
    use crate::store::tests::{numbered_surfels, test_context};
    use crate::store::RecordLayout;
    use nalgebra::vector;
    use tempfile::TempDir;

    #[test]
    fn node_table_round_trip() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(16);
        let mut tree = uneven_tree();
        tree.translation = vector![1.0, -2.0, 3.5];
        for (i, node) in tree.nodes.iter_mut().enumerate() {
            node.rep_radius = i as f64 * 0.25;
        }
        let total = tree.nodes.iter().map(|n| n.surfels.end).max().unwrap();
        let surfels = SurfelFile::new(dir.path().join("t.kdnu_surfels"), RecordLayout::Surfel);
        surfels.write_all(&ctx, &numbered_surfels(total as usize)).unwrap();

        let bvh = dir.path().join("t.bvh");
        let lod = SurfelFile::new(dir.path().join("t.lod"), RecordLayout::Surfel);
        serialize(&tree, &surfels, &bvh, &lod, None, &ctx).unwrap();

        let size = std::fs::metadata(&bvh).unwrap().len();
        assert_eq!(size, HEADER_SIZE + NODE_RECORD_SIZE * tree.len() as u64);
        assert_eq!(std::fs::read(&bvh).unwrap()[..8], *MAGIC);
        assert_eq!(lod.len().unwrap(), total);

        let mut reader = IndexReader::open(&bvh).unwrap();
        assert_eq!(reader.header().node_count, tree.len() as u64);
        assert_eq!(reader.header().translation, tree.translation);
        assert_eq!(reader.header().depth, tree.depth());
        let last = tree.len() as u32 - 1;
        assert_eq!(reader.node(last).unwrap(), IndexNode::of_node(tree.node(last)));
        let nodes = reader.nodes().unwrap();
        assert_eq!(nodes[0].parent, None);
        for (read, node) in nodes.iter().zip(&tree.nodes) {
            assert_eq!(*read, IndexNode::of_node(node));
        }
    }

    #[test]
    fn provenance_values_next_to_lod() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(4);
        let tree = uneven_tree();
        let annotated: Vec<_> = numbered_surfels(9)
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.with_provenance(i as f32 + 0.5))
            .collect();
        let surfels = SurfelFile::new(dir.path().join("t.kdnu_surfels"), RecordLayout::Annotated);
        surfels.write_all(&ctx, &annotated).unwrap();

        let bvh = dir.path().join("t.bvh");
        let lod = SurfelFile::new(dir.path().join("t.lod"), RecordLayout::Surfel);
        let values = dir.path().join("t.lod_prov");
        serialize(&tree, &surfels, &bvh, &lod, Some(&values), &ctx).unwrap();

        // the lod file keeps the plain record layout
        assert_eq!(std::fs::metadata(lod.path()).unwrap().len(), 9 * 47);
        let read = lod.read_all(&ctx).unwrap();
        for (a, b) in read.iter().zip(&annotated) {
            assert_eq!(*a, b.with_provenance(0.0));
        }
        let bytes = std::fs::read(&values).unwrap();
        assert_eq!(bytes.len(), 9 * 4);
        assert_eq!(bytes[4..8], 1.5_f32.to_le_bytes());
        assert_eq!(bytes[32..36], 8.5_f32.to_le_bytes());
    }

    #[test]
    fn rejects_other_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.bvh");
        std::fs::write(&path, [0_u8; 64]).unwrap();
        assert!(matches!(
            IndexReader::open(&path),
            Err(IndexError::InvalidHeader { .. })
        ));
    }
}
