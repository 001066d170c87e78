//! Arena representation of the level of detail tree.
//!
//! Nodes live in a single vector and reference each other by index. Ids are assigned
//! breadth first, so the children of a node are always contiguous, the nodes of one
//! depth are contiguous, and the parent of a node always has a smaller id.

use crate::geometry::bounding_box::Aabb;
use crate::store::{RecordLayout, SurfelFile};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type NodeId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub child_count: u32,
    pub depth: u32,
    pub bbox: Aabb,

    /// Surfels of this node in the surfel array that belongs to the tree.
    pub surfels: Range<u64>,
    pub rep_radius: f64,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.child_count == 0
    }

    pub fn children(&self) -> Range<NodeId> {
        match self.first_child {
            Some(first) => first..first + self.child_count,
            None => 0..0,
        }
    }

    pub fn surfel_count(&self) -> u64 {
        self.surfels.end - self.surfels.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub fan_factor: usize,
    pub surfels_per_node: usize,

    /// Offset that was added to the input coordinates.
    pub translation: Vector3<f64>,
    pub nodes: Vec<TreeNode>,
}

/// Node of a tree under construction, before ids are assigned.
#[derive(Debug, Clone)]
pub struct NestedNode {
    pub bbox: Aabb,
    pub surfels: Range<u64>,
    pub children: Vec<NestedNode>,
}

impl Tree {
    /// Flattens a nested tree into the breadth first arena.
    pub fn from_nested(
        root: NestedNode,
        fan_factor: usize,
        surfels_per_node: usize,
        translation: Vector3<f64>,
    ) -> Self {
        let mut nodes = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((root, None, 0_u32));
        while let Some((nested, parent, depth)) = queue.pop_front() {
            let id = nodes.len() as NodeId;
            let child_count = nested.children.len() as u32;
            // Children are queued after every node already in the queue, so their ids
            // follow directly after the ids of everything queued before them.
            let first_child = if child_count > 0 {
                Some(id + 1 + queue.len() as NodeId)
            } else {
                None
            };
            nodes.push(TreeNode {
                id,
                parent,
                first_child,
                child_count,
                depth,
                bbox: nested.bbox,
                surfels: nested.surfels,
                rep_radius: 0.0,
            });
            for child in nested.children {
                queue.push_back((child, Some(id), depth + 1));
            }
        }
        Tree {
            fan_factor,
            surfels_per_node,
            translation,
            nodes,
        }
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth of the deepest node. The root has depth 0.
    pub fn depth(&self) -> u32 {
        self.nodes.last().map_or(0, |n| n.depth)
    }

    /// Ids of all nodes with the given depth.
    pub fn level(&self, depth: u32) -> Range<NodeId> {
        let start = self.nodes.partition_point(|n| n.depth < depth);
        let end = self.nodes.partition_point(|n| n.depth <= depth);
        start as NodeId..end as NodeId
    }

    pub fn leaves(&self) -> impl Iterator<Item = &TreeNode> + '_ {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// Total number of surfels in the leaves.
    pub fn leaf_surfel_count(&self) -> u64 {
        self.leaves().map(|n| n.surfel_count()).sum()
    }

    /// Recomputes the bounding boxes of the internal nodes from their children.
    pub fn update_internal_bounds(&mut self) {
        for id in (0..self.nodes.len()).rev() {
            if self.nodes[id].is_leaf() {
                continue;
            }
            let mut bbox = Aabb::empty();
            for child in self.nodes[id].children() {
                bbox.extend_aabb(&self.nodes[child as usize].bbox);
            }
            self.nodes[id].bbox = bbox;
        }
    }

    /// Checks the structural invariants. Returns a description of the first violation.
    pub fn check(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id as usize != i {
                return Err(format!("node {i} has id {}", node.id));
            }
            match node.parent {
                None if i != 0 => return Err(format!("node {i} has no parent")),
                Some(p) if p as usize >= i => {
                    return Err(format!("parent {p} of node {i} is not before it"))
                }
                Some(p) if !self.node(p).children().contains(&node.id) => {
                    return Err(format!("node {i} is not a child of its parent {p}"))
                }
                _ => {}
            }
            if !node.is_leaf() && node.child_count as usize != self.fan_factor {
                return Err(format!(
                    "node {i} has {} children, expected {}",
                    node.child_count, self.fan_factor
                ));
            }
            for child in node.children() {
                let child = self.nodes.get(child as usize).ok_or("child id out of range")?;
                if child.parent != Some(node.id) || child.depth != node.depth + 1 {
                    return Err(format!("inconsistent child {} of node {i}", child.id));
                }
                if !node.bbox.contains_aabb(&child.bbox) {
                    return Err(format!(
                        "bounds of node {i} do not contain child {}",
                        child.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per node progress of the upsweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not all children are done yet.
    Pending,

    /// All children are done, the node can be reduced.
    Ready,

    /// The node holds its final representative surfels.
    Done,
}

#[derive(Error, Debug)]
pub enum ArtifactIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerDe(#[from] serde_json::Error),
}

/// Tree artifact on disk: the topology as json, next to a surfel array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeArtifact {
    /// File name of the surfel array, relative to the directory of the artifact.
    pub surfels_file: String,
    pub layout: RecordLayout,
    pub tree: Tree,
}

impl TreeArtifact {
    pub fn new(surfels: &SurfelFile, tree: Tree) -> Self {
        let surfels_file = surfels
            .path()
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        TreeArtifact {
            surfels_file,
            layout: surfels.layout(),
            tree,
        }
    }

    /// Resolves the surfel array belonging to the artifact stored at `artifact_path`.
    pub fn surfels_path(&self, artifact_path: &Path) -> PathBuf {
        match artifact_path.parent() {
            Some(dir) => dir.join(&self.surfels_file),
            None => PathBuf::from(&self.surfels_file),
        }
    }

    pub fn surfels(&self, artifact_path: &Path) -> SurfelFile {
        SurfelFile::new(self.surfels_path(artifact_path), self.layout)
    }

    pub fn load_from_file(file_name: &Path) -> Result<Self, ArtifactIoError> {
        let file = File::open(file_name)?;
        let artifact = serde_json::from_reader(BufReader::new(file))?;
        Ok(artifact)
    }

    pub fn save_to_file(&self, file_name: &Path) -> Result<(), ArtifactIoError> {
        let file = File::create(file_name)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }
}
