//! The staged build pipeline, from a point cloud file to the persisted level of detail
//! index.

use crate::buffer::BudgetError;
use crate::io::FormatError;
use crate::preprocess::descriptor::{ConfigError, DescriptorIoError};
use crate::preprocess::serializer::IndexError;
use crate::preprocess::tree::ArtifactIoError;
use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

pub mod builder;
pub mod descriptor;
pub mod estimate;
pub mod histogram;
pub mod neighbours;
pub mod outlier;
pub mod partition;
pub mod provenance;
pub mod reduction;
pub mod serializer;
pub mod tree;
pub mod upsweep;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Could not write the build descriptor {}: {source}", .path.display())]
    Descriptor {
        path: PathBuf,
        #[source]
        source: DescriptorIoError,
    },

    #[error("Could not access the tree artifact {}: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: ArtifactIoError,
    },

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("{} holds {values} provenance values for {surfels} surfels", .path.display())]
    ProvenanceMismatch {
        path: PathBuf,
        values: u64,
        surfels: u64,
    },

    #[error("Could not write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not start the worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
