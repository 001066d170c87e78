use clap::Parser;
use std::path::PathBuf;
use surfeltree_common::preprocess::descriptor::{
    NormalComputation, RadiusComputation, ReductionAlgorithm, RepRadius,
};

/// Builds a surfel level of detail tree from a point cloud.
///
/// Build mode: INPUT is a point cloud (.xyz, .xyz_all, .xyz_grey, .pc_bin) or an
/// intermediate artifact of an earlier build. The extension decides at which stage the
/// build starts:
///   .bin     - stage 1: normal and radius computation
///   .bin_all - stage 2: tree creation
///   .kdnd    - stage 3: outlier removal
///   .kdno    - stage 4: level of detail creation
///   .kdnu    - stage 5: serialization
///
/// Conversion mode (-c): INPUT OUTPUT, formats by extension.
///
/// Merge mode (-g): INPUTDIR TYPE OUTPUT, merges all files of the given type.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct AppOptions {
    /// Verbosity of the command line output.
    #[clap(long, default_value = "info")]
    pub log_level: log::Level,

    /// Convert a point cloud from one format to another.
    #[clap(short = 'c', long, conflicts_with = "merge")]
    pub convert: bool,

    /// Merge the content of multiple files into one.
    #[clap(short = 'g', long)]
    pub merge: bool,

    /// INPUT, or INPUT OUTPUT (-c), or INPUTDIR TYPE OUTPUT (-g).
    #[clap(required = true, num_args = 1..=3)]
    pub user_input: Vec<PathBuf>,

    #[clap(flatten)]
    pub build: BuildOptions,
}

#[derive(Debug, Parser)]
pub struct BuildOptions {
    /// Output and intermediate files are created in this directory.
    /// Defaults to the directory of the input file.
    #[clap(short = 'w', long)]
    pub working_directory: Option<PathBuf>,

    /// Number of the stage to stop after.
    ///   0 - binary file creation
    ///   1 - normal and radius computation
    ///   2 - tree creation
    ///   3 - statistical outlier removal
    ///   4 - level of detail creation
    ///   5 - serialization
    #[clap(short = 's', long, default_value = "5", verbatim_doc_comment)]
    pub final_stage: u8,

    /// Maximum fan-out factor of the tree. The actual factor depends on the number of
    /// surfels and the desired number of surfels per node, so it may be less.
    #[clap(long, default_value = "2")]
    pub max_fanout: usize,

    /// Do not translate the surfels to the center of the root bounding box.
    #[clap(long)]
    pub no_translate_to_origin: bool,

    /// The desired number of surfels per node.
    #[clap(short = 'd', long, default_value = "1024")]
    pub desired: usize,

    /// Recompute normals and radii, even if the input already has them.
    #[clap(short = 'r', long)]
    pub recompute: bool,

    /// Share of the surfels to remove as outliers, by their mean distance to their
    /// nearest neighbours.
    #[clap(long, default_value = "0.0")]
    pub outlier_ratio: f64,

    /// Number of nearest neighbours for the outlier detection.
    #[clap(long, default_value = "24")]
    pub num_outlier_neighbours: usize,

    /// Number of nearest neighbours for the normal and radius computation.
    #[clap(long, default_value = "10")]
    pub neighbours: usize,

    /// Keep the intermediate files.
    #[clap(short = 'k', long)]
    pub keep_interm: bool,

    /// Replace huge surfels by several smaller ones.
    #[clap(long)]
    pub resample: bool,

    /// Memory budget in GiB.
    #[clap(short = 'm', long, default_value = "8.0")]
    pub memory_budget: f64,

    /// Buffer size in MiB.
    #[clap(short = 'b', long, default_value = "150")]
    pub buffer_size: usize,

    /// Per point provenance values of the input cloud (.prov: one value per line,
    /// .xyz_prov: x y z r g b value). Implies the ndc_prov reduction. The values of the
    /// final surfels are written to <stem>.lod_prov.
    #[clap(long)]
    pub prov_file: Option<PathBuf>,

    /// Reduction strategy for the level of detail creation:
    ///   ndc             - normal deviation clustering
    ///   ndc_prov        - ndc, averaging the provenance values of each cluster
    ///   const           - ndc with constant radius
    ///   everysecond     - take every second surfel
    ///   random          - random selection, duplicates are possible
    ///   entropy         - take the surfels with minimal entropy
    ///   particlesim     - particle simulation
    ///   hierarchical    - clusters by binary splitting
    ///   kclustering     - hash based k-clustering
    ///   pair            - iterative point pair contraction
    ///   spatiallyrandom - random surfels from equally sized cells
    #[clap(long, default_value = "const", verbatim_doc_comment)]
    pub reduction_algo: ReductionAlgorithm,

    /// Normal computation: planefitting.
    #[clap(long, default_value = "planefitting")]
    pub normal_computation_algo: NormalComputation,

    /// Radius computation: averagedistance or naturalneighbours.
    #[clap(long, default_value = "naturalneighbours")]
    pub radius_computation_algo: RadiusComputation,

    /// Multiplier for the computed radii.
    #[clap(long, default_value = "1.0")]
    pub radius_multiplier: f64,

    /// Representative radius of a node: amean, gmean or hmean.
    #[clap(long, default_value = "amean")]
    pub rep_radius_algo: RepRadius,

    /// Number of worker threads. Defaults to the number of cpu cores.
    #[clap(long)]
    pub threads: Option<usize>,

    /// Seed for the randomized reduction strategies.
    #[clap(long, default_value = "0")]
    pub seed: u64,
}
