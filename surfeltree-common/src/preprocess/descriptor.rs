use crate::store::RecordLayout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

/// Errors in the build configuration. They are detected before any stage runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown {kind} '{name}'. Must be one of: {expected}")]
    UnknownAlgorithm {
        kind: &'static str,
        name: String,
        expected: &'static str,
    },

    #[error("Invalid value {value} for {option}: {expected}")]
    OutOfRange {
        option: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Input file {} does not exist", .0.display())]
    MissingInput(PathBuf),

    #[error("Cannot tell the start stage from the extension of {}", .0.display())]
    UnknownInput(PathBuf),

    #[error("Provenance file {} must end in .prov or .xyz_prov", .0.display())]
    UnknownProvenanceFormat(PathBuf),

    #[error("Required artifact {} does not exist", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Working directory {} does not exist", .0.display())]
    MissingWorkingDirectory(PathBuf),

    #[error("The input starts at stage {start}, which is after the final stage {final_stage}")]
    StartAfterFinal { start: u8, final_stage: u8 },
}

#[derive(Error, Debug)]
pub enum DescriptorIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerDe(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReductionAlgorithm {
    Ndc,
    NdcProv,
    Constant,
    EverySecond,
    Random,
    Entropy,
    ParticleSim,
    HierarchicalClustering,
    KClustering,
    Pair,
    SpatiallySubdividedRandom,
}

impl ReductionAlgorithm {
    /// Strategies that are not numerically robust.
    pub fn is_unstable(&self) -> bool {
        matches!(
            self,
            ReductionAlgorithm::Constant
                | ReductionAlgorithm::Entropy
                | ReductionAlgorithm::ParticleSim
                | ReductionAlgorithm::KClustering
                | ReductionAlgorithm::SpatiallySubdividedRandom
                | ReductionAlgorithm::Pair
        )
    }

    /// Strategies that consume random numbers (seeded per node).
    pub fn is_seeded(&self) -> bool {
        matches!(
            self,
            ReductionAlgorithm::Random
                | ReductionAlgorithm::ParticleSim
                | ReductionAlgorithm::SpatiallySubdividedRandom
        )
    }
}

impl FromStr for ReductionAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ndc" => Ok(ReductionAlgorithm::Ndc),
            "ndc_prov" => Ok(ReductionAlgorithm::NdcProv),
            "const" | "constant" => Ok(ReductionAlgorithm::Constant),
            "everysecond" | "every_second" => Ok(ReductionAlgorithm::EverySecond),
            "random" => Ok(ReductionAlgorithm::Random),
            "entropy" => Ok(ReductionAlgorithm::Entropy),
            "particlesim" | "particle_sim" => Ok(ReductionAlgorithm::ParticleSim),
            "hierarchical" | "hierarchical_clustering" => {
                Ok(ReductionAlgorithm::HierarchicalClustering)
            }
            "kclustering" | "k_clustering" => Ok(ReductionAlgorithm::KClustering),
            "pair" => Ok(ReductionAlgorithm::Pair),
            "spatiallyrandom" | "spatially_subdivided_random" => {
                Ok(ReductionAlgorithm::SpatiallySubdividedRandom)
            }
            _ => Err(ConfigError::UnknownAlgorithm {
                kind: "reduction algorithm",
                name: s.to_string(),
                expected: "'ndc', 'ndc_prov', 'const', 'everysecond', 'random', 'entropy', \
                    'particlesim', 'hierarchical', 'kclustering', 'pair', 'spatiallyrandom'",
            }),
        }
    }
}

impl std::fmt::Display for ReductionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            ReductionAlgorithm::Ndc => "ndc",
            ReductionAlgorithm::NdcProv => "ndc_prov",
            ReductionAlgorithm::Constant => "constant",
            ReductionAlgorithm::EverySecond => "every_second",
            ReductionAlgorithm::Random => "random",
            ReductionAlgorithm::Entropy => "entropy",
            ReductionAlgorithm::ParticleSim => "particle_sim",
            ReductionAlgorithm::HierarchicalClustering => "hierarchical_clustering",
            ReductionAlgorithm::KClustering => "k_clustering",
            ReductionAlgorithm::Pair => "pair",
            ReductionAlgorithm::SpatiallySubdividedRandom => "spatially_subdivided_random",
        };
        str.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NormalComputation {
    PlaneFitting,
}

impl FromStr for NormalComputation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planefitting" | "plane_fitting" => Ok(NormalComputation::PlaneFitting),
            _ => Err(ConfigError::UnknownAlgorithm {
                kind: "normal computation algorithm",
                name: s.to_string(),
                expected: "'planefitting'",
            }),
        }
    }
}

impl std::fmt::Display for NormalComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalComputation::PlaneFitting => "plane_fitting".fmt(f),
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RadiusComputation {
    AverageDistance,
    NaturalNeighbours,
}

impl FromStr for RadiusComputation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "averagedistance" | "average_distance" => Ok(RadiusComputation::AverageDistance),
            "naturalneighbours" | "natural_neighbours" => Ok(RadiusComputation::NaturalNeighbours),
            _ => Err(ConfigError::UnknownAlgorithm {
                kind: "radius computation algorithm",
                name: s.to_string(),
                expected: "'averagedistance', 'naturalneighbours'",
            }),
        }
    }
}

impl std::fmt::Display for RadiusComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            RadiusComputation::AverageDistance => "average_distance",
            RadiusComputation::NaturalNeighbours => "natural_neighbours",
        };
        str.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepRadius {
    ArithmeticMean,
    GeometricMean,
    HarmonicMean,
}

impl RepRadius {
    /// Summarizes the given radii into a single value. Zero for no radii.
    pub fn compute(&self, radii: impl IntoIterator<Item = f64>) -> f64 {
        let mut count = 0_usize;
        let mut acc = 0.0;
        let mut all_positive = true;
        for r in radii {
            count += 1;
            match self {
                RepRadius::ArithmeticMean => acc += r,
                RepRadius::GeometricMean | RepRadius::HarmonicMean if r <= 0.0 => {
                    all_positive = false
                }
                RepRadius::GeometricMean => acc += r.ln(),
                RepRadius::HarmonicMean => acc += 1.0 / r,
            }
        }
        if count == 0 {
            return 0.0;
        }
        let n = count as f64;
        match self {
            RepRadius::ArithmeticMean => acc / n,
            // a zero radius makes both means zero
            _ if !all_positive => 0.0,
            RepRadius::GeometricMean => (acc / n).exp(),
            RepRadius::HarmonicMean => n / acc,
        }
    }
}

impl FromStr for RepRadius {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amean" | "arithmetic_mean" => Ok(RepRadius::ArithmeticMean),
            "gmean" | "geometric_mean" => Ok(RepRadius::GeometricMean),
            "hmean" | "harmonic_mean" => Ok(RepRadius::HarmonicMean),
            _ => Err(ConfigError::UnknownAlgorithm {
                kind: "representative radius algorithm",
                name: s.to_string(),
                expected: "'amean', 'gmean', 'hmean'",
            }),
        }
    }
}

impl std::fmt::Display for RepRadius {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            RepRadius::ArithmeticMean => "arithmetic_mean",
            RepRadius::GeometricMean => "geometric_mean",
            RepRadius::HarmonicMean => "harmonic_mean",
        };
        str.fmt(f)
    }
}

/// All settings of a single build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub input_file: PathBuf,
    pub working_directory: PathBuf,
    pub max_fan_factor: usize,
    pub surfels_per_node: usize,
    pub final_stage: u8,

    /// Bytes
    pub memory_budget: usize,

    /// Bytes
    pub buffer_size: usize,
    pub number_of_neighbours: usize,
    pub translate_to_origin: bool,
    pub outlier_ratio: f64,
    pub number_of_outlier_neighbours: usize,
    pub radius_multiplier: f64,
    pub reduction_algo: ReductionAlgorithm,
    pub normal_computation_algo: NormalComputation,
    pub radius_computation_algo: RadiusComputation,
    pub rep_radius_algo: RepRadius,
    pub keep_intermediate_files: bool,
    pub resample: bool,

    /// Recompute normals and radii, even if the input already has them.
    pub recompute: bool,

    /// Per point provenance values of the input cloud (`.prov` or `.xyz_prov`).
    pub provenance_file: Option<PathBuf>,

    /// Size of the worker pool. `None` uses the available parallelism.
    pub num_threads: Option<usize>,
    pub seed: u64,
}

impl BuildDescriptor {
    /// A descriptor with the default settings for the given input.
    pub fn new(input_file: impl Into<PathBuf>, working_directory: impl Into<PathBuf>) -> Self {
        BuildDescriptor {
            input_file: input_file.into(),
            working_directory: working_directory.into(),
            max_fan_factor: 2,
            surfels_per_node: 1024,
            final_stage: 5,
            memory_budget: 8 * GIB,
            buffer_size: 150 * MIB,
            number_of_neighbours: 10,
            translate_to_origin: true,
            outlier_ratio: 0.0,
            number_of_outlier_neighbours: 24,
            radius_multiplier: 1.0,
            reduction_algo: ReductionAlgorithm::Constant,
            normal_computation_algo: NormalComputation::PlaneFitting,
            radius_computation_algo: RadiusComputation::NaturalNeighbours,
            rep_radius_algo: RepRadius::ArithmeticMean,
            keep_intermediate_files: false,
            resample: false,
            recompute: false,
            provenance_file: None,
            num_threads: None,
            seed: 0,
        }
    }

    /// Checks that every option is within its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(
            ok: bool,
            option: &'static str,
            value: impl ToString,
            expected: &'static str,
        ) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    option,
                    value: value.to_string(),
                    expected,
                })
            }
        }

        check(
            (2..=8).contains(&self.max_fan_factor),
            "max_fan_factor",
            self.max_fan_factor,
            "must be in [2,8]",
        )?;
        check(
            self.surfels_per_node >= 5,
            "surfels_per_node",
            self.surfels_per_node,
            "must be at least 5",
        )?;
        check(
            self.final_stage <= 5,
            "final_stage",
            self.final_stage,
            "must be in [0,5]",
        )?;
        check(
            self.memory_budget >= GIB,
            "memory_budget",
            self.memory_budget,
            "must be at least 1 GiB",
        )?;
        check(
            self.buffer_size >= 20 * MIB,
            "buffer_size",
            self.buffer_size,
            "must be at least 20 MiB",
        )?;
        check(
            self.buffer_size <= self.memory_budget / 4,
            "buffer_size",
            self.buffer_size,
            "must not exceed a quarter of the memory budget",
        )?;
        check(
            self.number_of_neighbours >= 1,
            "number_of_neighbours",
            self.number_of_neighbours,
            "must be at least 1",
        )?;
        check(
            self.number_of_outlier_neighbours >= 1,
            "number_of_outlier_neighbours",
            self.number_of_outlier_neighbours,
            "must be at least 1",
        )?;
        check(
            (0.0..1.0).contains(&self.outlier_ratio),
            "outlier_ratio",
            self.outlier_ratio,
            "must be in [0,1)",
        )?;
        check(
            self.radius_multiplier.is_finite() && self.radius_multiplier > 0.0,
            "radius_multiplier",
            self.radius_multiplier,
            "must be positive",
        )?;
        check(
            self.num_threads != Some(0),
            "num_threads",
            0,
            "must be at least 1",
        )?;
        Ok(())
    }

    /// The reduction that is actually used. Provenance values force `ndc_prov`.
    pub fn reduction(&self) -> ReductionAlgorithm {
        if self.provenance_file.is_some() {
            ReductionAlgorithm::NdcProv
        } else {
            self.reduction_algo
        }
    }

    /// Base name of all files produced by the build.
    pub fn stem(&self) -> String {
        self.input_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "surfels".to_string())
    }

    /// Path of the artifact with the given extension in the working directory.
    pub fn artifact(&self, extension: &str) -> PathBuf {
        self.working_directory
            .join(format!("{}.{}", self.stem(), extension))
    }

    /// Where the provenance values of the `.lod` surfels are written to, for builds whose
    /// surfels carry them. Never the provenance input itself.
    pub fn provenance_output(&self) -> PathBuf {
        self.artifact("lod_prov")
    }

    /// Record layout of the intermediate surfel files before the tree stages.
    pub fn layout(&self) -> RecordLayout {
        if self.provenance_file.is_some() {
            RecordLayout::Annotated
        } else {
            RecordLayout::Surfel
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.artifact("build.json")
    }

    pub fn load_from_file(file_name: &Path) -> Result<Self, DescriptorIoError> {
        let file = File::open(file_name)?;
        let descriptor = serde_json::from_reader(file)?;
        Ok(descriptor)
    }

    pub fn save_to_file(&self, file_name: &Path) -> Result<(), DescriptorIoError> {
        let file = File::create(file_name)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let desc = BuildDescriptor::new("/data/scan.xyz", "/tmp");
        assert_eq!(desc.validate(), Ok(()));
        assert_eq!(desc.stem(), "scan");
        assert_eq!(desc.artifact("kdnd"), PathBuf::from("/tmp/scan.kdnd"));
        assert_eq!(desc.layout(), RecordLayout::Surfel);
    }

    #[test]
    fn ranges() {
        let mut desc = BuildDescriptor::new("scan.xyz", ".");
        desc.surfels_per_node = 4;
        assert!(matches!(
            desc.validate(),
            Err(ConfigError::OutOfRange {
                option: "surfels_per_node",
                ..
            })
        ));

        let mut desc = BuildDescriptor::new("scan.xyz", ".");
        desc.outlier_ratio = 1.0;
        assert!(desc.validate().is_err());

        let mut desc = BuildDescriptor::new("scan.xyz", ".");
        desc.final_stage = 6;
        assert!(desc.validate().is_err());

        let mut desc = BuildDescriptor::new("scan.xyz", ".");
        desc.memory_budget = 512 * MIB;
        assert!(desc.validate().is_err());
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(
            "const".parse::<ReductionAlgorithm>(),
            Ok(ReductionAlgorithm::Constant)
        );
        assert_eq!(
            "spatially_subdivided_random".parse::<ReductionAlgorithm>(),
            Ok(ReductionAlgorithm::SpatiallySubdividedRandom)
        );
        assert_eq!(
            "naturalneighbours".parse::<RadiusComputation>(),
            Ok(RadiusComputation::NaturalNeighbours)
        );
        assert_eq!("hmean".parse::<RepRadius>(), Ok(RepRadius::HarmonicMean));
        assert!(matches!(
            "quadric".parse::<ReductionAlgorithm>(),
            Err(ConfigError::UnknownAlgorithm { .. })
        ));
        for algo in [ReductionAlgorithm::KClustering, ReductionAlgorithm::NdcProv] {
            assert_eq!(algo.to_string().parse::<ReductionAlgorithm>(), Ok(algo));
        }
    }

    #[test]
    fn provenance_forces_ndc_prov() {
        let mut desc = BuildDescriptor::new("/data/scan.xyz", "/work");
        desc.reduction_algo = ReductionAlgorithm::Pair;
        desc.provenance_file = Some(PathBuf::from("/data/scan.prov"));
        assert_eq!(desc.reduction(), ReductionAlgorithm::NdcProv);
        assert_eq!(desc.layout(), RecordLayout::Annotated);
        // the input is never the output
        assert_eq!(
            desc.provenance_output(),
            PathBuf::from("/work/scan.lod_prov")
        );

        desc.provenance_file = None;
        assert_eq!(desc.reduction(), ReductionAlgorithm::Pair);
        assert_eq!(desc.layout(), RecordLayout::Surfel);
    }

    #[test]
    fn rep_radius() {
        let radii = [1.0, 2.0, 4.0];
        assert!((RepRadius::ArithmeticMean.compute(radii) - 7.0 / 3.0).abs() < 1e-12);
        assert!((RepRadius::GeometricMean.compute(radii) - 2.0).abs() < 1e-12);
        assert!((RepRadius::HarmonicMean.compute(radii) - 3.0 / 1.75).abs() < 1e-12);
        assert_eq!(RepRadius::HarmonicMean.compute([1.0, 0.0]), 0.0);
        assert_eq!(RepRadius::GeometricMean.compute([]), 0.0);
    }

    #[test]
    fn snapshot() {
        let dir = TempDir::new().unwrap();
        let mut desc = BuildDescriptor::new(dir.path().join("a.xyz"), dir.path());
        desc.reduction_algo = ReductionAlgorithm::HierarchicalClustering;
        desc.num_threads = Some(3);
        desc.save_to_file(&desc.snapshot_path()).unwrap();
        let loaded = BuildDescriptor::load_from_file(&desc.snapshot_path()).unwrap();
        assert_eq!(loaded, desc);
    }
}
