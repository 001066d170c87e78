//! Sequencing of the build stages.
//!
//! The first stage is implied by the extension of the input, so a build can be resumed
//! from any intermediate artifact. The stages then run strictly one after another, up to
//! and including the final stage of the descriptor.
//!
//! The outputs of a stage are written under temporary names and renamed once the stage
//! succeeded, so a failed stage never leaves a partial artifact behind.

use crate::buffer::BufferManager;
use crate::io::provenance::ProvenanceFormat;
use crate::io::{converter, FormatRegistry};
use crate::preprocess::descriptor::{BuildDescriptor, ConfigError, ReductionAlgorithm};
use crate::preprocess::estimate::{estimate, EstimationSettings};
use crate::preprocess::neighbours::ChunkPlan;
use crate::preprocess::outlier::{filter_outliers, OutlierSettings};
use crate::preprocess::partition::{partition, PartitionSettings};
use crate::preprocess::provenance::attach_provenance;
use crate::preprocess::serializer::serialize;
use crate::preprocess::tree::{Tree, TreeArtifact};
use crate::preprocess::upsweep::{upsweep, UpsweepSettings};
use crate::preprocess::BuildError;
use crate::span;
use crate::store::{RecordLayout, StoreContext, SurfelFile};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Binarize = 0,
    Estimate = 1,
    Partition = 2,
    Filter = 3,
    Reduce = 4,
    Serialize = 5,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Binarize,
        Stage::Estimate,
        Stage::Partition,
        Stage::Filter,
        Stage::Reduce,
        Stage::Serialize,
    ];

    pub fn index(&self) -> u8 {
        *self as u8
    }

    /// The stage that consumes a file with the given path.
    pub fn for_input(path: &Path, registry: &FormatRegistry) -> Result<Stage, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ConfigError::UnknownInput(path.to_owned()))?;
        let stage = match extension.as_str() {
            "bin" => Stage::Estimate,
            "bin_all" => Stage::Partition,
            "kdnd" => Stage::Filter,
            "kdno" => Stage::Reduce,
            "kdnu" => Stage::Serialize,
            other if registry.by_extension(other).is_ok() => Stage::Binarize,
            _ => return Err(ConfigError::UnknownInput(path.to_owned())),
        };
        Ok(stage)
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Binarize => "binarize",
            Stage::Estimate => "estimate",
            Stage::Partition => "partition",
            Stage::Filter => "filter",
            Stage::Reduce => "reduce",
            Stage::Serialize => "serialize",
        };
        write!(f, "{} ({name})", self.index())
    }
}

/// Files that make up the output of one stage.
#[derive(Debug, Clone)]
struct Artifact {
    /// The file the next stage reads.
    path: PathBuf,

    /// Every file belonging to the artifact, including `path`.
    files: Vec<PathBuf>,

    /// Whether the artifact was created by this build (and may therefore be deleted).
    produced: bool,
}

impl Artifact {
    fn input(path: &Path) -> Self {
        Artifact {
            path: path.to_owned(),
            files: vec![],
            produced: false,
        }
    }

    fn produced(path: PathBuf, mut others: Vec<PathBuf>) -> Self {
        others.insert(0, path.clone());
        Artifact {
            path,
            files: others,
            produced: true,
        }
    }

    fn remove(&self) {
        if !self.produced {
            return;
        }
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => debug!("Deleted intermediate file {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete {}: {e}", file.display()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub first_stage: Stage,
    pub final_stage: Stage,

    /// Files of the final artifact.
    pub outputs: Vec<PathBuf>,
}

/// Outputs of one stage. They are written to temporary files in the working directory and
/// only get their final names once the whole stage succeeded.
struct Staged {
    dir: PathBuf,
    files: Vec<(TempPath, PathBuf)>,
}

impl Staged {
    fn new(dir: &Path) -> Self {
        Staged {
            dir: dir.to_owned(),
            files: vec![],
        }
    }

    /// Temporary stand-in for `target`. Keeps its extension, formats are chosen by it.
    fn output(&mut self, target: &Path) -> Result<PathBuf, BuildError> {
        let suffix = target
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let temp = scratch_file(&self.dir, &suffix)?;
        let path = temp.to_path_buf();
        self.files.push((temp, target.to_owned()));
        Ok(path)
    }

    fn surfels(&mut self, target: &SurfelFile) -> Result<SurfelFile, BuildError> {
        let path = self.output(target.path())?;
        Ok(SurfelFile::new(path, target.layout()))
    }

    /// Moves every output to its final name.
    fn commit(self) -> Result<(), BuildError> {
        for (temp, target) in self.files {
            temp.persist(&target).map_err(|e| BuildError::Io {
                path: target.clone(),
                source: e.error,
            })?;
            debug!("Wrote {}", target.display());
        }
        Ok(())
    }
}

/// Empty temporary file in `dir`, deleted when dropped.
fn scratch_file(dir: &Path, suffix: &str) -> Result<TempPath, BuildError> {
    let file = tempfile::Builder::new()
        .prefix(".staged-")
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|source| BuildError::Io {
            path: dir.to_owned(),
            source,
        })?;
    Ok(file.into_temp_path())
}

pub struct Builder {
    descriptor: BuildDescriptor,
    registry: FormatRegistry,
    ctx: StoreContext,
}

impl Builder {
    /// Validates the descriptor and sets up the buffer budget for a build.
    pub fn new(descriptor: BuildDescriptor) -> Result<Self, BuildError> {
        descriptor.validate()?;
        let buffers = BufferManager::new(descriptor.memory_budget, descriptor.memory_budget / 10);
        let ctx = StoreContext::new(buffers, descriptor.buffer_size);
        Ok(Builder {
            descriptor,
            registry: FormatRegistry::with_defaults(),
            ctx,
        })
    }

    pub fn descriptor(&self) -> &BuildDescriptor {
        &self.descriptor
    }

    /// Highest number of buffer bytes that were reserved at the same time so far.
    pub fn peak_buffer_usage(&self) -> usize {
        self.ctx.buffers.peak()
    }

    /// Checks everything that can be checked before the first stage runs.
    /// Returns the first stage.
    pub fn check(&self) -> Result<Stage, ConfigError> {
        let d = &self.descriptor;
        if !d.input_file.is_file() {
            return Err(ConfigError::MissingInput(d.input_file.clone()));
        }
        if !d.working_directory.is_dir() {
            return Err(ConfigError::MissingWorkingDirectory(
                d.working_directory.clone(),
            ));
        }
        let first = Stage::for_input(&d.input_file, &self.registry)?;
        if first.index() > d.final_stage {
            return Err(ConfigError::StartAfterFinal {
                start: first.index(),
                final_stage: d.final_stage,
            });
        }
        match &d.provenance_file {
            // the values are attached during estimation
            Some(values) if first <= Stage::Estimate => {
                ProvenanceFormat::for_path(values)
                    .map_err(|_| ConfigError::UnknownProvenanceFormat(values.clone()))?;
                if !values.is_file() {
                    return Err(ConfigError::MissingInput(values.clone()));
                }
            }
            _ => {}
        }
        if first >= Stage::Filter {
            // tree artifacts need their surfel array
            let artifact = TreeArtifact::load_from_file(&d.input_file)
                .map_err(|_| ConfigError::MissingArtifact(d.input_file.clone()))?;
            let surfels = artifact.surfels_path(&d.input_file);
            if !surfels.is_file() {
                return Err(ConfigError::MissingArtifact(surfels));
            }
        }
        Ok(first)
    }

    /// Runs the build.
    pub fn run(&self) -> Result<BuildSummary, BuildError> {
        let _span = span!("Builder::run");
        let first = self.check()?;
        let d = &self.descriptor;
        let reduction = d.reduction();
        if reduction.is_unstable() {
            warn!("The reduction algorithm '{reduction}' is experimental and may give poor results.");
        }
        if reduction.is_seeded() {
            info!("The reduction algorithm '{reduction}' uses the seed {}", d.seed);
        }
        if d.reduction_algo == ReductionAlgorithm::NdcProv && d.provenance_file.is_none() {
            warn!("No provenance values given, 'ndc_prov' reduces like 'ndc'.");
        }
        let snapshot = d.snapshot_path();
        d.save_to_file(&snapshot)
            .map_err(|source| BuildError::Descriptor {
                path: snapshot.clone(),
                source,
            })?;

        let mut pool = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = d.num_threads {
            pool = pool.num_threads(threads);
        }
        let pool = pool.build()?;
        info!(
            "Building {} from stage {first} to stage {} with {} threads",
            d.input_file.display(),
            d.final_stage,
            pool.current_num_threads()
        );

        pool.install(|| -> Result<BuildSummary, BuildError> {
            let mut current = Artifact::input(&d.input_file);
            let mut last = first;
            for stage in Stage::ALL
                .into_iter()
                .filter(|s| *s >= first && s.index() <= d.final_stage)
            {
                info!("Stage {stage}");
                let mut staged = Staged::new(&d.working_directory);
                let next = self.run_stage(stage, &current, &mut staged)?;
                staged.commit()?;
                if !d.keep_intermediate_files {
                    current.remove();
                }
                current = next;
                last = stage;
            }
            info!("Build finished.");
            Ok(BuildSummary {
                first_stage: first,
                final_stage: last,
                outputs: current.files,
            })
        })
    }

    fn load_tree(path: &Path) -> Result<(Tree, SurfelFile), BuildError> {
        let artifact = TreeArtifact::load_from_file(path).map_err(|source| BuildError::Artifact {
            path: path.to_owned(),
            source,
        })?;
        let surfels = artifact.surfels(path);
        Ok((artifact.tree, surfels))
    }

    /// Final surfel array of the tree artifact with the given extension.
    fn tree_surfels(&self, extension: &str, layout: RecordLayout) -> SurfelFile {
        SurfelFile::new(
            self.descriptor.artifact(&format!("{extension}_surfels")),
            layout,
        )
    }

    fn save_tree(
        &self,
        staged: &mut Staged,
        tree: Tree,
        extension: &str,
        surfels: &SurfelFile,
    ) -> Result<Artifact, BuildError> {
        let path = self.descriptor.artifact(extension);
        let staged_path = staged.output(&path)?;
        TreeArtifact::new(surfels, tree)
            .save_to_file(&staged_path)
            .map_err(|source| BuildError::Artifact {
                path: path.clone(),
                source,
            })?;
        Ok(Artifact::produced(path, vec![surfels.path().to_owned()]))
    }

    fn run_stage(
        &self,
        stage: Stage,
        input: &Artifact,
        staged: &mut Staged,
    ) -> Result<Artifact, BuildError> {
        let d = &self.descriptor;
        let ctx = &self.ctx;
        match stage {
            Stage::Binarize => {
                let output = d.artifact("bin");
                converter::convert(
                    &self.registry,
                    &input.path,
                    &staged.output(&output)?,
                    d.buffer_size,
                )?;
                Ok(Artifact::produced(output, vec![]))
            }
            Stage::Estimate => {
                let plain = SurfelFile::new(&input.path, RecordLayout::Surfel);
                let mut annotated = None;
                if let Some(values) = &d.provenance_file {
                    let scratch = scratch_file(&d.working_directory, ".bin_prov")?;
                    let file = SurfelFile::new(scratch.to_path_buf(), RecordLayout::Annotated);
                    attach_provenance(&plain, values, &file, ctx)?;
                    annotated = Some((scratch, file));
                }
                let source = annotated.as_ref().map_or(&plain, |(_, file)| file);

                let target = SurfelFile::new(d.artifact("bin_all"), source.layout());
                let settings = EstimationSettings {
                    number_of_neighbours: d.number_of_neighbours,
                    normal_computation: d.normal_computation_algo,
                    radius_computation: d.radius_computation_algo,
                    radius_multiplier: d.radius_multiplier,
                    recompute: d.recompute,
                    resample: d.resample,
                };
                let summary = estimate(
                    source,
                    &staged.surfels(&target)?,
                    ctx,
                    &settings,
                    ChunkPlan::capacity_for(ctx),
                )?;
                info!(
                    "Estimated {} of {} surfels",
                    summary.estimated, summary.surfels
                );
                Ok(Artifact::produced(target.path().to_owned(), vec![]))
            }
            Stage::Partition => {
                // a .bin_all has provenance values exactly if the build has them
                let input = SurfelFile::new(&input.path, d.layout());
                if input.is_empty()? {
                    return Err(BuildError::DegenerateInput(format!(
                        "{} contains no surfels",
                        input.path().display()
                    )));
                }
                let settings = PartitionSettings {
                    max_fan_factor: d.max_fan_factor,
                    surfels_per_node: d.surfels_per_node,
                    translate_to_origin: d.translate_to_origin,
                };
                let target = self.tree_surfels("kdnd", input.layout());
                let tree = partition(
                    &input,
                    &staged.surfels(&target)?,
                    ctx,
                    &d.working_directory,
                    &settings,
                )?;
                tree.check().map_err(BuildError::DegenerateInput)?;
                self.save_tree(staged, tree, "kdnd", &target)
            }
            Stage::Filter => {
                let (mut tree, surfels) = Self::load_tree(&input.path)?;
                let settings = OutlierSettings {
                    ratio: d.outlier_ratio,
                    neighbours: d.number_of_outlier_neighbours,
                };
                let target = self.tree_surfels("kdno", surfels.layout());
                filter_outliers(&mut tree, &surfels, &staged.surfels(&target)?, ctx, &settings)?;
                self.save_tree(staged, tree, "kdno", &target)
            }
            Stage::Reduce => {
                let (mut tree, surfels) = Self::load_tree(&input.path)?;
                let settings = UpsweepSettings {
                    reduction: d.reduction(),
                    rep_radius: d.rep_radius_algo,
                    seed: d.seed,
                };
                let target = self.tree_surfels("kdnu", surfels.layout());
                upsweep(
                    &mut tree,
                    &surfels,
                    &staged.surfels(&target)?,
                    ctx,
                    &d.working_directory,
                    &settings,
                )?;
                self.save_tree(staged, tree, "kdnu", &target)
            }
            Stage::Serialize => {
                let (tree, surfels) = Self::load_tree(&input.path)?;
                let bvh = d.artifact("bvh");
                let lod = d.artifact("lod");
                let provenance = match surfels.layout() {
                    RecordLayout::Annotated => Some(d.provenance_output()),
                    _ => {
                        if d.provenance_file.is_some() {
                            warn!(
                                "{} carries no provenance values, none will be written.",
                                surfels.path().display()
                            );
                        }
                        None
                    }
                };
                let staged_provenance = match &provenance {
                    Some(path) => Some(staged.output(path)?),
                    None => None,
                };
                serialize(
                    &tree,
                    &surfels,
                    &staged.output(&bvh)?,
                    &staged.surfels(&SurfelFile::new(&lod, RecordLayout::Surfel))?,
                    staged_provenance.as_deref(),
                    ctx,
                )?;
                let mut others = vec![lod];
                others.extend(provenance);
                Ok(Artifact {
                    // the final index is never deleted
                    produced: false,
                    ..Artifact::produced(bvh, others)
                })
            }
        }
    }
}
