use crate::cli::BuildOptions;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::PathBuf;
use surfeltree_common::preprocess::builder::Builder;
use surfeltree_common::preprocess::descriptor::{BuildDescriptor, GIB, MIB};

/// Translates the command line options into a build descriptor.
/// Values are clamped into their valid ranges first.
fn descriptor(input: PathBuf, options: BuildOptions) -> Result<BuildDescriptor> {
    let working_directory = match options.working_directory {
        Some(dir) => dir,
        None => input
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow!("Input {} has no parent directory", input.display()))?,
    };
    let max_fan_factor = options.max_fanout.clamp(2, 8);
    if max_fan_factor != options.max_fanout {
        warn!("Fan-out factor clamped to {max_fan_factor}");
    }
    let memory_budget = (options.memory_budget.max(1.0) * GIB as f64) as usize;
    let buffer_size = options.buffer_size.max(20) * MIB;

    let mut descriptor = BuildDescriptor::new(input, working_directory);
    descriptor.final_stage = options.final_stage;
    descriptor.max_fan_factor = max_fan_factor;
    descriptor.surfels_per_node = options.desired;
    descriptor.memory_budget = memory_budget;
    descriptor.buffer_size = buffer_size;
    descriptor.number_of_neighbours = options.neighbours;
    descriptor.translate_to_origin = !options.no_translate_to_origin;
    descriptor.outlier_ratio = options.outlier_ratio;
    descriptor.number_of_outlier_neighbours = options.num_outlier_neighbours;
    descriptor.radius_multiplier = options.radius_multiplier;
    descriptor.reduction_algo = options.reduction_algo;
    descriptor.normal_computation_algo = options.normal_computation_algo;
    descriptor.radius_computation_algo = options.radius_computation_algo;
    descriptor.rep_radius_algo = options.rep_radius_algo;
    descriptor.keep_intermediate_files = options.keep_interm;
    descriptor.resample = options.resample;
    descriptor.recompute = options.recompute;
    descriptor.provenance_file = options.prov_file;
    descriptor.num_threads = options.threads;
    descriptor.seed = options.seed;
    Ok(descriptor)
}

pub fn build(input: PathBuf, options: BuildOptions) -> Result<()> {
    let builder = Builder::new(descriptor(input, options)?)?;
    let summary = builder.run()?;
    for output in &summary.outputs {
        info!("Output: {}", output.display());
    }
    info!(
        "Peak buffer usage: {} MiB",
        builder.peak_buffer_usage() / MIB
    );
    Ok(())
}
