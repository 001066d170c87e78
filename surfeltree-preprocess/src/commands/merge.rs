use anyhow::{bail, Result};
use log::info;
use std::path::Path;
use surfeltree_common::io::converter;
use surfeltree_common::io::FormatRegistry;

pub fn merge(input_dir: &Path, input_type: &str, output: &Path, buffer_size: usize) -> Result<()> {
    if !input_dir.is_dir() {
        bail!("Input directory {} does not exist.", input_dir.display());
    }
    let registry = FormatRegistry::with_defaults();
    let summary = converter::merge(&registry, input_dir, input_type, output, buffer_size)?;
    info!(
        "Merged {} files ({} skipped) with {} surfels into {}",
        summary.files,
        summary.skipped,
        summary.surfels,
        output.display()
    );
    Ok(())
}
