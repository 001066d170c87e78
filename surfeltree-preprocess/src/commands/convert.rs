use anyhow::Result;
use std::path::Path;
use surfeltree_common::io::converter;
use surfeltree_common::io::FormatRegistry;

pub fn convert(input: &Path, output: &Path, buffer_size: usize) -> Result<()> {
    let registry = FormatRegistry::with_defaults();
    converter::convert(&registry, input, output, buffer_size)?;
    Ok(())
}
