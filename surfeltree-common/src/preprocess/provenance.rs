//! Attaching user supplied provenance values to the surfels of a build.
//!
//! The values are attached before normal estimation, while the surfels are still in the
//! order of the input cloud. From there on they travel inside the surfel records
//! ([RecordLayout::Annotated]) through every stage, and are averaged whenever surfels
//! are merged.

use crate::io::provenance::ProvenanceReader;
use crate::preprocess::BuildError;
use crate::span;
use crate::store::{RecordLayout, StoreContext, SurfelFile};
use log::info;
use std::path::Path;

/// Writes the surfels of `input` with the values of the provenance file `values` to
/// `output`, which must have the annotated layout.
///
/// Returns the number of surfels. Fails unless there is exactly one value per surfel.
pub fn attach_provenance(
    input: &SurfelFile,
    values: &Path,
    output: &SurfelFile,
    ctx: &StoreContext,
) -> Result<u64, BuildError> {
    let _span = span!("attach_provenance");
    debug_assert_eq!(output.layout(), RecordLayout::Annotated);
    let mut values = ProvenanceReader::open(values)?;
    let mut reader = input.open(ctx)?;
    let surfels = reader.len();
    let mut writer = output.create(ctx)?;
    for window in reader.scan() {
        for surfel in window?.iter() {
            let Some(value) = values.next_value()? else {
                return Err(BuildError::ProvenanceMismatch {
                    path: values.path().to_owned(),
                    values: writer.len(),
                    surfels,
                });
            };
            writer.push(&surfel.with_provenance(value))?;
        }
    }
    let mut surplus = 0;
    while values.next_value()?.is_some() {
        surplus += 1;
    }
    if surplus > 0 {
        return Err(BuildError::ProvenanceMismatch {
            path: values.path().to_owned(),
            values: surfels + surplus,
            surfels,
        });
    }
    let written = writer.close()?;
    info!(
        "Attached provenance values from {} to {} surfels",
        values.path().display(),
        written
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{numbered_surfels, test_context};
    use tempfile::TempDir;

    fn setup(dir: &TempDir, n: usize, values: &str) -> (SurfelFile, std::path::PathBuf, SurfelFile) {
        let ctx = test_context(16);
        let input = SurfelFile::new(dir.path().join("a.bin"), RecordLayout::Surfel);
        input.write_all(&ctx, &numbered_surfels(n)).unwrap();
        let path = dir.path().join("a.prov");
        std::fs::write(&path, values).unwrap();
        let output = SurfelFile::new(dir.path().join("a.bin_prov"), RecordLayout::Annotated);
        (input, path, output)
    }

    #[test]
    fn values_follow_the_surfel_order() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(16);
        let text: String = (0..40).map(|i| format!("{}\n", i as f32 * 0.5)).collect();
        let (input, values, output) = setup(&dir, 40, &text);
        assert_eq!(attach_provenance(&input, &values, &output, &ctx).unwrap(), 40);

        let plain = input.read_all(&ctx).unwrap();
        let annotated = output.read_all(&ctx).unwrap();
        for (i, (a, p)) in annotated.iter().zip(plain.iter()).enumerate() {
            assert_eq!(a.provenance(), i as f32 * 0.5);
            assert_eq!(a.position(), p.position());
        }
    }

    #[test]
    fn count_mismatch() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(16);
        let (input, values, output) = setup(&dir, 3, "1\n2\n");
        assert!(matches!(
            attach_provenance(&input, &values, &output, &ctx),
            Err(BuildError::ProvenanceMismatch {
                values: 2,
                surfels: 3,
                ..
            })
        ));

        let (input, values, output) = setup(&dir, 3, "1\n2\n3\n4\n5\n");
        assert!(matches!(
            attach_provenance(&input, &values, &output, &ctx),
            Err(BuildError::ProvenanceMismatch {
                values: 5,
                surfels: 3,
                ..
            })
        ));
    }
}
