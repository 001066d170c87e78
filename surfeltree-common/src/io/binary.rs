use crate::geometry::surfel::Surfel;
use crate::io::{FormatError, PointFormat, PullFn};
use crate::store::RecordLayout;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Flat, headerless binary record files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFormat {
    layout: RecordLayout,
    extension: &'static str,
}

impl BinaryFormat {
    /// The full surfel layout (`.bin`), which is also the layout of the build pipeline.
    pub const fn surfels() -> Self {
        BinaryFormat {
            layout: RecordLayout::Surfel,
            extension: "bin",
        }
    }

    /// Position and colour only (`.pc_bin`).
    pub const fn points() -> Self {
        BinaryFormat {
            layout: RecordLayout::Point,
            extension: "pc_bin",
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }
}

impl PointFormat for BinaryFormat {
    fn extension(&self) -> &'static str {
        self.extension
    }

    fn carries_attributes(&self) -> bool {
        self.layout.carries_attributes()
    }

    fn read(&self, path: &Path, emit: &mut dyn FnMut(Surfel)) -> Result<u64, FormatError> {
        let file = File::open(path).map_err(|e| FormatError::io(path, e))?;
        let bytes = file.metadata().map_err(|e| FormatError::io(path, e))?.len();
        let record_size = self.layout.record_size();
        if bytes % record_size as u64 != 0 {
            return Err(FormatError::Truncated {
                path: path.to_owned(),
                bytes,
                record_size,
            });
        }
        let count = bytes / record_size as u64;
        let mut rd = BufReader::with_capacity(1 << 16, file);
        for _ in 0..count {
            let surfel = self
                .layout
                .decode(&mut rd)
                .map_err(|e| FormatError::io(path, e))?;
            emit(surfel);
        }
        Ok(count)
    }

    fn write(&self, path: &Path, pull: &mut PullFn<'_>) -> Result<u64, FormatError> {
        let file = File::create(path).map_err(|e| FormatError::io(path, e))?;
        let mut wr = BufWriter::with_capacity(1 << 16, file);
        let mut count = 0;
        while let Some(batch) = pull()? {
            for surfel in &batch {
                self.layout
                    .encode(surfel, &mut wr)
                    .map_err(|e| FormatError::io(path, e))?;
            }
            count += batch.len() as u64;
        }
        wr.flush().map_err(|e| FormatError::io(path, e))?;
        Ok(count)
    }
}
