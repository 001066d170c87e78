//! Per point provenance values, given next to a point cloud.
//!
//! The values are matched to the points by their order: the n-th value belongs to the
//! n-th point of the input cloud.

use crate::io::FormatError;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvenanceFormat {
    /// `.prov`: one value per line.
    Values,

    /// `.xyz_prov`: `x y z r g b p` per line. Only `p` is used.
    XyzProv,
}

impl ProvenanceFormat {
    pub fn for_path(path: &Path) -> Result<Self, FormatError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "prov" => Ok(ProvenanceFormat::Values),
            "xyz_prov" => Ok(ProvenanceFormat::XyzProv),
            _ => Err(FormatError::UnknownFormat(path.display().to_string())),
        }
    }

    fn parse_line(self, line: &str) -> Result<f32, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected = match self {
            ProvenanceFormat::Values => 1,
            ProvenanceFormat::XyzProv => 7,
        };
        if fields.len() != expected {
            return Err(format!(
                "expected {expected} values, found {}",
                fields.len()
            ));
        }
        let field = fields[expected - 1];
        field
            .parse::<f32>()
            .map_err(|_| format!("invalid number '{field}'"))
    }
}

/// Streaming reader over the values of a provenance file.
pub struct ProvenanceReader {
    format: ProvenanceFormat,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_nr: usize,
}

impl ProvenanceReader {
    pub fn open(path: &Path) -> Result<Self, FormatError> {
        let format = ProvenanceFormat::for_path(path)?;
        let file = File::open(path).map_err(|e| FormatError::io(path, e))?;
        Ok(ProvenanceReader {
            format,
            path: path.to_owned(),
            lines: BufReader::new(file).lines(),
            line_nr: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next value, or `None` at the end of the file.
    pub fn next_value(&mut self) -> Result<Option<f32>, FormatError> {
        for line in self.lines.by_ref() {
            self.line_nr += 1;
            let line = line.map_err(|e| FormatError::io(&self.path, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let value = self
                .format
                .parse_line(line)
                .map_err(|message| FormatError::Parse {
                    path: self.path.clone(),
                    line: self.line_nr,
                    message,
                })?;
            return Ok(Some(value));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(path: &Path) -> Result<Vec<f32>, FormatError> {
        let mut reader = ProvenanceReader::open(path)?;
        let mut values = Vec::new();
        while let Some(value) = reader.next_value()? {
            values.push(value);
        }
        Ok(values)
    }

    #[test]
    fn single_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.prov");
        std::fs::write(&path, "0.5\n# comment\n\n-2\n1e3\n").unwrap();
        assert_eq!(read_all(&path).unwrap(), vec![0.5, -2.0, 1000.0]);
    }

    #[test]
    fn points_with_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.xyz_prov");
        std::fs::write(&path, "1 2 3 255 0 0 0.25\n4 5 6 0 255 0 0.75\n").unwrap();
        assert_eq!(read_all(&path).unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.prov");
        std::fs::write(&path, "1\n2 3\n").unwrap();
        assert!(matches!(
            read_all(&path),
            Err(FormatError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            ProvenanceReader::open(&dir.path().join("a.txt")),
            Err(FormatError::UnknownFormat(_))
        ));
        assert!(matches!(
            ProvenanceReader::open(&dir.path().join("missing.prov")),
            Err(FormatError::Io { .. })
        ));
    }
}
