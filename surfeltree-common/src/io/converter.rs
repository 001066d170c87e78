//! Format conversion and merging of many files into one.
//!
//! A reader thread pushes batches of surfels through a bounded channel to the writer,
//! so at most a few batches of `buffer_size` bytes are in flight at any time.

use crate::geometry::surfel::Surfel;
use crate::io::binary::BinaryFormat;
use crate::io::{FormatError, FormatRegistry, PointFormat};
use crate::span;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use std::io::{BufWriter, Write};
use std::mem::{size_of, take};
use std::path::{Path, PathBuf};
use std::thread;

/// Number of batches that may wait in the channel between reader and writer.
const CHANNEL_CAPACITY: usize = 2;

type Batch = Result<Vec<Surfel>, FormatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSummary {
    /// Number of input files that were merged into the output.
    pub files: usize,

    /// Input files skipped because they could not be read.
    pub skipped: usize,

    pub surfels: u64,
}

fn batch_len(buffer_size: usize) -> usize {
    (buffer_size / size_of::<Surfel>()).max(1)
}

/// Reads a file and sends its content in batches.
/// Returns `false` if the receiver hung up.
fn send_file(
    format: &dyn PointFormat,
    path: &Path,
    batch_len: usize,
    sender: &Sender<Batch>,
) -> Result<bool, FormatError> {
    let mut batch = Vec::with_capacity(batch_len);
    let mut connected = true;
    format.read(path, &mut |surfel| {
        if !connected {
            return;
        }
        batch.push(surfel);
        if batch.len() >= batch_len {
            connected = sender.send(Ok(take(&mut batch))).is_ok();
        }
    })?;
    if connected && !batch.is_empty() {
        connected = sender.send(Ok(batch)).is_ok();
    }
    Ok(connected)
}

/// Writes everything arriving on the channel with the given format.
fn receive_into(
    format: &dyn PointFormat,
    path: &Path,
    receiver: Receiver<Batch>,
) -> Result<u64, FormatError> {
    format.write(path, &mut || match receiver.recv() {
        Ok(Ok(batch)) => Ok(Some(batch)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    })
}

/// Converts a single file. The formats are chosen by file extension.
/// Any read error is fatal and is returned after the output was partially written.
pub fn convert(
    registry: &FormatRegistry,
    input: &Path,
    output: &Path,
    buffer_size: usize,
) -> Result<u64, FormatError> {
    let _span = span!("convert");
    let input_format = registry.for_path(input)?;
    let output_format = registry.for_path(output)?;
    if !input_format.carries_attributes() && output_format.carries_attributes() {
        debug!(
            "{} carries no radius and normal, they will be written as zero.",
            input.display()
        );
    }
    let batch_len = batch_len(buffer_size);
    let (sender, receiver) = crossbeam_channel::bounded(CHANNEL_CAPACITY);

    let written = thread::scope(|scope| {
        scope.spawn(move || {
            if let Err(e) = send_file(input_format, input, batch_len, &sender) {
                sender.send(Err(e)).ok();
            }
        });
        receive_into(output_format, output, receiver)
    })?;
    info!(
        "Converted {} surfels from {} to {}",
        written,
        input.display(),
        output.display()
    );
    Ok(written)
}

/// Lists the files in `dir` that have the given extension, sorted by name.
fn list_inputs(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, FormatError> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| FormatError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| FormatError::io(dir, e))?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case(extension));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Merges all files with the given extension in `input_dir` into a single output file.
///
/// Every input is first staged into a temporary binary file next to the output. Only
/// if that succeeds, it is appended to the output. An input that cannot be read is
/// skipped with a warning and contributes no surfels.
pub fn merge(
    registry: &FormatRegistry,
    input_dir: &Path,
    input_extension: &str,
    output: &Path,
    buffer_size: usize,
) -> Result<MergeSummary, FormatError> {
    let _span = span!("merge");
    let input_extension = input_extension.trim_start_matches('.');
    let input_format = registry.by_extension(input_extension)?;
    let output_format = registry.for_path(output)?;
    let inputs = list_inputs(input_dir, input_extension)?;
    info!(
        "Merging {} {} files from {}",
        inputs.len(),
        input_extension,
        input_dir.display()
    );

    let staging_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staging = BinaryFormat::surfels();
    let batch_len = batch_len(buffer_size);
    let (sender, receiver) = crossbeam_channel::bounded::<Batch>(CHANNEL_CAPACITY);

    let (summary, written) = thread::scope(|scope| {
        let producer = scope.spawn(move || -> MergeSummary {
            let mut summary = MergeSummary::default();
            for input in &inputs {
                let staged = match stage(input_format, &staging, input, staging_dir) {
                    Ok(staged) => staged,
                    Err(e) => {
                        warn!("Skipping {}: {}", input.display(), e);
                        summary.skipped += 1;
                        continue;
                    }
                };
                match send_file(&staging, staged.path(), batch_len, &sender) {
                    Ok(true) => {
                        summary.files += 1;
                    }
                    Ok(false) => break,
                    Err(e) => {
                        sender.send(Err(e)).ok();
                        break;
                    }
                }
            }
            summary
        });
        let written = receive_into(output_format, output, receiver);
        // unwrap: propagate panics of the producer thread
        (producer.join().unwrap(), written)
    });
    let written = written?;
    info!(
        "Merged {} files ({} skipped) with {} surfels into {}",
        summary.files,
        summary.skipped,
        written,
        output.display()
    );
    Ok(MergeSummary {
        surfels: written,
        ..summary
    })
}

/// Reads one input completely into a temporary binary file.
fn stage(
    format: &dyn PointFormat,
    staging: &BinaryFormat,
    input: &Path,
    dir: &Path,
) -> Result<tempfile::NamedTempFile, FormatError> {
    let staged = tempfile::Builder::new()
        .prefix("merge-")
        .suffix(".bin")
        .tempfile_in(dir)
        .map_err(|e| FormatError::io(dir, e))?;
    let layout = staging.layout();
    let mut wr = BufWriter::with_capacity(1 << 16, staged.as_file());
    let mut write_error = None;
    format.read(input, &mut |surfel| {
        if write_error.is_none() {
            if let Err(e) = layout.encode(&surfel, &mut wr) {
                write_error = Some(e);
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(FormatError::io(staged.path(), e));
    }
    wr.flush().map_err(|e| FormatError::io(staged.path(), e))?;
    drop(wr);
    Ok(staged)
}
