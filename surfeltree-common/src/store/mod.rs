//! Disk-backed surfel arrays.
//!
//! A surfel array is a flat file of fixed-size records (see [RecordLayout]).
//! Reading goes through bounded in-memory [Window]s, whose memory is reserved from the
//! shared [BufferManager]. Writing is append-only through a [SurfelWriter] with a single
//! bounded write buffer.

pub mod record;

use crate::buffer::{BudgetError, BufferManager, BufferReservation};
use crate::geometry::surfel::Surfel;
use crate::span;
pub use record::RecordLayout;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of windows a single reader keeps cached for random access.
const MAX_CACHED_WINDOWS: usize = 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Surfel file {} does not exist", .path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Surfel file {} is truncated: {bytes} bytes is not a multiple of the record size {record_size}", .path.display())]
    Truncated {
        path: PathBuf,
        bytes: u64,
        record_size: usize,
    },

    #[error("Surfel index {index} is out of range for a file with {len} surfels")]
    OutOfRange { index: u64, len: u64 },

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            StoreError::NotFound {
                path: path.to_owned(),
            }
        } else {
            StoreError::Io {
                path: path.to_owned(),
                source,
            }
        }
    }
}

/// Everything a disk array needs to allocate its buffers.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub buffers: Arc<BufferManager>,

    /// Size of a single buffer window in bytes.
    pub window_bytes: usize,
}

impl StoreContext {
    pub fn new(buffers: Arc<BufferManager>, window_bytes: usize) -> Self {
        StoreContext {
            buffers,
            window_bytes,
        }
    }

    /// Number of surfels in a full window.
    pub fn window_len(&self) -> u64 {
        (self.window_bytes / size_of::<Surfel>()).max(1) as u64
    }

    /// Bytes to reserve for holding the given number of surfels in memory.
    pub fn bytes_for(count: usize) -> usize {
        count * size_of::<Surfel>()
    }
}

/// A surfel array on disk, identified by its path and record layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfelFile {
    path: PathBuf,
    layout: RecordLayout,
}

impl SurfelFile {
    pub fn new(path: impl Into<PathBuf>, layout: RecordLayout) -> Self {
        SurfelFile {
            path: path.into(),
            layout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Number of surfels in the file, derived from the file size.
    pub fn len(&self) -> Result<u64, StoreError> {
        let bytes = std::fs::metadata(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();
        let record_size = self.layout.record_size();
        if bytes % record_size as u64 != 0 {
            return Err(StoreError::Truncated {
                path: self.path.clone(),
                bytes,
                record_size,
            });
        }
        Ok(bytes / record_size as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Opens the file for reading.
    pub fn open(&self, ctx: &StoreContext) -> Result<SurfelReader, StoreError> {
        let len = self.len()?;
        let file = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(SurfelReader {
            file,
            source: self.clone(),
            len,
            ctx: ctx.clone(),
            windows: VecDeque::new(),
        })
    }

    /// Creates (or truncates) the file for writing.
    pub fn create(&self, ctx: &StoreContext) -> Result<SurfelWriter, StoreError> {
        self.create_with_buffer(ctx, ctx.window_len() as usize * self.layout.record_size())
    }

    /// Like [SurfelFile::create], but with a write buffer of the given size, for writing
    /// many files at once.
    pub fn create_with_buffer(
        &self,
        ctx: &StoreContext,
        buffer_bytes: usize,
    ) -> Result<SurfelWriter, StoreError> {
        let capacity = buffer_bytes.max(self.layout.record_size());
        let reservation = ctx.buffers.reserve(capacity)?;
        let file = File::create(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(SurfelWriter {
            file,
            target: self.clone(),
            pending: Vec::with_capacity(capacity),
            capacity,
            written: 0,
            _reservation: reservation,
        })
    }

    /// Deletes the file. A file that does not exist is not an error.
    pub fn remove(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Copies the file. Both files must have the same layout.
    pub fn copy_to(&self, other: &SurfelFile) -> Result<u64, StoreError> {
        assert_eq!(self.layout, other.layout, "copy between different layouts");
        std::fs::copy(&self.path, &other.path).map_err(|e| StoreError::io(&other.path, e))?;
        other.len()
    }

    /// Reads the whole file into a single window.
    pub fn read_all(&self, ctx: &StoreContext) -> Result<Window, StoreError> {
        let mut reader = self.open(ctx)?;
        let len = reader.len();
        reader.read_window(0..len)
    }

    /// Writes the given surfels as the complete content of the file.
    pub fn write_all(&self, ctx: &StoreContext, surfels: &[Surfel]) -> Result<u64, StoreError> {
        let mut writer = self.create(ctx)?;
        writer.append(surfels)?;
        writer.close()
    }
}

/// A bounded, in-memory copy of a contiguous range of a surfel file.
/// The buffer memory is given back to the [BufferManager] when the window is dropped.
pub struct Window {
    first: u64,
    surfels: Vec<Surfel>,
    _reservation: BufferReservation,
}

impl Window {
    /// Index of the first surfel of this window within its file.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Range of surfel indices covered by this window.
    pub fn range(&self) -> Range<u64> {
        self.first..self.first + self.surfels.len() as u64
    }

    pub fn surfels(&self) -> &[Surfel] {
        &self.surfels
    }

    /// Takes the surfels out of the window, releasing the buffer memory.
    pub fn into_vec(self) -> Vec<Surfel> {
        self.surfels
    }
}

impl Deref for Window {
    type Target = [Surfel];

    fn deref(&self) -> &Self::Target {
        &self.surfels
    }
}

/// Read access to a surfel file.
///
/// Random access faults in aligned windows, of which at most [MAX_CACHED_WINDOWS] are
/// kept in least recently used order. Sequential scans ([SurfelReader::windows]) use one
/// forward advancing window at a time.
pub struct SurfelReader {
    file: File,
    source: SurfelFile,
    len: u64,
    ctx: StoreContext,

    /// front = least recently used
    windows: VecDeque<Window>,
}

impl SurfelReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &SurfelFile {
        &self.source
    }

    /// Random access to a single surfel.
    pub fn read_surfel(&mut self, index: u64) -> Result<Surfel, StoreError> {
        if index >= self.len {
            return Err(StoreError::OutOfRange {
                index,
                len: self.len,
            });
        }
        if let Some(pos) = self.windows.iter().position(|w| w.range().contains(&index)) {
            // unwrap: position was just found
            let window = self.windows.remove(pos).unwrap();
            let surfel = window[(index - window.first) as usize];
            self.windows.push_back(window);
            return Ok(surfel);
        }

        let window_len = self.ctx.window_len();
        let start = index / window_len * window_len;
        let end = (start + window_len).min(self.len);
        if self.windows.len() >= MAX_CACHED_WINDOWS {
            self.windows.pop_front();
        }
        let window = self.read_window(start..end)?;
        let surfel = window[(index - start) as usize];
        self.windows.push_back(window);
        Ok(surfel)
    }

    /// Reads the given range into a new window, that is not cached by the reader.
    ///
    /// If the buffer budget is exhausted, the cached windows of this reader are released
    /// first (least recently used first). After that, the call blocks until some other
    /// consumer releases enough buffer memory.
    pub fn read_window(&mut self, range: Range<u64>) -> Result<Window, StoreError> {
        let _span = span!("SurfelReader::read_window");
        if range.end > self.len {
            return Err(StoreError::OutOfRange {
                index: range.end.saturating_sub(1),
                len: self.len,
            });
        }
        let count = range.end.saturating_sub(range.start) as usize;
        let bytes = StoreContext::bytes_for(count);
        let reservation = loop {
            if let Some(reservation) = self.ctx.buffers.try_reserve(bytes) {
                break reservation;
            }
            if self.windows.pop_front().is_none() {
                break self.ctx.buffers.reserve(bytes)?;
            }
        };

        let path = self.source.path.clone();
        let layout = self.source.layout;
        let offset = range.start * layout.record_size() as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::io(&path, e))?;
        let mut rd = BufReader::with_capacity(1 << 16, &mut self.file);
        let mut surfels = Vec::with_capacity(count);
        for _ in 0..count {
            let surfel = layout.decode(&mut rd).map_err(|e| StoreError::io(&path, e))?;
            surfels.push(surfel);
        }
        Ok(Window {
            first: range.start,
            surfels,
            _reservation: reservation,
        })
    }

    /// Sequential scan over the given range, one window at a time.
    pub fn windows(&mut self, range: Range<u64>) -> WindowIter<'_> {
        WindowIter {
            next: range.start,
            end: range.end.min(self.len),
            reader: self,
        }
    }

    /// Sequential scan over the whole file.
    pub fn scan(&mut self) -> WindowIter<'_> {
        let len = self.len;
        self.windows(0..len)
    }
}

pub struct WindowIter<'a> {
    reader: &'a mut SurfelReader,
    next: u64,
    end: u64,
}

impl Iterator for WindowIter<'_> {
    type Item = Result<Window, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = (start + self.reader.ctx.window_len()).min(self.end);
        self.next = end;
        Some(self.reader.read_window(start..end))
    }
}

/// Append-only write access to a surfel file.
///
/// Appended surfels are collected in a bounded buffer and written to disk whenever it is
/// full. [SurfelWriter::close] must be called to write the remaining buffer; since it
/// consumes the writer, appending to a closed file is impossible.
pub struct SurfelWriter {
    file: File,
    target: SurfelFile,
    pending: Vec<u8>,
    capacity: usize,
    written: u64,
    _reservation: BufferReservation,
}

impl SurfelWriter {
    pub fn file(&self) -> &SurfelFile {
        &self.target
    }

    /// Number of surfels appended so far.
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn push(&mut self, surfel: &Surfel) -> Result<(), StoreError> {
        // unwrap: writing into a Vec cannot fail
        self.target
            .layout
            .encode(surfel, &mut self.pending)
            .unwrap();
        self.written += 1;
        if self.pending.len() >= self.capacity {
            self.flush_pending()?;
        }
        Ok(())
    }

    pub fn append(&mut self, surfels: &[Surfel]) -> Result<(), StoreError> {
        for surfel in surfels {
            self.push(surfel)?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), StoreError> {
        self.file
            .write_all(&self.pending)
            .map_err(|e| StoreError::io(&self.target.path, e))?;
        self.pending.clear();
        Ok(())
    }

    /// Writes all remaining data to disk and closes the file.
    /// Returns the total number of surfels in the file.
    pub fn close(mut self) -> Result<u64, StoreError> {
        self.flush_pending()?;
        self.file
            .sync_all()
            .map_err(|e| StoreError::io(&self.target.path, e))?;
        Ok(self.written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nalgebra::{point, vector};
    use tempfile::TempDir;

    pub fn test_context(window_len: usize) -> StoreContext {
        StoreContext::new(
            BufferManager::new(64 * 1024 * 1024, 0),
            window_len * size_of::<Surfel>(),
        )
    }

    pub fn numbered_surfels(n: usize) -> Vec<Surfel> {
        (0..n)
            .map(|i| {
                Surfel::new(
                    point![i as f64, (i * 2) as f64 + 0.5, -(i as f64) / 3.0],
                    [(i % 256) as u8, ((i / 256) % 256) as u8, 7],
                    i as f64 * 0.01,
                    vector![0.0, 0.0, 1.0],
                )
            })
            .collect()
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(16);
        for n in [0, 1, 15, 16, 17, 100] {
            let surfels = numbered_surfels(n);
            let file = SurfelFile::new(dir.path().join(format!("{n}.bin")), RecordLayout::Surfel);
            assert_eq!(file.write_all(&ctx, &surfels).unwrap(), n as u64);
            assert_eq!(file.len().unwrap(), n as u64);
            let read = file.read_all(&ctx).unwrap();
            assert_eq!(read.surfels(), surfels.as_slice());
        }
    }

    #[test]
    fn random_access() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(8);
        let surfels = numbered_surfels(100);
        let file = SurfelFile::new(dir.path().join("a.bin"), RecordLayout::Surfel);
        file.write_all(&ctx, &surfels).unwrap();
        let mut reader = file.open(&ctx).unwrap();
        for i in [99, 0, 50, 51, 7, 8, 93, 12, 64, 33] {
            assert_eq!(reader.read_surfel(i).unwrap(), surfels[i as usize]);
        }
        assert!(reader.windows.len() <= MAX_CACHED_WINDOWS);
        assert!(matches!(
            reader.read_surfel(100),
            Err(StoreError::OutOfRange { index: 100, len: 100 })
        ));
    }

    #[test]
    fn sequential_scan() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(10);
        let surfels = numbered_surfels(35);
        let file = SurfelFile::new(dir.path().join("a.bin"), RecordLayout::Surfel);
        file.write_all(&ctx, &surfels).unwrap();
        let mut reader = file.open(&ctx).unwrap();
        let mut seen = Vec::new();
        for window in reader.windows(5..35) {
            let window = window.unwrap();
            assert!(window.len() <= 10);
            seen.extend_from_slice(&window);
        }
        assert_eq!(seen.as_slice(), &surfels[5..35]);
        drop(reader);
        assert_eq!(ctx.buffers.resident(), 0);
    }

    #[test]
    fn missing_file() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(10);
        let file = SurfelFile::new(dir.path().join("missing.bin"), RecordLayout::Surfel);
        assert!(matches!(file.open(&ctx), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.bin");
        std::fs::write(&path, vec![0_u8; 50]).unwrap();
        let file = SurfelFile::new(path, RecordLayout::Surfel);
        assert!(matches!(
            file.len(),
            Err(StoreError::Truncated { bytes: 50, record_size: 47, .. })
        ));
    }

    #[test]
    fn windows_respect_budget() {
        let dir = TempDir::new().unwrap();
        let window_bytes = 4 * size_of::<Surfel>();
        // room for the writer buffer, or for two read windows
        let ctx = StoreContext::new(BufferManager::new(2 * window_bytes, 0), window_bytes);
        let surfels = numbered_surfels(40);
        let file = SurfelFile::new(dir.path().join("a.bin"), RecordLayout::Surfel);
        file.write_all(&ctx, &surfels).unwrap();
        let mut reader = file.open(&ctx).unwrap();
        for i in (0..40).rev() {
            assert_eq!(reader.read_surfel(i).unwrap(), surfels[i as usize]);
            assert!(ctx.buffers.resident() <= ctx.buffers.limit());
        }
        assert!(reader.windows.len() <= 2);
    }
}
