//! Size-capped zip archive writer.

use std::io::Read;
use std::path::PathBuf;

use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::Result;

/// One open archive. Tracks the payload bytes written so the cap holds for
/// what actually lands in the archive, not just for declared sizes.
pub struct ArchiveSink {
    path: PathBuf,
    writer: ZipWriter<std::fs::File>,
    written: u64,
    cap: u64,
    entries: usize,
}

impl ArchiveSink {
    /// Wraps a freshly created archive file.
    #[must_use]
    pub fn new(path: PathBuf, file: std::fs::File, cap: u64) -> Self {
        Self {
            path,
            writer: ZipWriter::new(file),
            written: 0,
            cap,
            entries: 0,
        }
    }

    /// Returns true if `len` more bytes fit under the cap.
    #[must_use]
    pub const fn fits(&self, len: u64) -> bool {
        self.written.saturating_add(len) <= self.cap
    }

    /// Copies `len` bytes from `reader` into a new entry. Returns
    /// `Ok(false)` without writing when the entry would push the archive
    /// over its cap.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or the zip writer fails.
    pub fn add<R: Read>(&mut self, entry_name: &str, len: u64, reader: &mut R) -> Result<bool> {
        if !self.fits(len) {
            return Ok(false);
        }
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        self.writer.start_file(entry_name, options)?;
        let copied = std::io::copy(reader, &mut self.writer)?;
        self.written += copied;
        self.entries += 1;
        Ok(true)
    }

    /// Payload bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Number of entries written so far.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Writes the central directory and closes the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the zip writer fails.
    pub fn finish(self) -> Result<PathBuf> {
        self.writer.finish()?;
        Ok(self.path)
    }
}
