//! Streaming archive writer
//!
//! [`ArchiveWriter`] is the public entry point. It keeps a running CRC32 and
//! byte count over exactly what the caller writes, then hands the bytes down
//! the pipeline:
//!
//! ```text
//! ArchiveWriter -> DeflateFramingWriter -> EntryCipherWriter -> VolumeWriter -> files
//! ```
//!
//! Nothing is buffered beyond one deflate output block and one AES block, so
//! archives of any size are written in constant memory.
//!
//! A writer is single-threaded and strictly sequential: one entry is open at
//! a time, and every call must come from the same owner.

use crate::deflate::DeflateFramingWriter;
use crate::entry::{EntryChecksum, EntryCipherWriter};
use crate::error::{Result, SpanZipError};
use crate::format::{GeneralFileHeader, LocalFileHeader};
use crate::options::{ArchiveConfig, EntryOptions};
use crate::volume::VolumeWriter;
use crc32fast::Hasher as Crc32;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// CRC and byte count of the uncompressed entry content
struct CrcCounter {
    crc: Crc32,
    uncompressed_count: u64,
}

impl CrcCounter {
    fn new() -> Self {
        Self {
            crc: Crc32::new(),
            uncompressed_count: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.crc.update(data);
        self.uncompressed_count += data.len() as u64;
    }

    fn finalize(&self) -> EntryChecksum {
        EntryChecksum {
            crc32: self.crc.clone().finalize(),
            uncompressed_size: self.uncompressed_count,
        }
    }
}

/// Streaming ZIP writer with optional volume splitting and per-entry encryption
///
/// # Example
/// ```no_run
/// use span_zip::{ArchiveConfig, ArchiveWriter, EncryptionMethod, EntryOptions};
///
/// let config = ArchiveConfig::default().with_split_length(65536);
/// let mut writer = ArchiveWriter::with_config("backup.zip", config)?;
///
/// writer.put_next_entry(&EntryOptions::file("data.bin"))?;
/// writer.write(&std::fs::read("data.bin")?)?;
/// writer.close_entry()?;
///
/// let secret = EntryOptions::stream("secret.txt").with_encryption(EncryptionMethod::Aes, "p@ss");
/// writer.put_next_entry(&secret)?;
/// writer.write(b"top secret")?;
/// writer.close_entry()?;
///
/// // backup.zip.01, backup.zip.02, ..., backup.zip
/// let volumes = writer.finish()?;
/// # Ok::<(), span_zip::SpanZipError>(())
/// ```
pub struct ArchiveWriter {
    inner: DeflateFramingWriter,
    counter: Option<CrcCounter>,
}

impl ArchiveWriter {
    /// Create an unsplit archive at `path` with UTF-8 entry names
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(path, ArchiveConfig::default())
    }

    /// Create an archive at `path` with the given archive-wide settings
    pub fn with_config<P: AsRef<Path>>(path: P, config: ArchiveConfig) -> Result<Self> {
        let split_length = config.effective_split_length()?;
        let volume = VolumeWriter::create(path.as_ref(), split_length)?;
        log::debug!(
            "creating archive {} (split length {:?})",
            path.as_ref().display(),
            split_length
        );
        let entries = EntryCipherWriter::new(volume, config.charset);
        Ok(Self {
            inner: DeflateFramingWriter::new(entries),
            counter: None,
        })
    }

    /// Start a new entry
    ///
    /// `options` is copied, so the caller may reuse or change it afterwards.
    /// Returns the options the entry is actually written with.
    pub fn put_next_entry(&mut self, options: &EntryOptions) -> Result<&EntryOptions> {
        let effective = self.inner.put_next_entry(options)?;
        self.counter = Some(CrcCounter::new());
        Ok(effective)
    }

    /// Write entry content; CRC and size are taken over these exact bytes
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let counter = self
            .counter
            .as_mut()
            .ok_or_else(|| SpanZipError::state("No entry started"))?;
        counter.update(data);
        self.inner.write(data)
    }

    /// Finish the current entry and write its trailer
    pub fn close_entry(&mut self) -> Result<&GeneralFileHeader> {
        let counter = self
            .counter
            .take()
            .ok_or_else(|| SpanZipError::state("No entry started"))?;
        self.inner.close_entry(counter.finalize())
    }

    /// Write the central directory and close the archive
    ///
    /// Returns every volume path in order; the last is the archive path itself.
    pub fn finish(self) -> Result<Vec<PathBuf>> {
        if self.counter.is_some() {
            return Err(SpanZipError::state(
                "finish called while an entry is still open",
            ));
        }
        self.inner.finish()
    }

    /// Central directory records of the closed entries
    pub fn central_directory(&self) -> &[GeneralFileHeader] {
        self.inner.central_directory()
    }

    /// Local headers of the closed entries, in the same order
    pub fn local_headers(&self) -> &[LocalFileHeader] {
        self.inner.local_headers()
    }
}

impl Write for ArchiveWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ArchiveWriter::write(self, buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn into_io_error(err: SpanZipError) -> io::Error {
    match err {
        SpanZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}
