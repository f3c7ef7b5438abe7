//! Deflate framing between the caller's bytes and the entry writer
//!
//! The deflate engine runs with a zlib wrapper. Its 2-byte header is dropped
//! from each entry's first output, and the last 4 bytes (the Adler-32
//! trailer) are held back and discarded when the stream ends, leaving the
//! raw deflate data ZIP expects.

use crate::entry::{EntryChecksum, EntryCipherWriter};
use crate::error::{Result, SpanZipError};
use crate::format::{GeneralFileHeader, LocalFileHeader};
use crate::options::{CompressionMethod, EntryOptions};
use flate2::{Compress, Compression, FlushCompress, Status};
use std::path::PathBuf;

const ZLIB_HEADER_LEN: usize = 2;
const ZLIB_TRAILER_LEN: usize = 4;
const OUTPUT_BUFFER_SIZE: usize = 4096;

/// Per-entry deflate state
struct DeflateStream {
    compress: Compress,
    header_remaining: usize,
    /// Output not yet forwarded; always ends with the last bytes produced
    held: Vec<u8>,
}

impl DeflateStream {
    fn new(level: Option<u32>) -> Self {
        let level = level.map(Compression::new).unwrap_or_default();
        Self {
            compress: Compress::new(level, true),
            header_remaining: ZLIB_HEADER_LEN,
            held: Vec::with_capacity(OUTPUT_BUFFER_SIZE + ZLIB_TRAILER_LEN),
        }
    }

    /// Accept engine output, forwarding all but the last 4 bytes seen so far
    fn forward(&mut self, mut output: &[u8], inner: &mut EntryCipherWriter) -> Result<()> {
        let skip = self.header_remaining.min(output.len());
        output = &output[skip..];
        self.header_remaining -= skip;

        self.held.extend_from_slice(output);
        if self.held.len() > ZLIB_TRAILER_LEN {
            let ready = self.held.len() - ZLIB_TRAILER_LEN;
            inner.write(&self.held[..ready])?;
            self.held.drain(..ready);
        }
        Ok(())
    }
}

/// Compresses entry data before handing it to [`EntryCipherWriter`]
pub struct DeflateFramingWriter {
    inner: EntryCipherWriter,
    stream: Option<DeflateStream>,
    buffer: Vec<u8>,
}

impl DeflateFramingWriter {
    pub fn new(inner: EntryCipherWriter) -> Self {
        Self {
            inner,
            stream: None,
            buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }

    pub fn central_directory(&self) -> &[GeneralFileHeader] {
        self.inner.central_directory()
    }

    pub fn local_headers(&self) -> &[LocalFileHeader] {
        self.inner.local_headers()
    }

    /// Validate the compression level, then open the entry
    pub fn put_next_entry(&mut self, options: &EntryOptions) -> Result<&EntryOptions> {
        if options.compression == CompressionMethod::Deflate {
            if let Some(level) = options.compression_level {
                if level > 9 {
                    return Err(SpanZipError::config(format!(
                        "compression level {} is out of range 0-9",
                        level
                    )));
                }
            }
        }

        let effective = self.inner.put_next_entry(options)?;
        self.stream = (effective.compression == CompressionMethod::Deflate)
            .then(|| DeflateStream::new(effective.compression_level));
        Ok(effective)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return self.inner.write(data);
        };

        let mut input = data;
        while !input.is_empty() {
            let before_in = stream.compress.total_in();
            let before_out = stream.compress.total_out();
            stream
                .compress
                .compress(input, &mut self.buffer, FlushCompress::None)
                .map_err(|e| SpanZipError::Compression(e.to_string()))?;
            let consumed = (stream.compress.total_in() - before_in) as usize;
            let produced = (stream.compress.total_out() - before_out) as usize;

            input = &input[consumed..];
            stream.forward(&self.buffer[..produced], &mut self.inner)?;
            if consumed == 0 && produced == 0 {
                return Err(SpanZipError::Compression(
                    "deflate engine made no progress".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Finish the deflate stream and close the entry
    pub fn close_entry(&mut self, checksum: EntryChecksum) -> Result<&GeneralFileHeader> {
        if let Some(mut stream) = self.stream.take() {
            loop {
                let before_out = stream.compress.total_out();
                let status = stream
                    .compress
                    .compress(&[], &mut self.buffer, FlushCompress::Finish)
                    .map_err(|e| SpanZipError::Compression(e.to_string()))?;
                let produced = (stream.compress.total_out() - before_out) as usize;
                stream.forward(&self.buffer[..produced], &mut self.inner)?;
                if status == Status::StreamEnd {
                    break;
                }
            }

            // what remains held is the Adler-32 trailer, never forwarded or counted
            log::trace!("dropping {} trailer bytes", stream.held.len());
        }
        self.inner.close_entry(checksum)
    }

    /// Write the central directory and close the archive
    pub fn finish(self) -> Result<Vec<PathBuf>> {
        self.inner.finish()
    }
}
