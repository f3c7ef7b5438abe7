//! Per-entry header construction, encryption and trailers
//!
//! [`EntryCipherWriter`] owns one entry at a time:
//!
//! ```text
//! Idle --put_next_entry--> HeaderWritten --write*--> Writing --close_entry--> Idle
//! ```
//!
//! It builds the general/local header pair from a snapshot of the entry's
//! options, writes the local header and any encryption header, feeds payload
//! bytes through the entry's encryptor and, on close, writes the trailer with
//! the final CRC and sizes. `finish` writes the central directory.
//!
//! Not safe for concurrent use; one entry is in flight at a time.

use crate::encryption::{AesEncryptor, Encryptor, StandardEncryptor, AES_BLOCK_SIZE};
use crate::error::{Result, SpanZipError};
use crate::format::{
    attributes, dos_date_time, flags, version_made_by, AesExtraData, EndCentralDirectoryRecord,
    GeneralFileHeader, LocalFileHeader, SPLIT_ZIP_SIGNATURE, TEMPORARY_SPANNING_SIGNATURE,
    VERSION_AES, VERSION_DEFAULT, VERSION_ZIP64, ZIP64_SIZE_LIMIT,
};
use crate::options::{CompressionMethod, EncryptionMethod, EntryOptions, FileNameCharset};
use crate::volume::VolumeWriter;
use std::fs::{self, Metadata};
use std::path::PathBuf;
use std::time::SystemTime;

/// CRC and size of the uncompressed bytes of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryChecksum {
    pub crc32: u32,
    pub uncompressed_size: u64,
}

/// Groups bytes into whole AES blocks, holding back the remainder
#[derive(Default)]
struct BlockAligner {
    pending: [u8; AES_BLOCK_SIZE],
    len: usize,
    scratch: Vec<u8>,
}

impl BlockAligner {
    /// Emit every complete block available after appending `data`
    fn feed<F>(&mut self, mut data: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        if self.len > 0 {
            let take = (AES_BLOCK_SIZE - self.len).min(data.len());
            self.pending[self.len..self.len + take].copy_from_slice(&data[..take]);
            self.len += take;
            data = &data[take..];
            if self.len < AES_BLOCK_SIZE {
                return Ok(());
            }
            emit(&mut self.pending[..])?;
            self.len = 0;
        }

        let whole = data.len() - data.len() % AES_BLOCK_SIZE;
        if whole > 0 {
            self.scratch.clear();
            self.scratch.extend_from_slice(&data[..whole]);
            emit(&mut self.scratch[..])?;
        }

        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.len = rest.len();
        Ok(())
    }

    /// Emit the final partial block, if any
    fn flush<F>(&mut self, mut emit: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> Result<()>,
    {
        if self.len > 0 {
            let len = std::mem::take(&mut self.len);
            emit(&mut self.pending[..len])?;
        }
        Ok(())
    }
}

/// State of the entry currently being written
struct EntryState {
    options: EntryOptions,
    general: GeneralFileHeader,
    local: LocalFileHeader,
    encryptor: Option<Box<dyn Encryptor>>,
    /// Present for AES entries only
    aligner: Option<BlockAligner>,
    /// Size of a real source file when the entry was opened
    declared_size: Option<u64>,
    compressed_size: u64,
}

/// Writes entries (headers, encrypted payload, trailers) to a volume writer
pub struct EntryCipherWriter {
    volume: VolumeWriter,
    charset: FileNameCharset,
    central_directory: Vec<GeneralFileHeader>,
    local_headers: Vec<LocalFileHeader>,
    entry: Option<EntryState>,
    split_marker_written: bool,
    scratch: Vec<u8>,
}

impl EntryCipherWriter {
    pub fn new(volume: VolumeWriter, charset: FileNameCharset) -> Self {
        Self {
            volume,
            charset,
            central_directory: Vec::new(),
            local_headers: Vec::new(),
            entry: None,
            split_marker_written: false,
            scratch: Vec::new(),
        }
    }

    /// Headers of every closed entry, in archive order
    pub fn central_directory(&self) -> &[GeneralFileHeader] {
        &self.central_directory
    }

    pub fn local_headers(&self) -> &[LocalFileHeader] {
        &self.local_headers
    }

    /// Options snapshot of the open entry
    pub fn current_options(&self) -> Option<&EntryOptions> {
        self.entry.as_ref().map(|entry| &entry.options)
    }

    /// Open a new entry and write its local header
    ///
    /// Returns the effective options snapshot (directories are forced to
    /// stored and unencrypted). Nothing is written if validation fails.
    pub fn put_next_entry(&mut self, options: &EntryOptions) -> Result<&EntryOptions> {
        if self.entry.is_some() {
            return Err(SpanZipError::state(
                "previous entry must be closed before opening another",
            ));
        }

        let mut options = options.clone();
        let metadata = source_metadata(&options)?;
        let is_dir = match &metadata {
            Some(meta) => meta.is_dir(),
            None => options
                .file_name_in_zip
                .as_deref()
                .is_some_and(|name| name.ends_with('/') || name.ends_with('\\')),
        };
        if is_dir {
            options.compression = CompressionMethod::Stored;
            options.encrypt = false;
            options.encryption = EncryptionMethod::None;
        }
        options.validate_encryption()?;

        let name = options.entry_path(is_dir)?;
        let last_modified = options
            .last_modified
            .or_else(|| metadata.as_ref().and_then(|m| m.modified().ok()))
            .unwrap_or_else(SystemTime::now);
        let dos_time = dos_date_time(last_modified);

        let declared_size = match &metadata {
            Some(_) if is_dir => Some(0),
            Some(meta) => Some(meta.len()),
            None if is_dir => Some(0),
            None => None,
        };
        let zip64 = declared_size.is_some_and(|size| size >= ZIP64_SIZE_LIMIT);

        let encryption = if options.is_encrypted() {
            options.encryption
        } else {
            EncryptionMethod::None
        };
        let aes_extra = (encryption == EncryptionMethod::Aes)
            .then(|| AesExtraData::new(options.aes_strength, options.compression));

        let mut entry_flags = flags::DATA_DESCRIPTOR;
        if encryption != EncryptionMethod::None {
            entry_flags |= flags::ENCRYPTED;
        }
        if self.charset.is_utf8() {
            entry_flags |= flags::UTF8_NAMES;
        }

        let version_needed = if aes_extra.is_some() {
            VERSION_AES
        } else if zip64 {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        };

        let encryptor = build_encryptor(&options, encryption, dos_time)?;

        let mut general = GeneralFileHeader {
            version_made_by: version_made_by(version_needed),
            version_needed,
            flags: entry_flags,
            compression_method: options.compression,
            last_modified: dos_time,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: declared_size.unwrap_or(0),
            file_name: self.charset.encode(&name)?,
            encryption,
            aes_extra,
            zip64,
            is_directory: is_dir,
            internal_attributes: 0,
            external_attributes: external_attributes(metadata.as_ref(), is_dir),
            disk_number_start: 0,
            local_header_offset: 0,
        };

        if self.volume.is_split() && !self.split_marker_written {
            self.volume.write(&SPLIT_ZIP_SIGNATURE.to_le_bytes())?;
            self.split_marker_written = true;
        }

        let header_bytes = LocalFileHeader::mirror(&general).to_bytes();
        self.volume.ensure_room(header_bytes.len() as u64)?;
        general.disk_number_start = self.volume.current_volume();
        general.local_header_offset = self.volume.current_position();
        let local = LocalFileHeader::mirror(&general);

        self.volume.write(&header_bytes)?;

        let mut compressed_size = 0;
        if let Some(encryptor) = &encryptor {
            let prefix = encryptor.header_bytes();
            self.volume.write(prefix)?;
            compressed_size += prefix.len() as u64;
        }

        log::debug!(
            "entry {:?} opened at volume {} offset {} ({:?}, {:?})",
            name,
            general.disk_number_start,
            general.local_header_offset,
            options.compression,
            encryption
        );

        let aligner = (encryption == EncryptionMethod::Aes).then(BlockAligner::default);
        let entry = self.entry.insert(EntryState {
            options,
            general,
            local,
            encryptor,
            aligner,
            declared_size,
            compressed_size,
        });
        Ok(&entry.options)
    }

    /// Write (already compressed) entry data, encrypting it if required
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Self {
            volume,
            entry,
            scratch,
            ..
        } = self;
        let entry = entry
            .as_mut()
            .ok_or_else(|| SpanZipError::state("No entry started"))?;
        if data.is_empty() {
            return Ok(());
        }

        let compressed_size = &mut entry.compressed_size;
        match (entry.encryptor.as_deref_mut(), entry.aligner.as_mut()) {
            (None, _) => {
                volume.write(data)?;
                *compressed_size += data.len() as u64;
            }
            (Some(encryptor), None) => {
                scratch.clear();
                scratch.extend_from_slice(data);
                encryptor.encrypt_data(scratch.as_mut_slice())?;
                volume.write(scratch.as_slice())?;
                *compressed_size += scratch.len() as u64;
            }
            (Some(encryptor), Some(aligner)) => {
                aligner.feed(data, |block| {
                    encryptor.encrypt_data(block)?;
                    volume.write(block)?;
                    *compressed_size += block.len() as u64;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Close the open entry: flush, write the trailer, record its headers
    pub fn close_entry(&mut self, checksum: EntryChecksum) -> Result<&GeneralFileHeader> {
        let mut entry = self
            .entry
            .take()
            .ok_or_else(|| SpanZipError::state("No entry started"))?;
        let volume = &mut self.volume;

        if let Some(encryptor) = entry.encryptor.as_deref_mut() {
            let compressed_size = &mut entry.compressed_size;
            if let Some(aligner) = entry.aligner.as_mut() {
                aligner.flush(|block| {
                    encryptor.encrypt_data(block)?;
                    volume.write(block)?;
                    *compressed_size += block.len() as u64;
                    Ok(())
                })?;
            }
            let auth_code = encryptor.finish()?;
            if !auth_code.is_empty() {
                volume.write(&auth_code)?;
                *compressed_size += auth_code.len() as u64;
            }
        }

        // AE-2 entries rely on the authentication code instead of the CRC
        let crc32 = if entry.general.encryption == EncryptionMethod::Aes {
            0
        } else {
            checksum.crc32
        };

        let uncompressed_size = checksum.uncompressed_size;
        if let Some(declared) = entry.declared_size {
            if !entry.options.external_stream
                && !entry.general.is_directory
                && declared != uncompressed_size
            {
                log::warn!(
                    "entry {:?}: source declared {} bytes but {} were written",
                    String::from_utf8_lossy(&entry.general.file_name),
                    declared,
                    uncompressed_size
                );
            }
        }

        entry
            .general
            .apply_final(crc32, entry.compressed_size, uncompressed_size);
        entry
            .local
            .apply_final(crc32, entry.compressed_size, uncompressed_size);

        volume.write(&entry.local.trailer_bytes())?;

        log::debug!(
            "entry {:?} closed: crc {:08x}, {} -> {} bytes",
            String::from_utf8_lossy(&entry.general.file_name),
            crc32,
            uncompressed_size,
            entry.compressed_size
        );

        self.local_headers.push(entry.local);
        self.central_directory.push(entry.general);
        Ok(&self.central_directory[self.central_directory.len() - 1])
    }

    /// Write the central directory and end records, close the last volume
    ///
    /// Returns the volume paths in order; the last one is the archive path.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        if self.entry.is_some() {
            return Err(SpanZipError::state(
                "finish called while an entry is still open",
            ));
        }

        let mut record = EndCentralDirectoryRecord {
            total_entries: self.central_directory.len() as u64,
            ..Default::default()
        };

        let mut record_disks = Vec::with_capacity(self.central_directory.len());
        let mut start: Option<(u32, u64)> = None;
        for header in &self.central_directory {
            let bytes = header.to_bytes();
            self.volume.ensure_room(bytes.len() as u64)?;
            let disk = self.volume.current_volume();
            start.get_or_insert((disk, self.volume.current_position()));
            self.volume.write(&bytes)?;
            record_disks.push(disk);
            record.central_directory_size += bytes.len() as u64;
        }

        let end_len = |record: &EndCentralDirectoryRecord| {
            if record.needs_zip64() {
                22 + 56 + 20
            } else {
                22
            }
        };
        let (cd_disk, cd_offset) = match start {
            Some(start) => start,
            None => {
                self.volume.ensure_room(22)?;
                (self.volume.current_volume(), self.volume.current_position())
            }
        };
        record.central_directory_disk = cd_disk;
        record.central_directory_offset = cd_offset;
        self.fill_disk_fields(&mut record, &record_disks);
        if self.volume.ensure_room(end_len(&record))? {
            self.fill_disk_fields(&mut record, &record_disks);
        }

        if record.needs_zip64() {
            let zip64_offset = self.volume.current_position();
            self.volume.write(&record.zip64_record_bytes())?;
            let total_disks = self.volume.current_volume() + 1;
            self.volume
                .write(&record.zip64_locator_bytes(zip64_offset, total_disks))?;
        }
        self.volume.write(&record.to_bytes())?;

        if self.split_marker_written && self.volume.current_volume() == 0 {
            // a split archive that fit in one volume carries the temporary marker
            self.volume
                .overwrite_at(0, &TEMPORARY_SPANNING_SIGNATURE.to_le_bytes())?;
        }

        log::debug!(
            "archive finished: {} entries, central directory {} bytes on volume {}",
            record.total_entries,
            record.central_directory_size,
            record.central_directory_disk
        );
        self.volume.close()
    }

    fn fill_disk_fields(&self, record: &mut EndCentralDirectoryRecord, record_disks: &[u32]) {
        let disk = self.volume.current_volume();
        record.disk_number = disk;
        record.entries_on_this_disk = record_disks.iter().filter(|&&d| d == disk).count() as u64;
    }
}

fn source_metadata(options: &EntryOptions) -> Result<Option<Metadata>> {
    if options.external_stream {
        return Ok(None);
    }
    let source = options.source.as_ref().ok_or_else(|| {
        SpanZipError::config("entry is not an external stream and has no source file")
    })?;
    fs::metadata(source)
        .map(Some)
        .map_err(|source_err| SpanZipError::SourceUnavailable {
            path: source.clone(),
            source: source_err,
        })
}

fn build_encryptor(
    options: &EntryOptions,
    encryption: EncryptionMethod,
    dos_time: u32,
) -> Result<Option<Box<dyn Encryptor>>> {
    let password = options.password.as_deref().unwrap_or_default().as_bytes();
    Ok(match encryption {
        EncryptionMethod::None => None,
        // with a data descriptor the check byte is the high byte of the DOS time
        EncryptionMethod::Standard => Some(Box::new(StandardEncryptor::new(
            password,
            (dos_time >> 8) as u8,
        )?)),
        EncryptionMethod::Aes => Some(Box::new(AesEncryptor::new(
            password,
            options.aes_strength,
        )?)),
    })
}

fn external_attributes(metadata: Option<&Metadata>, is_dir: bool) -> u32 {
    let mut attrs = if is_dir {
        attributes::DIRECTORY
    } else {
        attributes::ARCHIVE
    };
    if metadata.is_some_and(|meta| meta.permissions().readonly()) {
        attrs |= attributes::READ_ONLY;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = match metadata {
            Some(meta) => meta.permissions().mode() & 0xFFFF,
            None if is_dir => 0o040755,
            None => 0o100644,
        };
        attrs |= mode << 16;
    }
    attrs
}
