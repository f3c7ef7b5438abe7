//! ZIP record layouts written by the archive writer
//!
//! All multi-byte fields are little-endian. Each record serializes into a
//! single buffer so the volume writer can keep it in one piece.

use crate::options::{AesStrength, CompressionMethod, EncryptionMethod};
use std::time::{SystemTime, UNIX_EPOCH};
use time::{OffsetDateTime, UtcOffset};

/// Local file header signature
pub const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
/// Data descriptor ("extended local header") signature
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;
/// Split archive marker, same value as the data descriptor signature
pub const SPLIT_ZIP_SIGNATURE: u32 = 0x08074b50;
/// Temporary spanning marker for a split archive that fit in one volume
pub const TEMPORARY_SPANNING_SIGNATURE: u32 = 0x30304b50;
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06054b50;
pub const DIGITAL_SIGNATURE: u32 = 0x05054b50;
pub const ARCHIVE_EXTRA_DATA_SIGNATURE: u32 = 0x08064b50;
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE: u32 = 0x07064b50;
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06064b50;
/// Zip64 extended information extra field id
pub const ZIP64_EXTRA_FIELD_SIGNATURE: u32 = 0x0001;
/// WinZip AES extra field id
pub const AES_EXTRA_DATA_SIGNATURE: u32 = 0x9901;

/// Signatures that must never straddle a volume boundary
pub const RESERVED_HEADER_SIGNATURES: [u32; 10] = [
    LOCAL_FILE_HEADER_SIGNATURE,
    DATA_DESCRIPTOR_SIGNATURE,
    CENTRAL_DIRECTORY_SIGNATURE,
    END_OF_CENTRAL_DIRECTORY_SIGNATURE,
    DIGITAL_SIGNATURE,
    ARCHIVE_EXTRA_DATA_SIGNATURE,
    ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE,
    ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE,
    ZIP64_EXTRA_FIELD_SIGNATURE,
    AES_EXTRA_DATA_SIGNATURE,
];

pub const ZIP64_SIZE_LIMIT: u64 = 0xFFFF_FFFF;
pub const ZIP64_SENTINEL: u32 = 0xFFFF_FFFF;
pub const ZIP64_ENTRY_LIMIT: u64 = 0xFFFF;

/// Compression method id used in headers of AES-encrypted entries
pub const AES_COMPRESSION_METHOD: u16 = 99;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;
pub const VERSION_AES: u16 = 51;

/// Host system byte of "version made by"
#[cfg(unix)]
const HOST_SYSTEM: u16 = 3;
#[cfg(not(unix))]
const HOST_SYSTEM: u16 = 0;

/// General-purpose bit flags
pub mod flags {
    pub const ENCRYPTED: u16 = 1 << 0;
    /// CRC and sizes follow the data in a data descriptor
    pub const DATA_DESCRIPTOR: u16 = 1 << 3;
    pub const UTF8_NAMES: u16 = 1 << 11;
}

/// DOS external attribute bits
pub mod attributes {
    pub const READ_ONLY: u32 = 0x01;
    pub const DIRECTORY: u32 = 0x10;
    pub const ARCHIVE: u32 = 0x20;
}

/// Convert a timestamp to the packed DOS date/time (date in the high word)
///
/// Times before 1980 clamp to 1980-01-01 00:00:00, times after 2107 to the
/// last representable second.
pub fn dos_date_time(time: SystemTime) -> u32 {
    let secs = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let datetime = match OffsetDateTime::from_unix_timestamp(secs) {
        Ok(dt) => dt.to_offset(offset),
        Err(_) => return MIN_DOS_DATE_TIME,
    };

    let year = datetime.year();
    if year < 1980 {
        return MIN_DOS_DATE_TIME;
    }
    if year > 2107 {
        return MAX_DOS_DATE_TIME;
    }

    let date = ((year as u32 - 1980) << 9) | ((datetime.month() as u32) << 5) | datetime.day() as u32;
    let time = ((datetime.hour() as u32) << 11)
        | ((datetime.minute() as u32) << 5)
        | (datetime.second() as u32 >> 1);
    (date << 16) | time
}

const MIN_DOS_DATE_TIME: u32 = (1 << 21) | (1 << 16);
const MAX_DOS_DATE_TIME: u32 = (127 << 25) | (12 << 21) | (31 << 16) | (23 << 11) | (59 << 5) | 29;

/// WinZip AES extra data record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesExtraData {
    /// AE-1 = 1, AE-2 = 2
    pub version: u16,
    pub vendor_id: [u8; 2],
    pub strength: AesStrength,
    /// Compression method of the data before encryption
    pub compression_method: u16,
}

impl AesExtraData {
    /// AE-2 record for the given strength and inner compression method
    pub fn new(strength: AesStrength, compression: CompressionMethod) -> Self {
        Self {
            version: 2,
            vendor_id: *b"AE",
            strength,
            compression_method: compression.to_zip_method(),
        }
    }

    /// Serialized length including the 4-byte field header
    pub const LEN: usize = 11;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(AES_EXTRA_DATA_SIGNATURE as u16).to_le_bytes());
        out.extend_from_slice(&7u16.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.vendor_id);
        out.push(self.strength.to_winzip_code());
        out.extend_from_slice(&self.compression_method.to_le_bytes());
    }
}

/// Central directory record for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralFileHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub last_modified: u32,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Entry path encoded in the archive charset
    pub file_name: Vec<u8>,
    pub encryption: EncryptionMethod,
    pub aes_extra: Option<AesExtraData>,
    /// Sizes in the local header are carried by a Zip64 extra field
    pub zip64: bool,
    pub is_directory: bool,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    /// Volume index the local header starts on
    pub disk_number_start: u32,
    /// Offset of the local header within its volume
    pub local_header_offset: u64,
}

/// Local header, a field-for-field mirror of the general header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub last_modified: u32,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub file_name: Vec<u8>,
    pub encryption: EncryptionMethod,
    pub aes_extra: Option<AesExtraData>,
    pub zip64: bool,
    pub disk_number_start: u32,
    pub local_header_offset: u64,
}

impl GeneralFileHeader {
    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// Compression method id as stored in the headers (99 for AES entries)
    pub fn method_id(&self) -> u16 {
        method_id(self.compression_method, self.aes_extra.as_ref())
    }

    /// Set the final CRC and sizes once the entry is closed
    pub(crate) fn apply_final(&mut self, crc32: u32, compressed_size: u64, uncompressed_size: u64) {
        self.crc32 = crc32;
        self.compressed_size = compressed_size;
        self.uncompressed_size = uncompressed_size;
    }

    /// Whether the central record needs a Zip64 extra field
    fn needs_zip64(&self) -> bool {
        self.uncompressed_size >= ZIP64_SIZE_LIMIT
            || self.compressed_size >= ZIP64_SIZE_LIMIT
            || self.local_header_offset >= ZIP64_SIZE_LIMIT
            || self.disk_number_start as u64 >= ZIP64_ENTRY_LIMIT
    }

    /// Serialize as a central directory file header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut zip64_data: Vec<u8> = Vec::new();
        if self.needs_zip64() {
            if self.uncompressed_size >= ZIP64_SIZE_LIMIT {
                zip64_data.extend_from_slice(&self.uncompressed_size.to_le_bytes());
            }
            if self.compressed_size >= ZIP64_SIZE_LIMIT {
                zip64_data.extend_from_slice(&self.compressed_size.to_le_bytes());
            }
            if self.local_header_offset >= ZIP64_SIZE_LIMIT {
                zip64_data.extend_from_slice(&self.local_header_offset.to_le_bytes());
            }
            if self.disk_number_start as u64 >= ZIP64_ENTRY_LIMIT {
                zip64_data.extend_from_slice(&self.disk_number_start.to_le_bytes());
            }
        }

        let mut extra = Vec::new();
        if !zip64_data.is_empty() {
            extra.extend_from_slice(&(ZIP64_EXTRA_FIELD_SIGNATURE as u16).to_le_bytes());
            extra.extend_from_slice(&(zip64_data.len() as u16).to_le_bytes());
            extra.extend_from_slice(&zip64_data);
        }
        if let Some(aes) = &self.aes_extra {
            aes.write_to(&mut extra);
        }

        let mut out = Vec::with_capacity(46 + self.file_name.len() + extra.len());
        out.extend_from_slice(&CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.version_made_by.to_le_bytes());
        out.extend_from_slice(&self.version_needed.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.method_id().to_le_bytes());
        out.extend_from_slice(&self.last_modified.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&clamp_u32(self.compressed_size).to_le_bytes());
        out.extend_from_slice(&clamp_u32(self.uncompressed_size).to_le_bytes());
        out.extend_from_slice(&(self.file_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment len
        let disk = if self.disk_number_start as u64 >= ZIP64_ENTRY_LIMIT {
            0xFFFF
        } else {
            self.disk_number_start as u16
        };
        out.extend_from_slice(&disk.to_le_bytes());
        out.extend_from_slice(&self.internal_attributes.to_le_bytes());
        out.extend_from_slice(&self.external_attributes.to_le_bytes());
        out.extend_from_slice(&clamp_u32(self.local_header_offset).to_le_bytes());
        out.extend_from_slice(&self.file_name);
        out.extend_from_slice(&extra);
        out
    }
}

impl LocalFileHeader {
    /// Build the local header mirroring `general`
    pub fn mirror(general: &GeneralFileHeader) -> Self {
        Self {
            version_needed: general.version_needed,
            flags: general.flags,
            compression_method: general.compression_method,
            last_modified: general.last_modified,
            crc32: general.crc32,
            compressed_size: general.compressed_size,
            uncompressed_size: general.uncompressed_size,
            file_name: general.file_name.clone(),
            encryption: general.encryption,
            aes_extra: general.aes_extra,
            zip64: general.zip64,
            disk_number_start: general.disk_number_start,
            local_header_offset: general.local_header_offset,
        }
    }

    pub fn method_id(&self) -> u16 {
        method_id(self.compression_method, self.aes_extra.as_ref())
    }

    pub(crate) fn apply_final(&mut self, crc32: u32, compressed_size: u64, uncompressed_size: u64) {
        self.crc32 = crc32;
        self.compressed_size = compressed_size;
        self.uncompressed_size = uncompressed_size;
    }

    /// Serialize as a local file header
    ///
    /// With the data-descriptor flag set the CRC and size fields are written
    /// as placeholders (zero, or the Zip64 sentinel) and the real values go
    /// into the trailer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let deferred = self.flags & flags::DATA_DESCRIPTOR != 0;

        let mut extra = Vec::new();
        if self.zip64 {
            extra.extend_from_slice(&(ZIP64_EXTRA_FIELD_SIGNATURE as u16).to_le_bytes());
            extra.extend_from_slice(&16u16.to_le_bytes());
            extra.extend_from_slice(&self.uncompressed_size.to_le_bytes());
            let compressed = if deferred { 0 } else { self.compressed_size };
            extra.extend_from_slice(&compressed.to_le_bytes());
        }
        if let Some(aes) = &self.aes_extra {
            aes.write_to(&mut extra);
        }

        let (crc32, compressed, uncompressed) = if self.zip64 {
            let crc = if deferred { 0 } else { self.crc32 };
            (crc, ZIP64_SENTINEL, ZIP64_SENTINEL)
        } else if deferred {
            (0, 0, 0)
        } else {
            (
                self.crc32,
                self.compressed_size as u32,
                self.uncompressed_size as u32,
            )
        };

        let mut out = Vec::with_capacity(30 + self.file_name.len() + extra.len());
        out.extend_from_slice(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.version_needed.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.method_id().to_le_bytes());
        out.extend_from_slice(&self.last_modified.to_le_bytes());
        out.extend_from_slice(&crc32.to_le_bytes());
        out.extend_from_slice(&compressed.to_le_bytes());
        out.extend_from_slice(&uncompressed.to_le_bytes());
        out.extend_from_slice(&(self.file_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.file_name);
        out.extend_from_slice(&extra);
        out
    }

    /// Serialize the trailer carrying the final CRC and sizes
    ///
    /// Size fields widen to 8 bytes when the entry is Zip64 or either size
    /// no longer fits 32 bits.
    pub fn trailer_bytes(&self) -> Vec<u8> {
        let wide = self.zip64
            || self.compressed_size >= ZIP64_SIZE_LIMIT
            || self.uncompressed_size >= ZIP64_SIZE_LIMIT;

        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        if wide {
            out.extend_from_slice(&self.compressed_size.to_le_bytes());
            out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        } else {
            out.extend_from_slice(&(self.compressed_size as u32).to_le_bytes());
            out.extend_from_slice(&(self.uncompressed_size as u32).to_le_bytes());
        }
        out
    }
}

/// End of central directory, classic and Zip64 forms
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndCentralDirectoryRecord {
    /// Volume index holding this record
    pub disk_number: u32,
    /// Volume index the central directory starts on
    pub central_directory_disk: u32,
    pub entries_on_this_disk: u64,
    pub total_entries: u64,
    pub central_directory_size: u64,
    /// Offset of the central directory within its starting volume
    pub central_directory_offset: u64,
}

impl EndCentralDirectoryRecord {
    /// Whether any value overflows the classic record
    pub fn needs_zip64(&self) -> bool {
        self.total_entries >= ZIP64_ENTRY_LIMIT
            || self.entries_on_this_disk >= ZIP64_ENTRY_LIMIT
            || self.central_directory_size >= ZIP64_SIZE_LIMIT
            || self.central_directory_offset >= ZIP64_SIZE_LIMIT
            || self.disk_number as u64 >= ZIP64_ENTRY_LIMIT
            || self.central_directory_disk as u64 >= ZIP64_ENTRY_LIMIT
    }

    /// Zip64 end of central directory record
    pub fn zip64_record_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(56);
        out.extend_from_slice(&ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        // size of the remaining record
        out.extend_from_slice(&44u64.to_le_bytes());
        out.extend_from_slice(&version_made_by(VERSION_ZIP64).to_le_bytes());
        out.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
        out.extend_from_slice(&self.disk_number.to_le_bytes());
        out.extend_from_slice(&self.central_directory_disk.to_le_bytes());
        out.extend_from_slice(&self.entries_on_this_disk.to_le_bytes());
        out.extend_from_slice(&self.total_entries.to_le_bytes());
        out.extend_from_slice(&self.central_directory_size.to_le_bytes());
        out.extend_from_slice(&self.central_directory_offset.to_le_bytes());
        out
    }

    /// Zip64 end of central directory locator
    pub fn zip64_locator_bytes(&self, record_offset: u64, total_disks: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.extend_from_slice(&ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.disk_number.to_le_bytes());
        out.extend_from_slice(&record_offset.to_le_bytes());
        out.extend_from_slice(&total_disks.to_le_bytes());
        out
    }

    /// Classic end of central directory record, with sentinels where Zip64 took over
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&clamp_u16(self.disk_number as u64).to_le_bytes());
        out.extend_from_slice(&clamp_u16(self.central_directory_disk as u64).to_le_bytes());
        out.extend_from_slice(&clamp_u16(self.entries_on_this_disk).to_le_bytes());
        out.extend_from_slice(&clamp_u16(self.total_entries).to_le_bytes());
        out.extend_from_slice(&clamp_u32(self.central_directory_size).to_le_bytes());
        out.extend_from_slice(&clamp_u32(self.central_directory_offset).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment len
        out
    }
}

/// "Version made by": host system in the high byte, ZIP format version in the low
pub fn version_made_by(version: u16) -> u16 {
    (HOST_SYSTEM << 8) | version
}

fn method_id(compression: CompressionMethod, aes: Option<&AesExtraData>) -> u16 {
    match aes {
        Some(_) => AES_COMPRESSION_METHOD,
        None => compression.to_zip_method(),
    }
}

fn clamp_u32(value: u64) -> u32 {
    if value >= ZIP64_SIZE_LIMIT {
        ZIP64_SENTINEL
    } else {
        value as u32
    }
}

fn clamp_u16(value: u64) -> u16 {
    if value >= ZIP64_ENTRY_LIMIT {
        0xFFFF
    } else {
        value as u16
    }
}
