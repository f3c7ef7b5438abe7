//! Per-entry and per-archive configuration
//!
//! [`EntryOptions`] is cloned when an entry is opened, so a caller can keep
//! mutating its own copy for the next entry without touching the one in flight.

use crate::error::{Result, SpanZipError};
use crate::volume::MIN_SPLIT_LENGTH;
use encoding_rs::Encoding;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Compression method to use for ZIP entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// No compression (stored)
    Stored,
    /// DEFLATE compression (most common)
    #[default]
    Deflate,
}

impl CompressionMethod {
    pub(crate) fn to_zip_method(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

/// Entry encryption method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMethod {
    #[default]
    None,
    /// Legacy PKWARE stream cipher (ZipCrypto)
    Standard,
    /// WinZip AE-2
    Aes,
}

/// AES key strength for WinZip AES entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AesStrength {
    Aes128,
    #[default]
    Aes256,
}

impl AesStrength {
    /// Get salt size in bytes
    pub fn salt_size(&self) -> usize {
        match self {
            AesStrength::Aes128 => 8,
            AesStrength::Aes256 => 16,
        }
    }

    /// Get key size in bytes
    pub fn key_size(&self) -> usize {
        match self {
            AesStrength::Aes128 => 16,
            AesStrength::Aes256 => 32,
        }
    }

    /// Get total derived key material size (key + MAC key + password verification)
    pub fn derived_key_size(&self) -> usize {
        self.key_size() * 2 + 2
    }

    /// Get WinZip encryption strength code
    pub fn to_winzip_code(&self) -> u8 {
        match self {
            AesStrength::Aes128 => 0x01,
            AesStrength::Aes256 => 0x03,
        }
    }
}

/// How entry names are encoded in the headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileNameCharset {
    /// UTF-8 names, general-purpose bit 11 set
    #[default]
    Utf8,
    /// Names encoded with a legacy code page, bit 11 clear
    Legacy(&'static Encoding),
}

impl FileNameCharset {
    pub(crate) fn is_utf8(&self) -> bool {
        match self {
            FileNameCharset::Utf8 => true,
            FileNameCharset::Legacy(encoding) => *encoding == encoding_rs::UTF_8,
        }
    }

    /// Encode an entry name; names the code page cannot represent are rejected
    pub(crate) fn encode(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            FileNameCharset::Utf8 => Ok(name.as_bytes().to_vec()),
            FileNameCharset::Legacy(encoding) => {
                let (bytes, _, had_unmappable) = encoding.encode(name);
                if had_unmappable {
                    return Err(SpanZipError::config(format!(
                        "entry name {:?} cannot be represented in {}",
                        name,
                        encoding.name()
                    )));
                }
                Ok(bytes.into_owned())
            }
        }
    }
}

/// Archive-wide settings fixed when the writer is created
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveConfig {
    /// Maximum bytes per volume; `None` or `Some(0)` disables splitting
    pub split_length: Option<u64>,
    pub charset: FileNameCharset,
}

impl ArchiveConfig {
    /// Split the archive into volumes of at most `split_length` bytes
    pub fn with_split_length(mut self, split_length: u64) -> Self {
        self.split_length = Some(split_length);
        self
    }

    pub fn with_charset(mut self, charset: FileNameCharset) -> Self {
        self.charset = charset;
        self
    }

    /// Effective split length, `None` when splitting is disabled
    pub(crate) fn effective_split_length(&self) -> Result<Option<u64>> {
        match self.split_length {
            None | Some(0) => Ok(None),
            Some(len) if len < MIN_SPLIT_LENGTH => Err(SpanZipError::config(format!(
                "split length {} is below the minimum of {} bytes",
                len, MIN_SPLIT_LENGTH
            ))),
            Some(len) => Ok(Some(len)),
        }
    }
}

/// Options describing one archive entry
///
/// # Example
/// ```
/// use span_zip::{AesStrength, CompressionMethod, EncryptionMethod, EntryOptions};
///
/// let options = EntryOptions::stream("reports/q1.csv")
///     .with_compression(CompressionMethod::Deflate)
///     .with_compression_level(9)
///     .with_encryption(EncryptionMethod::Aes, "s3cret")
///     .with_aes_strength(AesStrength::Aes256);
/// assert!(options.is_encrypted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    pub compression: CompressionMethod,
    /// Deflate level 0-9, `None` for the engine default
    pub compression_level: Option<u32>,
    pub encrypt: bool,
    pub encryption: EncryptionMethod,
    pub aes_strength: AesStrength,
    pub password: Option<String>,
    /// Entry content is supplied by the caller, not backed by a file on disk
    pub external_stream: bool,
    /// Source file or directory on disk (ignored for external streams)
    pub source: Option<PathBuf>,
    /// File system folder the source path is made relative to
    pub default_folder: Option<PathBuf>,
    /// Explicit entry path inside the archive
    pub file_name_in_zip: Option<String>,
    /// Folder inside the archive every entry path is placed under
    pub root_folder_in_zip: Option<String>,
    /// Overrides the source file's modification time
    pub last_modified: Option<SystemTime>,
}

impl EntryOptions {
    /// Options for an entry backed by a file or directory on disk
    pub fn file(source: impl AsRef<Path>) -> Self {
        Self {
            source: Some(source.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Options for an entry whose bytes are streamed by the caller
    pub fn stream(file_name_in_zip: impl Into<String>) -> Self {
        Self {
            external_stream: true,
            file_name_in_zip: Some(file_name_in_zip.into()),
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Encrypt the entry with `method` and `password`
    pub fn with_encryption(mut self, method: EncryptionMethod, password: impl Into<String>) -> Self {
        self.encrypt = method != EncryptionMethod::None;
        self.encryption = method;
        self.password = Some(password.into());
        self
    }

    pub fn with_aes_strength(mut self, strength: AesStrength) -> Self {
        self.aes_strength = strength;
        self
    }

    pub fn with_file_name_in_zip(mut self, name: impl Into<String>) -> Self {
        self.file_name_in_zip = Some(name.into());
        self
    }

    pub fn with_default_folder(mut self, folder: impl AsRef<Path>) -> Self {
        self.default_folder = Some(folder.as_ref().to_path_buf());
        self
    }

    pub fn with_root_folder_in_zip(mut self, folder: impl Into<String>) -> Self {
        self.root_folder_in_zip = Some(folder.into());
        self
    }

    pub fn with_last_modified(mut self, time: SystemTime) -> Self {
        self.last_modified = Some(time);
        self
    }

    /// Whether the entry will actually be encrypted
    pub fn is_encrypted(&self) -> bool {
        self.encrypt && self.encryption != EncryptionMethod::None
    }

    /// Check the encryption settings
    pub(crate) fn validate_encryption(&self) -> Result<()> {
        if !self.encrypt {
            return Ok(());
        }
        if self.encryption == EncryptionMethod::None {
            return Err(SpanZipError::config(
                "encryption requested but no encryption method set",
            ));
        }
        match self.password.as_deref() {
            None | Some("") => Err(SpanZipError::config(format!(
                "a non-empty password is required for {:?} encryption",
                self.encryption
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Compute the entry path inside the archive
    ///
    /// `is_dir` appends the trailing separator directory entries carry.
    pub(crate) fn entry_path(&self, is_dir: bool) -> Result<String> {
        let mut name = match (&self.file_name_in_zip, &self.source) {
            (Some(name), _) => normalize(name),
            (None, Some(source)) if !self.external_stream => {
                relative_name(source, self.default_folder.as_deref())
            }
            _ => String::new(),
        };

        if let Some(root) = &self.root_folder_in_zip {
            let root = normalize(root).trim_end_matches('/').to_string();
            if !root.is_empty() && !name.starts_with(&format!("{}/", root)) {
                name = if name.is_empty() { root } else { format!("{}/{}", root, name) };
            }
        }

        if name.is_empty() || name == "/" {
            return Err(SpanZipError::config("entry path inside the archive is empty"));
        }

        if is_dir && !name.ends_with('/') {
            name.push('/');
        }
        Ok(name)
    }
}

/// Use forward slashes, no leading slash, collapse duplicate separators
fn normalize(path: &str) -> String {
    let trailing = path.ends_with('/') || path.ends_with('\\');
    let joined = path
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/");
    if trailing && !joined.is_empty() {
        format!("{}/", joined)
    } else {
        joined
    }
}

fn relative_name(source: &Path, default_folder: Option<&Path>) -> String {
    let relative = default_folder
        .and_then(|folder| source.strip_prefix(folder).ok())
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| source.file_name().map(PathBuf::from))
        .unwrap_or_default();
    normalize(&relative.to_string_lossy())
}
