//! # span-zip: Streaming, Split and Encrypted ZIP Writer
//!
//! `span-zip` writes ZIP archives as a stream, with constant memory use no
//! matter how large the archive grows. Archives can be split into fixed-size
//! volumes and entries can be password protected.
//!
//! ## Features
//!
//! - **Streaming Write**: entries are compressed and written on the fly, sizes follow in data descriptors
//! - **Split Archives**: `name.zip.01`, `name.zip.02`, ..., `name.zip` with a configurable volume size
//! - **Encryption**: WinZip AES (AE-2, 128 or 256 bit) and traditional PKWARE encryption
//! - **Zip64**: large entries, offsets and entry counts
//!
//! ## Quick Start
//!
//! ### Writing a ZIP file
//!
//! ```no_run
//! use span_zip::{ArchiveWriter, EntryOptions};
//!
//! let mut writer = ArchiveWriter::create("output.zip")?;
//!
//! writer.put_next_entry(&EntryOptions::stream("file1.txt"))?;
//! writer.write(b"Hello, World!")?;
//! writer.close_entry()?;
//!
//! writer.put_next_entry(&EntryOptions::file("report.pdf"))?;
//! writer.write(&std::fs::read("report.pdf")?)?;
//! writer.close_entry()?;
//!
//! writer.finish()?;
//! # Ok::<(), span_zip::SpanZipError>(())
//! ```
//!
//! ### Splitting and encrypting
//!
//! ```no_run
//! use span_zip::{AesStrength, ArchiveConfig, ArchiveWriter, EncryptionMethod, EntryOptions};
//!
//! let config = ArchiveConfig::default().with_split_length(10 * 1024 * 1024);
//! let mut writer = ArchiveWriter::with_config("backup.zip", config)?;
//!
//! let options = EntryOptions::stream("secret.txt")
//!     .with_encryption(EncryptionMethod::Aes, "p@ss")
//!     .with_aes_strength(AesStrength::Aes256);
//! writer.put_next_entry(&options)?;
//! writer.write(b"Confidential data")?;
//! writer.close_entry()?;
//!
//! for volume in writer.finish()? {
//!     println!("{}", volume.display());
//! }
//! # Ok::<(), span_zip::SpanZipError>(())
//! ```

pub mod deflate;
pub mod encryption;
pub mod entry;
pub mod error;
pub mod format;
pub mod options;
pub mod volume;
pub mod writer;

pub use encryption::{AesEncryptor, CipherMode, Encryptor, StandardEncryptor};
pub use entry::{EntryChecksum, EntryCipherWriter};
pub use error::{Result, SpanZipError};
pub use format::{GeneralFileHeader, LocalFileHeader};
pub use options::{
    AesStrength, ArchiveConfig, CompressionMethod, EncryptionMethod, EntryOptions,
    FileNameCharset,
};
pub use volume::{VolumeWriter, MIN_SPLIT_LENGTH};
pub use writer::ArchiveWriter;
