//! Volume-spanning output for split archives
//!
//! Bytes go to a single working file. When a split length is configured and
//! the working file is full, it is renamed to `<stem>.zip.NN` (NN = 01, 02, ...)
//! and the working path is reopened empty, so the last volume always keeps
//! the archive's own name.
//!
//! A write that begins with a known ZIP record signature is never split
//! across volumes: if it would not fit, the whole buffer moves to the next
//! volume.

use crate::error::{Result, SpanZipError};
use crate::format::RESERVED_HEADER_SIGNATURES;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Smallest accepted split length
pub const MIN_SPLIT_LENGTH: u64 = 65536;

/// Byte sink that rotates across fixed-size volume files
pub struct VolumeWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    split_length: Option<u64>,
    /// 0-based index of the volume being written
    current_volume: u32,
    /// High-water mark of the current volume
    bytes_written_for_this_part: u64,
    /// Write position within the current volume
    position: u64,
    /// Completed (renamed) volumes in order
    completed: Vec<PathBuf>,
}

impl VolumeWriter {
    /// Create the working file; `split_length` of `None` disables splitting
    pub fn create<P: AsRef<Path>>(path: P, split_length: Option<u64>) -> Result<Self> {
        if let Some(len) = split_length {
            if len < MIN_SPLIT_LENGTH {
                return Err(SpanZipError::config(format!(
                    "split length {} is below the minimum of {} bytes",
                    len, MIN_SPLIT_LENGTH
                )));
            }
        }

        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
            split_length,
            current_volume: 0,
            bytes_written_for_this_part: 0,
            position: 0,
            completed: Vec::new(),
        })
    }

    /// Whether output is split into volumes
    pub fn is_split(&self) -> bool {
        self.split_length.is_some()
    }

    /// 0-based index of the volume currently being written
    pub fn current_volume(&self) -> u32 {
        self.current_volume
    }

    /// Write position within the current volume
    pub fn current_position(&self) -> u64 {
        self.position
    }

    pub fn bytes_written_for_this_part(&self) -> u64 {
        self.bytes_written_for_this_part
    }

    /// Write `data`, rotating volumes as needed
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(split_length) = self.split_length else {
            return self.write_raw(data);
        };

        if self.position + data.len() as u64 <= self.bytes_written_for_this_part {
            // in-place overwrite after a seek
            return self.write_raw(data);
        }

        let mut remaining = data;
        let mut first = true;
        while !remaining.is_empty() {
            if self.bytes_written_for_this_part >= split_length {
                self.rotate()?;
                first = false;
                continue;
            }

            let room = split_length - self.bytes_written_for_this_part;
            if remaining.len() as u64 <= room {
                return self.write_raw(remaining);
            }

            if first
                && remaining.len() as u64 <= split_length
                && starts_with_reserved_signature(remaining)
            {
                // headers stay in one piece on the next volume
                self.rotate()?;
                return self.write_raw(remaining);
            }

            let (head, tail) = remaining.split_at(room as usize);
            self.write_raw(head)?;
            self.rotate()?;
            remaining = tail;
            first = false;
        }
        Ok(())
    }

    /// Rotate now if a header of `len` bytes would not fit in this volume
    ///
    /// Returns whether a rotation happened. Callers use this before recording
    /// the disk index and offset a header will be written at.
    pub fn ensure_room(&mut self, len: u64) -> Result<bool> {
        match self.split_length {
            Some(split_length)
                if self.bytes_written_for_this_part > 0
                    && self.bytes_written_for_this_part + len > split_length =>
            {
                self.rotate()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Close the current volume, rename it and reopen the working path
    ///
    /// Fails with `AlreadyExists` if the volume name is taken; nothing is
    /// written past a failed rotation.
    pub fn rotate(&mut self) -> Result<()> {
        let target = self.volume_path(self.current_volume + 1);
        if target.exists() {
            return Err(SpanZipError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("split volume {} already exists", target.display()),
            )));
        }

        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        fs::rename(&self.path, &target)?;
        log::debug!(
            "volume {} complete ({} bytes) -> {}",
            self.current_volume,
            self.bytes_written_for_this_part,
            target.display()
        );

        self.file = Some(BufWriter::new(File::create(&self.path)?));
        self.completed.push(target);
        self.current_volume += 1;
        self.bytes_written_for_this_part = 0;
        self.position = 0;
        Ok(())
    }

    /// Move the write position within the current volume
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.file_mut()?.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Overwrite already written bytes of the current volume at `position`
    ///
    /// Never rotates, even when the volume is full. The write position is
    /// restored afterwards.
    pub fn overwrite_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        if position + data.len() as u64 > self.bytes_written_for_this_part {
            return Err(SpanZipError::state(format!(
                "overwrite of {} bytes at {} runs past the end of volume {}",
                data.len(),
                position,
                self.current_volume
            )));
        }
        let end = self.position;
        self.seek(position)?;
        self.write_raw(data)?;
        self.seek(end)
    }

    /// Flush and close the last volume, returning all volume paths in order
    pub fn close(mut self) -> Result<Vec<PathBuf>> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        let mut volumes = std::mem::take(&mut self.completed);
        volumes.push(self.path.clone());
        Ok(volumes)
    }

    /// Path of the completed volume `number` (1-based)
    fn volume_path(&self, number: u32) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{}.zip.{:02}", stem, number))
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.file_mut()?.write_all(data)?;
        self.position += data.len() as u64;
        self.bytes_written_for_this_part = self.bytes_written_for_this_part.max(self.position);
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| SpanZipError::state("volume writer is closed"))
    }
}

fn starts_with_reserved_signature(data: &[u8]) -> bool {
    match data.first_chunk::<4>() {
        Some(head) => RESERVED_HEADER_SIGNATURES.contains(&u32::from_le_bytes(*head)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CENTRAL_DIRECTORY_SIGNATURE, LOCAL_FILE_HEADER_SIGNATURE};
    use tempfile::tempdir;

    const LIMIT: u64 = MIN_SPLIT_LENGTH;

    #[test]
    fn test_unsplit_writes_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.zip");
        let mut writer = VolumeWriter::create(&path, None).unwrap();
        writer.write(&vec![1u8; 200_000]).unwrap();
        assert_eq!(writer.current_volume(), 0);
        let volumes = writer.close().unwrap();
        assert_eq!(volumes, vec![path.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 200_000);
    }

    #[test]
    fn test_split_at_exact_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![7u8; 60_000]).unwrap();
        writer.write(&vec![8u8; 10_000]).unwrap();
        assert_eq!(writer.current_volume(), 1);
        assert_eq!(writer.current_position(), 70_000 - LIMIT);

        let volumes = writer.close().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0], dir.path().join("data.zip.01"));
        let first = fs::read(&volumes[0]).unwrap();
        assert_eq!(first.len() as u64, LIMIT);
        assert_eq!(first[59_999], 7);
        assert_eq!(first[60_000], 8);
        assert_eq!(fs::read(&volumes[1]).unwrap().len() as u64, 70_000 - LIMIT);
    }

    #[test]
    fn test_large_write_spans_several_volumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![3u8; 3 * LIMIT as usize + 10]).unwrap();
        let volumes = writer.close().unwrap();
        assert_eq!(volumes.len(), 4);
        for volume in &volumes[..3] {
            assert_eq!(fs::metadata(volume).unwrap().len(), LIMIT);
        }
        assert_eq!(fs::metadata(&volumes[3]).unwrap().len(), 10);
    }

    #[test]
    fn test_header_is_never_split() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hdr.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![0u8; LIMIT as usize - 10]).unwrap();

        let mut header = CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes().to_vec();
        header.extend_from_slice(&[0xAA; 42]);
        writer.write(&header).unwrap();
        assert_eq!(writer.current_volume(), 1);
        assert_eq!(writer.current_position(), header.len() as u64);

        let volumes = writer.close().unwrap();
        assert_eq!(fs::metadata(&volumes[0]).unwrap().len(), LIMIT - 10);
        assert_eq!(fs::read(&volumes[1]).unwrap(), header);
    }

    #[test]
    fn test_rotates_before_write_when_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![0u8; LIMIT as usize]).unwrap();
        assert_eq!(writer.current_volume(), 0);
        writer.write(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes()).unwrap();
        assert_eq!(writer.current_volume(), 1);
        assert_eq!(writer.bytes_written_for_this_part(), 4);
    }

    #[test]
    fn test_ensure_room_rotates_early() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("room.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        assert!(!writer.ensure_room(100).unwrap());
        writer.write(&vec![0u8; LIMIT as usize - 50]).unwrap();
        assert!(!writer.ensure_room(50).unwrap());
        assert!(writer.ensure_room(51).unwrap());
        assert_eq!(writer.current_volume(), 1);
        assert_eq!(writer.current_position(), 0);
    }

    #[test]
    fn test_rotation_fails_on_existing_volume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clash.zip");
        fs::write(dir.path().join("clash.zip.01"), b"taken").unwrap();

        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        let err = writer.write(&vec![0u8; LIMIT as usize + 1]).unwrap_err();
        assert!(matches!(err, SpanZipError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(fs::read(dir.path().join("clash.zip.01")).unwrap(), b"taken");
    }

    #[test]
    fn test_rejects_small_split_length() {
        let dir = tempdir().unwrap();
        let result = VolumeWriter::create(dir.path().join("x.zip"), Some(1000));
        assert!(matches!(result, Err(SpanZipError::Config(_))));
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patch.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(b"abcdefgh").unwrap();
        writer.overwrite_at(0, b"XY").unwrap();
        assert_eq!(writer.bytes_written_for_this_part(), 8);
        assert_eq!(writer.current_position(), 8);
        writer.write(b"ij").unwrap();
        writer.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"XYcdefghij");
    }

    #[test]
    fn test_overwrite_on_full_volume_does_not_rotate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![5u8; LIMIT as usize]).unwrap();
        writer.overwrite_at(0, b"PK00").unwrap();
        assert_eq!(writer.current_volume(), 0);

        let volumes = writer.close().unwrap();
        assert_eq!(volumes, vec![path.clone()]);
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, LIMIT);
        assert_eq!(&bytes[..4], b"PK00");
        assert!(!dir.path().join("full.zip.01").exists());
    }

    #[test]
    fn test_seek_back_on_full_volume_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seek.zip");
        let mut writer = VolumeWriter::create(&path, Some(LIMIT)).unwrap();
        writer.write(&vec![1u8; LIMIT as usize]).unwrap();
        writer.seek(8).unwrap();
        writer.write(b"XY").unwrap();
        assert_eq!(writer.current_volume(), 0);
        assert_eq!(writer.bytes_written_for_this_part(), LIMIT);
        writer.seek(LIMIT).unwrap();

        let volumes = writer.close().unwrap();
        assert_eq!(volumes, vec![path.clone()]);
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, LIMIT);
        assert_eq!(&bytes[8..10], b"XY");
    }

    #[test]
    fn test_overwrite_past_end_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = VolumeWriter::create(dir.path().join("short.zip"), None).unwrap();
        writer.write(b"abc").unwrap();
        let err = writer.overwrite_at(2, b"XY").unwrap_err();
        assert!(matches!(err, SpanZipError::InvalidState(_)));
    }
}
