//! Minimal archive reader used to check what the writer produced
#![allow(dead_code)]

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::read::DeflateDecoder;
use span_zip::AesStrength;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

pub const CENTRAL_SIG: u32 = 0x02014b50;
pub const LOCAL_SIG: u32 = 0x04034b50;
pub const DESCRIPTOR_SIG: u32 = 0x08074b50;
pub const EOCD_SIG: u32 = 0x06054b50;
pub const ZIP64_LOCATOR_SIG: u32 = 0x07064b50;

fn u16_at(bytes: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([bytes[pos], bytes[pos + 1]])
}

fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap())
}

/// Values from an entry's data descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub name: Vec<u8>,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub disk_number_start: u32,
    pub local_header_offset: u64,
    pub external_attributes: u32,
    pub central_extra: Vec<u8>,
    /// Local header bytes exactly as stored
    pub local_header: Vec<u8>,
    pub local_extra: Vec<u8>,
    /// Raw entry data (encryption header and tag included)
    pub data: Vec<u8>,
    pub descriptor: Descriptor,
}

impl ParsedEntry {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Body of the extra field with the given id
    pub fn central_extra_field(&self, id: u16) -> Option<&[u8]> {
        find_extra(&self.central_extra, id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndRecord {
    pub disk_number: u16,
    pub central_directory_disk: u16,
    pub entries_on_this_disk: u16,
    pub total_entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
}

#[derive(Debug)]
pub struct ParsedArchive {
    /// First four bytes of the first volume when they are a split marker
    pub marker: Option<[u8; 4]>,
    pub entries: Vec<ParsedEntry>,
    pub end: EndRecord,
    /// Byte length of each volume
    pub volume_lengths: Vec<u64>,
    /// Start of each volume within the joined byte stream
    pub volume_starts: Vec<u64>,
    /// (start, end) of every header, trailer and end record in the joined stream
    pub record_spans: Vec<(u64, u64)>,
}

impl ParsedArchive {
    pub fn entry(&self, name: &str) -> &ParsedEntry {
        self.entries
            .iter()
            .find(|e| e.name == name.as_bytes())
            .unwrap_or_else(|| panic!("no entry named {}", name))
    }

    /// Volume index holding the joined-stream position `pos`
    pub fn volume_of(&self, pos: u64) -> usize {
        self.volume_starts.iter().rposition(|&start| start <= pos).unwrap()
    }

    /// Panic if any record begins in one volume and ends in another
    pub fn assert_records_within_volumes(&self) {
        for &(start, end) in &self.record_spans {
            assert_eq!(
                self.volume_of(start),
                self.volume_of(end - 1),
                "record {}..{} straddles a volume boundary",
                start,
                end
            );
        }
    }
}

fn find_extra(extra: &[u8], id: u16) -> Option<&[u8]> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let field_id = u16_at(extra, pos);
        let len = u16_at(extra, pos + 2) as usize;
        if field_id == id {
            return Some(&extra[pos + 4..pos + 4 + len]);
        }
        pos += 4 + len;
    }
    None
}

/// Parse the volumes of an archive, given in order (last one is the .zip)
pub fn read_archive(volumes: &[PathBuf]) -> ParsedArchive {
    let parts: Vec<Vec<u8>> = volumes.iter().map(|p| fs::read(p).unwrap()).collect();
    let mut starts = Vec::with_capacity(parts.len());
    let mut joined = Vec::new();
    for part in &parts {
        starts.push(joined.len() as u64);
        joined.extend_from_slice(part);
    }

    let marker = match joined.get(..4) {
        Some(head) if head == b"PK00" || head == DESCRIPTOR_SIG.to_le_bytes() => {
            Some(head.try_into().unwrap())
        }
        _ => None,
    };

    let eocd_pos = joined.len() - 22;
    assert_eq!(u32_at(&joined, eocd_pos), EOCD_SIG, "missing end of central directory");
    let end = EndRecord {
        disk_number: u16_at(&joined, eocd_pos + 4),
        central_directory_disk: u16_at(&joined, eocd_pos + 6),
        entries_on_this_disk: u16_at(&joined, eocd_pos + 8),
        total_entries: u16_at(&joined, eocd_pos + 10),
        central_directory_size: u32_at(&joined, eocd_pos + 12),
        central_directory_offset: u32_at(&joined, eocd_pos + 16),
    };

    let mut pos = (starts[end.central_directory_disk as usize]
        + end.central_directory_offset as u64) as usize;
    let mut entries = Vec::new();
    let mut record_spans = vec![(eocd_pos as u64, joined.len() as u64)];
    for _ in 0..end.total_entries {
        assert_eq!(u32_at(&joined, pos), CENTRAL_SIG, "bad central record at {}", pos);
        let name_len = u16_at(&joined, pos + 28) as usize;
        let extra_len = u16_at(&joined, pos + 30) as usize;
        let comment_len = u16_at(&joined, pos + 32) as usize;
        let name = joined[pos + 46..pos + 46 + name_len].to_vec();
        let central_extra = joined[pos + 46 + name_len..pos + 46 + name_len + extra_len].to_vec();

        let mut compressed_size = u32_at(&joined, pos + 20) as u64;
        let mut uncompressed_size = u32_at(&joined, pos + 24) as u64;
        let mut local_header_offset = u32_at(&joined, pos + 42) as u64;
        if let Some(zip64) = find_extra(&central_extra, 0x0001) {
            let mut field = 0;
            if uncompressed_size == 0xFFFF_FFFF {
                uncompressed_size = u64_at(zip64, field);
                field += 8;
            }
            if compressed_size == 0xFFFF_FFFF {
                compressed_size = u64_at(zip64, field);
                field += 8;
            }
            if local_header_offset == 0xFFFF_FFFF {
                local_header_offset = u64_at(zip64, field);
            }
        }

        let disk_number_start = u16_at(&joined, pos + 34) as u32;
        let entry_start = (starts[disk_number_start as usize] + local_header_offset) as usize;
        assert_eq!(u32_at(&joined, entry_start), LOCAL_SIG, "bad local header at {}", entry_start);
        let local_name_len = u16_at(&joined, entry_start + 26) as usize;
        let local_extra_len = u16_at(&joined, entry_start + 28) as usize;
        let local_len = 30 + local_name_len + local_extra_len;
        let local_header = joined[entry_start..entry_start + local_len].to_vec();
        let local_extra = local_header[30 + local_name_len..].to_vec();

        let data_start = entry_start + local_len;
        let data = joined[data_start..data_start + compressed_size as usize].to_vec();

        let desc = data_start + compressed_size as usize;
        assert_eq!(u32_at(&joined, desc), DESCRIPTOR_SIG, "missing data descriptor");
        let wide = u32_at(&local_header, 18) == 0xFFFF_FFFF;
        let desc_len = if wide { 24 } else { 16 };
        let central_len = 46 + name_len + extra_len + comment_len;
        record_spans.push((pos as u64, (pos + central_len) as u64));
        record_spans.push((entry_start as u64, (entry_start + local_len) as u64));
        record_spans.push((desc as u64, (desc + desc_len) as u64));
        let descriptor = if wide {
            Descriptor {
                crc32: u32_at(&joined, desc + 4),
                compressed_size: u64_at(&joined, desc + 8),
                uncompressed_size: u64_at(&joined, desc + 16),
            }
        } else {
            Descriptor {
                crc32: u32_at(&joined, desc + 4),
                compressed_size: u32_at(&joined, desc + 8) as u64,
                uncompressed_size: u32_at(&joined, desc + 12) as u64,
            }
        };

        entries.push(ParsedEntry {
            name,
            version_needed: u16_at(&joined, pos + 6),
            flags: u16_at(&joined, pos + 8),
            method: u16_at(&joined, pos + 10),
            crc32: u32_at(&joined, pos + 16),
            compressed_size,
            uncompressed_size,
            disk_number_start,
            local_header_offset,
            external_attributes: u32_at(&joined, pos + 38),
            central_extra,
            local_header,
            local_extra,
            data,
            descriptor,
        });
        pos += central_len;
    }

    ParsedArchive {
        marker,
        entries,
        end,
        volume_lengths: parts.iter().map(|p| p.len() as u64).collect(),
        volume_starts: starts,
        record_spans,
    }
}

/// Inflate or copy entry data according to `method` (0 or 8)
pub fn decompress(method: u16, data: &[u8]) -> Vec<u8> {
    match method {
        0 => data.to_vec(),
        8 => {
            let mut out = Vec::new();
            DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
            out
        }
        other => panic!("unexpected compression method {}", other),
    }
}

/// Split AE-2 entry data into (salt, verifier, ciphertext, auth code)
pub fn split_aes_data(data: &[u8], strength: AesStrength) -> (&[u8], &[u8], &[u8], &[u8]) {
    let salt_len = strength.salt_size();
    let (salt, rest) = data.split_at(salt_len);
    let (verifier, rest) = rest.split_at(2);
    let (ciphertext, tag) = rest.split_at(rest.len() - 10);
    (salt, verifier, ciphertext, tag)
}

/// Decrypt AE-2 ciphertext
pub fn aes_decrypt(password: &[u8], salt: &[u8], strength: AesStrength, ciphertext: &[u8]) -> Vec<u8> {
    let mut derived = vec![0u8; strength.derived_key_size()];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, salt, 1000, &mut derived);
    let key = &derived[..strength.key_size()];
    let mut iv = [0u8; 16];
    iv[0] = 1;

    let mut out = ciphertext.to_vec();
    match strength {
        AesStrength::Aes128 => {
            ctr::Ctr128LE::<Aes128>::new_from_slices(key, &iv).unwrap().apply_keystream(&mut out)
        }
        AesStrength::Aes256 => {
            ctr::Ctr128LE::<Aes256>::new_from_slices(key, &iv).unwrap().apply_keystream(&mut out)
        }
    }
    out
}

/// Decrypt ZipCrypto entry data, returning (12-byte header, plaintext)
pub fn zipcrypto_decrypt(password: &[u8], data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut keys = [0x12345678u32, 0x23456789, 0x34567890];
    let update = |keys: &mut [u32; 3], byte: u8| {
        keys[0] = crc32_byte(keys[0], byte);
        keys[1] = keys[1].wrapping_add(keys[0] & 0xFF);
        keys[1] = keys[1].wrapping_mul(134775813).wrapping_add(1);
        keys[2] = crc32_byte(keys[2], (keys[1] >> 24) as u8);
    };
    for &byte in password {
        update(&mut keys, byte);
    }

    let mut plain = Vec::with_capacity(data.len());
    for &byte in data {
        let temp = (keys[2] | 2) as u16;
        let stream = (temp.wrapping_mul(temp ^ 1) >> 8) as u8;
        let decrypted = byte ^ stream;
        update(&mut keys, decrypted);
        plain.push(decrypted);
    }
    let body = plain.split_off(12);
    (plain, body)
}

fn crc32_byte(crc: u32, byte: u8) -> u32 {
    let mut c = (crc ^ byte as u32) & 0xFF;
    for _ in 0..8 {
        c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
    }
    c ^ (crc >> 8)
}

/// Deterministic, poorly compressible test data
pub fn pseudo_random_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
