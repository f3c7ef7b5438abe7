//! Entry encryption for ZIP files
//!
//! Two ciphers sit behind the [`Encryptor`] capability:
//!
//! - [`StandardEncryptor`]: the legacy PKWARE stream cipher ("ZipCrypto").
//!   Writes a 12-byte encryption header and has no trailer.
//! - [`AesEncryptor`]: WinZip AE-2.
//!   - PBKDF2-HMAC-SHA1 key derivation (1000 iterations)
//!   - AES-CTR with a little-endian counter starting at 1
//!   - HMAC-SHA1 over the ciphertext, truncated to 10 bytes
//!   - Salt (8 or 16 bytes) and 2-byte password verifier before the data
//!
//! The AES cipher only accepts whole 16-byte blocks until the final call;
//! callers group bytes before handing them over.

use crate::error::{Result, SpanZipError};
use crate::options::AesStrength;
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128LE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// AES block size; AES input is grouped into blocks of this size
pub const AES_BLOCK_SIZE: usize = 16;
/// Length of the WinZip authentication code
pub const AES_AUTH_CODE_LENGTH: usize = 10;
pub const AES_PASSWORD_VERIFIER_LENGTH: usize = 2;
/// Length of the ZipCrypto encryption header
pub const STANDARD_HEADER_SIZE: usize = 12;

const PBKDF2_ITERATIONS: u32 = 1000;

/// What an encryptor instance was built to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Transform plaintext and produce a trailer
    Encrypt,
    /// Check an authentication code over already-encrypted data
    Verify,
}

/// Per-entry encryption capability
pub trait Encryptor {
    fn mode(&self) -> CipherMode;

    /// Bytes written right after the local header (counted as entry data)
    fn header_bytes(&self) -> &[u8];

    /// Encrypt `data` in place
    fn encrypt_data(&mut self, data: &mut [u8]) -> Result<()>;

    /// Finish the entry and return the trailer to write after the data
    fn finish(&mut self) -> Result<Vec<u8>>;

    /// Return to the state right after construction, keeping the header
    fn reset(&mut self) -> Result<()>;

    /// Check `auth_code` against `ciphertext`
    fn verify(&mut self, _ciphertext: &[u8], _auth_code: &[u8]) -> Result<()> {
        Err(SpanZipError::EncryptionMode(
            "verification is not supported by this cipher".to_string(),
        ))
    }
}

/// Legacy PKWARE ("ZipCrypto") stream cipher
pub struct StandardEncryptor {
    keys: ZipCryptoKeys,
    /// Keys after the header was encrypted
    initial_keys: ZipCryptoKeys,
    header: [u8; STANDARD_HEADER_SIZE],
}

impl StandardEncryptor {
    /// Initialize with `password` and write the encryption header
    ///
    /// `check_byte` becomes the last header byte; readers compare it against
    /// the entry's CRC or, when a data descriptor is used, the high byte of
    /// the DOS time.
    pub fn new(password: &[u8], check_byte: u8) -> Result<Self> {
        let mut random = [0u8; STANDARD_HEADER_SIZE];
        fill_random(&mut random[..STANDARD_HEADER_SIZE - 1])?;
        Ok(Self::with_header_seed(password, random, check_byte))
    }

    fn with_header_seed(
        password: &[u8],
        mut header: [u8; STANDARD_HEADER_SIZE],
        check_byte: u8,
    ) -> Self {
        let mut keys = ZipCryptoKeys::derive(password);
        header[STANDARD_HEADER_SIZE - 1] = check_byte;
        keys.encrypt(&mut header);
        Self {
            keys,
            initial_keys: keys,
            header,
        }
    }
}

impl Encryptor for StandardEncryptor {
    fn mode(&self) -> CipherMode {
        CipherMode::Encrypt
    }

    fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    fn encrypt_data(&mut self, data: &mut [u8]) -> Result<()> {
        self.keys.encrypt(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) -> Result<()> {
        self.keys = self.initial_keys;
        Ok(())
    }
}

/// ZipCrypto key state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ZipCryptoKeys {
    key0: u32,
    key1: u32,
    key2: u32,
}

impl ZipCryptoKeys {
    fn derive(password: &[u8]) -> Self {
        let mut keys = Self {
            key0: 0x12345678,
            key1: 0x23456789,
            key2: 0x34567890,
        };
        for &byte in password {
            keys.update(byte);
        }
        keys
    }

    fn update(&mut self, byte: u8) {
        self.key0 = crc32_step(self.key0, byte);
        self.key1 = self
            .key1
            .wrapping_add(self.key0 & 0xFF)
            .wrapping_mul(134775813)
            .wrapping_add(1);
        self.key2 = crc32_step(self.key2, (self.key1 >> 24) as u8);
    }

    fn stream_byte(&self) -> u8 {
        let temp = (self.key2 | 2) as u16;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let plain = *byte;
            *byte = plain ^ self.stream_byte();
            self.update(plain);
        }
    }
}

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB88320 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// One raw CRC-32 table step, without the pre/post inversion
fn crc32_step(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize]
}

enum AesCtr {
    Aes128(Ctr128LE<Aes128>),
    Aes256(Ctr128LE<Aes256>),
}

impl AesCtr {
    fn new(strength: AesStrength, key: &[u8]) -> Result<Self> {
        // WinZip counter: little-endian, first block uses 1
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv[0] = 1;
        let invalid = |e: ctr::cipher::InvalidLength| {
            SpanZipError::Encryption(format!("AES key setup failed: {}", e))
        };
        Ok(match strength {
            AesStrength::Aes128 => {
                AesCtr::Aes128(Ctr128LE::<Aes128>::new_from_slices(key, &iv).map_err(invalid)?)
            }
            AesStrength::Aes256 => {
                AesCtr::Aes256(Ctr128LE::<Aes256>::new_from_slices(key, &iv).map_err(invalid)?)
            }
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            AesCtr::Aes128(cipher) => cipher.apply_keystream(data),
            AesCtr::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }
}

/// WinZip AE-2 encryption context for one entry
pub struct AesEncryptor {
    mode: CipherMode,
    strength: AesStrength,
    /// Salt followed by the password verifier
    header: Vec<u8>,
    /// Cipher key followed by the MAC key
    keys: Vec<u8>,
    cipher: AesCtr,
    hmac: HmacSha1,
    /// Set once a block shorter than 16 bytes was processed
    finished: bool,
}

impl AesEncryptor {
    /// Create an encryptor with a fresh random salt
    pub fn new(password: &[u8], strength: AesStrength) -> Result<Self> {
        let mut salt = vec![0u8; strength.salt_size()];
        fill_random(&mut salt)?;
        Self::with_salt(password, &salt, strength, CipherMode::Encrypt)
    }

    /// Create a verifier for data encrypted with `password` and `salt`
    pub fn verifier(password: &[u8], salt: &[u8], strength: AesStrength) -> Result<Self> {
        Self::with_salt(password, salt, strength, CipherMode::Verify)
    }

    fn with_salt(
        password: &[u8],
        salt: &[u8],
        strength: AesStrength,
        mode: CipherMode,
    ) -> Result<Self> {
        if salt.len() != strength.salt_size() {
            return Err(SpanZipError::Encryption(format!(
                "Invalid salt size: expected {}, got {}",
                strength.salt_size(),
                salt.len()
            )));
        }

        let mut derived = vec![0u8; strength.derived_key_size()];
        pbkdf2_hmac::<Sha1>(password, salt, PBKDF2_ITERATIONS, &mut derived);

        let key_size = strength.key_size();
        let keys = derived[..key_size * 2].to_vec();
        let (cipher, hmac) = Self::keyed(strength, &keys)?;

        let mut header = salt.to_vec();
        header.extend_from_slice(&derived[key_size * 2..]);

        Ok(Self {
            mode,
            strength,
            header,
            keys,
            cipher,
            hmac,
            finished: false,
        })
    }

    fn keyed(strength: AesStrength, keys: &[u8]) -> Result<(AesCtr, HmacSha1)> {
        let (cipher_key, mac_key) = keys.split_at(strength.key_size());
        let cipher = AesCtr::new(strength, cipher_key)?;
        let hmac = HmacSha1::new_from_slice(mac_key)
            .map_err(|e| SpanZipError::Encryption(format!("HMAC init failed: {}", e)))?;
        Ok((cipher, hmac))
    }

    pub fn strength(&self) -> AesStrength {
        self.strength
    }

    pub fn salt(&self) -> &[u8] {
        &self.header[..self.strength.salt_size()]
    }

    pub fn password_verifier(&self) -> &[u8] {
        &self.header[self.strength.salt_size()..]
    }
}

impl Encryptor for AesEncryptor {
    fn mode(&self) -> CipherMode {
        self.mode
    }

    fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    fn encrypt_data(&mut self, data: &mut [u8]) -> Result<()> {
        if self.mode != CipherMode::Encrypt {
            return Err(SpanZipError::EncryptionMode(
                "encrypt_data called on an AES verifier".to_string(),
            ));
        }
        if self.finished {
            return Err(SpanZipError::EncryptionMode(
                "AES encryptor is finished: a partial block was already processed".to_string(),
            ));
        }
        if data.len() % AES_BLOCK_SIZE != 0 {
            self.finished = true;
        }
        self.cipher.apply(data);
        self.hmac.update(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.mode != CipherMode::Encrypt {
            return Err(SpanZipError::EncryptionMode(
                "finish called on an AES verifier".to_string(),
            ));
        }
        self.finished = true;
        let mac = self.hmac.clone().finalize().into_bytes();
        Ok(mac[..AES_AUTH_CODE_LENGTH].to_vec())
    }

    fn reset(&mut self) -> Result<()> {
        let (cipher, hmac) = Self::keyed(self.strength, &self.keys)?;
        self.cipher = cipher;
        self.hmac = hmac;
        self.finished = false;
        Ok(())
    }

    fn verify(&mut self, ciphertext: &[u8], auth_code: &[u8]) -> Result<()> {
        if self.mode != CipherMode::Verify {
            return Err(SpanZipError::EncryptionMode(
                "verify is only valid in verify mode".to_string(),
            ));
        }
        let mut hmac = self.hmac.clone();
        hmac.update(ciphertext);
        hmac.verify_truncated_left(auth_code).map_err(|_| {
            SpanZipError::Encryption(
                "Authentication failed: data may be corrupted or password is incorrect".to_string(),
            )
        })
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf)
        .map_err(|e| SpanZipError::Encryption(format!("random source failed: {}", e)))
}
