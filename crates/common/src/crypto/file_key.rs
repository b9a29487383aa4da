//! Per-file content keys
//!
//! Every encrypted backup file carries its own 32-byte key, AES key wrapped
//! (RFC 3394) under the class key of the file's protection class. File
//! content is AES-256 in CBC mode with an all-zero IV; the plaintext is padded
//! to the block size, so the manifest's recorded size is what determines
//! where the real content ends.

use std::fmt;
use std::io::{self, Read, Write};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use super::keybag::{ClassKey, WRAPPED_KEY_SIZE};

/// Size of an unwrapped file key in bytes
pub const FILE_KEY_SIZE: usize = 32;
/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;
/// Initialization vector used for every file
pub const FILE_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

// multiple of BLOCK_SIZE
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FileKeyError {
    #[error("wrapped file key is {0} bytes, expected {WRAPPED_KEY_SIZE}")]
    InvalidWrappedSize(usize),
    #[error("file key failed the key wrap integrity check")]
    IntegrityCheckFailed,
    #[error("key wrap error: {0}")]
    Wrap(String),
    #[error("ciphertext length {0} is not a multiple of the block size")]
    UnalignedCiphertext(u64),
    #[error("ciphertext decrypts to {available} bytes but {expected} were expected")]
    ShortPlaintext { expected: u64, available: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An unwrapped file content key
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey([u8; FILE_KEY_SIZE]);

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(..)")
    }
}

impl From<[u8; FILE_KEY_SIZE]> for FileKey {
    fn from(bytes: [u8; FILE_KEY_SIZE]) -> Self {
        FileKey(bytes)
    }
}

/// Read until `buf` is full or the reader is exhausted
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl FileKey {
    pub fn bytes(&self) -> &[u8; FILE_KEY_SIZE] {
        &self.0
    }

    /// Unwrap a file key with the class key of its protection class
    pub fn unwrap(class_key: &ClassKey, wrapped: &[u8]) -> Result<Self, FileKeyError> {
        if wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(FileKeyError::InvalidWrappedSize(wrapped.len()));
        }
        let mut key = [0u8; FILE_KEY_SIZE];
        class_key
            .kek()
            .unwrap(wrapped, &mut key)
            .map_err(|e| match e {
                aes_kw::Error::IntegrityCheckFailed => FileKeyError::IntegrityCheckFailed,
                other => FileKeyError::Wrap(other.to_string()),
            })?;
        Ok(FileKey(key))
    }

    /// Wrap this key under `class_key`
    pub fn wrap(&self, class_key: &ClassKey) -> Result<Vec<u8>, FileKeyError> {
        class_key
            .kek()
            .wrap_vec(&self.0)
            .map_err(|e| FileKeyError::Wrap(e.to_string()))
    }

    /// Decrypt a whole ciphertext held in memory
    pub fn decrypt(&self, ciphertext: &[u8], plaintext_len: u64) -> Result<Vec<u8>, FileKeyError> {
        let mut out = Vec::with_capacity(ciphertext.len());
        self.decrypt_stream(ciphertext, &mut out, plaintext_len)?;
        Ok(out)
    }

    /// Decrypt `reader` into `writer`, keeping the first `plaintext_len`
    /// bytes of plaintext. Returns the number of bytes written.
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        plaintext_len: u64,
    ) -> Result<u64, FileKeyError> {
        let cipher = Aes256::new(GenericArray::from_slice(&self.0));
        let mut prev = FILE_IV;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        let mut remaining = plaintext_len;

        loop {
            let n = fill(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if n % BLOCK_SIZE != 0 {
                return Err(FileKeyError::UnalignedCiphertext(total));
            }

            for block in buf[..n].chunks_exact_mut(BLOCK_SIZE) {
                let mut current = [0u8; BLOCK_SIZE];
                current.copy_from_slice(block);
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
                block
                    .iter_mut()
                    .zip(prev.iter())
                    .for_each(|(byte, chained)| *byte ^= chained);
                prev = current;
            }

            let keep = remaining.min(n as u64) as usize;
            writer.write_all(&buf[..keep])?;
            remaining -= keep as u64;

            if n < buf.len() {
                break;
            }
        }

        if remaining > 0 {
            return Err(FileKeyError::ShortPlaintext {
                expected: plaintext_len,
                available: plaintext_len - remaining,
            });
        }
        writer.flush()?;
        Ok(plaintext_len)
    }

    /// Encrypt `plaintext` with PKCS#7 block padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256::new(GenericArray::from_slice(&self.0));
        let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
        let mut out = Vec::with_capacity(plaintext.len() + pad);
        out.extend_from_slice(plaintext);
        out.resize(plaintext.len() + pad, pad as u8);

        let mut prev = FILE_IV;
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            block
                .iter_mut()
                .zip(prev.iter())
                .for_each(|(byte, chained)| *byte ^= chained);
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
            prev.copy_from_slice(block);
        }
        out
    }
}
