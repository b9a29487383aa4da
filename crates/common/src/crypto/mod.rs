//! Cryptographic primitives for backup decryption
//!
//! A backup's key hierarchy has three levels:
//!
//! - **Passphrase**: stretched with PBKDF2 into an unlocking key ([`kdf`])
//! - **Class keys**: one per protection class, stored in the backup's
//!   [`KeyBag`] and AES key wrapped under the unlocking key
//! - **File keys**: one per file, AES key wrapped under the class key of the
//!   file's protection class and used for AES-256-CBC content encryption
//!   ([`FileKey`])
//!
//! Unlocking is all-or-nothing: [`KeyBag::unlock`] either releases every
//! passphrase-protected class key or fails with [`KeyError::WrongPassphrase`].

mod file_key;
pub mod kdf;
mod keybag;
pub mod tlv;

pub use file_key::{FileKey, FileKeyError, BLOCK_SIZE, FILE_IV, FILE_KEY_SIZE};
pub use keybag::{
    unlock, ClassKey, KeyBag, KeyError, UnlockedKeyBag, CLASS_KEY_SIZE, SUPPORTED_VERSIONS,
    WRAPPED_KEY_SIZE, WRAP_DEVICE, WRAP_PASSPHRASE,
};
