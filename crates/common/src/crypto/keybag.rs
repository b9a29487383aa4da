//! Backup key bag parsing and unlocking
//!
//! A backup key bag holds one *class key* per data protection class. Each
//! file's own key is wrapped with the class key of its protection class, so
//! unlocking the bag is the first step before any file can be decrypted.
//!
//! # Layout
//!
//! The blob is a flat [tagged-field](super::tlv) sequence. Fields before the
//! second `UUID` describe the bag itself; every further `UUID` opens a class
//! record:
//!
//! ```text
//! VERS TYPE UUID HMCK WRAP SALT ITER [DPWT DPIC DPSL]
//! UUID CLAS WRAP [KTYP] WPKY
//! UUID CLAS WRAP [KTYP] WPKY
//! ...
//! ```
//!
//! # Unlocking
//!
//! Class keys whose `WRAP` flags carry [`WRAP_PASSPHRASE`] are AES key
//! wrapped (RFC 3394) under a key derived from the passphrase (see
//! [`kdf`](super::kdf)). The integrity register embedded in every wrapped key
//! doubles as the passphrase check: a single failed unwrap means the
//! passphrase is wrong and no key is released. Class keys without that flag
//! are stored in the clear.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use aes_kw::KekAes256 as Kek;

use super::kdf::{derive_unlock_key, KdfParams};
use super::tlv::{self, Field, Tag, TlvError};

/// Class key flag: wrapped with the device UID key (never present in backups)
pub const WRAP_DEVICE: u32 = 0x1;
/// Class key flag: wrapped with the passphrase-derived key
pub const WRAP_PASSPHRASE: u32 = 0x2;
/// Size of an unwrapped class key in bytes
pub const CLASS_KEY_SIZE: usize = 32;
/// Size of an AES-KW wrapped 32-byte key in bytes
pub const WRAPPED_KEY_SIZE: usize = CLASS_KEY_SIZE + 8;
/// Key bag format versions this reader understands
pub const SUPPORTED_VERSIONS: RangeInclusive<u32> = 2..=5;

const TAG_VERS: Tag = Tag::new(b"VERS");
const TAG_TYPE: Tag = Tag::new(b"TYPE");
const TAG_UUID: Tag = Tag::new(b"UUID");
const TAG_HMCK: Tag = Tag::new(b"HMCK");
const TAG_WRAP: Tag = Tag::new(b"WRAP");
const TAG_SALT: Tag = Tag::new(b"SALT");
const TAG_ITER: Tag = Tag::new(b"ITER");
const TAG_DPWT: Tag = Tag::new(b"DPWT");
const TAG_DPIC: Tag = Tag::new(b"DPIC");
const TAG_DPSL: Tag = Tag::new(b"DPSL");
const TAG_CLAS: Tag = Tag::new(b"CLAS");
const TAG_KTYP: Tag = Tag::new(b"KTYP");
const TAG_WPKY: Tag = Tag::new(b"WPKY");
const TAG_PBKY: Tag = Tag::new(b"PBKY");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("malformed key bag: {0}")]
    MalformedBag(String),
    #[error("unsupported key bag version {0}")]
    UnsupportedVersion(u32),
}

impl From<TlvError> for KeyError {
    fn from(e: TlvError) -> Self {
        KeyError::MalformedBag(e.to_string())
    }
}

/// An unwrapped protection class key
#[derive(Clone, PartialEq, Eq)]
pub struct ClassKey([u8; CLASS_KEY_SIZE]);

impl fmt::Debug for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClassKey(..)")
    }
}

impl From<[u8; CLASS_KEY_SIZE]> for ClassKey {
    fn from(bytes: [u8; CLASS_KEY_SIZE]) -> Self {
        ClassKey(bytes)
    }
}

impl ClassKey {
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; CLASS_KEY_SIZE] = data.try_into().ok()?;
        Some(ClassKey(bytes))
    }

    pub fn bytes(&self) -> &[u8; CLASS_KEY_SIZE] {
        &self.0
    }

    /// AES key wrap cipher keyed with this class key
    pub(crate) fn kek(&self) -> Kek {
        Kek::from(self.0)
    }
}

/// One class record as declared in the blob
#[derive(Debug, Clone, Default)]
struct ClassEntry {
    class: Option<u32>,
    wrap: u32,
    key_type: Option<u32>,
    wrapped_key: Option<Vec<u8>>,
}

impl ClassEntry {
    fn is_passphrase_wrapped(&self) -> bool {
        self.wrap & WRAP_PASSPHRASE != 0
    }
}

/// A parsed, still locked key bag
///
/// No key material is reachable from a `KeyBag`; call [`KeyBag::unlock`] to
/// obtain an [`UnlockedKeyBag`].
#[derive(Debug, Clone)]
pub struct KeyBag {
    version: u32,
    bag_type: u32,
    uuid: Option<Vec<u8>>,
    kdf: Option<KdfParams>,
    classes: Vec<(u32, ClassEntry)>,
}

/// The class keys released by a successful unlock
#[derive(Debug, Clone, Default)]
pub struct UnlockedKeyBag {
    keys: BTreeMap<u32, ClassKey>,
}

impl UnlockedKeyBag {
    pub fn class_key(&self, class: u32) -> Option<&ClassKey> {
        self.keys.get(&class)
    }

    pub fn classes(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(u32, ClassKey)> for UnlockedKeyBag {
    fn from_iter<I: IntoIterator<Item = (u32, ClassKey)>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

fn required_u32(field: &Field<'_>) -> Result<u32, KeyError> {
    field.as_u32().ok_or_else(|| {
        KeyError::MalformedBag(format!(
            "field {} is not an integer ({} bytes)",
            field.tag,
            field.value.len()
        ))
    })
}

impl KeyBag {
    /// Parse a key bag blob without unlocking it
    pub fn parse(blob: &[u8]) -> Result<Self, KeyError> {
        let mut version = None;
        let mut bag_type = None;
        let mut uuid = None;
        let mut salt = None;
        let mut iterations = None;
        let mut dp_salt = None;
        let mut dp_iterations = None;
        let mut current: Option<ClassEntry> = None;
        let mut entries = Vec::new();

        for field in tlv::fields(blob) {
            let field = field?;
            match field.tag {
                TAG_UUID if uuid.is_none() => uuid = Some(field.value.to_vec()),
                TAG_UUID => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    current = Some(ClassEntry::default());
                }
                TAG_VERS => version = Some(required_u32(&field)?),
                TAG_TYPE => bag_type = Some(required_u32(&field)?),
                TAG_SALT => salt = Some(field.value.to_vec()),
                TAG_ITER => iterations = Some(required_u32(&field)?),
                TAG_DPSL => dp_salt = Some(field.value.to_vec()),
                TAG_DPIC => dp_iterations = Some(required_u32(&field)?),
                TAG_HMCK | TAG_DPWT => {}
                TAG_WRAP => {
                    let wrap = required_u32(&field)?;
                    if let Some(entry) = current.as_mut() {
                        entry.wrap = wrap;
                    }
                }
                TAG_CLAS | TAG_KTYP | TAG_WPKY | TAG_PBKY => {
                    let Some(entry) = current.as_mut() else {
                        return Err(KeyError::MalformedBag(format!(
                            "class field {} outside of a class record",
                            field.tag
                        )));
                    };
                    match field.tag {
                        TAG_CLAS => entry.class = Some(required_u32(&field)?),
                        TAG_KTYP => entry.key_type = Some(required_u32(&field)?),
                        TAG_WPKY => entry.wrapped_key = Some(field.value.to_vec()),
                        _ => {}
                    }
                }
                other => {
                    tracing::trace!(tag = %other, len = field.value.len(), "skipping unknown key bag field");
                }
            }
        }
        if let Some(entry) = current.take() {
            entries.push(entry);
        }

        let version =
            version.ok_or_else(|| KeyError::MalformedBag("missing VERS field".to_string()))?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(KeyError::UnsupportedVersion(version));
        }
        let bag_type =
            bag_type.ok_or_else(|| KeyError::MalformedBag("missing TYPE field".to_string()))?;

        let mut classes = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let class = entry.class.ok_or_else(|| {
                KeyError::MalformedBag(format!("class record {} has no CLAS field", index))
            })?;
            if entry.wrapped_key.is_none() {
                return Err(KeyError::MalformedBag(format!(
                    "class {} has no WPKY field",
                    class
                )));
            }
            classes.push((class, entry));
        }

        let encrypted = classes.iter().any(|(_, e)| e.is_passphrase_wrapped());
        let kdf = if encrypted {
            let salt =
                salt.ok_or_else(|| KeyError::MalformedBag("missing SALT field".to_string()))?;
            let iterations = match iterations {
                Some(n) if n > 0 => n,
                _ => return Err(KeyError::MalformedBag("missing ITER field".to_string())),
            };
            let pre_stretch = match (dp_salt, dp_iterations) {
                (Some(dp_salt), Some(dp_iterations)) if dp_iterations > 0 => {
                    Some((dp_salt, dp_iterations))
                }
                _ => None,
            };
            Some(KdfParams {
                salt,
                iterations,
                pre_stretch,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            bag_type,
            uuid,
            kdf,
            classes,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn bag_type(&self) -> u32 {
        self.bag_type
    }

    pub fn uuid_hex(&self) -> Option<String> {
        self.uuid.as_ref().map(hex::encode)
    }

    /// Whether any class key requires the passphrase
    pub fn is_encrypted(&self) -> bool {
        self.kdf.is_some()
    }

    pub fn class_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.classes.iter().map(|(class, _)| *class)
    }

    /// Unlock the bag with `passphrase`.
    ///
    /// For a bag without passphrase-wrapped keys the passphrase is ignored.
    /// Either every passphrase-wrapped key unwraps, or nothing is returned.
    pub fn unlock(&self, passphrase: &[u8]) -> Result<UnlockedKeyBag, KeyError> {
        let kek = self
            .kdf
            .as_ref()
            .map(|params| Kek::from(derive_unlock_key(passphrase, params)));

        let mut keys = BTreeMap::new();
        for (class, entry) in &self.classes {
            // presence checked in parse
            let wrapped = entry.wrapped_key.as_deref().unwrap_or_default();

            if entry.is_passphrase_wrapped() {
                let Some(kek) = kek.as_ref() else {
                    return Err(KeyError::MalformedBag(
                        "passphrase-wrapped key without KDF parameters".to_string(),
                    ));
                };
                if wrapped.len() != WRAPPED_KEY_SIZE {
                    return Err(KeyError::MalformedBag(format!(
                        "class {} wrapped key is {} bytes, expected {}",
                        class,
                        wrapped.len(),
                        WRAPPED_KEY_SIZE
                    )));
                }
                let mut unwrapped = [0u8; CLASS_KEY_SIZE];
                kek.unwrap(wrapped, &mut unwrapped)
                    .map_err(|e| match e {
                        aes_kw::Error::IntegrityCheckFailed => KeyError::WrongPassphrase,
                        other => KeyError::MalformedBag(format!(
                            "class {} key unwrap failed: {}",
                            class, other
                        )),
                    })?;
                keys.insert(*class, ClassKey(unwrapped));
            } else if let Some(key) = ClassKey::from_slice(wrapped) {
                keys.insert(*class, key);
            } else {
                tracing::debug!(
                    class,
                    wrap = entry.wrap,
                    key_type = ?entry.key_type,
                    "class key is not passphrase-wrapped and not in the clear, skipping"
                );
            }
        }

        tracing::debug!(
            version = self.version,
            classes = keys.len(),
            encrypted = self.is_encrypted(),
            "key bag unlocked"
        );
        Ok(UnlockedKeyBag { keys })
    }
}

/// Parse and unlock a key bag blob in one step
pub fn unlock(blob: &[u8], passphrase: &[u8]) -> Result<UnlockedKeyBag, KeyError> {
    KeyBag::parse(blob)?.unlock(passphrase)
}
