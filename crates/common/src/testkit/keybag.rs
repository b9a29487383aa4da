use aes_kw::KekAes256;
use sha2::{Digest, Sha256};

use crate::crypto::kdf::{derive_unlock_key, KdfParams};
use crate::crypto::tlv::encode_field;
use crate::crypto::{ClassKey, UnlockedKeyBag, CLASS_KEY_SIZE, WRAP_PASSPHRASE};

const BAG_TYPE_BACKUP: u32 = 1;
const SALT: [u8; 20] = [0x5A; 20];
const ITERATIONS: u32 = 10;
const DP_SALT: [u8; 20] = [0xA5; 20];
const DP_ITERATIONS: u32 = 5;

/// Builds key bag blobs with deterministic class keys
///
/// Class `n` always gets the key `sha256("class-key-{n}")`, so tests can
/// compare what a parser releases against [`KeyBagBuilder::class_key`].
#[derive(Debug, Clone)]
pub struct KeyBagBuilder {
    version: u32,
    encrypted: bool,
    pre_stretch: bool,
    classes: Vec<u32>,
}

impl KeyBagBuilder {
    /// A bag whose class keys are stored in the clear
    pub fn unencrypted() -> Self {
        Self {
            version: 3,
            encrypted: false,
            pre_stretch: false,
            classes: Vec::new(),
        }
    }

    /// A bag whose class keys are wrapped with the passphrase
    pub fn encrypted() -> Self {
        Self {
            encrypted: true,
            ..Self::unencrypted()
        }
    }

    pub fn with_class(mut self, class: u32) -> Self {
        if !self.classes.contains(&class) {
            self.classes.push(class);
        }
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Add the SHA-256 pre-stretch round (`DPSL`/`DPIC`)
    pub fn with_pre_stretch(mut self) -> Self {
        self.pre_stretch = true;
        self.version = self.version.max(4);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn class_key(&self, class: u32) -> Option<ClassKey> {
        self.classes
            .contains(&class)
            .then(|| deterministic_class_key(class))
    }

    /// The keys a successful unlock is expected to release
    pub fn class_keys(&self) -> UnlockedKeyBag {
        self.classes
            .iter()
            .map(|class| (*class, deterministic_class_key(*class)))
            .collect()
    }

    fn kdf_params(&self) -> KdfParams {
        KdfParams {
            salt: SALT.to_vec(),
            iterations: ITERATIONS,
            pre_stretch: self
                .pre_stretch
                .then(|| (DP_SALT.to_vec(), DP_ITERATIONS)),
        }
    }

    /// Serialize the bag, wrapping class keys under `passphrase` when encrypted
    pub fn encode(&self, passphrase: &str) -> Vec<u8> {
        let mut out = Vec::new();
        encode_field(b"VERS", &self.version.to_be_bytes(), &mut out);
        encode_field(b"TYPE", &BAG_TYPE_BACKUP.to_be_bytes(), &mut out);
        encode_field(b"UUID", &[0x11; 16], &mut out);
        encode_field(b"HMCK", &[0u8; 40], &mut out);
        encode_field(b"WRAP", &0u32.to_be_bytes(), &mut out);
        encode_field(b"SALT", &SALT, &mut out);
        encode_field(b"ITER", &ITERATIONS.to_be_bytes(), &mut out);
        if self.pre_stretch {
            encode_field(b"DPWT", &1u32.to_be_bytes(), &mut out);
            encode_field(b"DPIC", &DP_ITERATIONS.to_be_bytes(), &mut out);
            encode_field(b"DPSL", &DP_SALT, &mut out);
        }

        let kek = self
            .encrypted
            .then(|| KekAes256::from(derive_unlock_key(passphrase.as_bytes(), &self.kdf_params())));

        for class in &self.classes {
            let key = deterministic_class_key(*class);
            let (wrap, key_bytes) = match &kek {
                Some(kek) => (
                    WRAP_PASSPHRASE,
                    kek.wrap_vec(key.bytes())
                        .expect("32-byte keys always wrap"),
                ),
                None => (0, key.bytes().to_vec()),
            };
            encode_field(b"UUID", &[*class as u8; 16], &mut out);
            encode_field(b"CLAS", &class.to_be_bytes(), &mut out);
            encode_field(b"WRAP", &wrap.to_be_bytes(), &mut out);
            encode_field(b"KTYP", &0u32.to_be_bytes(), &mut out);
            encode_field(b"WPKY", &key_bytes, &mut out);
        }
        out
    }
}

pub(crate) fn deterministic_class_key(class: u32) -> ClassKey {
    let digest = Sha256::digest(format!("class-key-{}", class).as_bytes());
    let mut key = [0u8; CLASS_KEY_SIZE];
    key.copy_from_slice(&digest);
    ClassKey::from(key)
}
