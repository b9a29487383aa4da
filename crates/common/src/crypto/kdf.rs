//! Passphrase stretching for key bag unlocking
//!
//! The unlocking key is PBKDF2-HMAC-SHA1 over the passphrase with the bag's
//! `SALT`/`ITER`. Newer bags additionally declare `DPSL`/`DPIC`, in which case
//! the passphrase is first pre-stretched with PBKDF2-HMAC-SHA256.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;

/// Size of the derived unlocking key in bytes (AES-256 key wrap)
pub const UNLOCK_KEY_SIZE: usize = 32;

/// Parameters for deriving the unlocking key, as declared by a key bag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub salt: Vec<u8>,
    pub iterations: u32,
    /// Optional SHA-256 pre-stretch round as `(salt, iterations)`
    pub pre_stretch: Option<(Vec<u8>, u32)>,
}

/// Derive the key bag unlocking key from a passphrase
pub fn derive_unlock_key(passphrase: &[u8], params: &KdfParams) -> [u8; UNLOCK_KEY_SIZE] {
    let mut key = [0u8; UNLOCK_KEY_SIZE];
    match &params.pre_stretch {
        Some((dp_salt, dp_iterations)) => {
            let mut round1 = [0u8; UNLOCK_KEY_SIZE];
            pbkdf2_hmac::<Sha256>(passphrase, dp_salt, *dp_iterations, &mut round1);
            pbkdf2_hmac::<Sha1>(&round1, &params.salt, params.iterations, &mut key);
        }
        None => {
            pbkdf2_hmac::<Sha1>(passphrase, &params.salt, params.iterations, &mut key);
        }
    }
    key
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(pre_stretch: Option<(Vec<u8>, u32)>) -> KdfParams {
        KdfParams {
            salt: vec![0x42; 20],
            iterations: 10,
            pre_stretch,
        }
    }

    #[test]
    fn test_derive_deterministic() {
        let k1 = derive_unlock_key(b"hunter2", &params(None));
        let k2 = derive_unlock_key(b"hunter2", &params(None));
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_derive_different_passphrase() {
        let k1 = derive_unlock_key(b"hunter2", &params(None));
        let k2 = derive_unlock_key(b"hunter3", &params(None));
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_pre_stretch_changes_key() {
        let plain = derive_unlock_key(b"hunter2", &params(None));
        let stretched = derive_unlock_key(b"hunter2", &params(Some((vec![1; 20], 5))));
        assert_ne!(plain, stretched);
    }

    #[test]
    fn test_matches_rfc6070_vector() {
        // PBKDF2-HMAC-SHA1("password", "salt", 2), first 20 bytes
        let params = KdfParams {
            salt: b"salt".to_vec(),
            iterations: 2,
            pre_stretch: None,
        };
        let key = derive_unlock_key(b"password", &params);
        assert_eq!(
            hex::encode(&key[..20]),
            "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"
        );
    }
}
