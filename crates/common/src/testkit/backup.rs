use std::path::Path;

use anyhow::{anyhow, Result};
use plist::{Dictionary, Value};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use super::keybag::{deterministic_class_key, KeyBagBuilder};
use super::manifest::ManifestWriter;
use crate::backup::{fanout_path, flat_path, INFO_PLIST, MANIFEST_PLIST, MANIFEST_STREAM};
use crate::crypto::{FileKey, UnlockedKeyBag, FILE_KEY_SIZE};
use crate::manifest::{FileType, ManifestRecord};

/// Protection class files get unless one is given
pub const DEFAULT_CLASS: u32 = 3;

#[derive(Debug, Clone)]
struct Entry {
    record: ManifestRecord,
    /// Blob bytes as stored in the backup; `None` leaves the blob out
    blob: Option<Vec<u8>>,
}

/// Builds a backup directory on disk for tests
///
/// ```rust,ignore
/// let backup = SyntheticBackup::encrypted("Test Phone", "hunter2")
///     .directory("AppDomain-com.example", "")
///     .file("AppDomain-com.example", "Documents/a.txt", b"hello");
/// backup.write(dir.path())?;
/// ```
#[derive(Debug, Clone)]
pub struct SyntheticBackup {
    device_name: String,
    keybag: Option<(KeyBagBuilder, String)>,
    flat: bool,
    entries: Vec<Entry>,
}

impl SyntheticBackup {
    /// An unencrypted backup
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            keybag: None,
            flat: false,
            entries: Vec::new(),
        }
    }

    /// An encrypted backup with classes 1 through 4 wrapped under `passphrase`
    pub fn encrypted(device_name: &str, passphrase: &str) -> Self {
        let bag = (1..=4).fold(KeyBagBuilder::encrypted(), |bag, class| bag.with_class(class));
        Self {
            keybag: Some((bag, passphrase.to_string())),
            ..Self::new(device_name)
        }
    }

    /// Store blobs flat in the backup root instead of fan-out directories
    pub fn flat_layout(mut self) -> Self {
        self.flat = true;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.keybag.is_some()
    }

    /// Class keys the backup's key bag releases for the right passphrase
    pub fn class_keys(&self) -> Option<UnlockedKeyBag> {
        self.keybag.as_ref().map(|(bag, _)| bag.class_keys())
    }

    pub fn directory(mut self, domain: &str, path: &str) -> Self {
        let mut record = ManifestRecord::new(domain, path, FileType::Directory);
        record.mode = 0o40755;
        self.entries.push(Entry { record, blob: None });
        self
    }

    pub fn file(self, domain: &str, path: &str, contents: &[u8]) -> Self {
        self.file_with_class(domain, path, contents, DEFAULT_CLASS)
    }

    /// Add a regular file; encrypted backups wrap its key under `class`
    pub fn file_with_class(mut self, domain: &str, path: &str, contents: &[u8], class: u32) -> Self {
        let mut record = ManifestRecord::new(domain, path, FileType::Regular);
        record.file_size = contents.len() as u64;
        record.data_hash = Sha1::digest(contents).to_vec();
        record.inode = self.entries.len() as u64 + 1;

        let blob = if self.is_encrypted() {
            let file_key = deterministic_file_key(domain, path);
            let wrapped = file_key
                .wrap(&deterministic_class_key(class))
                .expect("32-byte keys always wrap");
            record.protection_class = class;
            record.wrapped_file_key = Some(wrapped);
            file_key.encrypt(contents)
        } else {
            contents.to_vec()
        };
        self.entries.push(Entry {
            record,
            blob: Some(blob),
        });
        self
    }

    /// Add a regular file whose blob is absent from the backup
    pub fn missing_file(mut self, domain: &str, path: &str, size: u64) -> Self {
        let mut record = ManifestRecord::new(domain, path, FileType::Regular);
        record.file_size = size;
        if self.is_encrypted() {
            record.protection_class = DEFAULT_CLASS;
            record.wrapped_file_key = deterministic_file_key(domain, path)
                .wrap(&deterministic_class_key(DEFAULT_CLASS))
                .ok();
        }
        self.entries.push(Entry { record, blob: None });
        self
    }

    pub fn symlink(mut self, domain: &str, path: &str, target: &str) -> Self {
        let mut record = ManifestRecord::new(domain, path, FileType::Symlink);
        record.mode = 0o120755;
        record.link_target = target.to_string();
        self.entries.push(Entry { record, blob: None });
        self
    }

    /// Manifest records in the order they were added
    pub fn records(&self) -> Vec<ManifestRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    /// The encoded manifest record stream
    pub fn manifest_stream(&self) -> Vec<u8> {
        self.entries
            .iter()
            .fold(ManifestWriter::new(), |writer, entry| writer.record(&entry.record))
            .finish()
    }

    /// Write `Info.plist`, `Manifest.plist`, `Manifest.mbdb` and all blobs
    pub fn write(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;

        let mut info = Dictionary::new();
        info.insert(
            "Device Name".to_string(),
            Value::String(self.device_name.clone()),
        );
        info.insert(
            "Display Name".to_string(),
            Value::String(self.device_name.clone()),
        );
        info.insert(
            "Product Type".to_string(),
            Value::String("iPhone3,1".to_string()),
        );
        info.insert(
            "Product Version".to_string(),
            Value::String("5.1.1".to_string()),
        );
        Value::Dictionary(info)
            .to_file_xml(root.join(INFO_PLIST))
            .map_err(|e| anyhow!("failed to write {}: {}", INFO_PLIST, e))?;

        let mut manifest = Dictionary::new();
        manifest.insert("IsEncrypted".to_string(), Value::Boolean(self.is_encrypted()));
        manifest.insert("Version".to_string(), Value::String("9.1".to_string()));
        if let Some((bag, passphrase)) = &self.keybag {
            manifest.insert("BackupKeyBag".to_string(), Value::Data(bag.encode(passphrase)));
        }
        Value::Dictionary(manifest)
            .to_file_xml(root.join(MANIFEST_PLIST))
            .map_err(|e| anyhow!("failed to write {}: {}", MANIFEST_PLIST, e))?;

        std::fs::write(root.join(MANIFEST_STREAM), self.manifest_stream())?;

        for entry in &self.entries {
            let Some(blob) = &entry.blob else {
                continue;
            };
            let id = &entry.record.storage_id;
            let path = if self.flat {
                flat_path(root, id)
            } else {
                fanout_path(root, id)
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, blob)?;
        }
        Ok(())
    }
}

fn deterministic_file_key(domain: &str, path: &str) -> FileKey {
    let digest = Sha256::digest(format!("file-key-{}-{}", domain, path).as_bytes());
    let mut key = [0u8; FILE_KEY_SIZE];
    key.copy_from_slice(&digest);
    FileKey::from(key)
}
