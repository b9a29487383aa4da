//! Reading the files of a backup directory
//!
//! A backup directory holds three well-known files next to its content
//! blobs:
//!
//! - `Info.plist`: device metadata, in particular the `Device Name`
//! - `Manifest.plist`: `IsEncrypted` and the `BackupKeyBag` blob
//! - `Manifest.mbdb`: the [manifest](crate::manifest) record stream
//!
//! Blobs are named by [`storage_id`] and stored either in a two-character
//! fan-out directory or flat in the backup root.

mod info;
mod storage;

use std::path::{Path, PathBuf};

pub use info::{BackupInfo, BackupManifest};
pub use storage::{fanout_path, flat_path, locate_blob, storage_id};

pub const INFO_PLIST: &str = "Info.plist";
pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const MANIFEST_STREAM: &str = "Manifest.mbdb";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup directory {0} does not exist")]
    NotFound(PathBuf),
    #[error("{0} is missing from the backup")]
    MissingFile(PathBuf),
    #[error("failed to read property list {path}: {source}")]
    Plist {
        path: PathBuf,
        #[source]
        source: plist::Error,
    },
    #[error("{file}: {reason}")]
    Invalid { file: &'static str, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A backup directory on disk
#[derive(Debug, Clone)]
pub struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(BackupError::NotFound(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_PLIST)
    }

    fn require(&self, name: &str) -> Result<PathBuf, BackupError> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(BackupError::MissingFile(path));
        }
        Ok(path)
    }

    pub fn read_info(&self) -> Result<BackupInfo, BackupError> {
        let path = self.require(INFO_PLIST)?;
        let value = read_plist(&path)?;
        BackupInfo::from_plist(&value)
    }

    pub fn read_manifest_plist(&self) -> Result<BackupManifest, BackupError> {
        let path = self.require(MANIFEST_PLIST)?;
        let value = read_plist(&path)?;
        BackupManifest::from_plist(&value)
    }

    /// Raw bytes of the manifest record stream
    pub fn read_manifest_stream(&self) -> Result<Vec<u8>, BackupError> {
        let path = self.require(MANIFEST_STREAM)?;
        Ok(std::fs::read(path)?)
    }
}

fn read_plist(path: &Path) -> Result<plist::Value, BackupError> {
    plist::Value::from_file(path).map_err(|source| BackupError::Plist {
        path: path.to_path_buf(),
        source,
    })
}
