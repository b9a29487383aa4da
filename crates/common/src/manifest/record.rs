use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::backup::storage_id;

/// Mask selecting the file type bits of a mode
pub const MODE_TYPE_MASK: u16 = 0xF000;
pub const MODE_DIRECTORY: u16 = 0x4000;
pub const MODE_REGULAR: u16 = 0x8000;
pub const MODE_SYMLINK: u16 = 0xA000;

/// Extended attribute carrying `class (u32 LE) || wrapped file key`
pub const ENCRYPTION_KEY_ATTRIBUTE: &str = "EncryptionKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & MODE_TYPE_MASK {
            MODE_REGULAR => Some(FileType::Regular),
            MODE_DIRECTORY => Some(FileType::Directory),
            MODE_SYMLINK => Some(FileType::Symlink),
            _ => None,
        }
    }

    pub fn mode_bits(&self) -> u16 {
        match self {
            FileType::Regular => MODE_REGULAR,
            FileType::Directory => MODE_DIRECTORY,
            FileType::Symlink => MODE_SYMLINK,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Regular => "file",
            FileType::Directory => "dir",
            FileType::Symlink => "link",
        };
        f.write_str(s)
    }
}

/// One backed-up file, directory or symlink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRecord {
    /// Namespace the file belongs to, e.g. `AppDomain-com.example.app`
    pub domain: String,
    /// Path within the domain, without a leading slash
    pub relative_path: String,
    /// Symlink target; empty unless `file_type` is `Symlink`
    pub link_target: String,
    /// Content-addressed name of the backup blob
    pub storage_id: String,
    pub protection_class: u32,
    #[serde(skip)]
    pub wrapped_file_key: Option<Vec<u8>>,
    pub file_type: FileType,
    pub file_size: u64,
    #[serde(skip)]
    pub data_hash: Vec<u8>,
    pub mode: u16,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub atime: u32,
    pub ctime: u32,
    #[serde(skip)]
    pub attributes: BTreeMap<String, Vec<u8>>,
}

impl ManifestRecord {
    /// Build a record with computed storage id and default metadata
    pub fn new(domain: &str, relative_path: &str, file_type: FileType) -> Self {
        Self {
            domain: domain.to_string(),
            relative_path: relative_path.to_string(),
            link_target: String::new(),
            storage_id: storage_id(domain, relative_path),
            protection_class: 0,
            wrapped_file_key: None,
            file_type,
            file_size: 0,
            data_hash: Vec::new(),
            mode: file_type.mode_bits() | 0o644,
            inode: 0,
            uid: 501,
            gid: 501,
            mtime: 0,
            atime: 0,
            ctime: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// The `(domain, relative_path)` identity of the record
    pub fn key(&self) -> (&str, &str) {
        (&self.domain, &self.relative_path)
    }

    pub fn is_encrypted(&self) -> bool {
        self.wrapped_file_key.is_some()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

impl fmt::Display for ManifestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative_path.is_empty() {
            write!(f, "{}", self.domain)
        } else {
            write!(f, "{}/{}", self.domain, self.relative_path)
        }
    }
}
