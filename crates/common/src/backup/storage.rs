use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Content-addressed blob name of a backed-up file:
/// lowercase hex SHA-1 of `domain-relative_path`
pub fn storage_id(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"-");
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Blob path in the fan-out layout, `<root>/<id[..2]>/<id>`
pub fn fanout_path(backup_root: &Path, storage_id: &str) -> PathBuf {
    let prefix = storage_id.get(..2).unwrap_or(storage_id);
    backup_root.join(prefix).join(storage_id)
}

/// Blob path in the flat layout, `<root>/<id>`
pub fn flat_path(backup_root: &Path, storage_id: &str) -> PathBuf {
    backup_root.join(storage_id)
}

/// Find the blob for `storage_id`, trying the fan-out layout first
pub fn locate_blob(backup_root: &Path, storage_id: &str) -> Option<PathBuf> {
    [
        fanout_path(backup_root, storage_id),
        flat_path(backup_root, storage_id),
    ]
    .into_iter()
    .find(|path| path.is_file())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_storage_id() {
        let id = storage_id("HomeDomain", "Library/Preferences/a.plist");
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, storage_id("HomeDomain", "Library/Preferences/b.plist"));
    }

    #[test]
    fn test_storage_id_known_value() {
        // sha1("a-b")
        assert_eq!(
            storage_id("a", "b"),
            "34fafddda8f42376094beb762e514a67b6f019e7"
        );
    }

    #[test]
    fn test_locate_prefers_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let id = storage_id("HomeDomain", "x");
        assert!(locate_blob(dir.path(), &id).is_none());

        std::fs::write(flat_path(dir.path(), &id), b"flat").unwrap();
        assert_eq!(locate_blob(dir.path(), &id), Some(flat_path(dir.path(), &id)));

        let fanout = fanout_path(dir.path(), &id);
        std::fs::create_dir_all(fanout.parent().unwrap()).unwrap();
        std::fs::write(&fanout, b"fanout").unwrap();
        assert_eq!(locate_blob(dir.path(), &id), Some(fanout));
    }
}
