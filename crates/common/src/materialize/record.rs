use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tempfile::NamedTempFile;

use super::{FileStatus, MaterializeError, ReconstructedFile};
use crate::backup::locate_blob;
use crate::crypto::{FileKey, FileKeyError, UnlockedKeyBag};
use crate::manifest::{FileType, ManifestRecord};

/// Where `record` lands under `output_root`: `output_root/domain/relative_path`
pub fn output_path(output_root: &Path, record: &ManifestRecord) -> Result<PathBuf, MaterializeError> {
    let unsafe_path = || MaterializeError::UnsafePath(record.to_string());

    let mut domain = Path::new(&record.domain).components();
    match (domain.next(), domain.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(unsafe_path()),
    }

    let mut path = output_root.join(&record.domain);
    for component in Path::new(&record.relative_path).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path())
            }
        }
    }
    Ok(path)
}

/// Fails with `UnsafePath` when an existing entry between `output_root` and
/// `path` (inclusive) is a symlink, so writes cannot be redirected through a
/// link recreated from the manifest.
fn ensure_no_symlinks(
    output_root: &Path,
    path: &Path,
    record: &ManifestRecord,
) -> Result<(), MaterializeError> {
    let relative = path
        .strip_prefix(output_root)
        .map_err(|_| MaterializeError::UnsafePath(record.to_string()))?;
    let mut current = output_root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(MaterializeError::UnsafePath(record.to_string()))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Recreate one manifest record under `output_root`.
///
/// Regular files are decrypted with their file key when the record carries
/// one and copied verbatim otherwise. Nothing is written for a record whose
/// blob or key is unavailable.
pub fn materialize(
    record: &ManifestRecord,
    keybag: Option<&UnlockedKeyBag>,
    backup_root: &Path,
    output_root: &Path,
) -> Result<ReconstructedFile, MaterializeError> {
    let target = output_path(output_root, record)?;
    match record.file_type {
        FileType::Directory => {
            ensure_no_symlinks(output_root, &target, record)?;
            fs::create_dir_all(&target)?;
            Ok(ReconstructedFile {
                path: target,
                size: 0,
                kind: FileType::Directory,
                status: FileStatus::Created,
            })
        }
        FileType::Regular => materialize_file(record, keybag, backup_root, output_root, target),
        FileType::Symlink => materialize_symlink(record, output_root, target),
    }
}

fn file_key(
    record: &ManifestRecord,
    keybag: Option<&UnlockedKeyBag>,
) -> Result<Option<FileKey>, MaterializeError> {
    let Some(wrapped) = record.wrapped_file_key.as_deref() else {
        return Ok(None);
    };
    let keybag = keybag.ok_or(MaterializeError::NoKeyBag)?;
    let class_key = keybag
        .class_key(record.protection_class)
        .ok_or(MaterializeError::MissingClassKey(record.protection_class))?;
    FileKey::unwrap(class_key, wrapped)
        .map(Some)
        .map_err(MaterializeError::Unwrap)
}

fn materialize_file(
    record: &ManifestRecord,
    keybag: Option<&UnlockedKeyBag>,
    backup_root: &Path,
    output_root: &Path,
    target: PathBuf,
) -> Result<ReconstructedFile, MaterializeError> {
    let blob = locate_blob(backup_root, &record.storage_id).ok_or_else(|| {
        MaterializeError::MissingBlob {
            storage_id: record.storage_id.clone(),
        }
    })?;
    let key = file_key(record, keybag)?;

    let parent = target
        .parent()
        .ok_or_else(|| MaterializeError::UnsafePath(record.to_string()))?;
    ensure_no_symlinks(output_root, parent, record)?;
    fs::create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    let reader = BufReader::new(File::open(&blob)?);
    let (size, status) = {
        let mut writer = BufWriter::new(&mut staged);
        match &key {
            Some(key) => {
                let written = key
                    .decrypt_stream(reader, &mut writer, record.file_size)
                    .map_err(|e| match e {
                        FileKeyError::Io(e) => MaterializeError::Io(e),
                        other => MaterializeError::Decrypt(other.to_string()),
                    })?;
                (written, FileStatus::Decrypted)
            }
            None => {
                let mut reader = reader;
                let copied = io::copy(&mut reader, &mut writer)?;
                writer.flush()?;
                if copied != record.file_size {
                    tracing::debug!(
                        record = %record,
                        expected = record.file_size,
                        copied,
                        "plain blob size differs from manifest"
                    );
                }
                (copied, FileStatus::Copied)
            }
        }
    };

    if record.mtime > 0 {
        let mtime = UNIX_EPOCH + Duration::from_secs(u64::from(record.mtime));
        if let Err(e) = staged.as_file().set_modified(mtime) {
            tracing::trace!(record = %record, error = %e, "could not set modification time");
        }
    }
    staged.persist(&target).map_err(|e| MaterializeError::Io(e.error))?;

    Ok(ReconstructedFile {
        path: target,
        size,
        kind: FileType::Regular,
        status,
    })
}

#[cfg(unix)]
fn materialize_symlink(
    record: &ManifestRecord,
    output_root: &Path,
    target: PathBuf,
) -> Result<ReconstructedFile, MaterializeError> {
    if let Some(parent) = target.parent() {
        ensure_no_symlinks(output_root, parent, record)?;
        fs::create_dir_all(parent)?;
    }
    if let Ok(existing) = fs::symlink_metadata(&target) {
        if existing.is_dir() {
            fs::remove_dir(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
    }
    std::os::unix::fs::symlink(&record.link_target, &target)?;
    Ok(ReconstructedFile {
        path: target,
        size: record.link_target.len() as u64,
        kind: FileType::Symlink,
        status: FileStatus::Linked,
    })
}

#[cfg(not(unix))]
fn materialize_symlink(
    record: &ManifestRecord,
    _output_root: &Path,
    _target: PathBuf,
) -> Result<ReconstructedFile, MaterializeError> {
    Err(MaterializeError::Unsupported(format!(
        "cannot recreate symlink {} on this platform",
        record
    )))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::SyntheticBackup;

    const DOMAIN: &str = "AppDomain-com.example.notes";

    fn record(backup: &SyntheticBackup, path: &str) -> ManifestRecord {
        backup
            .records()
            .into_iter()
            .find(|r| r.relative_path == path)
            .unwrap()
    }

    #[test]
    fn test_output_path() {
        let record = ManifestRecord::new(DOMAIN, "Documents/a.txt", FileType::Regular);
        assert_eq!(
            output_path(Path::new("/out"), &record).unwrap(),
            Path::new("/out").join(DOMAIN).join("Documents").join("a.txt")
        );

        let root = ManifestRecord::new(DOMAIN, "", FileType::Directory);
        assert_eq!(
            output_path(Path::new("/out"), &root).unwrap(),
            Path::new("/out").join(DOMAIN)
        );
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        for (domain, path) in [
            (DOMAIN, "../../etc/passwd"),
            (DOMAIN, "/etc/passwd"),
            ("..", "x"),
            ("a/b", "x"),
            ("", "x"),
        ] {
            let record = ManifestRecord::new(domain, path, FileType::Regular);
            assert!(
                matches!(
                    output_path(Path::new("/out"), &record),
                    Err(MaterializeError::UnsafePath(_))
                ),
                "{}/{} should be rejected",
                domain,
                path
            );
        }
    }

    #[test]
    fn test_decrypt_file() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let contents = b"the quick brown fox jumps over the lazy dog";
        let backup = SyntheticBackup::encrypted("Phone", "pw").file(DOMAIN, "Documents/fox.txt", contents);
        backup.write(backup_dir.path()).unwrap();
        let keys = backup.class_keys().unwrap();

        let file = materialize(
            &record(&backup, "Documents/fox.txt"),
            Some(&keys),
            backup_dir.path(),
            out.path(),
        )
        .unwrap();
        assert_eq!(file.status, FileStatus::Decrypted);
        assert_eq!(file.size, contents.len() as u64);
        assert_eq!(std::fs::read(&file.path).unwrap(), contents);
    }

    #[test]
    fn test_copy_unencrypted_file() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::new("Phone")
            .flat_layout()
            .file(DOMAIN, "a.bin", &[7u8; 100]);
        backup.write(backup_dir.path()).unwrap();

        let file = materialize(&record(&backup, "a.bin"), None, backup_dir.path(), out.path()).unwrap();
        assert_eq!(file.status, FileStatus::Copied);
        assert_eq!(std::fs::read(&file.path).unwrap(), vec![7u8; 100]);
    }

    #[test]
    fn test_missing_blob_has_no_side_effects() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::encrypted("Phone", "pw").missing_file(DOMAIN, "Documents/gone.db", 10);
        backup.write(backup_dir.path()).unwrap();
        let keys = backup.class_keys().unwrap();

        let result = materialize(
            &record(&backup, "Documents/gone.db"),
            Some(&keys),
            backup_dir.path(),
            out.path(),
        );
        assert!(matches!(result, Err(MaterializeError::MissingBlob { .. })));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_class_key() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::encrypted("Phone", "pw").file_with_class(DOMAIN, "k", b"data", 11);
        backup.write(backup_dir.path()).unwrap();
        let keys = backup.class_keys().unwrap();

        let result = materialize(&record(&backup, "k"), Some(&keys), backup_dir.path(), out.path());
        assert!(matches!(result, Err(MaterializeError::MissingClassKey(11))));
    }

    #[test]
    fn test_wrapped_key_without_keybag() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::encrypted("Phone", "pw").file(DOMAIN, "k", b"data");
        backup.write(backup_dir.path()).unwrap();

        let result = materialize(&record(&backup, "k"), None, backup_dir.path(), out.path());
        assert!(matches!(result, Err(MaterializeError::NoKeyBag)));
    }

    #[test]
    fn test_directory_is_idempotent() {
        let out = tempfile::tempdir().unwrap();
        let record = ManifestRecord::new(DOMAIN, "Library/Caches", FileType::Directory);
        let first = materialize(&record, None, Path::new("/nonexistent"), out.path()).unwrap();
        let second = materialize(&record, None, Path::new("/nonexistent"), out.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.path.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_replaces_existing() {
        let out = tempfile::tempdir().unwrap();
        let mut record = ManifestRecord::new(DOMAIN, "Library/current", FileType::Symlink);
        record.link_target = "v2".to_string();

        let target = output_path(out.path(), &record).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"stale").unwrap();

        let file = materialize(&record, None, Path::new("/nonexistent"), out.path()).unwrap();
        assert_eq!(file.status, FileStatus::Linked);
        assert_eq!(std::fs::read_link(&target).unwrap(), Path::new("v2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_parent_is_rejected() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::new("Phone")
            .symlink(DOMAIN, "Library", &elsewhere.path().to_string_lossy())
            .file(DOMAIN, "Library/escaped.txt", b"outside")
            .directory(DOMAIN, "Library/Caches")
            .symlink(DOMAIN, "Library/link", "target");
        backup.write(backup_dir.path()).unwrap();

        let link = materialize(&record(&backup, "Library"), None, backup_dir.path(), out.path()).unwrap();
        assert_eq!(link.status, FileStatus::Linked);

        for path in ["Library/escaped.txt", "Library/Caches", "Library/link"] {
            let result = materialize(&record(&backup, path), None, backup_dir.path(), out.path());
            assert!(
                matches!(result, Err(MaterializeError::UnsafePath(_))),
                "{} should be rejected",
                path
            );
        }
        assert_eq!(std::fs::read_dir(elsewhere.path()).unwrap().count(), 0);
    }
}
