/// Builders for synthetic backups used in unit and integration tests
///
/// Everything here produces the same bytes a device would write: key bags
/// with passphrase-wrapped class keys, manifest record streams and AES-CBC
/// encrypted blobs. Keys are derived deterministically from class numbers
/// and file paths, so tests can predict what decryption should release.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::SyntheticBackup;
///
/// #[tokio::test]
/// async fn test_encrypted_backup() -> anyhow::Result<()> {
///     let dir = tempfile::tempdir()?;
///
///     SyntheticBackup::encrypted("Test Phone", "hunter2")
///         .directory("AppDomain-com.example.app", "")
///         .file("AppDomain-com.example.app", "Documents/a.txt", b"hello")
///         .write(dir.path())?;
///
///     // dir now holds Info.plist, Manifest.plist, Manifest.mbdb and blobs
///     Ok(())
/// }
/// ```
mod backup;
mod keybag;
mod manifest;

pub use backup::{SyntheticBackup, DEFAULT_CLASS};
pub use keybag::KeyBagBuilder;
pub use manifest::ManifestWriter;
