//! Reconstructing the backed-up file tree
//!
//! Each manifest record is recreated at `output_root/domain/relative_path`.
//! Failures are per record: a missing blob or an unknown protection class
//! is reported and the rest of the backup is still materialized.

mod record;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};

use crate::crypto::{FileKeyError, UnlockedKeyBag};
use crate::manifest::{FileType, ManifestRecord};
use crate::pipeline::{Cancellation, ProgressEvent, ProgressSender};

pub use record::{materialize, output_path};

/// Default number of records materialized at once
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("blob {storage_id} is missing from the backup")]
    MissingBlob { storage_id: String },
    #[error("no class key for protection class {0}")]
    MissingClassKey(u32),
    #[error("failed to unwrap file key: {0}")]
    Unwrap(#[source] FileKeyError),
    #[error("failed to decrypt file: {0}")]
    Decrypt(String),
    #[error("refusing to write outside the output directory: {0}")]
    UnsafePath(String),
    #[error("record has a wrapped file key but no key bag was unlocked")]
    NoKeyBag,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Directory created (or already present)
    Created,
    Decrypted,
    /// Unencrypted blob copied verbatim
    Copied,
    Linked,
}

/// A record recreated on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconstructedFile {
    pub path: PathBuf,
    pub size: u64,
    pub kind: FileType,
    pub status: FileStatus,
}

/// Result of materializing one record
#[derive(Debug)]
pub struct MaterializeOutcome {
    pub domain: String,
    pub relative_path: String,
    pub result: Result<ReconstructedFile, MaterializeError>,
}

impl MaterializeOutcome {
    fn new(record: &ManifestRecord, result: Result<ReconstructedFile, MaterializeError>) -> Self {
        Self {
            domain: record.domain.clone(),
            relative_path: record.relative_path.clone(),
            result,
        }
    }
}

fn join_failure(e: JoinError) -> MaterializeError {
    if e.is_cancelled() {
        MaterializeError::Worker("task cancelled".to_string())
    } else {
        MaterializeError::Worker(e.to_string())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

/// Materialize `records` on up to `concurrency` blocking workers.
///
/// Directories and files go first. Symlinks are recreated one at a time once
/// every other record is done, so no worker writes through a link made by
/// another. Outcomes come back in manifest order. When `cancel` fires no
/// further records are started; outcomes cover only the records that ran.
pub async fn materialize_all(
    records: &[ManifestRecord],
    keybag: Option<Arc<UnlockedKeyBag>>,
    backup_root: &Path,
    output_root: &Path,
    concurrency: usize,
    progress: &ProgressSender,
    cancel: &Cancellation,
) -> Vec<MaterializeOutcome> {
    let total = records.len();
    let mut results: Vec<Option<Result<ReconstructedFile, MaterializeError>>> =
        (0..total).map(|_| None).collect();
    let (links, others): (Vec<usize>, Vec<usize>) =
        (0..total).partition(|&i| records[i].file_type == FileType::Symlink);
    let mut tasks = JoinSet::new();
    let mut started = 0;
    let mut completed = 0;
    let span = tracing::Span::current();

    for (batch, limit) in [(others, concurrency.max(1)), (links, 1)] {
        let mut pending = batch.into_iter();
        loop {
            while tasks.len() < limit && !cancel.is_cancelled() {
                let Some(index) = pending.next() else {
                    break;
                };
                let record = records[index].clone();
                let keybag = keybag.clone();
                let backup_root = backup_root.to_path_buf();
                let output_root = output_root.to_path_buf();
                let span = span.clone();
                tasks.spawn_blocking(move || {
                    let _entered = span.enter();
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        materialize(&record, keybag.as_deref(), &backup_root, &output_root)
                    }))
                    .unwrap_or_else(|payload| Err(MaterializeError::Worker(panic_message(payload))));
                    (index, result)
                });
                started += 1;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((index, result)) => {
                    if let Err(e) = &result {
                        tracing::warn!(record = %records[index], error = %e, "failed to materialize record");
                    }
                    results[index] = Some(result);
                }
                Err(e) => {
                    // only reachable if the runtime shuts down under us
                    tracing::error!("materialize task failed: {e}");
                    if let Some(slot) = results.iter_mut().find(|slot| slot.is_none()) {
                        *slot = Some(Err(join_failure(e)));
                    }
                }
            }
            completed += 1;
            progress.emit(ProgressEvent::RecordMaterialized { completed, total });
        }
    }

    if started < total {
        tracing::info!(started, total, "materialization cancelled");
    }

    records
        .iter()
        .zip(results)
        .filter_map(|(record, result)| result.map(|result| MaterializeOutcome::new(record, result)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::SyntheticBackup;

    const DOMAIN: &str = "HomeDomain";

    fn backup() -> SyntheticBackup {
        (0..20).fold(
            SyntheticBackup::encrypted("Phone", "pw").directory(DOMAIN, "Library"),
            |backup, i| backup.file(DOMAIN, &format!("Library/f{:02}.txt", i), format!("file {}", i).as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_outcomes_in_manifest_order() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = backup().missing_file(DOMAIN, "Library/gone", 4);
        backup.write(backup_dir.path()).unwrap();
        let records = backup.records();
        let keys = Arc::new(backup.class_keys().unwrap());
        let (progress, events) = ProgressSender::channel();

        let outcomes = materialize_all(
            &records,
            Some(keys),
            backup_dir.path(),
            out.path(),
            3,
            &progress,
            &Cancellation::never(),
        )
        .await;

        assert_eq!(outcomes.len(), records.len());
        for (outcome, record) in outcomes.iter().zip(&records) {
            assert_eq!(outcome.relative_path, record.relative_path);
        }
        assert_eq!(outcomes.iter().filter(|o| o.result.is_err()).count(), 1);
        assert!(matches!(
            outcomes.last().unwrap().result,
            Err(MaterializeError::MissingBlob { .. })
        ));
        assert_eq!(
            std::fs::read_to_string(out.path().join(DOMAIN).join("Library/f07.txt")).unwrap(),
            "file 7"
        );
        assert_eq!(events.drain().count(), records.len());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_recreated_after_files() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let backup = SyntheticBackup::new("Phone")
            .symlink(DOMAIN, "Library", &elsewhere.path().to_string_lossy())
            .file(DOMAIN, "Library/escaped.txt", b"outside")
            .symlink(DOMAIN, "latest", "Library/escaped.txt");
        backup.write(backup_dir.path()).unwrap();
        let records = backup.records();

        let outcomes = materialize_all(
            &records,
            None,
            backup_dir.path(),
            out.path(),
            1,
            &ProgressSender::disabled(),
            &Cancellation::never(),
        )
        .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].relative_path, "Library");
        // the file made Library a real directory, so the link cannot replace it
        assert!(outcomes[0].result.is_err());
        assert_eq!(outcomes[1].result.as_ref().unwrap().status, FileStatus::Copied);
        assert_eq!(outcomes[2].result.as_ref().unwrap().status, FileStatus::Linked);

        let library = out.path().join(DOMAIN).join("Library");
        assert!(std::fs::symlink_metadata(&library).unwrap().is_dir());
        assert_eq!(std::fs::read(library.join("escaped.txt")).unwrap(), b"outside");
        assert_eq!(std::fs::read_dir(elsewhere.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backup_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let backup = backup();
        backup.write(backup_dir.path()).unwrap();
        let (handle, cancel) = Cancellation::new();
        handle.cancel();

        let outcomes = materialize_all(
            &backup.records(),
            backup.class_keys().map(Arc::new),
            backup_dir.path(),
            out.path(),
            4,
            &ProgressSender::disabled(),
            &cancel,
        )
        .await;
        assert!(outcomes.is_empty());
    }
}
