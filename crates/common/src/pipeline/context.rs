use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::materialize::DEFAULT_CONCURRENCY;

/// Subdirectory holding the reconstructed backup tree
pub const ORIGINAL_DIR: &str = "Original";
/// Subdirectory holding extracted artifacts
pub const INTERESTING_DIR: &str = "Interesting";

/// Progress notifications emitted during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    KeyBagUnlocked { classes: usize },
    ManifestParsed { records: usize },
    RecordMaterialized { completed: usize, total: usize },
    ModuleStarted { name: String, index: usize, total: usize },
    ModuleFinished { name: String, ok: bool },
    SecretsWritten { files: Vec<PathBuf> },
}

/// Non-blocking sink for [`ProgressEvent`]s.
///
/// Sending never fails; events for a dropped receiver are discarded.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<flume::Sender<ProgressEvent>>,
}

impl ProgressSender {
    pub fn channel() -> (Self, flume::Receiver<ProgressEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Cooperative cancellation flag, checked between run stages
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Fires the [`Cancellation`] it was created with
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A flag that is never raised
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Output directories of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeLayout {
    /// `<output>/<device>`
    pub device_root: PathBuf,
    /// Reconstructed backup contents, one directory per domain
    pub original: PathBuf,
    /// Extracted artifacts
    pub interesting: PathBuf,
}

impl TreeLayout {
    pub fn new(output_root: &Path, device_dir: &str) -> Self {
        let device_root = output_root.join(device_dir);
        Self {
            original: device_root.join(ORIGINAL_DIR),
            interesting: device_root.join(INTERESTING_DIR),
            device_root,
        }
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.original)?;
        std::fs::create_dir_all(&self.interesting)
    }

    /// Directory of one domain inside the reconstructed tree
    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.original.join(domain)
    }
}

/// Tunables for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub backup_root: PathBuf,
    pub output_root: PathBuf,
    pub materialize_concurrency: usize,
}

impl RunOptions {
    pub fn new(backup_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            output_root: output_root.into(),
            materialize_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.materialize_concurrency = concurrency.max(1);
        self
    }
}

/// Everything scoped to a single run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub options: RunOptions,
    pub progress: ProgressSender,
    pub cancel: Cancellation,
}

impl RunContext {
    pub fn new(options: RunOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            options,
            progress: ProgressSender::disabled(),
            cancel: Cancellation::never(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let layout = TreeLayout::new(Path::new("/out"), "Phone");
        assert_eq!(layout.original, Path::new("/out/Phone/Original"));
        assert_eq!(layout.interesting, Path::new("/out/Phone/Interesting"));
        assert_eq!(
            layout.domain_dir("HomeDomain"),
            Path::new("/out/Phone/Original/HomeDomain")
        );
    }

    #[test]
    fn test_progress_ignores_dropped_receiver() {
        let (progress, rx) = ProgressSender::channel();
        drop(rx);
        progress.emit(ProgressEvent::ManifestParsed { records: 1 });
        ProgressSender::disabled().emit(ProgressEvent::ManifestParsed { records: 1 });
    }

    #[test]
    fn test_cancellation() {
        let (handle, cancel) = Cancellation::new();
        let observer = cancel.clone();
        assert!(!cancel.is_cancelled());
        handle.cancel();
        assert!(cancel.is_cancelled());
        assert!(observer.is_cancelled());
        assert!(!Cancellation::never().is_cancelled());
    }

    #[test]
    fn test_progress_event_json() {
        let event = ProgressEvent::RecordMaterialized {
            completed: 2,
            total: 5,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "record_materialized", "completed": 2, "total": 5})
        );
    }
}
