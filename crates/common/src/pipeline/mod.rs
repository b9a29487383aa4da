//! End-to-end processing of one backup
//!
//! A run goes through fixed stages:
//!
//! 1. read `Info.plist`/`Manifest.plist`, unlock the key bag of an encrypted
//!    backup
//! 2. parse the manifest stream
//! 3. materialize every record under `<output>/<device>/Original`
//! 4. run the analysis modules over the tree
//! 5. write the aggregated secrets to `<output>/<device>/Interesting`
//!
//! Stages 1 and 2 touch nothing on disk, so a wrong passphrase or a corrupt
//! manifest leaves the output directory untouched. Cancellation is checked
//! between stages.

mod context;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::analysis::{self, aggregate, AggregateError, ModuleRegistry};
use crate::backup::{BackupDir, BackupError, BackupInfo, INFO_PLIST};
use crate::crypto::{KeyBag, KeyError, UnlockedKeyBag};
use crate::manifest::{self, ParseError};
use crate::materialize::materialize_all;

pub use context::{
    CancelHandle, Cancellation, ProgressEvent, ProgressSender, RunContext, RunOptions, TreeLayout,
    INTERESTING_DIR, ORIGINAL_DIR,
};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to obtain passphrase: {0:#}")]
    Passphrase(anyhow::Error),
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Output(#[from] AggregateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplies the passphrase of an encrypted backup.
///
/// Only consulted when `Manifest.plist` marks the backup encrypted and its
/// key bag holds passphrase-wrapped keys.
pub trait PassphraseProvider: Send + Sync {
    fn passphrase(&self, device: &BackupInfo) -> anyhow::Result<String>;
}

impl<F> PassphraseProvider for F
where
    F: Fn(&BackupInfo) -> anyhow::Result<String> + Send + Sync,
{
    fn passphrase(&self, device: &BackupInfo) -> anyhow::Result<String> {
        self(device)
    }
}

/// A passphrase known up front
#[derive(Clone)]
pub struct StaticPassphrase(pub String);

impl std::fmt::Debug for StaticPassphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticPassphrase(..)")
    }
}

impl PassphraseProvider for StaticPassphrase {
    fn passphrase(&self, _device: &BackupInfo) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// A record that could not be materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeWarning {
    pub domain: String,
    pub relative_path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    pub ok: bool,
    pub error: Option<String>,
    pub tokens: usize,
    pub passwords: usize,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub device: BackupInfo,
    pub encrypted: bool,
    pub layout: TreeLayout,
    pub records: usize,
    pub materialized: usize,
    pub warnings: Vec<MaterializeWarning>,
    pub modules: Vec<ModuleSummary>,
    pub secrets_files: Vec<PathBuf>,
    pub tokens: usize,
    pub passwords: usize,
}

impl RunReport {
    pub fn failed_modules(&self) -> impl Iterator<Item = &ModuleSummary> {
        self.modules.iter().filter(|m| !m.ok)
    }
}

fn join_error(e: tokio::task::JoinError) -> RunError {
    RunError::Io(std::io::Error::other(e))
}

fn check_cancelled(ctx: &RunContext) -> Result<(), RunError> {
    if ctx.cancel.is_cancelled() {
        tracing::info!("run cancelled");
        return Err(RunError::Cancelled);
    }
    Ok(())
}

/// Unlock the backup's key bag, asking for the passphrase only if needed
async fn unlock_keybag(
    keybag: Option<Vec<u8>>,
    device: &BackupInfo,
    passphrase: &dyn PassphraseProvider,
) -> Result<Option<UnlockedKeyBag>, RunError> {
    let Some(blob) = keybag else {
        return Ok(None);
    };
    let bag = KeyBag::parse(&blob)?;
    tracing::debug!(
        version = bag.version(),
        uuid = ?bag.uuid_hex(),
        encrypted = bag.is_encrypted(),
        "parsed key bag"
    );
    let secret = if bag.is_encrypted() {
        passphrase.passphrase(device).map_err(RunError::Passphrase)?
    } else {
        String::new()
    };
    let unlocked = tokio::task::spawn_blocking(move || bag.unlock(secret.as_bytes()))
        .await
        .map_err(join_error)??;
    Ok(Some(unlocked))
}

/// Process one backup end to end
pub async fn run(
    ctx: &RunContext,
    passphrase: &dyn PassphraseProvider,
    registry: &ModuleRegistry,
) -> Result<RunReport, RunError> {
    let span = tracing::info_span!("run", run_id = %ctx.run_id);
    run_inner(ctx, passphrase, registry).instrument(span).await
}

async fn run_inner(
    ctx: &RunContext,
    passphrase: &dyn PassphraseProvider,
    registry: &ModuleRegistry,
) -> Result<RunReport, RunError> {
    let options = &ctx.options;
    let backup = BackupDir::open(&options.backup_root)?;
    let device = backup.read_info()?;
    let manifest_plist = backup.read_manifest_plist()?;
    let stream = backup.read_manifest_stream()?;
    tracing::info!(
        device = %device.device_name,
        encrypted = manifest_plist.is_encrypted,
        "opened backup"
    );

    let keybag_blob = if manifest_plist.is_encrypted {
        manifest_plist.keybag
    } else {
        if manifest_plist.keybag.is_some() {
            tracing::debug!("ignoring key bag of unencrypted backup");
        }
        None
    };
    let keybag = unlock_keybag(keybag_blob, &device, passphrase).await?;
    if let Some(keybag) = &keybag {
        ctx.progress.emit(ProgressEvent::KeyBagUnlocked {
            classes: keybag.len(),
        });
    }

    let records = manifest::parse(&stream)?;
    drop(stream);
    ctx.progress.emit(ProgressEvent::ManifestParsed {
        records: records.len(),
    });
    check_cancelled(ctx)?;

    let layout = TreeLayout::new(&options.output_root, &device.directory_name());
    layout.create()?;
    std::fs::copy(backup.info_path(), layout.device_root.join(INFO_PLIST))?;

    let outcomes = materialize_all(
        &records,
        keybag.map(Arc::new),
        backup.root(),
        &layout.original,
        options.materialize_concurrency,
        &ctx.progress,
        &ctx.cancel,
    )
    .await;
    check_cancelled(ctx)?;

    let materialized = outcomes.iter().filter(|o| o.result.is_ok()).count();
    let warnings: Vec<MaterializeWarning> = outcomes
        .into_iter()
        .filter_map(|o| match o.result {
            Ok(_) => None,
            Err(e) => Some(MaterializeWarning {
                domain: o.domain,
                relative_path: o.relative_path,
                error: e.to_string(),
            }),
        })
        .collect();
    tracing::info!(
        records = records.len(),
        materialized,
        warnings = warnings.len(),
        "materialized backup"
    );

    let modules = registry.load(&layout);
    let module_layout = layout.clone();
    let module_progress = ctx.progress.clone();
    let module_span = tracing::Span::current();
    let module_outcomes = tokio::task::spawn_blocking(move || {
        let _entered = module_span.enter();
        analysis::run(modules, &module_layout, &module_progress)
    })
    .await
    .map_err(join_error)?;
    check_cancelled(ctx)?;

    let mut summaries = Vec::with_capacity(module_outcomes.len());
    let mut results = Vec::new();
    for outcome in module_outcomes {
        match outcome.result {
            Ok(result) => {
                summaries.push(ModuleSummary {
                    name: outcome.name,
                    ok: true,
                    error: None,
                    tokens: result.token_count(),
                    passwords: result.passwords.len(),
                });
                results.push(result);
            }
            Err(e) => summaries.push(ModuleSummary {
                name: outcome.name,
                ok: false,
                error: Some(e.to_string()),
                tokens: 0,
                passwords: 0,
            }),
        }
    }

    let secrets = aggregate(results);
    let secrets_files = secrets.write(&layout.interesting)?;
    if !secrets_files.is_empty() {
        ctx.progress.emit(ProgressEvent::SecretsWritten {
            files: secrets_files.clone(),
        });
    }

    let report = RunReport {
        run_id: ctx.run_id,
        device,
        encrypted: manifest_plist.is_encrypted,
        layout,
        records: records.len(),
        materialized,
        warnings,
        modules: summaries,
        secrets_files,
        tokens: secrets.token_count(),
        passwords: secrets.passwords.len(),
    };
    tracing::info!(
        materialized = report.materialized,
        modules = report.modules.len(),
        failed_modules = report.failed_modules().count(),
        "run complete"
    );
    Ok(report)
}
