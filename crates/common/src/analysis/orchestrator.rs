use std::panic::{catch_unwind, AssertUnwindSafe};

use super::module::{AnalysisModule, ModuleResult};
use crate::pipeline::{ProgressEvent, ProgressSender, TreeLayout};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("module panicked: {0}")]
    Panicked(String),
    #[error("module returned malformed output: {0}")]
    Malformed(String),
}

/// What happened to one module
#[derive(Debug)]
pub struct ModuleOutcome {
    pub name: String,
    pub result: Result<ModuleResult, ModuleError>,
}

impl ModuleOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_one(module: Box<dyn AnalysisModule>, tree: &TreeLayout) -> Result<ModuleResult, ModuleError> {
    let result = catch_unwind(AssertUnwindSafe(|| module.analyze(tree)))
        .map_err(|payload| ModuleError::Panicked(panic_message(payload)))?
        .map_err(ModuleError::Failed)?;
    result.validate().map_err(ModuleError::Malformed)?;
    Ok(result)
}

/// Run `modules` one after another in the given order.
///
/// A module that fails or panics only affects its own outcome.
pub fn run(
    modules: Vec<Box<dyn AnalysisModule>>,
    tree: &TreeLayout,
    progress: &ProgressSender,
) -> Vec<ModuleOutcome> {
    let total = modules.len();
    let mut outcomes = Vec::with_capacity(total);

    for (index, module) in modules.into_iter().enumerate() {
        let name = module.name().to_string();
        let span = tracing::info_span!("module", name = %name);
        let _entered = span.enter();

        progress.emit(ProgressEvent::ModuleStarted {
            name: name.clone(),
            index,
            total,
        });
        tracing::info!(identifiers = ?module.app_identifiers(), "running module");

        let result = run_one(module, tree);
        match &result {
            Ok(found) => tracing::info!(
                tokens = found.token_count(),
                passwords = found.passwords.len(),
                "module finished"
            ),
            Err(e) => tracing::warn!(error = %e, "module failed"),
        }

        progress.emit(ProgressEvent::ModuleFinished {
            name: name.clone(),
            ok: result.is_ok(),
        });
        outcomes.push(ModuleOutcome { name, result });
    }
    outcomes
}
