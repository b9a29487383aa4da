//! Analysis modules and secret aggregation
//!
//! Modules run over the reconstructed tree one at a time. Each produces a
//! [`ModuleResult`]; the [orchestrator](run) isolates failures per module and
//! the [aggregator](aggregate) merges the successful results into the files
//! written to the `Interesting` directory.

mod aggregate;
mod module;
mod orchestrator;
mod registry;

pub use aggregate::{
    aggregate, AggregateError, AggregatedSecrets, OAUTH_TOKENS_FILE, PASSWORDS_FILE,
};
pub use module::{AnalysisModule, ModuleInfo, ModuleResult, PasswordMap, TokenMap};
pub use orchestrator::{run, ModuleError, ModuleOutcome};
pub use registry::{ModuleFactory, ModuleRegistry, RegistryError};
