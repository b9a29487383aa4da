/**
 * Analysis modules, the orchestrator that runs them
 *  with per-module failure isolation, and the
 *  aggregator merging their findings.
 */
pub mod analysis;
/**
 * Reading a backup directory: device metadata,
 *  encryption state and blob locations.
 */
pub mod backup;
/**
 * Cryptographic types and operations.
 *  - Key bag parsing and passphrase unlocking
 *  - Per-file key unwrapping and content decryption
 */
pub mod crypto;
/**
 * Parser for the manifest record stream describing
 *  every file in a backup.
 */
pub mod manifest;
/**
 * Recreating manifest records on disk, one blocking
 *  worker per record up to a concurrency limit.
 */
pub mod materialize;
/**
 * A whole run from key bag to aggregated secrets,
 *  plus the per-run context (progress, cancellation).
 */
pub mod pipeline;
/**
 * Builders for synthetic backups used by tests.
 */
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::analysis::{
        AggregatedSecrets, AnalysisModule, ModuleInfo, ModuleRegistry, ModuleResult,
    };
    pub use crate::backup::{BackupDir, BackupInfo};
    pub use crate::crypto::{KeyBag, KeyError, UnlockedKeyBag};
    pub use crate::manifest::{FileType, ManifestRecord, ParseError};
    pub use crate::materialize::{MaterializeError, ReconstructedFile};
    pub use crate::pipeline::{
        PassphraseProvider, ProgressEvent, RunContext, RunError, RunOptions, RunReport, TreeLayout,
    };
    pub use crate::version::build_info;
}
