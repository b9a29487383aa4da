use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use super::module::{ModuleResult, PasswordMap, TokenMap};

pub const OAUTH_TOKENS_FILE: &str = "oauthTokens.plist";
pub const PASSWORDS_FILE: &str = "passwords.plist";

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to encode {file}: {source}")]
    Encode {
        file: &'static str,
        #[source]
        source: plist::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Secrets merged across all modules of a run
///
/// Tokens accumulate: the lists for a `(site, user, identifier)` are
/// concatenated in module order and never deduplicated. Passwords do not:
/// when two modules report the same account, the later module's password
/// replaces the earlier one and the earlier value is lost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedSecrets {
    pub oauth_tokens: TokenMap,
    pub passwords: PasswordMap,
}

impl AggregatedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, result: ModuleResult) {
        for (site, users) in result.oauth_tokens {
            let site_entry = self.oauth_tokens.entry(site).or_default();
            for (user, identifiers) in users {
                let user_entry = site_entry.entry(user).or_default();
                for (identifier, tokens) in identifiers {
                    user_entry.entry(identifier).or_default().extend(tokens);
                }
            }
        }
        self.passwords.extend(result.passwords);
    }

    pub fn is_empty(&self) -> bool {
        self.oauth_tokens.is_empty() && self.passwords.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.oauth_tokens
            .values()
            .flat_map(|users| users.values())
            .flat_map(|identifiers| identifiers.values())
            .map(Vec::len)
            .sum()
    }

    /// Write the non-empty halves as XML property lists into `dir`.
    ///
    /// Both files are encoded into temp files before either is moved into
    /// place; if a later move fails the files already moved are removed.
    /// Returns the files written.
    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>, AggregateError> {
        let mut staged = Vec::new();
        if !self.oauth_tokens.is_empty() {
            staged.push(stage_plist(dir, OAUTH_TOKENS_FILE, &self.oauth_tokens)?);
        }
        if !self.passwords.is_empty() {
            staged.push(stage_plist(dir, PASSWORDS_FILE, &self.passwords)?);
        }

        let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (path, file) in staged {
            if let Err(e) = file.persist(&path) {
                for done in &written {
                    if let Err(e) = std::fs::remove_file(done) {
                        tracing::warn!(path = %done.display(), "failed to roll back secrets file: {}", e);
                    }
                }
                return Err(AggregateError::Io(e.error));
            }
            tracing::debug!(path = %path.display(), "wrote secrets");
            written.push(path);
        }
        Ok(written)
    }
}

fn stage_plist<T: Serialize>(
    dir: &Path,
    file: &'static str,
    value: &T,
) -> Result<(PathBuf, NamedTempFile), AggregateError> {
    std::fs::create_dir_all(dir)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    plist::to_writer_xml(&mut staged, value).map_err(|source| AggregateError::Encode { file, source })?;
    staged.flush()?;
    Ok((dir.join(file), staged))
}

/// Fold module results, in order, into one set of secrets
pub fn aggregate(results: impl IntoIterator<Item = ModuleResult>) -> AggregatedSecrets {
    results
        .into_iter()
        .fold(AggregatedSecrets::new(), |mut secrets, result| {
            secrets.merge(result);
            secrets
        })
}
