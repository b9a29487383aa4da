use std::collections::BTreeMap;

use serde::Serialize;

use crate::pipeline::TreeLayout;

/// `site -> user -> identifier -> tokens`
pub type TokenMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<String>>>>;
/// `account -> password`
pub type PasswordMap = BTreeMap<String, String>;

/// Secrets found by one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleResult {
    pub oauth_tokens: TokenMap,
    pub passwords: PasswordMap,
}

impl ModuleResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, site: &str, user: &str, identifier: &str, token: impl Into<String>) {
        self.oauth_tokens
            .entry(site.to_string())
            .or_default()
            .entry(user.to_string())
            .or_default()
            .entry(identifier.to_string())
            .or_default()
            .push(token.into());
    }

    pub fn add_password(&mut self, account: &str, password: impl Into<String>) {
        self.passwords.insert(account.to_string(), password.into());
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

    /// Reject results with empty keys at any level
    pub fn validate(&self) -> Result<(), String> {
        for (site, users) in &self.oauth_tokens {
            if site.is_empty() {
                return Err("empty site key".to_string());
            }
            for (user, identifiers) in users {
                if user.is_empty() {
                    return Err(format!("empty user key under site {:?}", site));
                }
                if identifiers.keys().any(String::is_empty) {
                    return Err(format!(
                        "empty identifier key under site {:?}, user {:?}",
                        site, user
                    ));
                }
            }
        }
        if self.passwords.keys().any(String::is_empty) {
            return Err("empty account key".to_string());
        }
        Ok(())
    }
}

/// A pluggable analysis over a reconstructed backup tree
///
/// Modules are built by a [`ModuleRegistry`](super::ModuleRegistry) factory
/// for one run and consumed by [`analyze`](AnalysisModule::analyze), so each
/// instance runs at most once.
pub trait AnalysisModule: Send {
    fn name(&self) -> &str;

    /// Backup domains (app identifiers) the module looks at
    fn app_identifiers(&self) -> &[String];

    fn description(&self) -> &str;

    fn analyze(self: Box<Self>, tree: &TreeLayout) -> anyhow::Result<ModuleResult>;
}

/// Static description of a registered module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub identifiers: Vec<String>,
    pub description: String,
}

impl ModuleInfo {
    pub fn new(name: &str, identifiers: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
        }
    }

    pub fn of(module: &dyn AnalysisModule) -> Self {
        Self {
            name: module.name().to_string(),
            identifiers: module.app_identifiers().to_vec(),
            description: module.description().to_string(),
        }
    }

    /// Identifiers joined with `", "`
    pub fn identifiers_display(&self) -> String {
        self.identifiers.join(", ")
    }
}
