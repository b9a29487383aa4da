//! Shared test utilities for backup processing integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use common::analysis::{AnalysisModule, ModuleInfo, ModuleRegistry, ModuleResult};
use common::pipeline::{RunContext, RunOptions, TreeLayout};
use common::testkit::SyntheticBackup;
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";
pub const DOMAIN: &str = "AppDomain-com.example.notes";

/// Write `backup` to a fresh directory and create an empty output directory
pub fn setup_backup(backup: &SyntheticBackup) -> (TempDir, TempDir) {
    let backup_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    backup.write(backup_dir.path()).unwrap();
    (backup_dir, output_dir)
}

pub fn context(backup_dir: &TempDir, output_dir: &TempDir) -> RunContext {
    RunContext::new(RunOptions::new(backup_dir.path(), output_dir.path()).with_concurrency(2))
}

/// Every file and directory below `root`, relative to it, sorted
pub fn tree_entries(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
            if path.symlink_metadata().unwrap().is_dir() {
                walk(root, &path, out);
            }
        }
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out.sort();
    out
}

/// What a scripted module does when analyzed
#[derive(Clone)]
pub enum Script {
    /// Report one password for `account`
    Password { account: String, password: String },
    /// Report one token
    Token { site: String, user: String, identifier: String, token: String },
    /// Read a file below the domain directory and report its contents as a password
    ReadFile { domain: String, path: String, account: String },
    Fail,
    Panic,
}

pub struct ScriptedModule {
    name: String,
    identifiers: Vec<String>,
    script: Script,
    original: PathBuf,
}

impl AnalysisModule for ScriptedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn app_identifiers(&self) -> &[String] {
        &self.identifiers
    }

    fn description(&self) -> &str {
        "scripted integration test module"
    }

    fn analyze(self: Box<Self>, tree: &TreeLayout) -> anyhow::Result<ModuleResult> {
        assert_eq!(tree.original, self.original);
        let mut result = ModuleResult::new();
        match self.script {
            Script::Password { account, password } => result.add_password(&account, password),
            Script::Token {
                site,
                user,
                identifier,
                token,
            } => result.add_token(&site, &user, &identifier, token),
            Script::ReadFile {
                domain,
                path,
                account,
            } => {
                let contents = std::fs::read_to_string(tree.domain_dir(&domain).join(path))?;
                result.add_password(&account, contents);
            }
            Script::Fail => anyhow::bail!("scripted failure"),
            Script::Panic => panic!("scripted panic"),
        }
        Ok(result)
    }
}

/// A registry holding one scripted module per `(name, script)`
pub fn registry(modules: Vec<(&str, Script)>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for (name, script) in modules {
        let owned = name.to_string();
        registry
            .register(
                ModuleInfo::new(name, &[DOMAIN], "scripted integration test module"),
                move |layout: &TreeLayout| -> Box<dyn AnalysisModule> {
                    Box::new(ScriptedModule {
                        name: owned.clone(),
                        identifiers: vec![DOMAIN.to_string()],
                        script: script.clone(),
                        original: layout.original.clone(),
                    })
                },
            )
            .unwrap();
    }
    registry
}

pub fn password(account: &str, password: &str) -> Script {
    Script::Password {
        account: account.to_string(),
        password: password.to_string(),
    }
}
