use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use common::analysis::{AnalysisModule, ModuleInfo, ModuleResult};
use common::pipeline::TreeLayout;
use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};

pub const NAME: &str = "preference-credentials";
pub const DESCRIPTION: &str = "Passwords and tokens stored in application preference files";

const APP_DOMAIN_PREFIX: &str = "AppDomain-";
const PREFERENCES_DIR: &str = "Library/Preferences";
/// User name reported for tokens found without one
const UNKNOWN_USER: &str = "unknown";

/// Preference keys the module treats as credentials, compared case-insensitively
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patterns {
    pub password_keys: Vec<String>,
    pub token_keys: Vec<String>,
    /// Keys naming the account a credential belongs to
    pub user_keys: Vec<String>,
}

impl Default for Patterns {
    fn default() -> Self {
        fn owned(keys: &[&str]) -> Vec<String> {
            keys.iter().map(|k| k.to_string()).collect()
        }
        Self {
            password_keys: owned(&["password", "passwd", "pass", "pin"]),
            token_keys: owned(&[
                "oauth_token",
                "oauthtoken",
                "access_token",
                "accesstoken",
                "refresh_token",
                "auth_token",
                "token",
            ]),
            user_keys: owned(&["username", "user", "login", "email", "account"]),
        }
    }
}

impl Patterns {
    fn matches(keys: &[String], key: &str) -> bool {
        keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    fn is_password(&self, key: &str) -> bool {
        Self::matches(&self.password_keys, key)
    }

    fn is_token(&self, key: &str) -> bool {
        Self::matches(&self.token_keys, key)
    }

    fn is_user(&self, key: &str) -> bool {
        Self::matches(&self.user_keys, key)
    }
}

pub fn info() -> ModuleInfo {
    ModuleInfo::new(NAME, &["AppDomain-*"], DESCRIPTION)
}

/// Scans every app domain's preference property lists for credential keys.
///
/// Passwords are reported under the dictionary's user value when it has one,
/// otherwise under the app's bundle identifier. Tokens are reported under
/// `(bundle identifier, user, preference file name)`.
pub struct PreferenceCredentials {
    patterns: Patterns,
    identifiers: Vec<String>,
}

impl PreferenceCredentials {
    pub fn new(patterns: Patterns) -> Self {
        Self {
            patterns,
            identifiers: vec![format!("{}*", APP_DOMAIN_PREFIX)],
        }
    }

    fn scan_file(
        &self,
        bundle_id: &str,
        path: &Path,
        result: &mut ModuleResult,
    ) -> anyhow::Result<()> {
        let value = Value::from_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let Some(dict) = value.as_dictionary() else {
            return Ok(());
        };
        let identifier = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(bundle_id);
        self.scan_dictionary(bundle_id, identifier, dict, result);
        Ok(())
    }

    fn scan_dictionary(
        &self,
        bundle_id: &str,
        identifier: &str,
        dict: &Dictionary,
        result: &mut ModuleResult,
    ) {
        let user = dict
            .iter()
            .filter(|(key, _)| self.patterns.is_user(key))
            .find_map(|(_, value)| non_empty_string(value));

        for (key, value) in dict {
            if let Some(nested) = value.as_dictionary() {
                self.scan_dictionary(bundle_id, identifier, nested, result);
                continue;
            }
            let Some(secret) = non_empty_string(value) else {
                continue;
            };
            if self.patterns.is_password(key) {
                result.add_password(user.unwrap_or(bundle_id), secret);
            } else if self.patterns.is_token(key) {
                result.add_token(bundle_id, user.unwrap_or(UNKNOWN_USER), identifier, secret);
            }
        }
    }
}

fn non_empty_string(value: &Value) -> Option<&str> {
    value.as_string().filter(|s| !s.is_empty())
}

/// `(bundle identifier, preference files)` for every app domain in the tree
fn preference_files(original: &Path) -> anyhow::Result<Vec<(String, Vec<PathBuf>)>> {
    let mut domains = Vec::new();
    if !original.is_dir() {
        return Ok(domains);
    }
    for entry in fs::read_dir(original)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(bundle_id) = name.to_str().and_then(|n| n.strip_prefix(APP_DOMAIN_PREFIX)) else {
            continue;
        };
        let dir = entry.path().join(PREFERENCES_DIR);
        if !dir.is_dir() {
            continue;
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "plist"))
            .collect();
        files.sort();
        domains.push((bundle_id.to_string(), files));
    }
    domains.sort();
    Ok(domains)
}

impl AnalysisModule for PreferenceCredentials {
    fn name(&self) -> &str {
        NAME
    }

    fn app_identifiers(&self) -> &[String] {
        &self.identifiers
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn analyze(self: Box<Self>, tree: &TreeLayout) -> anyhow::Result<ModuleResult> {
        let mut result = ModuleResult::new();
        for (bundle_id, files) in preference_files(&tree.original)? {
            for path in files {
                // one unreadable preference file should not hide the rest
                if let Err(e) = self.scan_file(&bundle_id, &path, &mut result) {
                    tracing::warn!(bundle_id = %bundle_id, "skipping preference file: {:#}", e);
                }
            }
        }
        tracing::debug!(
            passwords = result.passwords.len(),
            tokens = result.token_count(),
            "scanned preferences"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DOMAIN: &str = "AppDomain-com.example.mail";

    fn tree() -> (tempfile::TempDir, TreeLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = TreeLayout::new(dir.path(), "Phone");
        layout.create().unwrap();
        (dir, layout)
    }

    fn write_prefs(layout: &TreeLayout, domain: &str, file: &str, entries: Vec<(&str, Value)>) {
        let dir = layout.domain_dir(domain).join(PREFERENCES_DIR);
        fs::create_dir_all(&dir).unwrap();
        let dict: Dictionary = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Value::Dictionary(dict)
            .to_file_binary(dir.join(file))
            .unwrap();
    }

    fn analyze(layout: &TreeLayout) -> ModuleResult {
        Box::new(PreferenceCredentials::new(Patterns::default()))
            .analyze(layout)
            .unwrap()
    }

    #[test]
    fn test_password_with_user() {
        let (_dir, layout) = tree();
        write_prefs(
            &layout,
            DOMAIN,
            "com.example.mail.plist",
            vec![
                ("Username", Value::String("alice@example.com".into())),
                ("Password", Value::String("hunter2".into())),
                ("Theme", Value::String("dark".into())),
            ],
        );

        let result = analyze(&layout);
        assert_eq!(result.passwords.len(), 1);
        assert_eq!(result.passwords["alice@example.com"], "hunter2");
        assert_eq!(result.token_count(), 0);
    }

    #[test]
    fn test_token_in_nested_dictionary() {
        let (_dir, layout) = tree();
        let mut account = Dictionary::new();
        account.insert("access_token".into(), Value::String("tok-1".into()));
        write_prefs(
            &layout,
            DOMAIN,
            "com.example.mail.plist",
            vec![("account", Value::Dictionary(account))],
        );

        let result = analyze(&layout);
        assert_eq!(
            result.oauth_tokens["com.example.mail"][UNKNOWN_USER]["com.example.mail"],
            vec!["tok-1"]
        );
    }

    #[test]
    fn test_password_without_user_uses_bundle_id() {
        let (_dir, layout) = tree();
        write_prefs(
            &layout,
            DOMAIN,
            "settings.plist",
            vec![("PIN", Value::String("1234".into()))],
        );

        let result = analyze(&layout);
        assert_eq!(result.passwords["com.example.mail"], "1234");
    }

    #[test]
    fn test_ignores_other_domains_and_bad_files() {
        let (_dir, layout) = tree();
        write_prefs(
            &layout,
            "HomeDomain",
            "com.apple.springboard.plist",
            vec![("password", Value::String("nope".into()))],
        );
        let prefs = layout.domain_dir(DOMAIN).join(PREFERENCES_DIR);
        fs::create_dir_all(&prefs).unwrap();
        fs::write(prefs.join("broken.plist"), b"not a plist").unwrap();
        write_prefs(
            &layout,
            DOMAIN,
            "good.plist",
            vec![("password", Value::String("found".into()))],
        );

        let result = analyze(&layout);
        assert_eq!(result.passwords.len(), 1);
        assert_eq!(result.passwords["com.example.mail"], "found");
    }

    #[test]
    fn test_custom_patterns() {
        let (_dir, layout) = tree();
        write_prefs(
            &layout,
            DOMAIN,
            "com.example.mail.plist",
            vec![
                ("session", Value::String("s-1".into())),
                ("password", Value::String("ignored".into())),
            ],
        );
        let patterns = Patterns {
            password_keys: Vec::new(),
            token_keys: vec!["SESSION".to_string()],
            user_keys: Vec::new(),
        };

        let result = Box::new(PreferenceCredentials::new(patterns))
            .analyze(&layout)
            .unwrap();
        assert!(result.passwords.is_empty());
        assert_eq!(result.token_count(), 1);
    }

    #[test]
    fn test_empty_tree() {
        let (_dir, layout) = tree();
        assert!(analyze(&layout).is_empty());
    }
}
