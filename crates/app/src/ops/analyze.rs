use std::fmt;
use std::path::PathBuf;

use clap::Args;
use common::analysis::RegistryError;
use common::backup::BackupInfo;
use common::pipeline::{
    self, Cancellation, PassphraseProvider, ProgressEvent, ProgressSender, RunContext, RunError,
    RunOptions, RunReport,
};

use crate::process;
use crate::state::StateError;

#[derive(Args, Debug, Clone)]
pub struct Analyze {
    /// Backup directory holding Info.plist, Manifest.plist and Manifest.mbdb
    #[arg(long)]
    pub backup: PathBuf,

    /// Directory the device tree is reconstructed under
    #[arg(long)]
    pub output: PathBuf,

    /// Only run the named module; repeat for several (default: all enabled)
    #[arg(long = "module")]
    pub modules: Vec<String>,

    /// Read the passphrase from this environment variable instead of prompting
    #[arg(long)]
    pub passphrase_env: Option<String>,

    /// Records reconstructed at the same time (overrides the config file)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Config(#[from] StateError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Passphrase from an environment variable, or from the terminal
#[derive(Debug, Clone)]
pub struct TerminalPassphrase {
    env: Option<String>,
}

impl PassphraseProvider for TerminalPassphrase {
    fn passphrase(&self, device: &BackupInfo) -> anyhow::Result<String> {
        if let Some(var) = &self.env {
            return std::env::var(var)
                .map_err(|e| anyhow::anyhow!("passphrase variable {}: {}", var, e));
        }
        let prompt = format!("Backup passphrase for {}: ", device.device_name);
        Ok(rpassword::prompt_password(prompt)?)
    }
}

#[derive(Debug)]
pub struct AnalyzeOutput {
    pub report: RunReport,
    pub json: Option<String>,
}

impl fmt::Display for AnalyzeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(json) = &self.json {
            return f.write_str(json);
        }
        let report = &self.report;
        writeln!(f, "Run {}", report.run_id)?;
        writeln!(
            f,
            "- Device: {} ({})",
            report.device.device_name,
            if report.encrypted {
                "encrypted"
            } else {
                "unencrypted"
            }
        )?;
        writeln!(f, "- Output: {}", report.layout.device_root.display())?;
        writeln!(
            f,
            "- Records: {} ({} reconstructed, {} skipped)",
            report.records,
            report.materialized,
            report.warnings.len()
        )?;
        for warning in &report.warnings {
            writeln!(
                f,
                "    ! {}/{}: {}",
                warning.domain, warning.relative_path, warning.error
            )?;
        }
        writeln!(f, "- Modules: {}", report.modules.len())?;
        for module in &report.modules {
            match &module.error {
                None => writeln!(
                    f,
                    "    {}: {} password(s), {} token(s)",
                    module.name, module.passwords, module.tokens
                )?,
                Some(error) => writeln!(f, "    {}: failed: {}", module.name, error)?,
            }
        }
        write!(
            f,
            "- Secrets: {} password(s), {} token(s)",
            report.passwords, report.tokens
        )?;
        for path in &report.secrets_files {
            write!(f, "\n    {}", path.display())?;
        }
        Ok(())
    }
}

fn log_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::KeyBagUnlocked { classes } => {
            tracing::info!(classes, "key bag unlocked")
        }
        ProgressEvent::ManifestParsed { records } => {
            tracing::info!(records, "manifest parsed")
        }
        ProgressEvent::RecordMaterialized { completed, total } => {
            if completed == total || completed % 500 == 0 {
                tracing::info!(completed, total, "reconstructing files");
            }
        }
        ProgressEvent::ModuleStarted { name, index, total } => {
            tracing::info!(module = %name, index, total, "module started")
        }
        ProgressEvent::ModuleFinished { name, ok } => {
            tracing::info!(module = %name, ok, "module finished")
        }
        ProgressEvent::SecretsWritten { files } => {
            tracing::info!(files = files.len(), "secrets written")
        }
    }
}

#[async_trait::async_trait]
impl crate::op::Op for Analyze {
    type Error = AnalyzeError;
    type Output = AnalyzeOutput;

    async fn execute(&self, ctx: &crate::op::OpContext) -> Result<Self::Output, Self::Error> {
        let concurrency = self
            .concurrency
            .unwrap_or(ctx.config.materialize_concurrency);
        if concurrency == 0 {
            return Err(AnalyzeError::InvalidConcurrency);
        }
        let registry = crate::modules::enabled(&ctx.config.modules, &self.modules)?;

        let _guards = process::init_logging(ctx.level()?, self.log_dir.as_deref());
        tracing::debug!(config = ?ctx.config_path, modules = ?registry, "loaded configuration");

        let (progress, events) = ProgressSender::channel();
        let progress_task = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                log_progress(&event);
            }
        });
        let (cancel_handle, cancel) = Cancellation::new();
        let interrupt_task = process::cancel_on_interrupt(cancel_handle);

        let run_ctx = RunContext::new(
            RunOptions::new(&self.backup, &self.output).with_concurrency(concurrency),
        )
        .with_progress(progress)
        .with_cancellation(cancel);
        let provider = TerminalPassphrase {
            env: self.passphrase_env.clone(),
        };

        let result = pipeline::run(&run_ctx, &provider, &registry).await;

        interrupt_task.abort();
        // the progress task ends once every sender is gone
        drop(run_ctx);
        if let Err(e) = progress_task.await {
            tracing::warn!("progress logger failed: {}", e);
        }

        let report = result.inspect_err(|e| tracing::error!("run failed: {}", e))?;
        let json = if ctx.json {
            Some(serde_json::to_string_pretty(&report)?)
        } else {
            None
        };
        Ok(AnalyzeOutput { report, json })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use common::testkit::SyntheticBackup;
    use plist::Value;

    use crate::op::{Op, OpContext};
    use crate::state::AppConfig;

    const DOMAIN: &str = "AppDomain-com.example.mail";
    const PASSPHRASE_VAR: &str = "BFT_TEST_PASSPHRASE";

    fn prefs() -> Vec<u8> {
        let mut dict = plist::Dictionary::new();
        dict.insert("username".into(), Value::String("alice".into()));
        dict.insert("password".into(), Value::String("hunter2".into()));
        let mut out = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut out).unwrap();
        out
    }

    #[test]
    fn test_env_passphrase() {
        std::env::set_var(PASSPHRASE_VAR, "from-env");
        let provider = TerminalPassphrase {
            env: Some(PASSPHRASE_VAR.to_string()),
        };
        let device = BackupInfo {
            device_name: "Phone".to_string(),
            display_name: None,
            product_type: None,
            product_version: None,
            serial_number: None,
            unique_identifier: None,
        };
        assert_eq!(provider.passphrase(&device).unwrap(), "from-env");

        let missing = TerminalPassphrase {
            env: Some("BFT_TEST_UNSET_VARIABLE".to_string()),
        };
        assert!(missing.passphrase(&device).is_err());
    }

    #[tokio::test]
    async fn test_analyze_encrypted_backup() {
        let backup_dir = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        SyntheticBackup::encrypted("Phone", "pw")
            .directory(DOMAIN, "")
            .directory(DOMAIN, "Library")
            .directory(DOMAIN, "Library/Preferences")
            .file(DOMAIN, "Library/Preferences/com.example.mail.plist", &prefs())
            .write(backup_dir.path())
            .unwrap();
        std::env::set_var("BFT_TEST_ANALYZE_PASSPHRASE", "pw");

        let op = Analyze {
            backup: backup_dir.path().to_path_buf(),
            output: output_dir.path().to_path_buf(),
            modules: Vec::new(),
            passphrase_env: Some("BFT_TEST_ANALYZE_PASSPHRASE".to_string()),
            concurrency: Some(2),
            log_dir: None,
        };
        let ctx = OpContext {
            config: AppConfig::default(),
            config_path: None,
            log_level: Some("warn".to_string()),
            json: false,
        };

        let output = op.execute(&ctx).await.unwrap();
        assert_eq!(output.report.records, 4);
        assert_eq!(output.report.passwords, 1);
        let text = output.to_string();
        assert!(text.contains("preference-credentials: 1 password(s), 0 token(s)"));

        let passwords = Value::from_file(output.report.layout.interesting.join("passwords.plist"))
            .unwrap()
            .into_dictionary()
            .unwrap();
        assert_eq!(
            passwords.get("alice").and_then(|v| v.as_string()),
            Some("hunter2")
        );
    }
}
