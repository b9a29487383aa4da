use std::path::PathBuf;

use clap::Args;
use common::backup::{BackupDir, BackupError};
use common::manifest::{self, FileType, ManifestRecord, ParseError};

#[derive(Args, Debug, Clone)]
pub struct Manifest {
    /// Backup directory holding Info.plist, Manifest.plist and Manifest.mbdb
    #[arg(long)]
    pub backup: PathBuf,

    /// Only list records of this domain
    #[arg(long)]
    pub domain: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe(record: &ManifestRecord) -> String {
    let kind = match record.file_type {
        FileType::Directory => 'd',
        FileType::Regular => '-',
        FileType::Symlink => 'l',
    };
    let mut line = format!(
        "{}{:04o} {:>10} class {} {}",
        kind,
        record.mode & 0o7777,
        record.file_size,
        record.protection_class,
        record
    );
    if record.file_type == FileType::Symlink {
        line.push_str(" -> ");
        line.push_str(&record.link_target);
    }
    line
}

#[async_trait::async_trait]
impl crate::op::Op for Manifest {
    type Error = ManifestError;
    type Output = String;

    async fn execute(&self, ctx: &crate::op::OpContext) -> Result<Self::Output, Self::Error> {
        let backup = BackupDir::open(&self.backup)?;
        let records = manifest::parse(&backup.read_manifest_stream()?)?;
        let records: Vec<&ManifestRecord> = records
            .iter()
            .filter(|r| self.domain.as_deref().map_or(true, |d| r.domain == d))
            .collect();

        if ctx.json {
            return Ok(serde_json::to_string_pretty(&records)?);
        }

        let mut lines: Vec<String> = records.iter().map(|r| describe(r)).collect();
        lines.push(format!("{} record(s)", records.len()));
        Ok(lines.join("\n"))
    }
}
