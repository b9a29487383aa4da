use std::fmt;

use clap::Args;
use common::analysis::{ModuleInfo, RegistryError};
use serde::Serialize;

#[derive(Args, Debug, Clone)]
pub struct Modules;

#[derive(Debug, thiserror::Error)]
pub enum ModulesError {
    #[error("failed to build module registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct ModuleListing {
    #[serde(flatten)]
    pub info: ModuleInfo,
    pub enabled: bool,
}

#[derive(Debug)]
pub struct ModulesOutput(String);

impl fmt::Display for ModulesOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait::async_trait]
impl crate::op::Op for Modules {
    type Error = ModulesError;
    type Output = ModulesOutput;

    async fn execute(&self, ctx: &crate::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = &ctx.config.modules;
        let registry = crate::modules::builtin(config)?;
        let listings: Vec<ModuleListing> = registry
            .infos()
            .map(|info| ModuleListing {
                enabled: !config.disabled.contains(&info.name),
                info: info.clone(),
            })
            .collect();

        if ctx.json {
            return Ok(ModulesOutput(serde_json::to_string_pretty(&listings)?));
        }

        let lines: Vec<String> = listings
            .iter()
            .map(|l| {
                format!(
                    "{}{}\n  identifiers: {}\n  {}",
                    l.info.name,
                    if l.enabled { "" } else { " (disabled)" },
                    l.info.identifiers_display(),
                    l.info.description
                )
            })
            .collect();
        Ok(ModulesOutput(lines.join("\n")))
    }
}
