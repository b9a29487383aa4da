use std::error::Error;
use std::path::PathBuf;

use crate::state::{AppConfig, StateError};

#[derive(Debug, Clone)]
pub struct OpContext {
    /// Loaded configuration (defaults when no config file exists)
    pub config: AppConfig,
    /// Optional custom config file (defaults to ~/.bft/config.toml)
    pub config_path: Option<PathBuf>,
    /// Overrides the configured log level
    pub log_level: Option<String>,
    /// Render command output as JSON
    pub json: bool,
}

impl OpContext {
    pub fn new(
        config_path: Option<PathBuf>,
        log_level: Option<String>,
        json: bool,
    ) -> Result<Self, StateError> {
        let config = AppConfig::load(config_path.as_deref())?;
        Ok(Self {
            config,
            config_path,
            log_level,
            json,
        })
    }

    /// Log level for this invocation: `--log-level` over the config file
    pub fn level(&self) -> Result<tracing::Level, StateError> {
        match &self.log_level {
            Some(level) => crate::state::parse_level(level),
            None => self.config.level(),
        }
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}
