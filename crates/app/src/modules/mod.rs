pub mod preference_credentials;

use common::analysis::{AnalysisModule, ModuleRegistry, RegistryError};
use common::pipeline::TreeLayout;

use crate::state::ModulesConfig;

use preference_credentials::PreferenceCredentials;

/// Every built-in module, in execution order
pub fn builtin(config: &ModulesConfig) -> Result<ModuleRegistry, RegistryError> {
    let mut registry = ModuleRegistry::new();

    let patterns = config.preference_credentials.clone();
    registry.register(
        preference_credentials::info(),
        move |_: &TreeLayout| -> Box<dyn AnalysisModule> {
            Box::new(PreferenceCredentials::new(patterns.clone()))
        },
    )?;

    Ok(registry)
}

/// Built-in modules minus those disabled in the config, narrowed to
/// `selected` when it is non-empty
pub fn enabled(config: &ModulesConfig, selected: &[String]) -> Result<ModuleRegistry, RegistryError> {
    builtin(config)?
        .select(selected)
        .map(|registry| registry.without(&config.disabled))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = builtin(&ModulesConfig::default()).unwrap();
        let names: Vec<&str> = registry.infos().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec![preference_credentials::NAME]);
    }

    #[test]
    fn test_disabled_modules_are_dropped() {
        let config = ModulesConfig {
            disabled: vec![preference_credentials::NAME.to_string()],
            ..Default::default()
        };
        assert!(enabled(&config, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_selection() {
        let result = enabled(&ModulesConfig::default(), &["nope".to_string()]);
        assert_eq!(
            result.unwrap_err(),
            RegistryError::UnknownModules(vec!["nope".to_string()])
        );
    }
}
