use std::fmt;

use super::module::{AnalysisModule, ModuleInfo};
use crate::pipeline::TreeLayout;

/// Builds a module instance for one run
pub type ModuleFactory = Box<dyn Fn(&TreeLayout) -> Box<dyn AnalysisModule> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown module(s): {}", .0.join(", "))]
    UnknownModules(Vec<String>),
    #[error("module {0} is already registered")]
    Duplicate(String),
}

struct Entry {
    info: ModuleInfo,
    factory: ModuleFactory,
}

/// The set of analysis modules available to a run, in execution order
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<Entry>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.info.name))
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, info: ModuleInfo, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&TreeLayout) -> Box<dyn AnalysisModule> + Send + Sync + 'static,
    {
        if self.contains(&info.name) {
            return Err(RegistryError::Duplicate(info.name));
        }
        self.entries.push(Entry {
            info,
            factory: Box::new(factory),
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.info.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn infos(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.entries.iter().map(|e| &e.info)
    }

    /// Keep only the named modules, in registration order.
    ///
    /// An empty selection keeps everything.
    pub fn select<S: AsRef<str>>(self, names: &[S]) -> Result<Self, RegistryError> {
        if names.is_empty() {
            return Ok(self);
        }
        let unknown: Vec<String> = names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| !self.contains(name))
            .map(|name| name.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(RegistryError::UnknownModules(unknown));
        }
        Ok(self.retain(|name| names.iter().any(|n| n.as_ref() == name)))
    }

    /// Drop the named modules; unknown names are ignored
    pub fn without<S: AsRef<str>>(self, names: &[S]) -> Self {
        self.retain(|name| !names.iter().any(|n| n.as_ref() == name))
    }

    fn retain(mut self, keep: impl Fn(&str) -> bool) -> Self {
        self.entries.retain(|e| keep(&e.info.name));
        self
    }

    /// Instantiate every module for `layout`
    pub fn load(&self, layout: &TreeLayout) -> Vec<Box<dyn AnalysisModule>> {
        self.entries
            .iter()
            .map(|entry| {
                tracing::debug!(module = %entry.info.name, "loading module");
                (entry.factory)(layout)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ModuleResult;
    use std::path::Path;

    struct Noop {
        name: String,
        identifiers: Vec<String>,
    }

    impl AnalysisModule for Noop {
        fn name(&self) -> &str {
            &self.name
        }

        fn app_identifiers(&self) -> &[String] {
            &self.identifiers
        }

        fn description(&self) -> &str {
            "does nothing"
        }

        fn analyze(self: Box<Self>, _tree: &TreeLayout) -> anyhow::Result<ModuleResult> {
            Ok(ModuleResult::new())
        }
    }

    fn registry(names: &[&str]) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for name in names {
            let owned = name.to_string();
            registry
                .register(ModuleInfo::new(name, &["com.example"], "does nothing"), move |_| {
                    Box::new(Noop {
                        name: owned.clone(),
                        identifiers: vec!["com.example".to_string()],
                    })
                })
                .unwrap();
        }
        registry
    }

    fn names(registry: &ModuleRegistry) -> Vec<String> {
        registry.infos().map(|i| i.name.clone()).collect()
    }

    #[test]
    fn test_select_keeps_registration_order() {
        let selected = registry(&["a", "b", "c"]).select(&["c", "a"]).unwrap();
        assert_eq!(names(&selected), vec!["a", "c"]);
    }

    #[test]
    fn test_select_empty_keeps_all() {
        let selected = registry(&["a", "b"]).select::<&str>(&[]).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_select_unknown() {
        let err = registry(&["a"]).select(&["a", "zz"]).unwrap_err();
        assert_eq!(err, RegistryError::UnknownModules(vec!["zz".to_string()]));
    }

    #[test]
    fn test_without() {
        let remaining = registry(&["a", "b", "c"]).without(&["b", "nope"]);
        assert_eq!(names(&remaining), vec!["a", "c"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry(&["a"]);
        let result = registry.register(ModuleInfo::new("a", &[], ""), |_| {
            Box::new(Noop {
                name: "a".to_string(),
                identifiers: Vec::new(),
            })
        });
        assert_eq!(result, Err(RegistryError::Duplicate("a".to_string())));
    }

    #[test]
    fn test_load_instantiates_in_order() {
        let layout = TreeLayout::new(Path::new("/out"), "Phone");
        let modules = registry(&["x", "y"]).load(&layout);
        let loaded: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        assert_eq!(loaded, vec!["x", "y"]);
    }
}
