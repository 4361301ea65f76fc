use crate::loader::{self, LoadError};
use latticecore::{Component, ComponentMetadata};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files that make up a discovered component, relative to `root`
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSource {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Registry of available component types
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
    sources: RwLock<HashMap<String, ComponentSource>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Register a component; a later registration of the same type replaces it
    pub fn register(&self, component: Arc<dyn Component>) {
        let component_type = component.component_type().to_string();
        tracing::info!("Registering component type: {}", component_type);
        self.components.write().insert(component_type, component);
    }

    pub fn register_with_source(&self, component: Arc<dyn Component>, source: ComponentSource) {
        let component_type = component.component_type().to_string();
        self.register(component);
        self.sources.write().insert(component_type, source);
    }

    /// Load every `*.component.json` manifest in `dir`. Nothing is executed.
    pub fn scan_dir(&self, dir: &Path) -> Result<usize, LoadError> {
        let found = loader::scan_dir(dir)?;
        let count = found.len();
        for (component, source) in found {
            self.register_with_source(Arc::new(component), source);
        }
        tracing::info!(dir = %dir.display(), count, "Scanned component directory");
        Ok(count)
    }

    pub fn get(&self, component_type: &str) -> Option<Arc<dyn Component>> {
        self.components.read().get(component_type).cloned()
    }

    pub fn contains(&self, component_type: &str) -> bool {
        self.components.read().contains_key(component_type)
    }

    /// All registered types, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.components.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn metadata(&self, component_type: &str) -> Option<ComponentMetadata> {
        self.get(component_type).map(|c| c.metadata())
    }

    pub fn source(&self, component_type: &str) -> Option<ComponentSource> {
        self.sources.read().get(component_type).cloned()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
