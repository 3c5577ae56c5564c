//! Registry of configured backends, keyed by backend id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::DiggerError;
use crate::provider::Generator;
use crate::provider::http::HttpGenerator;

pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    /// Build adapters for every configured backend. Fails fast on any
    /// invalid backend definition.
    pub fn from_settings(settings: &Settings, default_model: &str) -> Result<Self, DiggerError> {
        let mut generators: HashMap<String, Arc<dyn Generator>> = HashMap::new();
        for backend in &settings.backends {
            let generator = HttpGenerator::new(backend.clone(), default_model)?;
            generators.insert(backend.id.clone(), Arc::new(generator));
        }
        Ok(Self { generators })
    }

    /// Registry over pre-built generators. Lets tests (and embedders
    /// with custom transports) supply their own implementations.
    pub fn from_generators(generators: Vec<Arc<dyn Generator>>) -> Self {
        Self {
            generators: generators
                .into_iter()
                .map(|g| (g.name().to_string(), g))
                .collect(),
        }
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<dyn Generator>> {
        self.generators.get(backend_id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.generators.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}
