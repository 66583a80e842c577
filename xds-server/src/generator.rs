//! Resource generators.
//!
//! A generator turns one proxy's view of a push context into the resources of
//! one type. Generators are registered per type URL; a watched type without a
//! generator is never pushed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::WatchedResource;
use crate::error::Result;
use crate::message::Resources;
use crate::model::proxy::Proxy;
use crate::model::push_context::PushContext;
use crate::model::push_request::PushRequest;

/// Produces the resources of one type for a proxy.
pub trait Generator: Send + Sync + 'static {
    /// Generate resources.
    ///
    /// `watched.resource_names` holds the names to generate; a wildcard watch
    /// asks for everything. Returning `Ok(None)` sends nothing, which leaves
    /// the proxy on its current version.
    fn generate(
        &self,
        proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        request: &PushRequest,
    ) -> Result<Option<Resources>>;

    /// Whether this generator has anything to do for an incremental
    /// (non-full) push, such as endpoint updates.
    fn handles_incremental(&self) -> bool {
        false
    }
}

/// Generators keyed by type URL.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.generators.keys().collect();
        types.sort();
        f.debug_struct("GeneratorRegistry")
            .field("types", &types)
            .finish()
    }
}

impl GeneratorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator, replacing any previous one for the type.
    pub fn insert(&mut self, type_url: impl Into<String>, generator: Arc<dyn Generator>) {
        self.generators.insert(type_url.into(), generator);
    }

    /// Generator for a type.
    pub fn get(&self, type_url: &str) -> Option<&Arc<dyn Generator>> {
        self.generators.get(type_url)
    }
}

/// Serves resources pre-built into the push context.
#[derive(Debug, Clone, Default)]
pub struct SnapshotGenerator {
    type_url: String,
    incremental: bool,
}

impl SnapshotGenerator {
    /// Serve the push context's resources of `type_url`.
    pub fn new(type_url: impl Into<String>) -> Self {
        Self {
            type_url: type_url.into(),
            incremental: false,
        }
    }

    /// Also push on incremental requests.
    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }
}

impl Generator for SnapshotGenerator {
    fn generate(
        &self,
        _proxy: &Proxy,
        push: &PushContext,
        watched: &WatchedResource,
        _request: &PushRequest,
    ) -> Result<Option<Resources>> {
        let Some(all) = push.resources(&self.type_url) else {
            return Ok(Some(Vec::new()));
        };
        let version = push.version();
        let with_version = |r: &crate::message::Resource| {
            let mut r = r.clone();
            if r.version.is_empty() {
                r.version = version.to_string();
            }
            r
        };
        let resources = if watched.wildcard {
            all.values().map(with_version).collect()
        } else {
            watched
                .resource_names
                .iter()
                .filter_map(|name| all.get(name))
                .map(with_version)
                .collect()
        };
        Ok(Some(resources))
    }

    fn handles_incremental(&self) -> bool {
        self.incremental
    }
}
