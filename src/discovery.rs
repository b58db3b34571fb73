//! Discovery sources consulted by the extension registry on a cache miss.
//!
//! Sources are tried in the configured [`SourceKind`] order; the first one
//! that answers wins and later sources are never consulted.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{RegistryError, RegistryResult, ResolutionResult};
use crate::provider::{Extension, ExtensionKey, ExtensionKind};

/// Category of a discovery source, used to order sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Extensions registered programmatically.
    Explicit,
    /// Factory descriptors, the service-loader style catalog.
    Services,
    /// User-supplied sources.
    Custom,
    /// The bean repository.
    Beans,
    /// Built-in fallbacks.
    Defaults,
}

impl SourceKind {
    pub const DEFAULT_ORDER: [SourceKind; 5] = [
        SourceKind::Explicit,
        SourceKind::Services,
        SourceKind::Custom,
        SourceKind::Beans,
        SourceKind::Defaults,
    ];
}

/// A strategy that can locate extensions by key.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Names this source can answer for, when it can enumerate them.
    fn names(&self, _kind: ExtensionKind) -> Vec<String> {
        Vec::new()
    }

    /// Locate `key`.
    ///
    /// `Ok(None)` passes the lookup on to the next source. An error means a
    /// candidate was found but could not be constructed, and stops discovery.
    async fn discover(&self, key: &ExtensionKey) -> ResolutionResult<Option<Extension>>;
}

/// Programmatic registrations.
#[derive(Default)]
pub struct ExplicitSource {
    entries: RwLock<HashMap<ExtensionKey, Extension>>,
}

impl ExplicitSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous registration.
    pub fn insert(&self, extension: Extension) -> Option<Extension> {
        self.entries.write().insert(extension.key(), extension)
    }

    pub fn insert_unique(&self, extension: Extension) -> RegistryResult<()> {
        let key = extension.key();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key.to_string()));
        }
        entries.insert(key, extension);
        Ok(())
    }

    /// Insert unless the key is taken, handing back the current holder.
    pub fn claim(&self, extension: Extension) -> Result<(), Extension> {
        let key = extension.key();
        let mut entries = self.entries.write();
        if let Some(owner) = entries.get(&key) {
            return Err(owner.clone());
        }
        entries.insert(key, extension);
        Ok(())
    }

    pub fn get(&self, key: &ExtensionKey) -> Option<Extension> {
        self.entries.read().get(key).cloned()
    }

    pub fn remove(&self, key: &ExtensionKey) -> Option<Extension> {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DiscoverySource for ExplicitSource {
    fn name(&self) -> &str {
        "explicit"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Explicit
    }

    fn names(&self, kind: ExtensionKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn discover(&self, key: &ExtensionKey) -> ResolutionResult<Option<Extension>> {
        Ok(self.get(key))
    }
}

/// Constructs an extension from its descriptor.
pub type ExtensionFactory = Arc<dyn Fn() -> ResolutionResult<Extension> + Send + Sync>;

/// A catalog of factories keyed by extension key.
///
/// Serves both the service-style catalog and the built-in defaults; the two
/// differ only in their [`SourceKind`].
pub struct FactorySource {
    name: String,
    kind: SourceKind,
    factories: RwLock<HashMap<ExtensionKey, ExtensionFactory>>,
}

impl FactorySource {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// The service-style catalog.
    pub fn services() -> Self {
        Self::new("services", SourceKind::Services)
    }

    /// The fallback defaults.
    pub fn defaults() -> Self {
        Self::new("defaults", SourceKind::Defaults)
    }

    pub fn with<F>(self, kind: ExtensionKind, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> ResolutionResult<Extension> + Send + Sync + 'static,
    {
        self.add(kind, name, factory);
        self
    }

    pub fn add<F>(&self, kind: ExtensionKind, name: impl Into<String>, factory: F)
    where
        F: Fn() -> ResolutionResult<Extension> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(ExtensionKey::new(kind, name), Arc::new(factory));
    }

    pub fn contains(&self, key: &ExtensionKey) -> bool {
        self.factories.read().contains_key(key)
    }
}

#[async_trait]
impl DiscoverySource for FactorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn names(&self, kind: ExtensionKind) -> Vec<String> {
        self.factories
            .read()
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.name.clone())
            .collect()
    }

    async fn discover(&self, key: &ExtensionKey) -> ResolutionResult<Option<Extension>> {
        let factory = self.factories.read().get(key).cloned();
        match factory {
            Some(factory) => factory().map(Some),
            None => Ok(None),
        }
    }
}

/// A shared, type-erased bean.
pub type Bean = Arc<dyn Any + Send + Sync>;

/// Id-keyed bean lookup.
pub trait BeanRepository: Send + Sync {
    fn bind(&self, id: &str, bean: Bean);
    fn lookup(&self, id: &str) -> Option<Bean>;
    fn unbind(&self, id: &str) -> Option<Bean>;
}

/// In-memory [`BeanRepository`].
#[derive(Default)]
pub struct SimpleBeanRepository {
    beans: RwLock<HashMap<String, Bean>>,
}

impl SimpleBeanRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BeanRepository for SimpleBeanRepository {
    fn bind(&self, id: &str, bean: Bean) {
        self.beans.write().insert(id.to_string(), bean);
    }

    fn lookup(&self, id: &str) -> Option<Bean> {
        self.beans.read().get(id).cloned()
    }

    fn unbind(&self, id: &str) -> Option<Bean> {
        self.beans.write().remove(id)
    }
}

/// Discovers extensions bound as beans under the extension's name.
///
/// Only beans holding an [`Extension`] of the requested kind match; any
/// other bean with that id is ignored.
pub struct BeanSource {
    repository: Arc<dyn BeanRepository>,
}

impl BeanSource {
    pub fn new(repository: Arc<dyn BeanRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl DiscoverySource for BeanSource {
    fn name(&self) -> &str {
        "beans"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Beans
    }

    async fn discover(&self, key: &ExtensionKey) -> ResolutionResult<Option<Extension>> {
        let found = self
            .repository
            .lookup(&key.name)
            .and_then(|bean| bean.downcast_ref::<Extension>().cloned())
            .filter(|extension| extension.kind() == key.kind);
        Ok(found)
    }
}
