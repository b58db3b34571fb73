//! Extension registry: name-to-implementation resolution with caching.
//!
//! Lookups go through a cache generation. On a miss the configured discovery
//! sources are consulted in order and the outcome (found, absent, or failed)
//! is cached. Concurrent lookups of one key share a single discovery attempt.
//! Invalidation swaps in a fresh generation, so a lookup sees either the old
//! cache or the new one, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::config::RouterConfig;
use crate::discovery::{BeanRepository, BeanSource, DiscoverySource, ExplicitSource, FactorySource, SourceKind};
use crate::error::{RegistryError, RegistryResult, ResolutionError, ResolutionResult};
use crate::notify::{Notification, Notifier};
use crate::provider::{
    Component, ConverterTable, Extension, ExtensionKey, ExtensionKind, RoutePolicy, UriFactory,
    VariableRepository,
};
use crate::resource::{split_scheme, Resource};

#[derive(Clone)]
enum Outcome {
    Found(Extension),
    Absent { at: Instant },
    Failed { error: ResolutionError, at: Instant },
}

impl Outcome {
    fn expired(&self, ttl: Duration) -> bool {
        match self {
            Outcome::Found(_) => false,
            Outcome::Absent { at } | Outcome::Failed { at, .. } => at.elapsed() >= ttl,
        }
    }
}

type Slot = Arc<OnceCell<Outcome>>;

/// One cache generation.
struct Generation {
    id: u64,
    entries: Mutex<HashMap<ExtensionKey, Slot>>,
}

impl Generation {
    fn new(id: u64) -> Self {
        Self {
            id,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The slot for `key`, replacing one whose negative outcome has expired.
    fn slot(&self, key: &ExtensionKey, ttl: Duration) -> Slot {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(key) {
            let stale = slot.get().is_some_and(|outcome| outcome.expired(ttl));
            if !stale {
                return Arc::clone(slot);
            }
        }
        let slot = Slot::default();
        entries.insert(key.clone(), Arc::clone(&slot));
        slot
    }

    fn evict(&self, key: &ExtensionKey) {
        self.entries.lock().remove(key);
    }

    fn without_kind(&self, id: u64, kind: ExtensionKind) -> Self {
        let entries = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.kind != kind)
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();
        Self {
            id,
            entries: Mutex::new(entries),
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Resolves extensions by kind and name.
///
/// # Example
///
/// ```rust
/// use routekit::{Extension, ExtensionKind, ExtensionRegistry, InMemoryVariableRepository};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let registry = ExtensionRegistry::builder().build().unwrap();
/// assert!(registry
///     .resolve(ExtensionKind::VariableRepository, "global")
///     .await
///     .unwrap()
///     .is_none());
///
/// registry
///     .register(Extension::VariableRepository(Arc::new(
///         InMemoryVariableRepository::new("global"),
///     )))
///     .unwrap();
/// assert!(registry
///     .resolve(ExtensionKind::VariableRepository, "global")
///     .await
///     .unwrap()
///     .is_some());
/// # }
/// ```
pub struct ExtensionRegistry {
    explicit: Arc<ExplicitSource>,
    sources: Vec<Arc<dyn DiscoverySource>>,
    generation: ArcSwap<Generation>,
    /// Serializes registration, eviction and generation swaps.
    writer: Mutex<()>,
    next_generation: AtomicU64,
    failure_ttl: Duration,
    discoveries: AtomicU64,
    notifier: Option<Arc<Notifier>>,
}

impl ExtensionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Register an extension, replacing any previous registration under the
    /// same key.
    ///
    /// Resource resolvers are the exception: a scheme can be claimed once,
    /// and a second claim is rejected here rather than at lookup time.
    pub fn register(&self, extension: Extension) -> RegistryResult<()> {
        let key = extension.key();
        validate_name(&key)?;
        let _writer = self.writer.lock();
        debug!(%key, provider = extension.provider_name(), "registering extension");
        if extension.kind() == ExtensionKind::ResourceResolver {
            self.explicit
                .claim(extension)
                .map_err(|owner| RegistryError::SchemeAlreadyClaimed {
                    scheme: key.name.clone(),
                    owner: owner.provider_name().to_string(),
                })?;
        } else {
            self.explicit.insert(extension);
        }
        self.generation.load().evict(&key);
        Ok(())
    }

    /// Register an extension, returning an error if the key is taken.
    pub fn register_unique(&self, extension: Extension) -> RegistryResult<()> {
        if extension.kind() == ExtensionKind::ResourceResolver {
            return self.register(extension);
        }
        let key = extension.key();
        validate_name(&key)?;
        let _writer = self.writer.lock();
        self.explicit.insert_unique(extension)?;
        self.generation.load().evict(&key);
        Ok(())
    }

    /// Remove an explicit registration.
    pub fn unregister(&self, kind: ExtensionKind, name: &str) -> Option<Extension> {
        let key = ExtensionKey::new(kind, name);
        let _writer = self.writer.lock();
        let removed = self.explicit.remove(&key);
        self.generation.load().evict(&key);
        removed
    }

    /// Drop the cached outcome for one key.
    pub fn evict(&self, kind: ExtensionKind, name: &str) {
        let _writer = self.writer.lock();
        self.generation.load().evict(&ExtensionKey::new(kind, name));
    }

    /// Resolve an extension.
    ///
    /// Absence is `Ok(None)`. An error means a candidate was found but could
    /// not be constructed; it stays cached until the failure window elapses
    /// or the registry is invalidated.
    pub async fn resolve(
        &self,
        kind: ExtensionKind,
        name: &str,
    ) -> ResolutionResult<Option<Extension>> {
        let key = ExtensionKey::new(kind, name);
        let generation = self.generation.load_full();
        let slot = generation.slot(&key, self.failure_ttl);
        let outcome = slot.get_or_init(|| self.discover(&key)).await;
        match outcome {
            Outcome::Found(extension) => Ok(Some(extension.clone())),
            Outcome::Absent { .. } => Ok(None),
            Outcome::Failed { error, .. } => Err(error.clone()),
        }
    }

    pub async fn resolve_component(&self, name: &str) -> ResolutionResult<Option<Arc<dyn Component>>> {
        let found = self.resolve(ExtensionKind::Component, name).await?;
        Ok(found.and_then(|e| e.as_component().cloned()))
    }

    pub async fn resolve_route_policy(
        &self,
        name: &str,
    ) -> ResolutionResult<Option<Arc<dyn RoutePolicy>>> {
        let found = self.resolve(ExtensionKind::RoutePolicy, name).await?;
        Ok(found.and_then(|e| e.as_route_policy().cloned()))
    }

    pub async fn resolve_uri_factory(
        &self,
        scheme: &str,
    ) -> ResolutionResult<Option<Arc<dyn UriFactory>>> {
        let found = self.resolve(ExtensionKind::UriFactory, scheme).await?;
        Ok(found.and_then(|e| e.as_uri_factory().cloned()))
    }

    pub async fn resolve_variable_repository(
        &self,
        name: &str,
    ) -> ResolutionResult<Option<Arc<dyn VariableRepository>>> {
        let found = self.resolve(ExtensionKind::VariableRepository, name).await?;
        Ok(found.and_then(|e| e.as_variable_repository().cloned()))
    }

    /// Load `scheme:location` through the resolver claiming the scheme.
    pub async fn resolve_resource(&self, location: &str) -> ResolutionResult<Option<Resource>> {
        let Some((scheme, remaining)) = split_scheme(location) else {
            return Ok(None);
        };
        let found = self.resolve(ExtensionKind::ResourceResolver, scheme).await?;
        Ok(found
            .and_then(|e| e.as_resource_resolver().cloned())
            .and_then(|resolver| resolver.resolve(remaining)))
    }

    /// Build a converter table from every known type converter loader, in
    /// name order.
    pub async fn type_converters(&self) -> ResolutionResult<ConverterTable> {
        let mut table = ConverterTable::new();
        for name in self.names(ExtensionKind::TypeConverterLoader) {
            let found = self.resolve(ExtensionKind::TypeConverterLoader, &name).await?;
            if let Some(loader) = found.and_then(|e| e.as_type_converter_loader().cloned()) {
                loader.load(&mut table)?;
            }
        }
        Ok(table)
    }

    /// Names known to any source for `kind`, without resolving them.
    pub fn names(&self, kind: ExtensionKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .iter()
            .flat_map(|source| source.names(kind))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Invalidate every cached outcome. Returns the new generation id.
    pub fn invalidate_all(&self) -> u64 {
        let _writer = self.writer.lock();
        let id = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.generation.store(Arc::new(Generation::new(id)));
        debug!(generation = id, "extension cache invalidated");
        id
    }

    /// Invalidate the cached outcomes of one kind only.
    pub fn invalidate_kind(&self, kind: ExtensionKind) -> u64 {
        let _writer = self.writer.lock();
        let id = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = self.generation.load().without_kind(id, kind);
        self.generation.store(Arc::new(next));
        debug!(generation = id, %kind, "extension cache invalidated for kind");
        id
    }

    /// Current cache generation id.
    pub fn generation(&self) -> u64 {
        self.generation.load().id
    }

    /// Number of discovery passes run so far.
    pub fn discovery_count(&self) -> u64 {
        self.discoveries.load(Ordering::Acquire)
    }

    /// Number of keys in the current cache generation.
    pub fn cached_len(&self) -> usize {
        self.generation.load().len()
    }

    async fn discover(&self, key: &ExtensionKey) -> Outcome {
        self.discoveries.fetch_add(1, Ordering::AcqRel);
        for source in &self.sources {
            match source.discover(key).await {
                Ok(Some(extension)) if extension.kind() != key.kind => {
                    let error = ResolutionError::KindMismatch {
                        name: key.name.clone(),
                        expected: key.kind,
                        found: extension.kind(),
                    };
                    warn!(%key, source = source.name(), %error, "discovery returned wrong kind");
                    return Outcome::Failed {
                        error,
                        at: Instant::now(),
                    };
                }
                Ok(Some(extension)) => {
                    debug!(%key, source = source.name(), "extension discovered");
                    self.announce_dependencies(key, &extension);
                    return Outcome::Found(extension);
                }
                Ok(None) => continue,
                Err(error) => {
                    warn!(%key, source = source.name(), %error, "extension resolution failed");
                    return Outcome::Failed {
                        error,
                        at: Instant::now(),
                    };
                }
            }
        }
        trace!(%key, "extension not found");
        Outcome::Absent { at: Instant::now() }
    }

    fn announce_dependencies(&self, key: &ExtensionKey, extension: &Extension) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        for dependency in extension.dependencies() {
            notifier.notify(Notification::DependencyDetected {
                extension: key.clone(),
                dependency: dependency.to_string(),
            });
        }
    }
}

fn validate_name(key: &ExtensionKey) -> RegistryResult<()> {
    if key.name.trim().is_empty() || key.name.contains(':') {
        return Err(RegistryError::InvalidName(key.name.clone()));
    }
    Ok(())
}

/// Builder for an [`ExtensionRegistry`].
pub struct RegistryBuilder {
    explicit: Vec<Extension>,
    sources: Vec<Arc<dyn DiscoverySource>>,
    order: Vec<SourceKind>,
    failure_ttl: Duration,
    notifier: Option<Arc<Notifier>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let defaults = RouterConfig::default();
        Self {
            explicit: Vec::new(),
            sources: Vec::new(),
            order: defaults.discovery_order,
            failure_ttl: defaults.failure_cache_ttl,
            notifier: None,
        }
    }

    /// Take the discovery order and failure window from a configuration.
    pub fn config(mut self, config: &RouterConfig) -> Self {
        self.order = config.discovery_order.clone();
        self.failure_ttl = config.failure_cache_ttl;
        self
    }

    pub fn failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }

    pub fn order(mut self, order: Vec<SourceKind>) -> Self {
        self.order = order;
        self
    }

    /// Register an extension explicitly.
    pub fn with(mut self, extension: Extension) -> Self {
        self.explicit.push(extension);
        self
    }

    pub fn source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn services(self, catalog: FactorySource) -> Self {
        self.source(Arc::new(catalog))
    }

    pub fn defaults(self, catalog: FactorySource) -> Self {
        self.source(Arc::new(catalog))
    }

    pub fn beans(self, repository: Arc<dyn BeanRepository>) -> Self {
        self.source(Arc::new(BeanSource::new(repository)))
    }

    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the registry.
    ///
    /// Sources are ordered by the rank of their kind; sources of equal kind
    /// keep insertion order, and sources whose kind is not listed are left
    /// out.
    pub fn build(self) -> RegistryResult<ExtensionRegistry> {
        let explicit = Arc::new(ExplicitSource::new());
        let mut ranked: Vec<(usize, Arc<dyn DiscoverySource>)> = Vec::new();
        let all = std::iter::once(Arc::clone(&explicit) as Arc<dyn DiscoverySource>)
            .chain(self.sources);
        for source in all {
            match self.order.iter().position(|k| *k == source.kind()) {
                Some(rank) => ranked.push((rank, source)),
                None => debug!(source = source.name(), "discovery source not in order, skipped"),
            }
        }
        ranked.sort_by_key(|(rank, _)| *rank);

        let registry = ExtensionRegistry {
            explicit,
            sources: ranked.into_iter().map(|(_, source)| source).collect(),
            generation: ArcSwap::from_pointee(Generation::new(0)),
            writer: Mutex::new(()),
            next_generation: AtomicU64::new(0),
            failure_ttl: self.failure_ttl,
            discoveries: AtomicU64::new(0),
            notifier: self.notifier,
        };
        for extension in self.explicit {
            registry.register(extension)?;
        }
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
