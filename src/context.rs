//! The router context: the object that owns the registry, the routes, the
//! reload coordinator and the teardown callbacks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::advice::InflightRepository;
use crate::chain::{Chain, ChainBuilder};
use crate::config::{Config, RouterConfig};
use crate::discovery::{Bean, BeanRepository, DiscoverySource, FactorySource, SimpleBeanRepository};
use crate::error::{
    Fault, RegistryResult, ReloadError, RoutekitError, RoutekitResult,
};
use crate::exchange::{Exchange, RouteId};
use crate::notify::{Listener, Notification, Notifier};
use crate::provider::{
    Extension, ExtensionKey, ExtensionKind, InMemoryVariableRepository, VariableRepository,
};
use crate::registry::ExtensionRegistry;
use crate::reload::{ReloadCoordinator, ReloadParticipant, ReloadReport};
use crate::resource::{split_scheme, FileResourceResolver};
use crate::step::Step;

/// Name of the variable repository holding global variables.
pub const GLOBAL_VARIABLES: &str = "global";

/// Shared collaborators used while building and running chains.
pub struct Services {
    config: RouterConfig,
    registry: Arc<ExtensionRegistry>,
    notifier: Arc<Notifier>,
    inflight: Arc<InflightRepository>,
    beans: Arc<dyn BeanRepository>,
    endpoints: RwLock<HashMap<String, Step>>,
}

impl Services {
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn inflight(&self) -> Arc<InflightRepository> {
        Arc::clone(&self.inflight)
    }

    pub fn beans(&self) -> &Arc<dyn BeanRepository> {
        &self.beans
    }

    /// The producer step for `scheme:remaining`, created by the component
    /// named `scheme` and cached per URI.
    pub async fn endpoint(&self, uri: &str) -> RoutekitResult<Step> {
        let cached = self.endpoints.read().get(uri).cloned();
        if let Some(step) = cached {
            return Ok(step);
        }
        let Some((scheme, remaining)) = split_scheme(uri) else {
            return Err(RoutekitError::Route(format!("invalid endpoint uri '{uri}'")));
        };
        let component = self
            .registry
            .resolve_component(scheme)
            .await?
            .ok_or_else(|| Fault::EndpointUnavailable(format!("no component for '{uri}'")))?;

        self.notifier.notify(Notification::EndpointRegistering {
            uri: uri.to_string(),
        });
        let producer = component.create_producer(remaining)?;
        debug!(uri, component = component.name(), "endpoint created");
        Ok(self
            .endpoints
            .write()
            .entry(uri.to_string())
            .or_insert(producer)
            .clone())
    }

    /// Forget every cached endpoint.
    pub fn clear_endpoints(&self) {
        self.endpoints.write().clear();
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Build an endpoint URI through the URI factory claiming `scheme`.
    pub async fn build_uri(
        &self,
        scheme: &str,
        parameters: &BTreeMap<String, String>,
    ) -> RoutekitResult<String> {
        let factory = self
            .registry
            .resolve_uri_factory(scheme)
            .await?
            .ok_or_else(|| RoutekitError::Config(format!("no uri factory for scheme '{scheme}'")))?;
        factory.build_uri(parameters)
    }

    async fn globals(&self) -> RoutekitResult<Option<Arc<dyn VariableRepository>>> {
        Ok(self
            .registry
            .resolve_variable_repository(GLOBAL_VARIABLES)
            .await?)
    }

    pub async fn global_variable(&self, name: &str) -> RoutekitResult<Option<String>> {
        Ok(self.globals().await?.and_then(|repo| repo.get(name)))
    }

    pub async fn set_global_variable(
        &self,
        name: &str,
        value: impl Into<String>,
    ) -> RoutekitResult<()> {
        let repo = self.globals().await?.ok_or_else(|| {
            RoutekitError::Config("no global variable repository".to_string())
        })?;
        repo.set(name, value.into());
        Ok(())
    }

    /// Set a property on a component through its configurer. Returns whether
    /// the component accepted the property.
    pub async fn configure_component(
        &self,
        component: &str,
        property: &str,
        value: &str,
    ) -> RoutekitResult<bool> {
        let found = self
            .registry
            .resolve_component(component)
            .await?
            .ok_or_else(|| RoutekitError::Config(format!("unknown component '{component}'")))?;
        Ok(found
            .configurer()
            .map(|configurer| configurer.configure(property, value))
            .unwrap_or(false))
    }
}

/// Supplies parameters for templated routes.
pub trait RouteTemplateSource: Send + Sync {
    fn parameters(&self, route_id: &RouteId) -> HashMap<String, String>;

    fn route_ids(&self) -> BTreeSet<RouteId>;
}

/// In-memory [`RouteTemplateSource`].
#[derive(Debug, Default)]
pub struct StaticTemplates {
    routes: BTreeMap<RouteId, HashMap<String, String>>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route<I, K, V>(mut self, route_id: impl Into<RouteId>, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let parameters = parameters
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.routes.insert(route_id.into(), parameters);
        self
    }
}

impl RouteTemplateSource for StaticTemplates {
    fn parameters(&self, route_id: &RouteId) -> HashMap<String, String> {
        self.routes.get(route_id).cloned().unwrap_or_default()
    }

    fn route_ids(&self) -> BTreeSet<RouteId> {
        self.routes.keys().cloned().collect()
    }
}

struct RouteEntry {
    definition: ChainBuilder,
    chain: ArcSwap<Chain>,
}

/// Installed routes. Each route's chain sits behind an atomically swapped
/// reference; exchanges keep the chain they entered.
#[derive(Default)]
struct RouteTable {
    routes: RwLock<BTreeMap<RouteId, Arc<RouteEntry>>>,
}

impl RouteTable {
    fn get(&self, route_id: &RouteId) -> Option<Arc<Chain>> {
        self.routes
            .read()
            .get(route_id)
            .map(|entry| entry.chain.load_full())
    }

    fn entries(&self) -> Vec<Arc<RouteEntry>> {
        self.routes.read().values().cloned().collect()
    }
}

/// Rebuilds every route against the refreshed registry and swaps them in.
struct RouteRebuilder {
    services: Arc<Services>,
    routes: Arc<RouteTable>,
}

#[async_trait]
impl ReloadParticipant for RouteRebuilder {
    fn name(&self) -> &str {
        "routes"
    }

    async fn reload(&self, source: &str) -> Result<(), ReloadError> {
        self.services.clear_endpoints();
        let entries = self.routes.entries();
        let mut rebuilt = Vec::with_capacity(entries.len());
        for entry in &entries {
            let chain = entry
                .definition
                .build(&self.services)
                .await
                .map_err(|e| ReloadError::Participant {
                    name: format!("route '{}'", entry.definition.route_id()),
                    reason: e.to_string(),
                })?;
            rebuilt.push(chain);
        }
        for (entry, chain) in entries.iter().zip(rebuilt) {
            entry.chain.store(Arc::new(chain));
        }
        debug!(source, routes = entries.len(), "routes rebuilt");
        Ok(())
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Owns everything a router needs and tears it down once.
///
/// ```rust
/// use routekit::{Chain, Exchange, RouterContext};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let context = RouterContext::builder().build()?;
/// context
///     .add_route(Chain::builder("greet").process(|exchange: &mut Exchange| {
///         exchange.set_body("hello");
///         Ok(())
///     }))
///     .await?;
///
/// let exchange = context.send("greet", Exchange::new()).await?;
/// assert_eq!(exchange.body().as_text(), Some("hello"));
/// # Ok(())
/// # }
/// ```
pub struct RouterContext {
    services: Arc<Services>,
    routes: Arc<RouteTable>,
    coordinator: ReloadCoordinator,
    templates: Option<Arc<dyn RouteTemplateSource>>,
    cleanups: Mutex<Vec<Cleanup>>,
    shut_down: AtomicBool,
}

impl RouterContext {
    pub fn builder() -> RouterContextBuilder {
        RouterContextBuilder::new()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &RouterConfig {
        self.services.config()
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.services.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.services.notifier
    }

    pub fn coordinator(&self) -> &ReloadCoordinator {
        &self.coordinator
    }

    /// Register an extension explicitly.
    pub fn register(&self, extension: Extension) -> RegistryResult<()> {
        self.services.registry.register(extension)
    }

    /// Bind a bean. Cached outcomes for that name are dropped so the bean can
    /// be discovered.
    pub fn bind(&self, id: &str, bean: Bean) {
        self.services.beans.bind(id, bean);
        for kind in ExtensionKind::ALL {
            self.services.registry.evict(kind, id);
        }
        self.services.notifier.notify(Notification::BeanLoaded { id: id.to_string() });
    }

    /// Build and install a route.
    pub async fn add_route(&self, definition: ChainBuilder) -> RoutekitResult<Arc<Chain>> {
        let route_id = definition.route_id().clone();
        if self.routes.routes.read().contains_key(&route_id) {
            return Err(RoutekitError::Route(format!("route '{route_id}' already exists")));
        }
        let chain = Arc::new(definition.build(&self.services).await?);

        let mut routes = self.routes.routes.write();
        if routes.contains_key(&route_id) {
            return Err(RoutekitError::Route(format!("route '{route_id}' already exists")));
        }
        routes.insert(
            route_id.clone(),
            Arc::new(RouteEntry {
                definition,
                chain: ArcSwap::new(Arc::clone(&chain)),
            }),
        );
        info!(route = %route_id, nodes = chain.len(), "route added");
        Ok(chain)
    }

    /// Install a route whose parameters come from the template source.
    pub async fn add_templated_route(
        &self,
        definition: ChainBuilder,
    ) -> RoutekitResult<Arc<Chain>> {
        let templates = self
            .templates
            .as_ref()
            .ok_or_else(|| RoutekitError::Config("no route template source".to_string()))?;
        let route_id = definition.route_id().clone();
        if !templates.route_ids().contains(&route_id) {
            return Err(RoutekitError::Route(format!(
                "route '{route_id}' is not a known template"
            )));
        }
        self.services
            .notifier
            .notify(Notification::RouteTemplateLoading {
                route_id: route_id.clone(),
            });
        let parameters = templates.parameters(&route_id);
        self.add_route(definition.parameters(parameters)).await
    }

    /// The chain currently installed for a route.
    pub fn route(&self, route_id: impl Into<RouteId>) -> Option<Arc<Chain>> {
        self.routes.get(&route_id.into())
    }

    pub fn route_ids(&self) -> Vec<RouteId> {
        self.routes.routes.read().keys().cloned().collect()
    }

    /// Route an exchange and await it. A fault stays recorded on the
    /// returned exchange.
    pub async fn send(
        &self,
        route_id: impl Into<RouteId>,
        exchange: Exchange,
    ) -> RoutekitResult<Exchange> {
        let chain = self.require(route_id.into())?;
        Ok(chain.process(exchange).await?)
    }

    /// Route an exchange and block until it completes, returning a fault as
    /// the error.
    pub fn send_blocking(
        &self,
        route_id: impl Into<RouteId>,
        exchange: Exchange,
    ) -> RoutekitResult<Exchange> {
        let chain = self.require(route_id.into())?;
        Ok(chain.process_blocking(exchange)?)
    }

    fn require(&self, route_id: RouteId) -> RoutekitResult<Arc<Chain>> {
        self.routes
            .get(&route_id)
            .ok_or_else(|| RoutekitError::Route(format!("unknown route '{route_id}'")))
    }

    /// Invalidate the extension cache and rebuild every route.
    pub async fn reload(&self, source: &str) -> Result<ReloadReport, ReloadError> {
        self.coordinator.reload(source).await
    }

    /// Register a callback to run once on shutdown. Callbacks run in reverse
    /// registration order.
    pub fn on_shutdown(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().push(Box::new(cleanup));
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Run the teardown callbacks, stop the coordinator and drop every
    /// cached extension and endpoint. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        let count = cleanups.len();
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        self.coordinator.stop();
        self.services.registry.invalidate_all();
        self.services.clear_endpoints();
        info!(cleanups = count, "router context shut down");
    }
}

impl Drop for RouterContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterContext")
            .field("name", &self.services.config.name)
            .field("routes", &self.route_ids())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builder for a [`RouterContext`].
pub struct RouterContextBuilder {
    config: RouterConfig,
    extensions: Vec<Extension>,
    services: Option<FactorySource>,
    defaults: FactorySource,
    sources: Vec<Arc<dyn DiscoverySource>>,
    beans: Option<Arc<dyn BeanRepository>>,
    templates: Option<Arc<dyn RouteTemplateSource>>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl RouterContextBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            extensions: Vec::new(),
            services: None,
            defaults: FactorySource::defaults(),
            sources: Vec::new(),
            beans: None,
            templates: None,
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// The service-style factory catalog.
    pub fn services(mut self, catalog: FactorySource) -> Self {
        self.services = Some(catalog);
        self
    }

    /// Fallback factories. The built-in `file` resolver and `global`
    /// variable repository are added unless the catalog provides them.
    pub fn defaults(mut self, catalog: FactorySource) -> Self {
        self.defaults = catalog;
        self
    }

    pub fn source(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn beans(mut self, repository: Arc<dyn BeanRepository>) -> Self {
        self.beans = Some(repository);
        self
    }

    pub fn templates(mut self, templates: Arc<dyn RouteTemplateSource>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> RoutekitResult<RouterContext> {
        self.config.validate().map_err(RoutekitError::Config)?;

        let notifier = Arc::new(Notifier::new(self.config.notification_buffer));
        for listener in self.listeners {
            notifier.add_listener(listener);
        }
        let beans = self
            .beans
            .unwrap_or_else(|| Arc::new(SimpleBeanRepository::new()));

        let defaults = self.defaults;
        let file = ExtensionKey::new(ExtensionKind::ResourceResolver, "file");
        if !defaults.contains(&file) {
            defaults.add(file.kind, file.name, || {
                Ok(Extension::ResourceResolver(Arc::new(FileResourceResolver)))
            });
        }
        let globals = ExtensionKey::new(ExtensionKind::VariableRepository, GLOBAL_VARIABLES);
        if !defaults.contains(&globals) {
            let repository: Arc<dyn VariableRepository> =
                Arc::new(InMemoryVariableRepository::new(GLOBAL_VARIABLES));
            defaults.add(globals.kind, globals.name, move || {
                Ok(Extension::VariableRepository(Arc::clone(&repository)))
            });
        }

        let mut registry = ExtensionRegistry::builder()
            .config(&self.config)
            .beans(Arc::clone(&beans))
            .defaults(defaults)
            .notifier(Arc::clone(&notifier));
        if let Some(services) = self.services {
            registry = registry.services(services);
        }
        for source in self.sources {
            registry = registry.source(source);
        }
        for extension in self.extensions {
            registry = registry.with(extension);
        }
        let registry = Arc::new(registry.build()?);

        let services = Arc::new(Services {
            config: self.config,
            registry: Arc::clone(&registry),
            notifier: Arc::clone(&notifier),
            inflight: Arc::new(InflightRepository::new()),
            beans,
            endpoints: RwLock::new(HashMap::new()),
        });
        let routes = Arc::new(RouteTable::default());
        let coordinator = ReloadCoordinator::new(registry).with_notifier(notifier);
        coordinator.add_participant(Arc::new(RouteRebuilder {
            services: Arc::clone(&services),
            routes: Arc::clone(&routes),
        }));

        debug!(name = %services.config.name, "router context built");
        Ok(RouterContext {
            services,
            routes,
            coordinator,
            templates: self.templates,
            cleanups: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for RouterContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionResult;
    use crate::provider::{Component, PropertyConfigurer, Provider};
    use futures::StreamExt;
    use std::any::Any;

    #[derive(Debug, Default)]
    struct Echo {
        prefix: Mutex<String>,
    }

    impl Provider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl PropertyConfigurer for Echo {
        fn configure(&self, name: &str, value: &str) -> bool {
            match name {
                "prefix" => {
                    *self.prefix.lock() = value.to_string();
                    true
                }
                _ => false,
            }
        }
    }

    impl Component for Echo {
        fn create_producer(&self, remaining: &str) -> ResolutionResult<Step> {
            let reply = format!("{}{remaining}", self.prefix.lock());
            Ok(Step::from_fn(move |exchange: &mut Exchange| {
                exchange.set_body(reply.clone());
                Ok(())
            }))
        }

        fn configurer(&self) -> Option<&dyn PropertyConfigurer> {
            Some(self)
        }
    }

    fn echo() -> Extension {
        Extension::Component(Arc::new(Echo::default()))
    }

    #[tokio::test]
    async fn test_endpoint_resolved_and_cached() {
        let context = RouterContext::builder().register(echo()).build().unwrap();
        let mut events = context.notifier().subscribe();

        context
            .add_route(Chain::builder("r").to("echo:hi"))
            .await
            .unwrap();
        assert_eq!(context.services().endpoint_count(), 1);
        assert_eq!(
            events.next().await,
            Some(Notification::EndpointRegistering { uri: "echo:hi".into() })
        );

        let exchange = context.send("r", Exchange::new()).await.unwrap();
        assert_eq!(exchange.body().as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_missing_component_fails_build() {
        let context = RouterContext::builder().build().unwrap();
        let result = context.add_route(Chain::builder("r").to("nope:x")).await;
        assert!(matches!(
            result,
            Err(RoutekitError::Fault(Fault::EndpointUnavailable(_)))
        ));
        assert!(context.route("r").is_none());
    }

    #[tokio::test]
    async fn test_configure_component() {
        let context = RouterContext::builder().register(echo()).build().unwrap();
        let services = context.services();
        assert!(services.configure_component("echo", "prefix", ">").await.unwrap());
        assert!(!services.configure_component("echo", "unknown", "x").await.unwrap());

        let step = services.endpoint("echo:x").await.unwrap();
        let exchange = step.process(Exchange::new()).await.unwrap();
        assert_eq!(exchange.body().as_text(), Some(">x"));
    }

    #[tokio::test]
    async fn test_global_variables_default_repository() {
        let context = RouterContext::builder().build().unwrap();
        let services = context.services();
        assert_eq!(services.global_variable("region").await.unwrap(), None);
        services.set_global_variable("region", "eu").await.unwrap();
        assert_eq!(
            services.global_variable("region").await.unwrap(),
            Some("eu".to_string())
        );
    }

    #[tokio::test]
    async fn test_bound_bean_replaces_cached_absence() {
        let context = RouterContext::builder().build().unwrap();
        assert!(context.registry().resolve_component("echo").await.unwrap().is_none());

        context.bind("echo", Arc::new(echo()));
        assert!(context.registry().resolve_component("echo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_templated_route() {
        let templates = StaticTemplates::new().with_route("greet-eu", [("greeting", "hallo")]);
        let context = RouterContext::builder()
            .templates(Arc::new(templates))
            .build()
            .unwrap();

        let chain = context
            .add_templated_route(Chain::builder("greet-eu").to("log:x").process(|_| Ok(())))
            .await;
        assert!(chain.is_err());

        context
            .add_templated_route(Chain::builder("greet-eu").process(|exchange: &mut Exchange| {
                let greeting = exchange
                    .variable(crate::exchange::VariableScope::Route, "greeting")
                    .unwrap_or_default()
                    .to_string();
                exchange.set_body(greeting);
                Ok(())
            }))
            .await
            .unwrap();
        let exchange = context.send("greet-eu", Exchange::new()).await.unwrap();
        assert_eq!(exchange.body().as_text(), Some("hallo"));

        let unknown = context.add_templated_route(Chain::builder("other")).await;
        assert!(matches!(unknown, Err(RoutekitError::Route(_))));
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected() {
        let context = RouterContext::builder().build().unwrap();
        context.add_route(Chain::builder("r")).await.unwrap();
        assert!(context.add_route(Chain::builder("r")).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_swaps_route_chain() {
        let context = RouterContext::builder().register(echo()).build().unwrap();
        let before = context
            .add_route(Chain::builder("r").to("echo:a"))
            .await
            .unwrap();

        context.reload("test").await.unwrap();
        let after = context.route("r").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        let exchange = before.process(Exchange::new()).await.unwrap();
        assert_eq!(exchange.body().as_text(), Some("a"));
    }

    #[test]
    fn test_shutdown_runs_cleanups_once_in_reverse() {
        let context = RouterContext::builder().build().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            context.on_shutdown(move || order.lock().push(label));
        }

        context.shutdown();
        context.shutdown();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
        assert!(context.coordinator().is_stopped());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = RouterContext::builder()
            .config(RouterConfig::default().with_discovery_order(Vec::new()))
            .build();
        assert!(matches!(result, Err(RoutekitError::Config(_))));
    }
}
