//! Provider trait and the extension capabilities resolved by the registry.
//!
//! Every pluggable implementation is a [`Provider`]. The registry stores them
//! as an [`Extension`], one variant per [`ExtensionKind`], keyed by an
//! [`ExtensionKey`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FaultResult, ResolutionResult, RoutekitResult};
use crate::exchange::{Body, Exchange, RouteId};
use crate::resource::Resource;
use crate::step::Step;

/// Base trait for all pluggable implementations.
///
/// # Example
///
/// ```rust
/// use routekit::Provider;
/// use std::any::Any;
///
/// #[derive(Debug)]
/// struct Audit;
///
/// impl Provider for Audit {
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
///
/// assert!(Audit.supports("audit"));
/// ```
pub trait Provider: Send + Sync + Debug {
    /// Returns the unique name of this provider.
    fn name(&self) -> &str;

    /// Names of other extensions this provider relies on.
    ///
    /// Reported to listeners as "dependency detected" when the provider is
    /// discovered.
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    /// Check if this provider answers to the given key.
    fn supports(&self, key: &str) -> bool {
        key == self.name()
    }

    /// Returns the priority of this provider (higher = preferred).
    fn priority(&self) -> i32 {
        0
    }

    /// Downcast to concrete type for advanced usage.
    fn as_any(&self) -> &dyn Any;
}

/// Extension trait for provider type checking.
pub trait ProviderExt: Provider {
    /// Check if this provider is of type T.
    fn is<T: Provider + 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to type T.
    fn downcast_ref<T: Provider + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl<P: Provider + ?Sized> ProviderExt for P {}

/// The kinds of extension the registry resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionKind {
    Component,
    TypeConverterLoader,
    ResourceResolver,
    UriFactory,
    VariableRepository,
    RoutePolicy,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 6] = [
        ExtensionKind::Component,
        ExtensionKind::TypeConverterLoader,
        ExtensionKind::ResourceResolver,
        ExtensionKind::UriFactory,
        ExtensionKind::VariableRepository,
        ExtensionKind::RoutePolicy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionKind::Component => "component",
            ExtensionKind::TypeConverterLoader => "type-converter-loader",
            ExtensionKind::ResourceResolver => "resource-resolver",
            ExtensionKind::UriFactory => "uri-factory",
            ExtensionKind::VariableRepository => "variable-repository",
            ExtensionKind::RoutePolicy => "route-policy",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one extension: a kind plus a name (a scheme for resolvers and
/// URI factories).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionKey {
    pub kind: ExtensionKind,
    pub name: String,
}

impl ExtensionKey {
    pub fn new(kind: ExtensionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ExtensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Optional capability for components whose properties can be set by name.
pub trait PropertyConfigurer: Send + Sync {
    /// Returns `false` when the property is unknown.
    fn configure(&self, name: &str, value: &str) -> bool;
}

/// A transport component that produces steps for endpoint URIs.
pub trait Component: Provider {
    /// Create the producing step for `scheme:remaining`.
    fn create_producer(&self, remaining: &str) -> ResolutionResult<Step>;

    fn configurer(&self) -> Option<&dyn PropertyConfigurer> {
        None
    }
}

/// Body conversion function registered in a [`ConverterTable`].
pub type ConvertFn = Arc<dyn Fn(&Body) -> FaultResult<Body> + Send + Sync>;

/// Converters between named data types.
#[derive(Clone, Default)]
pub struct ConverterTable {
    converters: HashMap<(String, String), ConvertFn>,
}

impl ConverterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, from: impl Into<String>, to: impl Into<String>, convert: F)
    where
        F: Fn(&Body) -> FaultResult<Body> + Send + Sync + 'static,
    {
        self.converters
            .insert((from.into(), to.into()), Arc::new(convert));
    }

    pub fn lookup(&self, from: &str, to: &str) -> Option<&ConvertFn> {
        self.converters.get(&(from.to_string(), to.to_string()))
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl Debug for ConverterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.converters.keys()).finish()
    }
}

/// Contributes type converters.
pub trait TypeConverterLoader: Provider {
    fn load(&self, table: &mut ConverterTable) -> ResolutionResult<()>;
}

/// Loads resources for one URI scheme.
pub trait ResourceResolver: Provider {
    fn scheme(&self) -> &str;

    /// Resolve the part of the location after `scheme:`.
    fn resolve(&self, location: &str) -> Option<Resource>;
}

/// Builds endpoint URIs for one scheme from named parameters.
pub trait UriFactory: Provider {
    fn scheme(&self) -> &str;

    fn build_uri(&self, parameters: &BTreeMap<String, String>) -> RoutekitResult<String>;
}

/// A named store of variables.
pub trait VariableRepository: Provider {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: String);
    fn remove(&self, name: &str) -> Option<String>;
}

/// Per-route hooks run around every exchange entering a route.
pub trait RoutePolicy: Provider {
    /// Returning an error rejects the exchange with that fault.
    fn on_exchange_begin(&self, _route: &RouteId, _exchange: &mut Exchange) -> FaultResult<()> {
        Ok(())
    }

    fn on_exchange_done(&self, _route: &RouteId, _exchange: &Exchange) {}
}

/// In-memory [`VariableRepository`].
#[derive(Debug)]
pub struct InMemoryVariableRepository {
    name: String,
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryVariableRepository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl Provider for InMemoryVariableRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl VariableRepository for InMemoryVariableRepository {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: String) {
        self.values.write().insert(name.to_string(), value);
    }

    fn remove(&self, name: &str) -> Option<String> {
        self.values.write().remove(name)
    }
}

/// A resolved extension instance.
#[derive(Clone)]
pub enum Extension {
    Component(Arc<dyn Component>),
    TypeConverterLoader(Arc<dyn TypeConverterLoader>),
    ResourceResolver(Arc<dyn ResourceResolver>),
    UriFactory(Arc<dyn UriFactory>),
    VariableRepository(Arc<dyn VariableRepository>),
    RoutePolicy(Arc<dyn RoutePolicy>),
}

macro_rules! with_provider {
    ($ext:expr, $p:ident => $body:expr) => {
        match $ext {
            Extension::Component($p) => $body,
            Extension::TypeConverterLoader($p) => $body,
            Extension::ResourceResolver($p) => $body,
            Extension::UriFactory($p) => $body,
            Extension::VariableRepository($p) => $body,
            Extension::RoutePolicy($p) => $body,
        }
    };
}

impl Extension {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::Component(_) => ExtensionKind::Component,
            Extension::TypeConverterLoader(_) => ExtensionKind::TypeConverterLoader,
            Extension::ResourceResolver(_) => ExtensionKind::ResourceResolver,
            Extension::UriFactory(_) => ExtensionKind::UriFactory,
            Extension::VariableRepository(_) => ExtensionKind::VariableRepository,
            Extension::RoutePolicy(_) => ExtensionKind::RoutePolicy,
        }
    }

    /// The provider's own name.
    pub fn provider_name(&self) -> &str {
        with_provider!(self, p => p.name())
    }

    pub fn dependencies(&self) -> &[&str] {
        with_provider!(self, p => p.dependencies())
    }

    pub fn priority(&self) -> i32 {
        with_provider!(self, p => p.priority())
    }

    /// The key this extension is registered under. Resolvers and URI
    /// factories are keyed by scheme, everything else by provider name.
    pub fn key(&self) -> ExtensionKey {
        let name = match self {
            Extension::ResourceResolver(r) => r.scheme(),
            Extension::UriFactory(f) => f.scheme(),
            other => other.provider_name(),
        };
        ExtensionKey::new(self.kind(), name)
    }

    pub fn as_component(&self) -> Option<&Arc<dyn Component>> {
        match self {
            Extension::Component(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_type_converter_loader(&self) -> Option<&Arc<dyn TypeConverterLoader>> {
        match self {
            Extension::TypeConverterLoader(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_resource_resolver(&self) -> Option<&Arc<dyn ResourceResolver>> {
        match self {
            Extension::ResourceResolver(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_uri_factory(&self) -> Option<&Arc<dyn UriFactory>> {
        match self {
            Extension::UriFactory(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_variable_repository(&self) -> Option<&Arc<dyn VariableRepository>> {
        match self {
            Extension::VariableRepository(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_route_policy(&self) -> Option<&Arc<dyn RoutePolicy>> {
        match self {
            Extension::RoutePolicy(p) => Some(p),
            _ => None,
        }
    }

    /// Whether both values refer to the same instance.
    pub fn ptr_eq(&self, other: &Extension) -> bool {
        fn addr<T: ?Sized>(arc: &Arc<T>) -> *const () {
            Arc::as_ptr(arc) as *const ()
        }
        let left = with_provider!(self, p => addr(p));
        let right = with_provider!(other, p => addr(p));
        left == right
    }
}

impl Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("kind", &self.kind())
            .field("name", &self.provider_name())
            .finish()
    }
}
