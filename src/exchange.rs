//! The unit of work flowing through a chain.
//!
//! An [`Exchange`] is moved by value into every step and handed back through
//! the step's completion callback, so exactly one step owns it at any time.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Fault;

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a route, fixed when its chain is constructed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(Arc<str>);

impl RouteId {
    /// Create a route identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RouteId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Message payload.
///
/// `Stream` bodies can be read once; the stream caching layer replaces them
/// with `Bytes` so later steps may read them again.
pub enum Body {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
    Value(Arc<dyn Any + Send + Sync>),
}

impl Body {
    /// Wrap any shareable value as an opaque body.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Body::Value(Arc::new(value))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Whether the body is a single-read stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            Body::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Text(text) => Some(text.as_bytes()),
            Body::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Downcast an opaque body.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Stream(..)"),
            Body::Value(_) => f.write_str("Value(..)"),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

/// Scope of a variable readable from an exchange.
///
/// Global variables live in the `global` variable repository extension and
/// are read through the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    Exchange,
    Route,
}

/// One node visited by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub route_id: RouteId,
    pub node_id: String,
    pub elapsed: Duration,
}

/// A message plus the metadata tracked while it is routed.
#[derive(Debug)]
pub struct Exchange {
    id: u64,
    body: Body,
    headers: HashMap<String, String>,
    variables: HashMap<String, String>,
    route_variables: Arc<HashMap<String, String>>,
    data_type: Option<String>,
    fault: Option<Fault>,
    route_stack: Vec<RouteId>,
    history: Vec<HistoryEntry>,
    route_stopped: bool,
    created: Instant,
}

impl Exchange {
    /// Create an empty exchange with a fresh identifier.
    pub fn new() -> Self {
        Self {
            id: NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed),
            body: Body::Empty,
            headers: HashMap::new(),
            variables: HashMap::new(),
            route_variables: Arc::default(),
            data_type: None,
            fault: None,
            route_stack: Vec::new(),
            history: Vec::new(),
            route_stopped: false,
            created: Instant::now(),
        }
    }

    /// Create an exchange carrying the given body.
    pub fn with_body(body: impl Into<Body>) -> Self {
        let mut exchange = Self::new();
        exchange.body = body.into();
        exchange
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Take the body, leaving `Body::Empty` behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    /// Read a variable from the exchange or route scope.
    pub fn variable(&self, scope: VariableScope, name: &str) -> Option<&str> {
        match scope {
            VariableScope::Exchange => self.variables.get(name),
            VariableScope::Route => self.route_variables.get(name),
        }
        .map(String::as_str)
    }

    /// Set an exchange-scoped variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub(crate) fn route_variables(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.route_variables)
    }

    pub(crate) fn set_route_variables(&mut self, variables: Arc<HashMap<String, String>>) {
        self.route_variables = variables;
    }

    /// Declared data type of the current body, used by content transformation.
    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    pub fn set_data_type(&mut self, data_type: impl Into<String>) {
        self.data_type = Some(data_type.into());
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.fault.is_some()
    }

    /// Record a fault. A later fault replaces an earlier one.
    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    pub fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }

    /// The route currently processing this exchange.
    pub fn route_id(&self) -> Option<&RouteId> {
        self.route_stack.last()
    }

    /// Routes in progress, outermost first.
    pub fn route_stack(&self) -> &[RouteId] {
        &self.route_stack
    }

    pub(crate) fn enter_route(&mut self, route_id: RouteId) {
        self.route_stack.push(route_id);
    }

    pub(crate) fn leave_route(&mut self) -> Option<RouteId> {
        self.route_stack.pop()
    }

    /// Nodes visited so far, in visiting order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub(crate) fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Ask the enclosing pipeline not to run any further steps.
    pub fn stop_route(&mut self) {
        self.route_stopped = true;
    }

    pub fn is_route_stopped(&self) -> bool {
        self.route_stopped
    }

    /// Time since the exchange was created.
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}
