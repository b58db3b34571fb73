//! Configuration for a router context.

use std::time::Duration;

use crate::discovery::SourceKind;

/// Base trait for configuration types.
pub trait Config: Send + Sync {
    /// Returns the configuration name/identifier.
    fn name(&self) -> &str {
        "default"
    }

    /// Returns the timeout duration, if configured.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Validates the configuration.
    ///
    /// Returns Ok(()) if valid, or an error message describing the issue.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Settings for the extension registry, the wrappers and notifications.
///
/// # Example
///
/// ```rust
/// use routekit::{Config, RouterConfig};
/// use std::time::Duration;
///
/// let config = RouterConfig::new()
///     .with_name("orders")
///     .with_failure_cache_ttl(Duration::from_secs(5))
///     .without_message_history();
///
/// assert_eq!(config.name(), "orders");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Configuration name
    pub name: String,
    /// How long absence and resolution failures stay cached
    pub failure_cache_ttl: Duration,
    /// Order in which discovery sources are consulted
    pub discovery_order: Vec<SourceKind>,
    /// Record visited nodes on each exchange
    pub message_history: bool,
    /// Materialize single-read stream bodies on route entry
    pub stream_caching: bool,
    /// Capacity of each notification subscriber's stream
    pub notification_buffer: usize,
    /// Upper bound for the blocking entry point
    pub blocking_timeout: Option<Duration>,
}

impl RouterConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_failure_cache_ttl(mut self, ttl: Duration) -> Self {
        self.failure_cache_ttl = ttl;
        self
    }

    pub fn with_discovery_order(mut self, order: Vec<SourceKind>) -> Self {
        self.discovery_order = order;
        self
    }

    pub fn without_message_history(mut self) -> Self {
        self.message_history = false;
        self
    }

    pub fn without_stream_caching(mut self) -> Self {
        self.stream_caching = false;
        self
    }

    pub fn with_notification_buffer(mut self, size: usize) -> Self {
        self.notification_buffer = size;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = Some(timeout);
        self
    }

    /// Position of a source kind in the discovery order, if it participates.
    pub fn source_rank(&self, kind: SourceKind) -> Option<usize> {
        self.discovery_order.iter().position(|k| *k == kind)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_cache_ttl: Duration::from_secs(30),
            discovery_order: SourceKind::DEFAULT_ORDER.to_vec(),
            message_history: true,
            stream_caching: true,
            notification_buffer: 100,
            blocking_timeout: None,
        }
    }
}

impl Config for RouterConfig {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.blocking_timeout
    }

    fn validate(&self) -> Result<(), String> {
        if self.discovery_order.is_empty() {
            return Err("discovery_order must name at least one source".to_string());
        }
        for (i, kind) in self.discovery_order.iter().enumerate() {
            if self.discovery_order[..i].contains(kind) {
                return Err(format!("discovery source {kind:?} listed twice"));
            }
        }
        if self.notification_buffer == 0 {
            return Err("notification_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}
