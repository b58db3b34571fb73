//! Error types for Routekit.
//!
//! The taxonomy separates four situations that callers handle differently:
//! absence (not an error at all, `Ok(None)`), resolution errors, processing
//! faults carried on an exchange, and reload faults.

use thiserror::Error;

use crate::provider::ExtensionKind;

/// Root error type for Routekit operations.
#[derive(Error, Debug, Clone)]
pub enum RoutekitError {
    /// A step raised a fault while handling an exchange
    #[error("Processing fault: {0}")]
    Fault(#[from] Fault),

    /// An extension was found but could not be constructed
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Registration was rejected
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A reload attempt failed
    #[error("Reload error: {0}")]
    Reload(#[from] ReloadError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Route construction or lookup failed
    #[error("Route error: {0}")]
    Route(String),
}

/// A fault raised by a processing step and recorded on the exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Step execution failed
    #[error("Step execution failed: {0}")]
    ExecutionFailed(String),

    /// An asynchronous step or a blocking wait did not complete in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// A single-read body could not be materialized
    #[error("Stream caching failed: {0}")]
    StreamCaching(String),

    /// Content transformation between data types failed
    #[error("Transformation failed: {0}")]
    Transformation(String),

    /// A route policy rejected the exchange
    #[error("Route policy rejected exchange: {0}")]
    Policy(String),

    /// No component could produce the requested endpoint
    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// IO error while processing
    #[error("IO error: {0}")]
    Io(String),
}

/// A candidate extension was located but could not be turned into an instance.
///
/// Cached by the registry like a successful resolution until the failure
/// window elapses or the registry is reloaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The factory for the extension failed
    #[error("Failed to construct {kind} '{name}': {reason}")]
    ConstructionFailed {
        kind: ExtensionKind,
        name: String,
        reason: String,
    },

    /// The descriptor for the extension is malformed
    #[error("Malformed descriptor for {kind} '{name}': {reason}")]
    MalformedDescriptor {
        kind: ExtensionKind,
        name: String,
        reason: String,
    },

    /// The extension needs something that is not available
    #[error("{kind} '{name}' is missing dependency '{dependency}'")]
    MissingDependency {
        kind: ExtensionKind,
        name: String,
        dependency: String,
    },

    /// A source answered with an extension of the wrong kind
    #[error("Expected {expected} for '{name}' but discovered {found}")]
    KindMismatch {
        name: String,
        expected: ExtensionKind,
        found: ExtensionKind,
    },
}

/// Errors reported at registration time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An extension is already registered under this key
    #[error("Extension already registered: {0}")]
    AlreadyRegistered(String),

    /// A resource resolver already claims this scheme
    #[error("Scheme '{scheme}' is already claimed by resolver '{owner}'")]
    SchemeAlreadyClaimed { scheme: String, owner: String },

    /// Invalid extension name
    #[error("Invalid extension name: {0}")]
    InvalidName(String),
}

/// Errors raised by a reload attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReloadError {
    /// A reload participant failed
    #[error("Reload participant '{name}' failed: {reason}")]
    Participant { name: String, reason: String },

    /// Re-resolving an extension failed
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The coordinator was stopped
    #[error("Reload coordinator is stopped")]
    Stopped,
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Fault::Io(err.to_string())
    }
}

impl From<String> for Fault {
    fn from(msg: String) -> Self {
        Fault::ExecutionFailed(msg)
    }
}

impl From<&str> for Fault {
    fn from(msg: &str) -> Self {
        Fault::ExecutionFailed(msg.to_string())
    }
}

impl From<ResolutionError> for Fault {
    fn from(err: ResolutionError) -> Self {
        Fault::EndpointUnavailable(err.to_string())
    }
}

/// Result type alias for step operations.
pub type FaultResult<T> = Result<T, Fault>;

/// Result type alias for registration operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type alias for extension resolution.
pub type ResolutionResult<T> = Result<T, ResolutionError>;

/// Result type alias for general Routekit operations.
pub type RoutekitResult<T> = Result<T, RoutekitError>;
