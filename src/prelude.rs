//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and traits
//! from Routekit for convenient glob imports.
//!
//! # Example
//!
//! ```rust
//! use routekit::prelude::*;
//! ```

// Configuration
pub use crate::config::{Config, RouterConfig};

// Core traits
pub use crate::provider::{
    Component, Extension, ExtensionKind, Provider, ProviderExt, RoutePolicy, VariableRepository,
};
pub use crate::step::{AsyncProcessor, Callback, Completion, Processor, Step};

// Exchanges and chains
pub use crate::advice::Advice;
pub use crate::chain::{Chain, ChainBuilder};
pub use crate::context::{RouterContext, RouterContextBuilder};
pub use crate::exchange::{Body, Exchange, RouteId, VariableScope};
pub use crate::internal::InternalProcessor;

// Error handling
pub use crate::error_handler::{
    DeadLetterChannel, ErrorHandlerAware, ErrorHandlerFactory, RedeliveryPolicy,
};

// Registry
pub use crate::discovery::{DiscoverySource, FactorySource, SourceKind};
pub use crate::registry::{ExtensionRegistry, RegistryBuilder};

// Reload and notifications
pub use crate::notify::{Listener, Notification};
pub use crate::reload::{ReloadMonitor, ReloadParticipant, ReloadState};

// Streams
pub use crate::stream::{EventSender, EventStream, StreamBuilder};

// Errors
pub use crate::error::{
    Fault, FaultResult, RegistryError, RegistryResult, ReloadError, ResolutionError,
    ResolutionResult, RoutekitError, RoutekitResult,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
