//! # Routekit
//!
//! **Routekit** is the core of an asynchronous message router: exchanges flow
//! through chains of steps, each step wrapped with cross-cutting layers, and
//! pluggable implementations are found by name through a cached, reloadable
//! extension registry.
//!
//! ## Overview
//!
//! - **Extension registry**: `(kind, name)` lookups with ordered discovery
//!   sources, at most one discovery in flight per key, and atomic
//!   invalidation
//! - **Steps**: synchronous and asynchronous steps behind one callback
//!   contract that reports whether completion happened before returning
//! - **Cross-cutting wrapper**: enter/exit layers that always unwind in
//!   reverse order, even for failed exchanges
//! - **Error handler binding**: faults are routed to a bound handler that
//!   can redeliver, dead-letter or re-raise
//! - **Reload coordination**: one reload at a time, counters and
//!   notifications
//!
//! ## Layering
//!
//! ```text
//! RouterContext   - owns routes, services, teardown
//! Chain           - route-level wrapper around a pipeline
//! InternalProcessor - node-level wrapper around one step
//! Step            - synchronous or asynchronous processing
//! ExtensionRegistry - components, policies, resolvers, converters
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use routekit::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = RouterContext::builder().build()?;
//!
//! context
//!     .add_route(
//!         Chain::builder("shout")
//!             .process(|exchange: &mut Exchange| {
//!                 let text = exchange.body().as_text().unwrap_or_default().to_uppercase();
//!                 exchange.set_body(text);
//!                 Ok(())
//!             }),
//!     )
//!     .await?;
//!
//! let exchange = context.send("shout", Exchange::with_body("hi")).await?;
//! assert_eq!(exchange.body().as_text(), Some("HI"));
//! # Ok(())
//! # }
//! ```

mod advice;
mod chain;
mod config;
mod context;
mod discovery;
mod error;
mod error_handler;
mod exchange;
mod internal;
mod notify;
mod provider;
mod registry;
mod reload;
mod resource;
mod step;
pub mod stream;

pub mod prelude;

// Re-export core types
pub use advice::{
    Advice, ContentTransformAdvice, InflightRepository, MessageHistoryAdvice, RoutePolicyAdvice,
    StreamCachingAdvice, TimingAdvice, TimingStats, UnitOfWorkAdvice,
};
pub use chain::{Chain, ChainBuilder, ChainNode, Pipeline};
pub use config::{Config, RouterConfig};
pub use context::{
    RouteTemplateSource, RouterContext, RouterContextBuilder, Services, StaticTemplates,
    GLOBAL_VARIABLES,
};
pub use discovery::{
    Bean, BeanRepository, BeanSource, DiscoverySource, ExplicitSource, ExtensionFactory,
    FactorySource, SimpleBeanRepository, SourceKind,
};
pub use error::{
    Fault, FaultResult, RegistryError, RegistryResult, ReloadError, ResolutionError,
    ResolutionResult, RoutekitError, RoutekitResult,
};
pub use error_handler::{
    DeadLetterChannel, ErrorHandlerAware, ErrorHandlerFactory, Redelivery, RedeliveryPolicy,
    CAUGHT_FAULT_HEADER, REDELIVERY_COUNTER_HEADER,
};
pub use exchange::{Body, Exchange, HistoryEntry, RouteId, VariableScope};
pub use internal::InternalProcessor;
pub use notify::{Listener, Notification, Notifier};
pub use provider::{
    Component, ConvertFn, ConverterTable, Extension, ExtensionKey, ExtensionKind,
    InMemoryVariableRepository, PropertyConfigurer, Provider, ProviderExt, ResourceResolver,
    RoutePolicy, TypeConverterLoader, UriFactory, VariableRepository,
};
pub use registry::{ExtensionRegistry, RegistryBuilder};
pub use reload::{
    ReloadCoordinator, ReloadCounters, ReloadMonitor, ReloadParticipant, ReloadReport,
    ReloadState, ReloadStats,
};
pub use resource::{split_scheme, FileResourceResolver, InMemoryResourceResolver, Resource};
pub use step::{AsyncProcessor, Callback, Completion, Processor, Step};
pub use stream::{EventSender, EventStream, SendRejection, StreamBuilder};

// Re-export async-trait for convenience
pub use async_trait::async_trait;
