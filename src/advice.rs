//! Cross-cutting hook pairs applied around a step.
//!
//! An [`Advice`] runs `before` on the way in and `after` on the way out. The
//! token produced by `before` is carried across any suspension and handed to
//! `after`; its type belongs to the advice and is opaque to the wrapper.

use std::any::Any;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, debug_span, trace, warn, Span};

use crate::error::{Fault, FaultResult};
use crate::exchange::{Body, Exchange, HistoryEntry, RouteId};
use crate::provider::{ConverterTable, RoutePolicy};

/// A before/after hook pair.
pub trait Advice: Send + Sync + 'static {
    /// State carried from `before` to `after`.
    type Token: Send + 'static;

    fn name(&self) -> &str;

    /// Enter the layer. An error aborts the exchange; layers already entered
    /// still exit.
    fn before(&self, exchange: &mut Exchange) -> FaultResult<Self::Token>;

    /// Exit the layer. Runs exactly once for every successful `before`,
    /// whether or not the exchange failed.
    fn after(&self, exchange: &mut Exchange, token: Self::Token);
}

impl<A: Advice> Advice for Arc<A> {
    type Token = A::Token;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<Self::Token> {
        (**self).before(exchange)
    }

    fn after(&self, exchange: &mut Exchange, token: Self::Token) {
        (**self).after(exchange, token)
    }
}

pub(crate) type Token = Box<dyn Any + Send>;

/// Object-safe form of [`Advice`].
pub(crate) trait ErasedAdvice: Send + Sync {
    fn name(&self) -> &str;
    fn enter(&self, exchange: &mut Exchange) -> FaultResult<Token>;
    fn exit(&self, exchange: &mut Exchange, token: Token);
}

impl<A: Advice> ErasedAdvice for A {
    fn name(&self) -> &str {
        Advice::name(self)
    }

    fn enter(&self, exchange: &mut Exchange) -> FaultResult<Token> {
        Advice::before(self, exchange).map(|token| Box::new(token) as Token)
    }

    fn exit(&self, exchange: &mut Exchange, token: Token) {
        match token.downcast::<A::Token>() {
            Ok(token) => Advice::after(self, exchange, *token),
            Err(_) => warn!(advice = Advice::name(self), "advice token type mismatch"),
        }
    }
}

pub(crate) type SharedAdvice = Arc<dyn ErasedAdvice>;

pub(crate) fn share(advice: impl Advice) -> SharedAdvice {
    Arc::new(advice)
}

/// Exchanges currently in progress, per route.
#[derive(Debug, Default)]
pub struct InflightRepository {
    counts: Mutex<HashMap<RouteId, usize>>,
}

impl InflightRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, route: &RouteId) {
        *self.counts.lock().entry(route.clone()).or_insert(0) += 1;
    }

    fn remove(&self, route: &RouteId) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(route) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(route);
            }
        }
    }

    pub fn size(&self, route: &RouteId) -> usize {
        self.counts.lock().get(route).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

/// Marks the exchange as being inside a route for the duration of the call.
pub struct UnitOfWorkAdvice {
    route_id: RouteId,
    inflight: Arc<InflightRepository>,
    route_variables: Arc<HashMap<String, String>>,
}

impl UnitOfWorkAdvice {
    pub fn new(
        route_id: RouteId,
        inflight: Arc<InflightRepository>,
        route_variables: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            route_id,
            inflight,
            route_variables,
        }
    }
}

pub struct UnitOfWorkToken {
    outer_variables: Arc<HashMap<String, String>>,
}

impl Advice for UnitOfWorkAdvice {
    type Token = UnitOfWorkToken;

    fn name(&self) -> &str {
        "unit-of-work"
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<UnitOfWorkToken> {
        let outer_variables = exchange.route_variables();
        exchange.enter_route(self.route_id.clone());
        exchange.set_route_variables(Arc::clone(&self.route_variables));
        self.inflight.add(&self.route_id);
        trace!(route = %self.route_id, exchange = exchange.id(), "unit of work begins");
        Ok(UnitOfWorkToken { outer_variables })
    }

    fn after(&self, exchange: &mut Exchange, token: UnitOfWorkToken) {
        exchange.leave_route();
        exchange.set_route_variables(token.outer_variables);
        self.inflight.remove(&self.route_id);
        match exchange.fault() {
            Some(fault) => {
                debug!(route = %self.route_id, exchange = exchange.id(), %fault, "unit of work failed")
            }
            None => trace!(route = %self.route_id, exchange = exchange.id(), "unit of work done"),
        }
    }
}

/// Runs the route's policies around the exchange.
pub struct RoutePolicyAdvice {
    route_id: RouteId,
    policies: Vec<Arc<dyn RoutePolicy>>,
}

impl RoutePolicyAdvice {
    pub fn new(route_id: RouteId, policies: Vec<Arc<dyn RoutePolicy>>) -> Self {
        Self { route_id, policies }
    }
}

impl Advice for RoutePolicyAdvice {
    type Token = ();

    fn name(&self) -> &str {
        "route-policy"
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<()> {
        for (begun, policy) in self.policies.iter().enumerate() {
            if let Err(fault) = policy.on_exchange_begin(&self.route_id, exchange) {
                debug!(route = %self.route_id, policy = policy.name(), %fault, "policy rejected exchange");
                for entered in self.policies[..begun].iter().rev() {
                    entered.on_exchange_done(&self.route_id, exchange);
                }
                return Err(fault);
            }
        }
        Ok(())
    }

    fn after(&self, exchange: &mut Exchange, _token: ()) {
        for policy in self.policies.iter().rev() {
            policy.on_exchange_done(&self.route_id, exchange);
        }
    }
}

/// Aggregate timings gathered by [`TimingAdvice`].
#[derive(Debug, Default)]
pub struct TimingStats {
    completed: AtomicU64,
    failed: AtomicU64,
    total_nanos: AtomicU64,
}

impl TimingStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Acquire))
    }
}

/// Instrumentation measuring time spent inside the wrapped step.
pub struct TimingAdvice {
    name: String,
    stats: Arc<TimingStats>,
}

impl TimingAdvice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<TimingStats> {
        Arc::clone(&self.stats)
    }
}

impl Advice for TimingAdvice {
    type Token = Instant;

    fn name(&self) -> &str {
        &self.name
    }

    fn before(&self, _exchange: &mut Exchange) -> FaultResult<Instant> {
        Ok(Instant::now())
    }

    fn after(&self, exchange: &mut Exchange, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.stats.total_nanos.fetch_add(nanos, Ordering::AcqRel);
        self.stats.completed.fetch_add(1, Ordering::AcqRel);
        if exchange.is_failed() {
            self.stats.failed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Records each visited node on the exchange and traces it.
pub struct MessageHistoryAdvice {
    route_id: RouteId,
    node_id: String,
}

impl MessageHistoryAdvice {
    pub fn new(route_id: RouteId, node_id: impl Into<String>) -> Self {
        Self {
            route_id,
            node_id: node_id.into(),
        }
    }
}

impl Advice for MessageHistoryAdvice {
    type Token = (Instant, Span);

    fn name(&self) -> &str {
        "message-history"
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<(Instant, Span)> {
        let span = debug_span!(
            "node",
            route = %self.route_id,
            node = %self.node_id,
            exchange = exchange.id()
        );
        span.in_scope(|| trace!("entering node"));
        Ok((Instant::now(), span))
    }

    fn after(&self, exchange: &mut Exchange, (started, span): (Instant, Span)) {
        let elapsed = started.elapsed();
        span.in_scope(|| trace!(?elapsed, failed = exchange.is_failed(), "leaving node"));
        exchange.push_history(HistoryEntry {
            route_id: self.route_id.clone(),
            node_id: self.node_id.clone(),
            elapsed,
        });
    }
}

/// Reads single-read stream bodies into memory so they can be re-read.
#[derive(Debug, Default)]
pub struct StreamCachingAdvice;

impl Advice for StreamCachingAdvice {
    type Token = ();

    fn name(&self) -> &str {
        "stream-caching"
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<()> {
        if !exchange.body().is_stream() {
            return Ok(());
        }
        if let Body::Stream(mut reader) = exchange.take_body() {
            let mut cached = Vec::new();
            reader
                .read_to_end(&mut cached)
                .map_err(|e| Fault::StreamCaching(e.to_string()))?;
            trace!(exchange = exchange.id(), bytes = cached.len(), "stream body cached");
            exchange.set_body(Body::Bytes(cached));
        }
        Ok(())
    }

    fn after(&self, _exchange: &mut Exchange, _token: ()) {}
}

/// Converts the body to a declared input type on entry and to a declared
/// output type on exit, when a converter for the pair exists.
///
/// An exchange without a data type is simply tagged with the declared type.
/// A failed conversion on exit is recorded as a fault on the exchange, with
/// the body and data type left untouched.
pub struct ContentTransformAdvice {
    input: Option<String>,
    output: Option<String>,
    converters: Arc<ConverterTable>,
}

impl ContentTransformAdvice {
    pub fn new(
        input: Option<String>,
        output: Option<String>,
        converters: Arc<ConverterTable>,
    ) -> Self {
        Self {
            input,
            output,
            converters,
        }
    }

    fn transform(&self, exchange: &mut Exchange, target: &str) -> FaultResult<()> {
        let Some(current) = exchange.data_type().map(str::to_string) else {
            exchange.set_data_type(target);
            return Ok(());
        };
        if current == target {
            return Ok(());
        }
        let Some(convert) = self.converters.lookup(&current, target) else {
            trace!(from = %current, to = target, "no converter declared, body left as is");
            return Ok(());
        };
        let body = convert(exchange.body())
            .map_err(|fault| Fault::Transformation(format!("{current} -> {target}: {fault}")))?;
        exchange.set_body(body);
        exchange.set_data_type(target);
        Ok(())
    }
}

impl Advice for ContentTransformAdvice {
    type Token = ();

    fn name(&self) -> &str {
        "content-transform"
    }

    fn before(&self, exchange: &mut Exchange) -> FaultResult<()> {
        match &self.input {
            Some(input) => self.transform(exchange, input),
            None => Ok(()),
        }
    }

    fn after(&self, exchange: &mut Exchange, _token: ()) {
        let Some(output) = &self.output else {
            return;
        };
        if exchange.is_failed() {
            return;
        }
        if let Err(fault) = self.transform(exchange, output) {
            exchange.set_fault(fault);
        }
    }
}
