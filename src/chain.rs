//! Chains: the ordered, wrapped steps of one route.
//!
//! Building a chain resolves endpoints and policies but never runs a step.
//! Once built, a chain is immutable and shared by every exchange routed
//! through it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::advice::{
    share, Advice, ContentTransformAdvice, MessageHistoryAdvice, RoutePolicyAdvice,
    SharedAdvice, StreamCachingAdvice, UnitOfWorkAdvice,
};
use crate::context::Services;
use crate::error::{FaultResult, RoutekitError, RoutekitResult};
use crate::error_handler::ErrorHandlerFactory;
use crate::exchange::{Exchange, RouteId};
use crate::internal::InternalProcessor;
use crate::step::{
    await_completion, block_on_completion, drive, AsyncProcessor, Callback, Completion,
    CompletionFlag, Driven, Processor, Step,
};

/// One wrapped step of a chain.
pub type ChainNode = Arc<InternalProcessor>;

/// Runs nodes one after another, stopping at the first node that leaves a
/// fault on the exchange or marks the route stopped.
///
/// Nodes that complete before returning are run in a loop on the calling
/// thread; a node that suspends resumes the rest of the pipeline from its
/// completion callback.
pub struct Pipeline {
    nodes: Vec<ChainNode>,
    steps: Arc<[Step]>,
}

impl Pipeline {
    pub fn new(nodes: Vec<ChainNode>) -> Self {
        let steps = nodes
            .iter()
            .map(|node| Step::Async(Arc::clone(node) as Arc<dyn AsyncProcessor>))
            .collect();
        Self { nodes, steps }
    }

    pub fn nodes(&self) -> &[ChainNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn run(steps: Arc<[Step]>, mut index: usize, mut exchange: Exchange, mut callback: Callback) {
        loop {
            if index >= steps.len() || exchange.is_failed() || exchange.is_route_stopped() {
                callback.done(exchange);
                return;
            }
            let rest = Arc::clone(&steps);
            let resume = move |exchange: Exchange, callback: Callback| {
                Self::run(rest, index + 1, exchange, callback)
            };
            match drive(&steps[index], exchange, callback, resume) {
                Driven::Ready(next, done) => {
                    exchange = next;
                    callback = done;
                    index += 1;
                }
                Driven::Suspended => return,
            }
        }
    }
}

impl AsyncProcessor for Pipeline {
    fn process_async(&self, exchange: Exchange, callback: Callback) -> Completion {
        let (callback, flag) = CompletionFlag::track(callback);
        Self::run(Arc::clone(&self.steps), 0, exchange, callback);
        flag.completion()
    }
}

/// A route's pipeline inside its route-level wrapper.
pub struct Chain {
    route_id: RouteId,
    pipeline: Arc<Pipeline>,
    wrapper: InternalProcessor,
    parameters: Arc<HashMap<String, String>>,
    blocking_timeout: Option<Duration>,
}

impl Chain {
    pub fn builder(route_id: impl Into<RouteId>) -> ChainBuilder {
        ChainBuilder::new(route_id)
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    pub fn len(&self) -> usize {
        self.pipeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline.is_empty()
    }

    pub fn nodes(&self) -> &[ChainNode] {
        self.pipeline.nodes()
    }

    pub fn node(&self, id: &str) -> Option<&ChainNode> {
        self.nodes().iter().find(|node| node.id() == id)
    }

    /// The route-level wrapper around the pipeline.
    pub fn wrapper(&self) -> &InternalProcessor {
        &self.wrapper
    }

    /// Template parameters installed as route variables.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// Route the exchange, then run `result` if it completed without a fault.
    pub fn process_with(
        &self,
        exchange: Exchange,
        result: Option<Step>,
        callback: Callback,
    ) -> Completion {
        self.wrapper.process_with(exchange, result, callback)
    }

    pub async fn process(&self, exchange: Exchange) -> FaultResult<Exchange> {
        await_completion(|callback| self.process_with(exchange, None, callback)).await
    }

    /// Route the exchange and block until it completes, bounded by the
    /// configured blocking timeout.
    pub fn process_blocking(&self, exchange: Exchange) -> FaultResult<Exchange> {
        block_on_completion(
            |callback| self.process_with(exchange, None, callback),
            self.blocking_timeout,
        )
    }
}

impl AsyncProcessor for Chain {
    fn process_async(&self, exchange: Exchange, callback: Callback) -> Completion {
        self.process_with(exchange, None, callback)
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("route_id", &self.route_id)
            .field("nodes", &self.nodes().iter().map(|n| n.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone)]
enum StepDef {
    Process(Step),
    To(String),
}

/// Declarative definition of a route, turned into a [`Chain`] by
/// [`ChainBuilder::build`].
///
/// The definition is kept by the router so routes can be rebuilt against a
/// reloaded registry.
#[derive(Clone)]
pub struct ChainBuilder {
    route_id: RouteId,
    steps: Vec<StepDef>,
    policies: Vec<String>,
    route_advices: Vec<SharedAdvice>,
    node_advices: Vec<SharedAdvice>,
    error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
    input_type: Option<String>,
    output_type: Option<String>,
    parameters: HashMap<String, String>,
    message_history: Option<bool>,
    stream_caching: Option<bool>,
}

impl ChainBuilder {
    pub fn new(route_id: impl Into<RouteId>) -> Self {
        Self {
            route_id: route_id.into(),
            steps: Vec::new(),
            policies: Vec::new(),
            route_advices: Vec::new(),
            node_advices: Vec::new(),
            error_handler: None,
            input_type: None,
            output_type: None,
            parameters: HashMap::new(),
            message_history: None,
            stream_caching: None,
        }
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(StepDef::Process(step));
        self
    }

    /// Append a synchronous closure step.
    pub fn process<F>(self, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> FaultResult<()> + Send + Sync + 'static,
    {
        self.step(Step::from_fn(f))
    }

    pub fn processor(self, processor: impl Processor + 'static) -> Self {
        self.step(Step::sync(processor))
    }

    /// Send the exchange to an endpoint, resolved through the component named
    /// by the URI scheme when the chain is built.
    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.steps.push(StepDef::To(uri.into()));
        self
    }

    /// Apply the route policy extension with this name.
    pub fn route_policy(mut self, name: impl Into<String>) -> Self {
        self.policies.push(name.into());
        self
    }

    /// Add an instrumentation layer around the whole route.
    pub fn instrument(mut self, advice: impl Advice) -> Self {
        self.route_advices.push(share(advice));
        self
    }

    /// Add an instrumentation layer around every node. The same advice value
    /// is shared by all nodes.
    pub fn instrument_nodes(mut self, advice: impl Advice) -> Self {
        self.node_advices.push(share(advice));
        self
    }

    pub fn error_handler(mut self, factory: Arc<dyn ErrorHandlerFactory>) -> Self {
        self.error_handler = Some(factory);
        self
    }

    pub fn input_type(mut self, data_type: impl Into<String>) -> Self {
        self.input_type = Some(data_type.into());
        self
    }

    pub fn output_type(mut self, data_type: impl Into<String>) -> Self {
        self.output_type = Some(data_type.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn message_history(mut self, enabled: bool) -> Self {
        self.message_history = Some(enabled);
        self
    }

    pub fn stream_caching(mut self, enabled: bool) -> Self {
        self.stream_caching = Some(enabled);
        self
    }

    /// Resolve everything the route refers to and assemble the chain.
    pub async fn build(&self, services: &Services) -> RoutekitResult<Chain> {
        if self.route_id.as_str().is_empty() {
            return Err(RoutekitError::Route("route id must not be empty".to_string()));
        }
        let config = services.config();
        let history = self.message_history.unwrap_or(config.message_history);
        let caching = self.stream_caching.unwrap_or(config.stream_caching);

        let mut nodes = Vec::with_capacity(self.steps.len());
        for (index, def) in self.steps.iter().enumerate() {
            let (id, target) = match def {
                StepDef::Process(step) => (format!("process-{}", index + 1), step.clone()),
                StepDef::To(uri) => (format!("to-{}", index + 1), services.endpoint(uri).await?),
            };
            let mut advices = self.node_advices.clone();
            if history {
                advices.push(share(MessageHistoryAdvice::new(self.route_id.clone(), id.clone())));
            }
            let mut node = InternalProcessor::new(id, self.route_id.clone(), target.clone())
                .with_shared_advices(advices);
            if let Some(factory) = &self.error_handler {
                node = node.with_error_handler(factory.create(&target));
            }
            nodes.push(Arc::new(node));
        }

        let mut policies = Vec::with_capacity(self.policies.len());
        for name in &self.policies {
            match services.registry().resolve_route_policy(name).await? {
                Some(policy) => policies.push(policy),
                None => {
                    return Err(RoutekitError::Route(format!(
                        "route '{}' refers to unknown route policy '{}'",
                        self.route_id, name
                    )))
                }
            }
        }

        let parameters = Arc::new(self.parameters.clone());
        let mut route_advices = vec![share(UnitOfWorkAdvice::new(
            self.route_id.clone(),
            services.inflight(),
            Arc::clone(&parameters),
        ))];
        if !policies.is_empty() {
            route_advices.push(share(RoutePolicyAdvice::new(self.route_id.clone(), policies)));
        }
        route_advices.extend(self.route_advices.iter().cloned());
        if caching {
            route_advices.push(share(StreamCachingAdvice));
        }
        if self.input_type.is_some() || self.output_type.is_some() {
            let converters = services.registry().type_converters().await?;
            route_advices.push(share(ContentTransformAdvice::new(
                self.input_type.clone(),
                self.output_type.clone(),
                Arc::new(converters),
            )));
        }

        let pipeline = Arc::new(Pipeline::new(nodes));
        let wrapper = InternalProcessor::new(
            format!("{}-route", self.route_id),
            self.route_id.clone(),
            Step::Async(Arc::clone(&pipeline) as Arc<dyn AsyncProcessor>),
        )
        .with_shared_advices(route_advices);

        debug!(
            route = %self.route_id,
            nodes = pipeline.len(),
            layers = ?wrapper.advice_names(),
            "chain built"
        );
        Ok(Chain {
            route_id: self.route_id.clone(),
            pipeline,
            wrapper,
            parameters,
            blocking_timeout: config.blocking_timeout,
        })
    }
}

impl fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("route_id", &self.route_id)
            .field("steps", &self.steps.len())
            .field("policies", &self.policies)
            .finish()
    }
}
